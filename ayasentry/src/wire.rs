//! Field readers for kernel records.
//!
//! Every reader is bounds-checked and yields zeroes past the end of the
//! buffer; decoders validate the record length before calling them.

use std::net::Ipv4Addr;

fn array<const N: usize>(buf: &[u8], offset: usize) -> [u8; N] {
    let mut out = [0u8; N];
    if let Some(src) = offset
        .checked_add(N)
        .and_then(|end| buf.get(offset..end))
    {
        out.copy_from_slice(src);
    }
    out
}

pub fn u8_at(buf: &[u8], offset: usize) -> u8 {
    buf.get(offset).copied().unwrap_or(0)
}

pub fn u16_le(buf: &[u8], offset: usize) -> u16 {
    u16::from_le_bytes(array(buf, offset))
}

pub fn u32_le(buf: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes(array(buf, offset))
}

pub fn u64_le(buf: &[u8], offset: usize) -> u64 {
    u64::from_le_bytes(array(buf, offset))
}

/// IPv4 address stored as raw network-order bytes.
pub fn ipv4(buf: &[u8], offset: usize) -> Ipv4Addr {
    Ipv4Addr::from(array::<4>(buf, offset))
}

pub fn mac(buf: &[u8], offset: usize) -> [u8; 6] {
    array(buf, offset)
}

/// Text from a fixed-capacity buffer, cut at the first NUL and at the end
/// of the record, whichever comes first.
pub fn c_string(buf: &[u8], offset: usize, capacity: usize) -> String {
    let end = offset.saturating_add(capacity).min(buf.len());
    let bytes = buf.get(offset..end).unwrap_or(&[]);
    let bytes = match bytes.iter().position(|&b| b == 0) {
        Some(nul) => &bytes[..nul],
        None => bytes,
    };
    String::from_utf8_lossy(bytes).into_owned()
}

/// Text with an explicit length prefix, clamped to the buffer capacity and
/// then cut at the first NUL.
pub fn prefixed_string(buf: &[u8], len: u8, offset: usize, capacity: usize) -> String {
    c_string(buf, offset, (len as usize).min(capacity))
}

pub fn format_mac(mac: &[u8; 6]) -> String {
    format!(
        "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
        mac[0], mac[1], mac[2], mac[3], mac[4], mac[5]
    )
}
