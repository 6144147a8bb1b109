//! Kernel program loading on top of aya.

use async_trait::async_trait;
use std::collections::VecDeque;
use std::ffi::CString;
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};

use aya::maps::{HashMap, MapData, RingBuf};
use aya::programs::{tc, SchedClassifier, SocketFilter, TcAttachType};
use aya::Ebpf;
use tokio::io::unix::AsyncFd;
use tokio::io::Interest;

use ayasentry_common::DhcpKey;

use crate::error::{Error, Result};
use crate::source::{
    is_expired, Attachment, AttachMode, EventLoader, EventSource, ProgramSpec, TrackingTable,
};

/// Loads program objects from disk and attaches them to the configured
/// interface.
#[derive(Debug, Default)]
pub struct AyaLoader;

impl EventLoader for AyaLoader {
    fn attach(&self, spec: &ProgramSpec) -> Result<Attachment> {
        let mut bpf =
            Ebpf::load_file(&spec.object).map_err(|e| Error::attach(&spec.program, e))?;

        let socket = {
            let program = bpf
                .program_mut(&spec.program)
                .ok_or_else(|| Error::attach(&spec.program, "program not found in object"))?;
            match spec.mode {
                AttachMode::Socket => {
                    let filter: &mut SocketFilter = program
                        .try_into()
                        .map_err(|e| Error::attach(&spec.program, e))?;
                    filter.load().map_err(|e| Error::attach(&spec.program, e))?;
                    let socket = open_packet_socket(&spec.interface)
                        .map_err(|e| Error::attach(&spec.program, e))?;
                    filter
                        .attach(&socket)
                        .map_err(|e| Error::attach(&spec.program, e))?;
                    Some(socket)
                }
                AttachMode::Tc => {
                    // If the clsact qdisc already exists (EEXIST), that is fine.
                    if let Err(e) = tc::qdisc_add_clsact(&spec.interface) {
                        if e.raw_os_error() != Some(libc::EEXIST) {
                            return Err(Error::attach(&spec.program, e));
                        }
                        tracing::debug!("clsact qdisc already exists on {}, reusing", spec.interface);
                    }
                    let classifier: &mut SchedClassifier = program
                        .try_into()
                        .map_err(|e| Error::attach(&spec.program, e))?;
                    classifier
                        .load()
                        .map_err(|e| Error::attach(&spec.program, e))?;
                    classifier
                        .attach(&spec.interface, TcAttachType::Ingress)
                        .map_err(|e| Error::attach(&spec.program, e))?;
                    None
                }
            }
        };
        tracing::info!(
            program = %spec.program,
            interface = %spec.interface,
            mode = ?spec.mode,
            "kernel program attached"
        );

        let mut tables: Vec<Box<dyn TrackingTable>> = Vec::with_capacity(spec.tables.len());
        for table in &spec.tables {
            let map = bpf.take_map(table.name).ok_or_else(|| Error::MissingMap {
                program: spec.program.clone(),
                map: table.name.to_string(),
            })?;
            tables.push(open_table(map, *table)?);
        }

        let events = bpf
            .take_map(&spec.events_map)
            .ok_or_else(|| Error::MissingMap {
                program: spec.program.clone(),
                map: spec.events_map.clone(),
            })?;
        let ring = RingBuf::try_from(events).map_err(|e| Error::attach(&spec.program, e))?;
        let ring = AsyncFd::with_interest(ring, Interest::READABLE)?;

        Ok(Attachment {
            source: Box::new(RingSource {
                ring: Some(ring),
                pending: VecDeque::new(),
                _bpf: Some(bpf),
                _socket: socket,
            }),
            tables,
        })
    }
}

/// Raw `AF_PACKET` socket bound to `iface`, used as the carrier for socket
/// filter programs.
fn open_packet_socket(iface: &str) -> io::Result<OwnedFd> {
    let protocol = (libc::ETH_P_ALL as u16).to_be();
    // SAFETY: plain syscall; the result is checked before use.
    let fd = unsafe {
        libc::socket(
            libc::AF_PACKET,
            libc::SOCK_RAW | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
            protocol as libc::c_int,
        )
    };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: `fd` is a freshly created descriptor we own.
    let socket = unsafe { OwnedFd::from_raw_fd(fd) };

    let name = CString::new(iface).map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
    // SAFETY: `name` is a valid NUL-terminated string.
    let index = unsafe { libc::if_nametoindex(name.as_ptr()) };
    if index == 0 {
        return Err(io::Error::last_os_error());
    }

    // SAFETY: sockaddr_ll is plain old data; zeroed is a valid starting value.
    let mut addr: libc::sockaddr_ll = unsafe { std::mem::zeroed() };
    addr.sll_family = libc::AF_PACKET as libc::c_ushort;
    addr.sll_protocol = protocol;
    addr.sll_ifindex = index as libc::c_int;
    // SAFETY: `addr` outlives the call and the length matches its type.
    let rc = unsafe {
        libc::bind(
            socket.as_raw_fd(),
            &addr as *const libc::sockaddr_ll as *const libc::sockaddr,
            std::mem::size_of::<libc::sockaddr_ll>() as libc::socklen_t,
        )
    };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(socket)
}

fn open_table(
    map: aya::maps::Map,
    table: ayasentry_common::TrackingTable,
) -> Result<Box<dyn TrackingTable>> {
    fn typed<const N: usize>(
        map: aya::maps::Map,
        table: ayasentry_common::TrackingTable,
    ) -> Result<Box<dyn TrackingTable>> {
        let inner = HashMap::<MapData, DhcpKey, [u8; N]>::try_from(map)
            .map_err(|e| Error::table(table.name, e))?;
        Ok(Box::new(KernelTable {
            inner,
            name: table.name,
            timestamp_offset: table.timestamp_offset,
        }))
    }

    match table.value_len {
        48 => typed::<48>(map, table),
        56 => typed::<56>(map, table),
        96 => typed::<96>(map, table),
        152 => typed::<152>(map, table),
        other => Err(Error::table(
            table.name,
            format!("unsupported value size {other}"),
        )),
    }
}

struct RingSource {
    ring: Option<AsyncFd<RingBuf<MapData>>>,
    pending: VecDeque<Vec<u8>>,
    // Dropping these detaches the program.
    _bpf: Option<Ebpf>,
    _socket: Option<OwnedFd>,
}

#[async_trait]
impl EventSource for RingSource {
    async fn next_record(&mut self) -> Result<Option<Vec<u8>>> {
        loop {
            if let Some(record) = self.pending.pop_front() {
                return Ok(Some(record));
            }
            let Some(ring) = self.ring.as_mut() else {
                return Ok(None);
            };

            let mut guard = ring.readable_mut().await?;
            let rb = guard.get_inner_mut();
            while let Some(item) = rb.next() {
                self.pending.push_back(item.to_vec());
            }
            guard.clear_ready();
        }
    }

    fn close(&mut self) {
        self.pending.clear();
        self.ring = None;
        self._socket = None;
        self._bpf = None;
    }
}

struct KernelTable<const N: usize> {
    inner: HashMap<MapData, DhcpKey, [u8; N]>,
    name: &'static str,
    timestamp_offset: usize,
}

impl<const N: usize> TrackingTable for KernelTable<N> {
    fn name(&self) -> &str {
        self.name
    }

    fn expire(&mut self, now_ns: u64, max_age_ns: u64) -> Result<usize> {
        let mut stale = Vec::new();
        for entry in self.inner.iter() {
            let (key, value) = entry.map_err(|e| Error::table(self.name, e))?;
            let ts = crate::wire::u64_le(&value, self.timestamp_offset);
            if is_expired(ts, now_ns, max_age_ns) {
                stale.push(key);
            }
        }

        let mut removed = 0;
        for key in stale {
            match self.inner.remove(&key) {
                Ok(()) => removed += 1,
                // Already gone: the kernel side completed the transaction.
                Err(e) => tracing::trace!(table = self.name, error = %e, "entry vanished during sweep"),
            }
        }
        Ok(removed)
    }
}
