use ipnet::IpNet;
use std::net::IpAddr;
use std::sync::LazyLock;

static PRIVATE_RANGES: LazyLock<Vec<IpNet>> = LazyLock::new(|| {
    ["10.0.0.0/8", "172.16.0.0/12", "192.168.0.0/16", "fc00::/7"]
        .iter()
        .filter_map(|cidr| cidr.parse().ok())
        .collect()
});

/// RFC 1918 and RFC 4193 addresses.
pub fn is_private(ip: &IpAddr) -> bool {
    PRIVATE_RANGES.iter().any(|net| net.contains(ip))
}
