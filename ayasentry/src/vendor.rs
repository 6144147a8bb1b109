//! MAC vendor lookup and device-type heuristics.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;

pub const UNKNOWN_VENDOR: &str = "Unknown";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum DeviceType {
    Mobile,
    #[serde(rename = "Network Equipment")]
    NetworkEquipment,
    Printer,
    IoT,
    Server,
    Computer,
    /// A DHCP server outside the trusted set.
    Rogue,
    #[default]
    Unknown,
}

impl DeviceType {
    pub fn as_str(self) -> &'static str {
        match self {
            DeviceType::Mobile => "Mobile",
            DeviceType::NetworkEquipment => "Network Equipment",
            DeviceType::Printer => "Printer",
            DeviceType::IoT => "IoT",
            DeviceType::Server => "Server",
            DeviceType::Computer => "Computer",
            DeviceType::Rogue => "Rogue",
            DeviceType::Unknown => "Unknown",
        }
    }
}

impl fmt::Display for DeviceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DeviceType {
    type Err = String;

    /// Case-insensitive; accepts `network-equipment` and
    /// `network_equipment` for use in URLs.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let folded = s.trim().to_ascii_lowercase().replace(['-', '_'], " ");
        [
            DeviceType::Mobile,
            DeviceType::NetworkEquipment,
            DeviceType::Printer,
            DeviceType::IoT,
            DeviceType::Server,
            DeviceType::Computer,
            DeviceType::Rogue,
            DeviceType::Unknown,
        ]
        .into_iter()
        .find(|t| t.as_str().to_ascii_lowercase() == folded)
        .ok_or_else(|| format!("unknown device type '{s}'"))
    }
}

static OUI_VENDORS: LazyLock<HashMap<&'static str, &'static str>> = LazyLock::new(|| {
    const TABLE: &[(&str, &[&str])] = &[
        (
            "Apple",
            &[
                "000393", "000502", "000A27", "000A95", "000D93", "0010FA", "001124", "001451",
                "0016CB", "0017F2", "0019E3", "001B63", "001C42", "001C25", "001D4F", "001E52",
                "001F5B", "0021E9", "002241", "002312", "002332", "00236C", "002436", "002500",
                "00254B", "0025BC", "002608", "00264A", "0026B0", "0026BB", "D8004D", "D81D72",
                "D83062", "D88F76", "D89695", "D8A25E", "D8CF9C", "D8D1CB",
            ],
        ),
        ("Google", &["001A11", "3C5AB4", "D8EB97", "DAA119", "E4F042", "F4F5D8"]),
        (
            "Samsung",
            &[
                "0000F0", "000278", "0007AB", "000D70", "000FB3", "001247", "0012FB", "001599",
                "00166B", "0017C9", "0017D4", "0018AF", "001901", "001A99", "001B98", "001C43",
            ],
        ),
        (
            "Cisco",
            &[
                "00000C", "000142", "000143", "000163", "000164", "000196", "000197", "0001C7",
                "0001C9", "000216", "000217", "00024A", "00024B", "00027D", "0002B9", "0002FA",
            ],
        ),
        (
            "Linksys",
            &[
                "000625", "000C41", "000F66", "001310", "0014BF", "001839", "001D7E", "002129",
                "00226B", "002369", "00259C",
            ],
        ),
        (
            "Netgear",
            &[
                "00095B", "000FB5", "00146C", "00184D", "001B2F", "001E2A", "001F33", "00223F",
                "0024B2", "0026F2", "204E71", "28C687",
            ],
        ),
        (
            "Intel",
            &[
                "0002B3", "000347", "000423", "0007E9", "0008A1", "000CF1", "001302", "0013E8",
                "001500", "00166F", "001676", "0018DE", "0019D1", "001B21", "001C23", "001D71",
                "001E64", "001E65", "001F3C",
            ],
        ),
        (
            "Dell",
            &[
                "000874", "000BDB", "000D56", "000F1F", "001143", "00123F", "001372", "001422",
                "0015C5", "00188B", "0019B9", "001AF1", "001A4B", "001D09",
            ],
        ),
        (
            "HP",
            &[
                "0001E6", "000344", "0004EA", "00055D", "000802", "000BCD", "000D9D", "000E7F",
                "000F20", "001083", "00110A", "001185", "001279", "001321", "001438", "001560",
            ],
        ),
        (
            "Microsoft",
            &[
                "0003FF", "00125A", "00155D", "0017FA", "001D2D", "001DD8", "002248", "0025AE",
                "0050F2",
            ],
        ),
        ("Raspberry Pi", &["28CDC1", "3A3541", "B827EB", "D83ADD", "E45F01"]),
        (
            "Ubiquiti",
            &[
                "00156D", "002722", "0418D6", "0418D7", "24A43C", "44D9E7", "687251", "706582",
                "788A20", "802AA8", "8DE204", "902106", "B4FBE4", "D8B377", "F09FC2", "FCECDA",
            ],
        ),
        (
            "TP-Link",
            &[
                "0019E0", "002127", "00236A", "002586", "10FEED", "14CC20", "18A6C7", "18D6C7",
                "30B5C2", "349672", "40169E", "4432C8", "50C7BF", "54E6FC", "60E327", "6466B3",
                "704F57", "74EA3A", "784476", "8416F9", "8C210A", "90F652", "94103E", "98DED0",
                "A42BB0", "B0487A", "BC4699", "C025E9", "C04A00", "D46E0E", "D84732", "E894F6",
                "EC086B", "F4F26D", "F81A67", "F8D111",
            ],
        ),
    ];

    TABLE
        .iter()
        .flat_map(|(vendor, prefixes)| prefixes.iter().map(move |p| (*p, *vendor)))
        .collect()
});

/// Vendor for `mac` by its OUI prefix. Accepts `:` or `-` separated or bare
/// hex, any case.
pub fn lookup_vendor(mac: &str) -> Option<&'static str> {
    let hex: String = mac
        .chars()
        .filter(|c| c.is_ascii_hexdigit())
        .take(6)
        .map(|c| c.to_ascii_uppercase())
        .collect();
    if hex.len() < 6 {
        return None;
    }
    OUI_VENDORS.get(hex.as_str()).copied()
}

fn any_in(haystack: &str, needles: &[&str]) -> bool {
    needles.iter().any(|n| haystack.contains(n))
}

/// Heuristic device type from vendor, hostname and DHCP vendor class.
/// Categories are tried in a fixed order and the first hit wins.
pub fn classify(vendor: &str, hostname: &str, vendor_class: &str) -> DeviceType {
    let vendor = vendor.to_lowercase();
    let host = hostname.to_lowercase();
    let class = vendor_class.to_lowercase();

    if any_in(&vendor, &["apple", "samsung"])
        || any_in(&host, &["iphone", "ipad", "android"])
        || class.contains("android")
    {
        return DeviceType::Mobile;
    }
    if any_in(&vendor, &["cisco", "netgear", "linksys", "ubiquiti", "tp-link"])
        || any_in(&host, &["router", "gateway", "ap-"])
        || class.contains("ubnt")
    {
        return DeviceType::NetworkEquipment;
    }
    if host.contains("printer")
        || any_in(&vendor, &["hp", "brother", "canon", "epson", "lexmark"])
        || class.contains("ipp")
    {
        return DeviceType::Printer;
    }
    if any_in(&host, &["iot", "sensor", "camera", "cam", "smart", "light", "plug"])
        || any_in(&vendor, &["raspberry pi", "espressif"])
        || any_in(&class, &["esp8266", "esp32"])
    {
        return DeviceType::IoT;
    }
    if any_in(&host, &["server", "nas", "proxmox", "esxi"])
        || any_in(&vendor, &["supermicro", "vmware"])
    {
        return DeviceType::Server;
    }
    if any_in(&vendor, &["dell", "hp", "lenovo", "microsoft", "intel"])
        || any_in(&host, &["pc", "laptop", "desktop"])
    {
        return DeviceType::Computer;
    }
    DeviceType::Unknown
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup_vendor() {
        assert_eq!(lookup_vendor("b8:27:eb:12:34:56"), Some("Raspberry Pi"));
        assert_eq!(lookup_vendor("00-03-93-00-00-01"), Some("Apple"));
        assert_eq!(lookup_vendor("F81A67AABBCC"), Some("TP-Link"));
        assert_eq!(lookup_vendor("02:00:00:00:00:01"), None);
        assert_eq!(lookup_vendor("b8:27"), None);
    }

    #[test]
    fn test_classification_examples() {
        assert_eq!(classify("Apple", "iphone-12", ""), DeviceType::Mobile);
        assert_eq!(classify("TP-Link", "router-lan", ""), DeviceType::NetworkEquipment);
        assert_eq!(classify("", "", ""), DeviceType::Unknown);
        assert_eq!(classify(UNKNOWN_VENDOR, "box", "udhcp"), DeviceType::Unknown);
    }

    #[test]
    fn test_classification_precedence() {
        // Mobile beats network equipment.
        assert_eq!(classify("Cisco", "android-phone", ""), DeviceType::Mobile);
        // HP matches printer before computer.
        assert_eq!(classify("HP", "office-laptop", ""), DeviceType::Printer);
        assert_eq!(classify("Raspberry Pi", "", ""), DeviceType::IoT);
        assert_eq!(classify("", "", "ESP32-Module"), DeviceType::IoT);
        assert_eq!(classify("", "Proxmox-01", ""), DeviceType::Server);
        assert_eq!(classify("Dell", "workstation", ""), DeviceType::Computer);
    }

    #[test]
    fn test_device_type_parse_and_display() {
        assert_eq!("network-equipment".parse::<DeviceType>().unwrap(), DeviceType::NetworkEquipment);
        assert_eq!("IOT".parse::<DeviceType>().unwrap(), DeviceType::IoT);
        assert!("toaster".parse::<DeviceType>().is_err());
        assert_eq!(DeviceType::NetworkEquipment.to_string(), "Network Equipment");
        assert_eq!(
            serde_json::to_string(&DeviceType::NetworkEquipment).unwrap(),
            "\"Network Equipment\""
        );
    }
}
