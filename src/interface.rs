//! Network interface lookup and PTP clock identity derivation.

use pnet::{datalink, datalink::NetworkInterface, util::MacAddr};

/// Finds a network interface by name.
pub fn find_interface(name: &str) -> Option<NetworkInterface> {
    datalink::interfaces()
        .into_iter()
        .find(|iface| iface.name == name)
}

/// Builds an EUI-64 clock identity from an EUI-48 MAC address (IEEE 1588 7.5.2.2.2).
pub fn clock_identity_from_mac(mac: MacAddr) -> u64 {
    let MacAddr(a, b, c, d, e, f) = mac;
    u64::from_be_bytes([a, b, c, 0xFF, 0xFE, d, e, f])
}

/// Returns the clock identity of the named interface, if it has a MAC address.
pub fn clock_identity(name: &str) -> Option<u64> {
    find_interface(name)
        .and_then(|iface| iface.mac)
        .filter(|mac| !mac.is_zero())
        .map(clock_identity_from_mac)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clock_identity_from_mac() {
        let mac = MacAddr(0x0c, 0x42, 0xa1, 0x6d, 0x7c, 0xa6);
        assert_eq!(clock_identity_from_mac(mac), 0x0c42_a1ff_fe6d_7ca6);
    }

    #[test]
    fn test_missing_interface() {
        assert!(find_interface("definitely-not-a-nic0").is_none());
        assert!(clock_identity("definitely-not-a-nic0").is_none());
    }
}
