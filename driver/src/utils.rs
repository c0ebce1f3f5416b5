//! Address parsing helpers.

use smoltcp::wire::{EthernetAddress, Ipv4Address};

/// Parse dotted-quad IPv4 text ("192.168.1.1").
///
/// Exactly four decimal octets, each 0..=255. Anything else (hostnames,
/// empty labels, trailing dots) is `None`.
pub fn parse_ipv4(s: &[u8]) -> Option<Ipv4Address> {
    let mut octets = [0u8; 4];
    let mut octet_idx = 0;
    let mut current = 0u16;
    let mut has_digit = false;

    for &b in s {
        if b.is_ascii_digit() {
            current = current * 10 + (b - b'0') as u16;
            has_digit = true;
            if current > 255 {
                return None;
            }
        } else if b == b'.' {
            if !has_digit || octet_idx >= 3 {
                return None;
            }
            octets[octet_idx] = current as u8;
            octet_idx += 1;
            current = 0;
            has_digit = false;
        } else {
            return None;
        }
    }

    if !has_digit || octet_idx != 3 {
        return None;
    }
    octets[3] = current as u8;

    Some(Ipv4Address::from(octets))
}

/// True for addresses a unicast connect or datagram can never reach.
pub fn is_unusable_destination(addr: Ipv4Address) -> bool {
    addr.is_unspecified() || addr.is_broadcast()
}

/// Ethernet group address for an IPv4 multicast group (01:00:5E plus the
/// low 23 bits of the address).
pub fn multicast_mac(group: Ipv4Address) -> EthernetAddress {
    let o = group.octets();
    EthernetAddress([0x01, 0x00, 0x5E, o[1] & 0x7F, o[2], o[3]])
}
