//! DNS client for hostname resolution.
//!
//! One A-record question per query, sent over a UDP socket borrowed from
//! the controller for the duration of `resolve`. Dotted-quad literals are
//! answered without touching the chip.

use alloc::vec::Vec;
use core::fmt;
use core::hint::spin_loop;

use rand_core::RngCore;
use smoltcp::wire::Ipv4Address;

use crate::bus::SpiBus;
use crate::chip::W5100;
use crate::config::{DNS_MAX_MESSAGE, DNS_PORT};
use crate::udp::UdpSocket;
use crate::utils::parse_ipv4;

/// DNS query type for A records (IPv4 address)
const DNS_TYPE_A: u16 = 1;
/// DNS class for Internet
const DNS_CLASS_IN: u16 = 1;

/// DNS header flags
const DNS_FLAG_RD: u16 = 0x0100; // Recursion Desired
const DNS_FLAG_QR: u16 = 0x8000; // Query/Response (1 = response)

/// DNS response codes
const DNS_RCODE_MASK: u16 = 0x000F;
const DNS_RCODE_NXDOMAIN: u16 = 3;

const DNS_HEADER_LEN: usize = 12;
const MAX_LABEL_LEN: usize = 63;
const MAX_NAME_LEN: usize = 253;

/// Resolution failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DnsError {
    /// No matching reply before the deadline
    Timeout,
    /// Server address is 0.0.0.0
    InvalidServer,
    /// Empty name, empty label or label/name too long
    InvalidHostname,
    /// Server answered with an error RCODE other than NXDOMAIN
    ServerFailure(u8),
    /// NXDOMAIN
    NotFound,
    /// Reply carried no usable A record
    NoAddress,
    /// No socket could be opened for the query
    NoSocket,
    /// Query could not be transmitted
    SendFailed,
}

impl fmt::Display for DnsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Timeout => write!(f, "query timed out"),
            Self::InvalidServer => write!(f, "no DNS server configured"),
            Self::InvalidHostname => write!(f, "invalid hostname"),
            Self::ServerFailure(rcode) => write!(f, "server error (rcode {})", rcode),
            Self::NotFound => write!(f, "domain not found"),
            Self::NoAddress => write!(f, "no A record in answer"),
            Self::NoSocket => write!(f, "no free socket"),
            Self::SendFailed => write!(f, "query send failed"),
        }
    }
}

/// Build a DNS query packet for an A record lookup.
pub fn build_query(txid: u16, hostname: &[u8]) -> Result<Vec<u8>, DnsError> {
    let mut packet = Vec::with_capacity(DNS_HEADER_LEN + hostname.len() + 2 + 4);

    // Header: id, flags, QDCOUNT=1, AN/NS/AR=0
    packet.extend_from_slice(&txid.to_be_bytes());
    packet.extend_from_slice(&DNS_FLAG_RD.to_be_bytes());
    packet.extend_from_slice(&1u16.to_be_bytes());
    packet.extend_from_slice(&0u16.to_be_bytes());
    packet.extend_from_slice(&0u16.to_be_bytes());
    packet.extend_from_slice(&0u16.to_be_bytes());

    encode_domain_name(hostname, &mut packet)?;

    packet.extend_from_slice(&DNS_TYPE_A.to_be_bytes());
    packet.extend_from_slice(&DNS_CLASS_IN.to_be_bytes());

    Ok(packet)
}

/// Encode a domain name as length-prefixed labels.
/// e.g., "www.google.com" -> [3]www[6]google[3]com[0]
///
/// One trailing dot is accepted; any other empty label is rejected.
fn encode_domain_name(hostname: &[u8], packet: &mut Vec<u8>) -> Result<(), DnsError> {
    let name = hostname.strip_suffix(b".").unwrap_or(hostname);
    if name.is_empty() || name.len() > MAX_NAME_LEN {
        return Err(DnsError::InvalidHostname);
    }

    for label in name.split(|&b| b == b'.') {
        if label.is_empty() || label.len() > MAX_LABEL_LEN {
            return Err(DnsError::InvalidHostname);
        }
        packet.push(label.len() as u8);
        packet.extend_from_slice(label);
    }

    // Null terminator
    packet.push(0);
    Ok(())
}

/// DNS response parsing result
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DnsResult {
    /// First A record of the answer section
    Resolved(Ipv4Address),
    /// Reply for our query that resolves to nothing
    Failed(DnsError),
    /// Response for wrong transaction ID
    WrongId,
    /// Too short or inconsistent to trust
    Malformed(&'static str),
}

/// Parse a DNS response packet
pub fn parse_response(packet: &[u8], expected_txid: u16) -> DnsResult {
    if packet.len() < DNS_HEADER_LEN {
        return DnsResult::Malformed("packet too short");
    }

    let txid = u16::from_be_bytes([packet[0], packet[1]]);
    if txid != expected_txid {
        return DnsResult::WrongId;
    }

    let flags = u16::from_be_bytes([packet[2], packet[3]]);
    if flags & DNS_FLAG_QR == 0 {
        return DnsResult::Malformed("not a response");
    }

    let rcode = flags & DNS_RCODE_MASK;
    if rcode == DNS_RCODE_NXDOMAIN {
        return DnsResult::Failed(DnsError::NotFound);
    }
    if rcode != 0 {
        return DnsResult::Failed(DnsError::ServerFailure(rcode as u8));
    }

    let qdcount = u16::from_be_bytes([packet[4], packet[5]]) as usize;
    let ancount = u16::from_be_bytes([packet[6], packet[7]]) as usize;

    let mut pos = DNS_HEADER_LEN;

    // Skip question section
    for _ in 0..qdcount {
        pos = match skip_name(packet, pos) {
            Ok(p) => p,
            Err(e) => return e,
        };
        // QTYPE and QCLASS
        pos += 4;
        if pos > packet.len() {
            return DnsResult::Malformed("truncated question");
        }
    }

    for _ in 0..ancount {
        pos = match skip_name(packet, pos) {
            Ok(p) => p,
            Err(e) => return e,
        };

        // TYPE, CLASS, TTL, RDLENGTH
        if pos + 10 > packet.len() {
            return DnsResult::Malformed("truncated answer");
        }

        let rtype = u16::from_be_bytes([packet[pos], packet[pos + 1]]);
        let rclass = u16::from_be_bytes([packet[pos + 2], packet[pos + 3]]);
        let rdlength = u16::from_be_bytes([packet[pos + 8], packet[pos + 9]]) as usize;
        pos += 10;

        if pos + rdlength > packet.len() {
            return DnsResult::Malformed("truncated RDATA");
        }

        if rtype == DNS_TYPE_A && rclass == DNS_CLASS_IN && rdlength == 4 {
            return DnsResult::Resolved(Ipv4Address::new(
                packet[pos],
                packet[pos + 1],
                packet[pos + 2],
                packet[pos + 3],
            ));
        }

        pos += rdlength;
    }

    DnsResult::Failed(DnsError::NoAddress)
}

/// Skip a DNS name (handles compression pointers)
/// Returns the position after the name
fn skip_name(packet: &[u8], mut pos: usize) -> Result<usize, DnsResult> {
    loop {
        if pos >= packet.len() {
            return Err(DnsResult::Malformed("name extends past packet"));
        }

        let len = packet[pos];

        if len == 0 {
            return Ok(pos + 1);
        }

        if len & 0xC0 == 0xC0 {
            // Compression pointer (2 bytes)
            if pos + 2 > packet.len() {
                return Err(DnsResult::Malformed("truncated pointer"));
            }
            return Ok(pos + 2);
        }

        pos += 1 + (len as usize);

        if pos > packet.len() {
            return Err(DnsResult::Malformed("label extends past packet"));
        }
    }
}

/// An outstanding query.
#[derive(Debug, Clone, Copy)]
pub struct PendingQuery<'a> {
    pub id: u16,
    pub hostname: &'a str,
    /// Absolute time, same clock as `get_time_ms`
    pub deadline: i64,
}

impl<'a> PendingQuery<'a> {
    /// Query `id` for `hostname` started at `now`, expiring `timeout_ms`
    /// later (clamped to the end of the clock).
    pub fn new(id: u16, hostname: &'a str, now: i64, timeout_ms: i64) -> Self {
        Self { id, hostname, deadline: now.saturating_add(timeout_ms) }
    }

    pub fn expired(&self, now: i64) -> bool {
        now >= self.deadline
    }
}

/// Resolver bound to one DNS server.
pub struct DnsClient {
    server: Ipv4Address,
    next_id: u16,
}

impl DnsClient {
    /// `seed` starts the transaction id counter.
    pub fn new(server: Ipv4Address, seed: u16) -> Self {
        Self { server, next_id: seed }
    }

    /// Seed the transaction id counter from a board RNG.
    pub fn with_rng(server: Ipv4Address, rng: &mut impl RngCore) -> Self {
        Self::new(server, rng.next_u32() as u16)
    }

    pub fn server(&self) -> Ipv4Address {
        self.server
    }

    pub fn set_server(&mut self, server: Ipv4Address) {
        self.server = server;
    }

    fn next_transaction_id(&mut self) -> u16 {
        self.next_id = self.next_id.wrapping_add(1);
        self.next_id
    }

    /// Resolve `hostname` to an IPv4 address.
    ///
    /// Replies from other endpoints or with another transaction id are
    /// dropped and polling continues; a reply to this query that carries no
    /// address fails at once. There is no retransmission.
    pub fn resolve<S: SpiBus>(
        &mut self,
        chip: &mut W5100<S>,
        hostname: &str,
        timeout_ms: i64,
        get_time_ms: fn() -> i64,
    ) -> Result<Ipv4Address, DnsError> {
        if let Some(ip) = parse_ipv4(hostname.as_bytes()) {
            return Ok(ip);
        }
        if self.server.is_unspecified() {
            return Err(DnsError::InvalidServer);
        }

        let query = PendingQuery::new(self.next_transaction_id(), hostname, get_time_ms(), timeout_ms);
        let packet = build_query(query.id, hostname.as_bytes())?;

        let mut udp = UdpSocket::begin(chip, 0).map_err(|_| DnsError::NoSocket)?;
        if let Err(e) = self.send_query(&mut udp, &packet) {
            log::warn!("DNS: failed to send query for {}: {}", hostname, e);
            return Err(DnsError::SendFailed);
        }
        log::debug!("DNS: query {:#06x} for {} sent to {}", query.id, hostname, self.server);

        let result = self.await_reply(&mut udp, &query, get_time_ms);
        match result {
            Ok(ip) => log::info!("DNS: {} -> {}", hostname, ip),
            Err(e) => log::warn!("DNS: {} failed: {}", hostname, e),
        }
        result
    }

    fn send_query<S: SpiBus>(&self, udp: &mut UdpSocket<'_, S>, packet: &[u8]) -> crate::Result<()> {
        udp.begin_packet(self.server, DNS_PORT)?;
        let n = udp.write_packet(packet)?;
        if n < packet.len() {
            return Err(crate::Error::InsufficientTxSpace { requested: packet.len(), free: n });
        }
        udp.end_packet()
    }

    fn await_reply<S: SpiBus>(
        &self,
        udp: &mut UdpSocket<'_, S>,
        query: &PendingQuery<'_>,
        get_time_ms: fn() -> i64,
    ) -> Result<Ipv4Address, DnsError> {
        let mut buf = [0u8; DNS_MAX_MESSAGE];
        loop {
            if query.expired(get_time_ms()) {
                log::debug!("DNS: query {:#06x} for {} expired", query.id, query.hostname);
                return Err(DnsError::Timeout);
            }

            let size = udp.parse_packet().unwrap_or(0);
            if size == 0 {
                spin_loop();
                continue;
            }
            if udp.remote_ip() != self.server || udp.remote_port() != DNS_PORT {
                log::trace!("DNS: ignoring datagram from {}:{}", udp.remote_ip(), udp.remote_port());
                continue;
            }

            let n = match udp.read_packet(&mut buf) {
                Ok(n) => n,
                Err(_) => continue,
            };
            match parse_response(&buf[..n], query.id) {
                DnsResult::Resolved(ip) => return Ok(ip),
                DnsResult::Failed(e) => return Err(e),
                DnsResult::WrongId => {
                    log::trace!("DNS: ignoring reply with wrong id");
                }
                DnsResult::Malformed(why) => {
                    log::debug!("DNS: ignoring malformed reply: {}", why);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::regs::{SocketId, SocketStatus};
    use crate::sim::{Reply, SimChip};
    use core::cell::Cell;

    const SERVER: Ipv4Address = Ipv4Address::new(192, 168, 1, 1);

    std::thread_local! {
        static NOW: Cell<i64> = const { Cell::new(0) };
    }

    /// Advances 1 ms per call.
    fn ticking_clock() -> i64 {
        NOW.with(|t| {
            let now = t.get();
            t.set(now + 1);
            now
        })
    }

    fn rr(rtype: u16, rdata: &[u8]) -> (u16, &[u8]) {
        (rtype, rdata)
    }

    fn reply(id: u16, flags: u16, answers: &[(u16, &[u8])]) -> Vec<u8> {
        let mut p = Vec::new();
        p.extend_from_slice(&id.to_be_bytes());
        p.extend_from_slice(&flags.to_be_bytes());
        p.extend_from_slice(&1u16.to_be_bytes());
        p.extend_from_slice(&(answers.len() as u16).to_be_bytes());
        p.extend_from_slice(&[0, 0, 0, 0]);
        p.extend_from_slice(b"\x07example\x03com\x00\x00\x01\x00\x01");
        for &(rtype, rdata) in answers {
            // Compressed name pointing at the question
            p.extend_from_slice(&[0xC0, 0x0C]);
            p.extend_from_slice(&rtype.to_be_bytes());
            p.extend_from_slice(&DNS_CLASS_IN.to_be_bytes());
            p.extend_from_slice(&300u32.to_be_bytes());
            p.extend_from_slice(&(rdata.len() as u16).to_be_bytes());
            p.extend_from_slice(rdata);
        }
        p
    }

    fn query_id(payload: &[u8]) -> u16 {
        u16::from_be_bytes([payload[0], payload[1]])
    }

    #[test]
    fn test_query_encoding() {
        let q = build_query(0xBEEF, b"example.com").unwrap();
        assert_eq!(&q[..12], &[0xBE, 0xEF, 0x01, 0x00, 0, 1, 0, 0, 0, 0, 0, 0]);
        assert_eq!(&q[12..], b"\x07example\x03com\x00\x00\x01\x00\x01");
    }

    #[test]
    fn test_invalid_hostnames() {
        assert_eq!(build_query(1, b""), Err(DnsError::InvalidHostname));
        assert_eq!(build_query(1, b"a..b"), Err(DnsError::InvalidHostname));
        assert_eq!(build_query(1, b".com"), Err(DnsError::InvalidHostname));
        assert_eq!(build_query(1, &[b'a'; 64]), Err(DnsError::InvalidHostname));
        assert!(build_query(1, b"example.com.").is_ok());
    }

    #[test]
    fn test_parse_first_a_record() {
        let p = reply(7, 0x8180, &[rr(5, b"\x03www\x00"), rr(1, &[93, 184, 216, 34]), rr(1, &[1, 1, 1, 1])]);
        assert_eq!(parse_response(&p, 7), DnsResult::Resolved(Ipv4Address::new(93, 184, 216, 34)));
        assert_eq!(parse_response(&p, 8), DnsResult::WrongId);
    }

    #[test]
    fn test_parse_failures() {
        assert_eq!(parse_response(&reply(7, 0x8183, &[]), 7), DnsResult::Failed(DnsError::NotFound));
        assert_eq!(parse_response(&reply(7, 0x8182, &[]), 7), DnsResult::Failed(DnsError::ServerFailure(2)));
        assert_eq!(parse_response(&reply(7, 0x8180, &[]), 7), DnsResult::Failed(DnsError::NoAddress));
        assert_eq!(parse_response(&reply(7, 0x8180, &[rr(28, &[0; 16])]), 7), DnsResult::Failed(DnsError::NoAddress));
        // A record with the wrong length is never an address
        assert_eq!(
            parse_response(&reply(7, 0x8180, &[rr(1, &[1, 2, 3])]), 7),
            DnsResult::Failed(DnsError::NoAddress)
        );
    }

    #[test]
    fn test_parse_malformed() {
        assert!(matches!(parse_response(&[0, 7, 0x81], 7), DnsResult::Malformed(_)));
        assert!(matches!(parse_response(&reply(7, 0x0100, &[]), 7), DnsResult::Malformed(_)));
        let mut p = reply(7, 0x8180, &[rr(1, &[10, 0, 0, 1])]);
        p.truncate(p.len() - 2);
        assert!(matches!(parse_response(&p, 7), DnsResult::Malformed(_)));
    }

    #[test]
    fn test_literal_needs_no_bus() {
        let sim = SimChip::new();
        let mut chip = W5100::create(sim.bus()).unwrap();
        let before = sim.transactions();
        let mut dns = DnsClient::new(SERVER, 0);
        assert_eq!(
            dns.resolve(&mut chip, "192.168.1.1", 1000, ticking_clock),
            Ok(Ipv4Address::new(192, 168, 1, 1))
        );
        assert_eq!(sim.transactions(), before);
    }

    #[test]
    fn test_resolve_roundtrip() {
        let sim = SimChip::new();
        let mut chip = W5100::create(sim.bus()).unwrap();
        sim.set_responder(|sent| {
            Some(Reply {
                delay: 50,
                source: SERVER,
                port: 53,
                payload: reply(query_id(&sent.payload), 0x8180, &[rr(1, &[93, 184, 216, 34])]),
            })
        });

        let mut dns = DnsClient::new(SERVER, 0x1233);
        let ip = dns.resolve(&mut chip, "example.com", 5000, ticking_clock);
        assert_eq!(ip, Ok(Ipv4Address::new(93, 184, 216, 34)));

        let sent = sim.take_sent();
        assert_eq!(sent.len(), 1);
        assert_eq!((sent[0].dest, sent[0].port), (SERVER, 53));
        assert_eq!(query_id(&sent[0].payload), 0x1234);
        // Socket handed back
        assert_eq!(sim.status(SocketId::ALL[0]), SocketStatus::Closed);
    }

    #[test]
    fn test_deadline_clamps() {
        let query = PendingQuery::new(1, "example.com", 1_000, i64::MAX);
        assert_eq!(query.deadline, i64::MAX);
        assert!(!query.expired(1_000));
        assert!(PendingQuery::new(1, "example.com", 1_000, 0).expired(1_000));

        let sim = SimChip::new();
        let mut chip = W5100::create(sim.bus()).unwrap();
        sim.set_responder(|sent| {
            Some(Reply {
                delay: 10,
                source: SERVER,
                port: 53,
                payload: reply(query_id(&sent.payload), 0x8180, &[rr(1, &[10, 1, 2, 3])]),
            })
        });
        let mut dns = DnsClient::new(SERVER, 0);
        assert_eq!(dns.resolve(&mut chip, "example.com", i64::MAX, ticking_clock), Ok(Ipv4Address::new(10, 1, 2, 3)));
    }

    #[test]
    fn test_mismatched_id_times_out() {
        let sim = SimChip::new();
        let mut chip = W5100::create(sim.bus()).unwrap();
        sim.set_responder(|sent| {
            Some(Reply {
                delay: 10,
                source: SERVER,
                port: 53,
                payload: reply(query_id(&sent.payload).wrapping_add(1), 0x8180, &[rr(1, &[1, 2, 3, 4])]),
            })
        });

        let mut dns = DnsClient::new(SERVER, 0);
        assert_eq!(dns.resolve(&mut chip, "example.com", 200, ticking_clock), Err(DnsError::Timeout));
    }

    #[test]
    fn test_foreign_source_ignored() {
        let sim = SimChip::new();
        let mut chip = W5100::create(sim.bus()).unwrap();
        sim.set_responder(|sent| {
            Some(Reply {
                delay: 10,
                source: Ipv4Address::new(6, 6, 6, 6),
                port: 53,
                payload: reply(query_id(&sent.payload), 0x8180, &[rr(1, &[6, 6, 6, 6])]),
            })
        });

        let mut dns = DnsClient::new(SERVER, 0);
        assert_eq!(dns.resolve(&mut chip, "example.com", 200, ticking_clock), Err(DnsError::Timeout));
    }

    #[test]
    fn test_error_rcode_fails_fast() {
        let sim = SimChip::new();
        let mut chip = W5100::create(sim.bus()).unwrap();
        sim.set_responder(|sent| {
            Some(Reply {
                delay: 10,
                source: SERVER,
                port: 53,
                payload: reply(query_id(&sent.payload), 0x8182, &[rr(1, &[1, 2, 3, 4])]),
            })
        });

        let mut dns = DnsClient::new(SERVER, 0);
        let start = NOW.with(|t| t.get());
        assert_eq!(dns.resolve(&mut chip, "example.com", 5000, ticking_clock), Err(DnsError::ServerFailure(2)));
        assert!(NOW.with(|t| t.get()) - start < 5000);
    }

    #[test]
    fn test_resolve_argument_errors() {
        let sim = SimChip::new();
        let mut chip = W5100::create(sim.bus()).unwrap();
        let mut dns = DnsClient::new(Ipv4Address::UNSPECIFIED, 0);
        assert_eq!(dns.resolve(&mut chip, "example.com", 100, ticking_clock), Err(DnsError::InvalidServer));

        dns.set_server(SERVER);
        assert_eq!(dns.resolve(&mut chip, "bad..name", 100, ticking_clock), Err(DnsError::InvalidHostname));

        for s in SocketId::ALL {
            sim.set_status(s, SocketStatus::Established);
        }
        assert_eq!(dns.resolve(&mut chip, "example.com", 100, ticking_clock), Err(DnsError::NoSocket));
        assert!(sim.take_sent().is_empty());
    }

    #[test]
    fn test_with_rng_seeds_ids() {
        struct Fixed;
        impl RngCore for Fixed {
            fn next_u32(&mut self) -> u32 {
                0x0001_0041
            }
            fn next_u64(&mut self) -> u64 {
                0
            }
            fn fill_bytes(&mut self, dest: &mut [u8]) {
                dest.fill(0)
            }
            fn try_fill_bytes(&mut self, dest: &mut [u8]) -> Result<(), rand_core::Error> {
                dest.fill(0);
                Ok(())
            }
        }
        let mut dns = DnsClient::with_rng(SERVER, &mut Fixed);
        assert_eq!(dns.next_transaction_id(), 0x0042);
        assert_eq!(dns.next_transaction_id(), 0x0043);
    }
}
