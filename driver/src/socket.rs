//! Socket operations
//!
//! Lifecycle (open/connect/listen/close), TCP stream data and UDP datagram
//! data on top of the ring and command layers. Send completion is read from
//! the sticky interrupt aggregate, never from Sn_IR directly, so it works
//! the same whether the board drains from an interrupt handler or not.

use core::hint::spin_loop;

use smoltcp::wire::{EthernetAddress, Ipv4Address};

use crate::bus::SpiBus;
use crate::chip::W5100;
use crate::config::EPHEMERAL_PORT_START;
use crate::regs::{socket, SocketCommand, SocketFlags, SocketId, SocketInterrupt, SocketMode, SocketStatus, RING_SIZE};
use crate::utils::is_unusable_destination;
use crate::{Error, Result};

/// Size of the header the chip prepends to each received UDP datagram.
pub const UDP_HEADER_LEN: usize = 8;
/// IP-raw header: source address and length.
pub const IPRAW_HEADER_LEN: usize = 6;
/// MAC-raw header: frame length, counting the header itself.
pub const MACRAW_HEADER_LEN: usize = 2;

/// Source and length of a received datagram.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DatagramInfo {
    pub source: Ipv4Address,
    pub port: u16,
    /// Full datagram length as reported by the chip
    pub len: usize,
}

impl<S: SpiBus> W5100<S> {
    /// First socket that is CLOSED (or FIN_WAIT, about to be).
    pub fn allocate_socket(&mut self) -> Result<SocketId> {
        for s in SocketId::ALL {
            if self.status(s).is_reusable() {
                return Ok(s);
            }
        }
        Err(Error::NoFreeSocket)
    }

    /// Local port a socket was opened with.
    pub fn local_port(&self, s: SocketId) -> u16 {
        self.local_port[s.index()]
    }

    fn next_ephemeral_port(&mut self) -> u16 {
        let port = self.next_ephemeral;
        self.next_ephemeral = match self.next_ephemeral.checked_add(1) {
            Some(next) => next,
            None => EPHEMERAL_PORT_START,
        };
        port
    }

    /// (Re)open `s` in `mode`. Port 0 picks the next ephemeral port.
    ///
    /// Returns the local port in use.
    pub fn open(&mut self, s: SocketId, mode: SocketMode, flags: SocketFlags, port: u16) -> Result<u16> {
        let expected = match mode {
            SocketMode::Tcp => SocketStatus::Init,
            SocketMode::Udp => SocketStatus::Udp,
            SocketMode::IpRaw => SocketStatus::IpRaw,
            SocketMode::MacRaw => SocketStatus::MacRaw,
            SocketMode::Closed => {
                self.close(s);
                return Ok(0);
            }
        };

        self.close(s);
        self.bus.write_reg8(socket::MR.of(s), mode as u8 | flags.bits());
        let port = if port == 0 { self.next_ephemeral_port() } else { port };
        self.bus.write_reg16(socket::PORT.of(s), port);
        self.execute(s, SocketCommand::Open);

        let status = self.status(s);
        if status != expected {
            log::warn!("socket {} open as {:?} left status {:?}", s.index(), mode, status);
            self.close(s);
            return Err(Error::UnexpectedStatus(status.raw()));
        }
        self.local_port[s.index()] = port;
        log::debug!("socket {} open {:?} port {}", s.index(), mode, port);
        Ok(port)
    }

    /// Close immediately and forget every pending flag for the slot.
    pub fn close(&mut self, s: SocketId) {
        self.execute(s, SocketCommand::Close);
        self.bus.write_reg8(socket::IR.of(s), 0xFF);
        self.irq.clear_socket(s);
        self.local_port[s.index()] = 0;
    }

    /// Start a graceful TCP close (FIN).
    pub fn disconnect(&mut self, s: SocketId) {
        self.execute(s, SocketCommand::Discon);
    }

    /// Start a TCP connection. Progress shows up in `status`.
    pub fn connect(&mut self, s: SocketId, ip: Ipv4Address, port: u16) -> Result<()> {
        if is_unusable_destination(ip) || port == 0 {
            return Err(Error::InvalidAddress);
        }
        self.set_destination(s, ip, port);
        self.execute(s, SocketCommand::Connect);
        Ok(())
    }

    /// Wait for an incoming TCP connection. The socket must be in INIT.
    pub fn listen(&mut self, s: SocketId) -> Result<()> {
        let status = self.status(s);
        if status != SocketStatus::Init {
            return Err(Error::UnexpectedStatus(status.raw()));
        }
        self.execute(s, SocketCommand::Listen);
        Ok(())
    }

    /// IP protocol number for IP-raw sockets; set before `open`.
    pub fn set_protocol(&mut self, s: SocketId, protocol: u8) {
        self.bus.write_reg8(socket::PROTO.of(s), protocol);
    }

    pub fn set_tos(&mut self, s: SocketId, tos: u8) {
        self.bus.write_reg8(socket::TOS.of(s), tos);
    }

    pub fn set_ttl(&mut self, s: SocketId, ttl: u8) {
        self.bus.write_reg8(socket::TTL.of(s), ttl);
    }

    /// Maximum segment size for TCP.
    pub fn set_mss(&mut self, s: SocketId, mss: u16) {
        self.bus.write_reg16(socket::MSSR.of(s), mss);
    }

    /// Destination hardware address, used by multicast UDP sockets.
    pub fn set_destination_mac(&mut self, s: SocketId, mac: EthernetAddress) {
        self.bus.write_reg_from(socket::DHAR.of(s), &mac.0);
    }

    fn set_destination(&mut self, s: SocketId, ip: Ipv4Address, port: u16) {
        self.bus.write_reg_from(socket::DIPR.of(s), &ip.octets());
        self.bus.write_reg16(socket::DPORT.of(s), port);
    }

    /// Wait for SEND_OK or TIMEOUT after a SEND.
    ///
    /// TCP sockets also give up when the peer drops the connection; both
    /// failures close the socket.
    fn wait_send_complete(&mut self, s: SocketId, tcp: bool) -> Result<()> {
        loop {
            self.drain_interrupts();
            let flags = self.irq.take_socket(s, SocketInterrupt::SEND_OK | SocketInterrupt::TIMEOUT);
            if flags.contains(SocketInterrupt::SEND_OK) {
                return Ok(());
            }
            if flags.contains(SocketInterrupt::TIMEOUT) {
                log::debug!("socket {} send timed out", s.index());
                if tcp {
                    self.close(s);
                }
                return Err(Error::SendTimeout);
            }
            if tcp && self.status(s) == SocketStatus::Closed {
                self.close(s);
                return Err(Error::ConnectionClosed);
            }
            spin_loop();
        }
    }

    /// Drop completion flags left over from an earlier send.
    fn clear_send_flags(&mut self, s: SocketId) {
        self.drain_interrupts();
        self.irq.take_socket(s, SocketInterrupt::SEND_OK | SocketInterrupt::TIMEOUT);
    }

    // =========================================================================
    // TCP
    // =========================================================================

    /// Send up to one ring's worth of `data` on a connected socket.
    ///
    /// Blocks until the ring has room, then until the chip reports the
    /// segment sent. Returns the number of bytes sent.
    pub fn send(&mut self, s: SocketId, data: &[u8]) -> Result<usize> {
        let len = data.len().min(RING_SIZE as usize);
        if len == 0 {
            return Ok(0);
        }

        loop {
            let free = self.free_tx_bytes(s) as usize;
            let status = self.status(s);
            if !status.can_send() {
                return Err(match status {
                    SocketStatus::Closed => Error::ConnectionClosed,
                    other => Error::UnexpectedStatus(other.raw()),
                });
            }
            if free >= len {
                break;
            }
            spin_loop();
        }

        self.clear_send_flags(s);
        self.stage_send(s, 0, &data[..len])?;
        self.execute(s, SocketCommand::Send);
        self.wait_send_complete(s, true)?;
        Ok(len)
    }

    /// Read received stream bytes into `buf`.
    ///
    /// `Ok(Some(n))` with n > 0 is data, `Ok(Some(0))` means the peer has
    /// closed and nothing is left, `Ok(None)` means nothing has arrived yet.
    /// An empty `buf` while data is pending also gives `Ok(None)`.
    pub fn recv(&mut self, s: SocketId, buf: &mut [u8]) -> Result<Option<usize>> {
        let available = self.pending_rx_bytes(s) as usize;
        if available == 0 {
            return Ok(match self.status(s) {
                SocketStatus::Listen | SocketStatus::Closed | SocketStatus::CloseWait => Some(0),
                _ => None,
            });
        }
        if buf.is_empty() {
            return Ok(None);
        }
        let n = available.min(buf.len());
        self.consume_receive(s, &mut buf[..n], false)?;
        self.execute(s, SocketCommand::Recv);
        Ok(Some(n))
    }

    /// Next received byte without consuming it.
    pub fn peek(&mut self, s: SocketId) -> Result<Option<u8>> {
        if self.pending_rx_bytes(s) == 0 {
            return Ok(None);
        }
        let mut byte = [0u8; 1];
        self.consume_receive(s, &mut byte, true)?;
        Ok(Some(byte[0]))
    }

    pub fn recv_available(&mut self, s: SocketId) -> usize {
        self.pending_rx_bytes(s) as usize
    }

    // =========================================================================
    // UDP
    // =========================================================================

    /// Send one datagram to `ip:port`.
    pub fn send_to(&mut self, s: SocketId, data: &[u8], ip: Ipv4Address, port: u16) -> Result<usize> {
        self.start_udp(s, ip, port)?;
        let free = self.free_tx_bytes(s) as usize;
        if data.len() > free {
            return Err(Error::InsufficientTxSpace { requested: data.len(), free });
        }
        self.stage_send(s, 0, data)?;
        self.send_udp(s)?;
        Ok(data.len())
    }

    /// Receive one datagram into `buf`.
    ///
    /// Bytes beyond `buf.len()` are dropped; the returned `len` is the full
    /// datagram size so callers can tell. `None` when nothing is queued.
    pub fn recv_from(&mut self, s: SocketId, buf: &mut [u8]) -> Result<Option<DatagramInfo>> {
        let Some(info) = self.read_datagram_header(s)? else {
            return Ok(None);
        };
        let n = info.len.min(buf.len());
        self.consume_receive(s, &mut buf[..n], false)?;
        self.discard_receive(s, (info.len - n) as u16);
        self.execute(s, SocketCommand::Recv);
        Ok(Some(info))
    }

    /// Consume the header of the next datagram, if one is queued.
    ///
    /// The header layout follows the socket's protocol: 8 bytes for UDP,
    /// 6 for IP-raw and 2 for MAC-raw. Raw datagrams report port 0, and
    /// MAC-raw frames an unspecified source. The payload stays in the ring;
    /// RECV is issued for the header.
    pub(crate) fn read_datagram_header(&mut self, s: SocketId) -> Result<Option<DatagramInfo>> {
        let mode = SocketMode::from_register(self.bus.read_reg8(socket::MR.of(s)));
        let header_len = match mode {
            Some(SocketMode::IpRaw) => IPRAW_HEADER_LEN,
            Some(SocketMode::MacRaw) => MACRAW_HEADER_LEN,
            _ => UDP_HEADER_LEN,
        };
        let pending = self.pending_rx_bytes(s) as usize;
        if pending < header_len {
            return Ok(None);
        }
        let mut header = [0u8; UDP_HEADER_LEN];
        self.consume_receive(s, &mut header[..header_len], false)?;
        self.execute(s, SocketCommand::Recv);

        let (source, port, len) = match mode {
            Some(SocketMode::IpRaw) => (
                Ipv4Address::new(header[0], header[1], header[2], header[3]),
                0,
                u16::from_be_bytes([header[4], header[5]]) as usize,
            ),
            Some(SocketMode::MacRaw) => (
                Ipv4Address::UNSPECIFIED,
                0,
                (u16::from_be_bytes([header[0], header[1]]) as usize).saturating_sub(MACRAW_HEADER_LEN),
            ),
            _ => (
                Ipv4Address::new(header[0], header[1], header[2], header[3]),
                u16::from_be_bytes([header[4], header[5]]),
                u16::from_be_bytes([header[6], header[7]]) as usize,
            ),
        };
        // A length past what the chip holds means the ring is out of sync
        let len = len.min(pending - header_len);
        Ok(Some(DatagramInfo { source, port, len }))
    }

    /// Begin building a datagram for `ip:port`; fill it with `buffer_data`.
    pub fn start_udp(&mut self, s: SocketId, ip: Ipv4Address, port: u16) -> Result<()> {
        if ip.is_unspecified() || port == 0 {
            return Err(Error::InvalidAddress);
        }
        self.set_destination(s, ip, port);
        Ok(())
    }

    /// Stage `data` at `offset` bytes into the datagram being built.
    ///
    /// Writes as much as fits in the TX ring and returns that count.
    pub fn buffer_data(&mut self, s: SocketId, offset: u16, data: &[u8]) -> Result<usize> {
        let free = (self.free_tx_bytes(s) as usize).saturating_sub(offset as usize);
        let n = data.len().min(free);
        self.stage_send(s, offset, &data[..n])?;
        Ok(n)
    }

    /// Transmit the datagram assembled with `buffer_data`.
    pub fn send_udp(&mut self, s: SocketId) -> Result<()> {
        self.clear_send_flags(s);
        self.execute(s, SocketCommand::Send);
        self.wait_send_complete(s, false)
    }

    // =========================================================================
    // Raw
    // =========================================================================

    /// Send one IP-raw datagram to `ip`.
    ///
    /// The IP protocol number is the one given to `set_protocol` before
    /// `open`; raw sockets have no port.
    pub fn send_raw_to(&mut self, s: SocketId, data: &[u8], ip: Ipv4Address) -> Result<usize> {
        if ip.is_unspecified() {
            return Err(Error::InvalidAddress);
        }
        self.bus.write_reg_from(socket::DIPR.of(s), &ip.octets());
        self.send_raw(s, data)
    }

    /// Send `data` on a raw socket to whatever destination is programmed.
    ///
    /// On a MAC-raw socket `data` is a whole Ethernet frame. A send timeout
    /// closes the socket.
    pub fn send_raw(&mut self, s: SocketId, data: &[u8]) -> Result<usize> {
        let free = self.free_tx_bytes(s) as usize;
        if data.len() > free {
            return Err(Error::InsufficientTxSpace { requested: data.len(), free });
        }
        self.stage_send(s, 0, data)?;
        if let Err(e) = self.send_udp(s) {
            self.close(s);
            return Err(e);
        }
        Ok(data.len())
    }
}
