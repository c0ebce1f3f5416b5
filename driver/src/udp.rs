//! UDP socket wrapper.
//!
//! Holds one hardware socket open in UDP mode for as long as it lives and
//! exposes datagram-at-a-time send and receive. Outgoing datagrams are
//! built with `begin_packet`, any number of `write`s and `end_packet`;
//! incoming ones are selected with `parse_packet` and drained with `read`.

use embedded_io::{ErrorType, Read, ReadReady, Write};
use smoltcp::wire::Ipv4Address;

use crate::bus::SpiBus;
use crate::chip::W5100;
use crate::regs::{SocketFlags, SocketId, SocketMode, SocketStatus};
use crate::utils::multicast_mac;
use crate::{Error, Result};

/// A UDP socket borrowed from the controller.
pub struct UdpSocket<'a, S: SpiBus> {
    chip: &'a mut W5100<S>,
    socket: SocketId,
    port: u16,
    /// Bytes staged for the datagram being built, if one is open
    tx_offset: Option<u16>,
    /// Unread payload bytes of the current inbound datagram
    remaining: usize,
    remote: (Ipv4Address, u16),
}

impl<'a, S: SpiBus> UdpSocket<'a, S> {
    /// Open a free socket in UDP mode on `port` (0 for ephemeral).
    pub fn begin(chip: &'a mut W5100<S>, port: u16) -> Result<Self> {
        let socket = chip.allocate_socket()?;
        let port = chip.open(socket, SocketMode::Udp, SocketFlags::empty(), port)?;
        Ok(Self {
            chip,
            socket,
            port,
            tx_offset: None,
            remaining: 0,
            remote: (Ipv4Address::UNSPECIFIED, 0),
        })
    }

    /// Join multicast `group` and receive datagrams sent to it on `port`.
    ///
    /// Sn_DHAR, Sn_DIPR and Sn_DPORT must hold the group before the socket
    /// opens with MULTI; the chip sends the IGMP join itself.
    pub fn begin_multicast(chip: &'a mut W5100<S>, group: Ipv4Address, port: u16) -> Result<Self> {
        if !group.is_multicast() {
            return Err(Error::InvalidAddress);
        }
        let socket = chip.allocate_socket()?;
        chip.start_udp(socket, group, port)?;
        chip.set_destination_mac(socket, multicast_mac(group));
        let port = chip.open(socket, SocketMode::Udp, SocketFlags::MULTI, port)?;
        log::debug!("socket {} joined {}", socket.index(), group);
        Ok(Self {
            chip,
            socket,
            port,
            tx_offset: None,
            remaining: 0,
            remote: (Ipv4Address::UNSPECIFIED, 0),
        })
    }

    /// Close the socket. Dropping the wrapper does the same.
    pub fn stop(self) {}

    pub fn socket(&self) -> SocketId {
        self.socket
    }

    pub fn local_port(&self) -> u16 {
        self.port
    }

    pub fn status(&mut self) -> SocketStatus {
        self.chip.status(self.socket)
    }

    /// Start a datagram for `ip:port`, discarding any unsent one.
    pub fn begin_packet(&mut self, ip: Ipv4Address, port: u16) -> Result<()> {
        self.chip.start_udp(self.socket, ip, port)?;
        self.tx_offset = Some(0);
        Ok(())
    }

    /// Append to the open datagram. Returns how much fit.
    ///
    /// Fails with `InsufficientTxSpace` rather than returning 0 when the
    /// ring has no room left for a non-empty `data`.
    pub fn write_packet(&mut self, data: &[u8]) -> Result<usize> {
        let offset = self.tx_offset.ok_or(Error::NoPacket)?;
        let n = self.chip.buffer_data(self.socket, offset, data)?;
        if n == 0 && !data.is_empty() {
            let free = (self.chip.free_tx_bytes(self.socket) as usize).saturating_sub(offset as usize);
            return Err(Error::InsufficientTxSpace { requested: data.len(), free });
        }
        self.tx_offset = Some(offset.wrapping_add(n as u16));
        Ok(n)
    }

    /// Transmit the open datagram.
    pub fn end_packet(&mut self) -> Result<()> {
        if self.tx_offset.take().is_none() {
            return Err(Error::NoPacket);
        }
        self.chip.send_udp(self.socket)
    }

    /// Move to the next inbound datagram and return its payload size.
    ///
    /// Unread bytes of the previous datagram are skipped. 0 when nothing
    /// is queued.
    pub fn parse_packet(&mut self) -> Result<usize> {
        self.flush_inbound();
        let Some(info) = self.chip.read_datagram_header(self.socket)? else {
            return Ok(0);
        };
        self.remaining = info.len;
        self.remote = (info.source, info.port);
        Ok(info.len)
    }

    /// Read from the current datagram's payload.
    pub fn read_packet(&mut self, buf: &mut [u8]) -> Result<usize> {
        let n = self.remaining.min(buf.len());
        if n == 0 {
            return Ok(0);
        }
        self.chip.consume_receive(self.socket, &mut buf[..n], false)?;
        self.chip.execute(self.socket, crate::regs::SocketCommand::Recv);
        self.remaining -= n;
        Ok(n)
    }

    /// Next payload byte without consuming it.
    pub fn peek(&mut self) -> Result<Option<u8>> {
        if self.remaining == 0 {
            return Ok(None);
        }
        self.chip.peek(self.socket)
    }

    /// Unread bytes of the current datagram.
    pub fn available(&self) -> usize {
        self.remaining
    }

    pub fn remote_ip(&self) -> Ipv4Address {
        self.remote.0
    }

    pub fn remote_port(&self) -> u16 {
        self.remote.1
    }

    fn flush_inbound(&mut self) {
        if self.remaining > 0 {
            self.chip.discard_receive(self.socket, self.remaining as u16);
            self.chip.execute(self.socket, crate::regs::SocketCommand::Recv);
            self.remaining = 0;
        }
    }
}

impl<S: SpiBus> Drop for UdpSocket<'_, S> {
    fn drop(&mut self) {
        self.chip.close(self.socket);
    }
}

impl<S: SpiBus> ErrorType for UdpSocket<'_, S> {
    type Error = Error;
}

/// Reads the current datagram; `Ok(0)` marks its end.
impl<S: SpiBus> Read for UdpSocket<'_, S> {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        self.read_packet(buf)
    }
}

/// Writes append to the datagram opened with `begin_packet`; `flush`
/// sends it.
impl<S: SpiBus> Write for UdpSocket<'_, S> {
    fn write(&mut self, buf: &[u8]) -> Result<usize> {
        self.write_packet(buf)
    }

    fn flush(&mut self) -> Result<()> {
        if self.tx_offset.is_some() {
            self.end_packet()?;
        }
        Ok(())
    }
}

impl<S: SpiBus> ReadReady for UdpSocket<'_, S> {
    fn read_ready(&mut self) -> Result<bool> {
        Ok(self.remaining > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::regs::socket;
    use crate::sim::SimChip;
    use embedded_io::Error as _;

    const PEER: Ipv4Address = Ipv4Address::new(10, 0, 0, 99);

    #[test]
    fn test_begin_and_drop() {
        let sim = SimChip::new();
        let mut chip = W5100::create(sim.bus()).unwrap();
        {
            let udp = UdpSocket::begin(&mut chip, 0).unwrap();
            assert_eq!(udp.socket(), SocketId::ALL[0]);
            assert_eq!(udp.local_port(), 49152);
            assert_eq!(sim.status(SocketId::ALL[0]), SocketStatus::Udp);
        }
        assert_eq!(sim.status(SocketId::ALL[0]), SocketStatus::Closed);
    }

    #[test]
    fn test_packet_build() {
        let sim = SimChip::new();
        let mut chip = W5100::create(sim.bus()).unwrap();
        let mut udp = UdpSocket::begin(&mut chip, 4000).unwrap();

        assert_eq!(udp.write_packet(b"early"), Err(Error::NoPacket));
        assert_eq!(udp.end_packet(), Err(Error::NoPacket));

        udp.begin_packet(PEER, 9000).unwrap();
        udp.write_all(b"hello ").unwrap();
        udp.write_all(b"world").unwrap();
        udp.flush().unwrap();

        let sent = sim.take_sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].payload, b"hello world");
        assert_eq!((sent[0].dest, sent[0].port), (PEER, 9000));

        // Nothing open: flush is a no-op
        udp.flush().unwrap();
        assert!(sim.take_sent().is_empty());
    }

    #[test]
    fn test_begin_multicast() {
        let sim = SimChip::new();
        let mut chip = W5100::create(sim.bus()).unwrap();
        assert_eq!(
            UdpSocket::begin_multicast(&mut chip, PEER, 5353).err(),
            Some(Error::InvalidAddress)
        );
        let group = Ipv4Address::new(239, 129, 2, 3);
        assert_eq!(UdpSocket::begin_multicast(&mut chip, group, 0).err(), Some(Error::InvalidAddress));

        let mut udp = UdpSocket::begin_multicast(&mut chip, group, 5353).unwrap();
        let s = udp.socket();
        assert_eq!(udp.local_port(), 5353);
        assert_eq!(sim.status(s), SocketStatus::Udp);
        assert_eq!(sim.peek_mem(socket::MR.of(s).addr), 0x82);
        let dhar = socket::DHAR.of(s).addr;
        let mac: Vec<u8> = (0..6).map(|i| sim.peek_mem(dhar + i)).collect();
        assert_eq!(mac, [0x01, 0x00, 0x5E, 0x01, 0x02, 0x03]);
        let dipr = socket::DIPR.of(s).addr;
        let dest: Vec<u8> = (0..4).map(|i| sim.peek_mem(dipr + i)).collect();
        assert_eq!(dest, group.octets());
        assert_eq!(sim.peek16(socket::DPORT.of(s).addr), 5353);

        sim.deliver_udp(s, PEER, 5353, b"announce");
        assert_eq!(udp.parse_packet(), Ok(8));
        assert_eq!(udp.remote_ip(), PEER);
    }

    #[test]
    fn test_write_on_full_ring_fails() {
        let sim = SimChip::new();
        let mut chip = W5100::create(sim.bus()).unwrap();
        let mut udp = UdpSocket::begin(&mut chip, 4000).unwrap();
        let s = udp.socket();
        udp.begin_packet(PEER, 9000).unwrap();
        sim.poke16(socket::TX_FSR.of(s).addr, 0);

        assert_eq!(udp.write(b""), Ok(0));
        assert_eq!(udp.write(b"x"), Err(Error::InsufficientTxSpace { requested: 1, free: 0 }));
        assert_eq!(udp.write_all(b"x"), Err(Error::InsufficientTxSpace { requested: 1, free: 0 }));
        assert_eq!(Error::InsufficientTxSpace { requested: 1, free: 0 }.kind(), embedded_io::ErrorKind::OutOfMemory);

        // Partial fit keeps going until the ring is exhausted
        sim.poke16(socket::TX_FSR.of(s).addr, 4);
        assert_eq!(udp.write(b"abcdef"), Ok(4));
        assert_eq!(udp.write(b"gh"), Err(Error::InsufficientTxSpace { requested: 2, free: 0 }));
    }

    #[test]
    fn test_parse_and_read() {
        let sim = SimChip::new();
        let mut chip = W5100::create(sim.bus()).unwrap();
        let mut udp = UdpSocket::begin(&mut chip, 4000).unwrap();
        let s = udp.socket();
        assert_eq!(udp.parse_packet(), Ok(0));
        assert!(!udp.read_ready().unwrap());

        sim.deliver_udp(s, PEER, 53, b"abcdef");
        sim.deliver_udp(s, PEER, 54, b"xyz");

        assert_eq!(udp.parse_packet(), Ok(6));
        assert_eq!((udp.remote_ip(), udp.remote_port()), (PEER, 53));
        assert_eq!(udp.peek(), Ok(Some(b'a')));
        let mut buf = [0u8; 4];
        assert_eq!(udp.read(&mut buf), Ok(4));
        assert_eq!(&buf, b"abcd");
        assert_eq!(udp.available(), 2);

        // Skips "ef"
        assert_eq!(udp.parse_packet(), Ok(3));
        assert_eq!(udp.remote_port(), 54);
        let mut buf = [0u8; 8];
        assert_eq!(udp.read(&mut buf), Ok(3));
        assert_eq!(udp.read(&mut buf), Ok(0));
        assert_eq!(udp.peek(), Ok(None));
        assert_eq!(udp.parse_packet(), Ok(0));
    }
}
