//! W5100 register map
//!
//! Registers are described as data: an absolute address plus a width in
//! bytes. Socket registers are described by their offset inside a socket
//! block and resolved to an absolute address with `SocketRegister::of`.
//! The `Bus` accessors below are the only code that turns a descriptor
//! into bus traffic.

use crate::bus::{Bus, SpiBus};

// =============================================================================
// Geometry
// =============================================================================

/// Number of hardware sockets
pub const MAX_SOCKETS: usize = 4;

/// First socket register block
pub const SOCKET_REG_BASE: u16 = 0x0400;
/// Distance between socket register blocks
pub const SOCKET_REG_STRIDE: u16 = 0x0100;

/// TX ring memory start
pub const TX_MEM_BASE: u16 = 0x4000;
/// RX ring memory start
pub const RX_MEM_BASE: u16 = 0x6000;
/// Per-socket ring size (TMSR/RMSR = 0x55)
pub const RING_SIZE: u16 = 2048;
/// Pointer mask for a 2 KiB ring
pub const RING_MASK: u16 = RING_SIZE - 1;
/// TMSR/RMSR value giving every socket 2 KiB
pub const MEM_SIZE_2K_EACH: u8 = 0x55;

// =============================================================================
// Descriptors
// =============================================================================

/// An absolute register.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Register {
    pub addr: u16,
    pub width: u16,
}

impl Register {
    pub const fn new(addr: u16, width: u16) -> Self {
        Self { addr, width }
    }
}

/// A register inside each socket's block.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SocketRegister {
    pub offset: u16,
    pub width: u16,
}

impl SocketRegister {
    pub const fn new(offset: u16, width: u16) -> Self {
        Self { offset, width }
    }

    /// Resolve to the absolute register for `socket`.
    pub const fn of(self, socket: SocketId) -> Register {
        Register::new(
            SOCKET_REG_BASE + socket.0 as u16 * SOCKET_REG_STRIDE + self.offset,
            self.width,
        )
    }
}

/// Common (global) registers
pub mod common {
    use super::Register;

    pub const MR: Register = Register::new(0x0000, 1);
    pub const GAR: Register = Register::new(0x0001, 4);
    pub const SUBR: Register = Register::new(0x0005, 4);
    pub const SHAR: Register = Register::new(0x0009, 6);
    pub const SIPR: Register = Register::new(0x000F, 4);
    pub const IR: Register = Register::new(0x0015, 1);
    pub const IMR: Register = Register::new(0x0016, 1);
    pub const RTR: Register = Register::new(0x0017, 2);
    pub const RCR: Register = Register::new(0x0019, 1);
    pub const RMSR: Register = Register::new(0x001A, 1);
    pub const TMSR: Register = Register::new(0x001B, 1);
    pub const PATR: Register = Register::new(0x001C, 2);
    pub const PTIMER: Register = Register::new(0x0028, 1);
    pub const PMAGIC: Register = Register::new(0x0029, 1);
    pub const UIPR: Register = Register::new(0x002A, 4);
    pub const UPORT: Register = Register::new(0x002E, 2);
}

/// Per-socket registers (offsets inside a socket block)
pub mod socket {
    use super::SocketRegister;

    pub const MR: SocketRegister = SocketRegister::new(0x00, 1);
    pub const CR: SocketRegister = SocketRegister::new(0x01, 1);
    pub const IR: SocketRegister = SocketRegister::new(0x02, 1);
    pub const SR: SocketRegister = SocketRegister::new(0x03, 1);
    pub const PORT: SocketRegister = SocketRegister::new(0x04, 2);
    pub const DHAR: SocketRegister = SocketRegister::new(0x06, 6);
    pub const DIPR: SocketRegister = SocketRegister::new(0x0C, 4);
    pub const DPORT: SocketRegister = SocketRegister::new(0x10, 2);
    pub const MSSR: SocketRegister = SocketRegister::new(0x12, 2);
    pub const PROTO: SocketRegister = SocketRegister::new(0x14, 1);
    pub const TOS: SocketRegister = SocketRegister::new(0x15, 1);
    pub const TTL: SocketRegister = SocketRegister::new(0x16, 1);
    pub const TX_FSR: SocketRegister = SocketRegister::new(0x20, 2);
    pub const TX_RD: SocketRegister = SocketRegister::new(0x22, 2);
    pub const TX_WR: SocketRegister = SocketRegister::new(0x24, 2);
    pub const RX_RSR: SocketRegister = SocketRegister::new(0x26, 2);
    pub const RX_RD: SocketRegister = SocketRegister::new(0x28, 2);
    pub const RX_WR: SocketRegister = SocketRegister::new(0x2A, 2);
}

// =============================================================================
// Socket index
// =============================================================================

/// Hardware socket slot, always in 0..MAX_SOCKETS.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SocketId(u8);

impl SocketId {
    pub const ALL: [SocketId; MAX_SOCKETS] = [SocketId(0), SocketId(1), SocketId(2), SocketId(3)];

    pub const fn new(index: u8) -> Option<Self> {
        if (index as usize) < MAX_SOCKETS {
            Some(Self(index))
        } else {
            None
        }
    }

    pub const fn index(self) -> usize {
        self.0 as usize
    }

    /// This socket's bit in the common interrupt register.
    pub fn interrupt_bit(self) -> Interrupt {
        Interrupt::from_bits_truncate(1 << self.0)
    }
}

impl TryFrom<u8> for SocketId {
    type Error = crate::Error;

    fn try_from(index: u8) -> Result<Self, Self::Error> {
        SocketId::new(index).ok_or(crate::Error::InvalidSocket(index))
    }
}

// =============================================================================
// Flag sets
// =============================================================================

bitflags::bitflags! {
    /// Common mode register (MR)
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct Mode: u8 {
        /// Software reset, self-clearing
        const RST = 0x80;
        /// Ping block
        const PB = 0x10;
        /// PPPoE mode
        const PPPOE = 0x08;
        /// Address auto-increment in indirect bus mode
        const AI = 0x02;
        /// Indirect bus mode
        const IND = 0x01;
    }
}

bitflags::bitflags! {
    /// Common interrupt register (IR) and its mask (IMR)
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct Interrupt: u8 {
        /// IP address conflict detected by ARP
        const CONFLICT = 0x80;
        /// Destination unreachable (ICMP)
        const UNREACH = 0x40;
        /// PPPoE connection closed
        const PPPOE = 0x20;
        const S3 = 0x08;
        const S2 = 0x04;
        const S1 = 0x02;
        const S0 = 0x01;
    }
}

impl Interrupt {
    /// Bits that mirror per-socket Sn_IR state
    pub const SOCKETS: Interrupt = Interrupt::S0.union(Interrupt::S1).union(Interrupt::S2).union(Interrupt::S3);
    /// Bits that are cleared by writing 1 to IR
    pub const GLOBAL: Interrupt = Interrupt::CONFLICT.union(Interrupt::UNREACH).union(Interrupt::PPPOE);
}

bitflags::bitflags! {
    /// Socket interrupt register (Sn_IR), clear-by-write-1
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
    pub struct SocketInterrupt: u8 {
        const SEND_OK = 0x10;
        const TIMEOUT = 0x08;
        const RECV = 0x04;
        const DISCON = 0x02;
        const CON = 0x01;
    }
}

bitflags::bitflags! {
    /// Option bits in the socket mode register (Sn_MR)
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
    pub struct SocketFlags: u8 {
        /// UDP multicast
        const MULTI = 0x80;
        /// TCP no delayed ACK
        const ND = 0x20;
    }
}

// =============================================================================
// Socket mode / command / status
// =============================================================================

/// Protocol in the low nibble of Sn_MR.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum SocketMode {
    Closed = 0x00,
    Tcp = 0x01,
    Udp = 0x02,
    IpRaw = 0x03,
    MacRaw = 0x04,
}

impl SocketMode {
    pub fn from_register(value: u8) -> Option<Self> {
        match value & 0x0F {
            0x00 => Some(Self::Closed),
            0x01 => Some(Self::Tcp),
            0x02 => Some(Self::Udp),
            0x03 => Some(Self::IpRaw),
            0x04 => Some(Self::MacRaw),
            _ => None,
        }
    }
}

/// Opcodes accepted by Sn_CR.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum SocketCommand {
    Open = 0x01,
    Listen = 0x02,
    Connect = 0x04,
    Discon = 0x08,
    Close = 0x10,
    Send = 0x20,
    SendMac = 0x21,
    SendKeep = 0x22,
    Recv = 0x40,
}

/// Value of Sn_SR.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SocketStatus {
    Closed,
    Init,
    Listen,
    SynSent,
    SynRecv,
    Established,
    FinWait,
    Closing,
    TimeWait,
    CloseWait,
    LastAck,
    Udp,
    IpRaw,
    MacRaw,
    /// Transient or undocumented status byte
    Unknown(u8),
}

impl SocketStatus {
    pub fn raw(self) -> u8 {
        match self {
            Self::Closed => 0x00,
            Self::Init => 0x13,
            Self::Listen => 0x14,
            Self::SynSent => 0x15,
            Self::SynRecv => 0x16,
            Self::Established => 0x17,
            Self::FinWait => 0x18,
            Self::Closing => 0x1A,
            Self::TimeWait => 0x1B,
            Self::CloseWait => 0x1C,
            Self::LastAck => 0x1D,
            Self::Udp => 0x22,
            Self::IpRaw => 0x32,
            Self::MacRaw => 0x42,
            Self::Unknown(v) => v,
        }
    }

    /// Whether a TCP connection can still carry outbound data.
    pub fn can_send(self) -> bool {
        matches!(self, Self::Established | Self::CloseWait)
    }

    /// Whether the slot is free for a new owner.
    pub fn is_reusable(self) -> bool {
        matches!(self, Self::Closed | Self::FinWait)
    }
}

impl From<u8> for SocketStatus {
    fn from(value: u8) -> Self {
        match value {
            0x00 => Self::Closed,
            0x13 => Self::Init,
            0x14 => Self::Listen,
            0x15 => Self::SynSent,
            0x16 => Self::SynRecv,
            0x17 => Self::Established,
            0x18 => Self::FinWait,
            0x1A => Self::Closing,
            0x1B => Self::TimeWait,
            0x1C => Self::CloseWait,
            0x1D => Self::LastAck,
            0x22 => Self::Udp,
            0x32 => Self::IpRaw,
            0x42 => Self::MacRaw,
            other => Self::Unknown(other),
        }
    }
}

// =============================================================================
// Generic accessors
// =============================================================================

impl<S: SpiBus> Bus<S> {
    pub fn read_reg8(&mut self, reg: Register) -> u8 {
        debug_assert_eq!(reg.width, 1);
        self.read_byte(reg.addr)
    }

    pub fn write_reg8(&mut self, reg: Register, value: u8) {
        debug_assert_eq!(reg.width, 1);
        self.write_byte(reg.addr, value);
    }

    /// Big-endian 16-bit read: high byte at `addr`, low byte at `addr + 1`.
    pub fn read_reg16(&mut self, reg: Register) -> u16 {
        debug_assert_eq!(reg.width, 2);
        let hi = self.read_byte(reg.addr);
        let lo = self.read_byte(reg.addr + 1);
        u16::from_be_bytes([hi, lo])
    }

    /// Big-endian 16-bit write, high byte first.
    pub fn write_reg16(&mut self, reg: Register, value: u16) {
        debug_assert_eq!(reg.width, 2);
        let [hi, lo] = value.to_be_bytes();
        self.write_byte(reg.addr, hi);
        self.write_byte(reg.addr + 1, lo);
    }

    pub fn read_reg_into(&mut self, reg: Register, buf: &mut [u8]) {
        debug_assert_eq!(reg.width as usize, buf.len());
        self.read_block(reg.addr, buf);
    }

    pub fn write_reg_from(&mut self, reg: Register, buf: &[u8]) {
        debug_assert_eq!(reg.width as usize, buf.len());
        self.write_block(reg.addr, buf);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::SimChip;

    #[test]
    fn test_socket_register_stride() {
        let s2 = SocketId::new(2).unwrap();
        assert_eq!(socket::CR.of(s2).addr, 0x0601);
        assert_eq!(socket::RX_RD.of(SocketId::ALL[3]).addr, 0x0728);
        assert_eq!(socket::DIPR.of(SocketId::ALL[0]), Register::new(0x040C, 4));
    }

    #[test]
    fn test_socket_id_bounds() {
        assert!(SocketId::new(3).is_some());
        assert!(SocketId::new(4).is_none());
        assert_eq!(SocketId::try_from(9), Err(crate::Error::InvalidSocket(9)));
        assert_eq!(SocketId::ALL[2].interrupt_bit(), Interrupt::S2);
    }

    #[test]
    fn test_reg16_is_big_endian() {
        let chip = SimChip::new();
        let mut bus = Bus::new(chip.bus());
        let port = socket::PORT.of(SocketId::ALL[1]);
        bus.write_reg16(port, 0x1F90);
        assert_eq!(chip.peek_mem(0x0504), 0x1F);
        assert_eq!(chip.peek_mem(0x0505), 0x90);
        assert_eq!(bus.read_reg16(port), 8080);
    }

    #[test]
    fn test_array_register_roundtrip() {
        let chip = SimChip::new();
        let mut bus = Bus::new(chip.bus());
        bus.write_reg_from(common::SHAR, &[0xDE, 0xAD, 0xBE, 0xEF, 0x00, 0x01]);
        let mut mac = [0u8; 6];
        bus.read_reg_into(common::SHAR, &mut mac);
        assert_eq!(mac, [0xDE, 0xAD, 0xBE, 0xEF, 0x00, 0x01]);
        assert_eq!(chip.peek_mem(0x0009), 0xDE);
    }

    #[test]
    fn test_status_decoding() {
        assert_eq!(SocketStatus::from(0x17), SocketStatus::Established);
        assert_eq!(SocketStatus::from(0x22), SocketStatus::Udp);
        assert_eq!(SocketStatus::from(0x01), SocketStatus::Unknown(0x01));
        assert_eq!(SocketStatus::Unknown(0x01).raw(), 0x01);
        assert!(SocketStatus::CloseWait.can_send());
        assert!(SocketStatus::FinWait.is_reusable());
        assert!(!SocketStatus::Listen.is_reusable());
    }

    #[test]
    fn test_mode_nibble() {
        assert_eq!(SocketMode::from_register(0x22), Some(SocketMode::Udp));
        assert_eq!(SocketMode::from_register(0x05), None);
    }
}
