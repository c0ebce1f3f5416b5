//! W5100 controller handle.
//!
//! Owns the bus and every piece of per-chip software state: ring bases,
//! local ports, the ephemeral port counter and the interrupt aggregate.
//! The ring, command and socket layers are further `impl` blocks on the
//! same type in their own modules.

use core::hint::spin_loop;

use smoltcp::wire::{EthernetAddress, Ipv4Address};

use crate::bus::{Bus, SpiBus};
use crate::config::{NetConfig, RetryConfig, EPHEMERAL_PORT_START, RESET_POLL_LIMIT};
use crate::irq::InterruptAggregate;
use crate::regs::{common, Interrupt, Mode, MAX_SOCKETS, MEM_SIZE_2K_EACH, RING_SIZE, RX_MEM_BASE, TX_MEM_BASE};
use crate::{Error, Result};

/// Interrupt sources enabled in IMR after reset.
pub const IMR_DEFAULT: Interrupt = Interrupt::SOCKETS.union(Interrupt::CONFLICT).union(Interrupt::UNREACH);

/// The one physical chip.
pub struct W5100<S> {
    pub(crate) bus: Bus<S>,
    pub(crate) tx_base: [u16; MAX_SOCKETS],
    pub(crate) rx_base: [u16; MAX_SOCKETS],
    pub(crate) local_port: [u16; MAX_SOCKETS],
    pub(crate) next_ephemeral: u16,
    pub(crate) irq: InterruptAggregate,
    pub(crate) unreachable: Option<(Ipv4Address, u16)>,
}

impl<S: SpiBus> W5100<S> {
    /// Wrap a bus without touching the chip.
    ///
    /// Ring bases assume the 2 KiB-per-socket layout that `init` programs.
    pub fn new(spi: S) -> Self {
        let mut tx_base = [0u16; MAX_SOCKETS];
        let mut rx_base = [0u16; MAX_SOCKETS];
        for i in 0..MAX_SOCKETS {
            tx_base[i] = TX_MEM_BASE + RING_SIZE * i as u16;
            rx_base[i] = RX_MEM_BASE + RING_SIZE * i as u16;
        }
        Self {
            bus: Bus::new(spi),
            tx_base,
            rx_base,
            local_port: [0; MAX_SOCKETS],
            next_ephemeral: EPHEMERAL_PORT_START,
            irq: InterruptAggregate::new(),
            unreachable: None,
        }
    }

    /// Create and reset a controller.
    pub fn create(spi: S) -> Result<Self> {
        let mut chip = Self::new(spi);
        chip.init()?;
        Ok(chip)
    }

    /// Soft-reset the chip and program the memory layout.
    ///
    /// Every socket ends up CLOSED and all software state is cleared.
    pub fn init(&mut self) -> Result<()> {
        self.bus.write_reg8(common::MR, Mode::RST.bits());

        let mut polls = 0u32;
        while Mode::from_bits_retain(self.bus.read_reg8(common::MR)).contains(Mode::RST) {
            polls += 1;
            if polls >= RESET_POLL_LIMIT {
                log::warn!("W5100 reset bit stuck after {} polls", polls);
                return Err(Error::ResetTimeout);
            }
            spin_loop();
        }

        self.bus.write_reg8(common::TMSR, MEM_SIZE_2K_EACH);
        self.bus.write_reg8(common::RMSR, MEM_SIZE_2K_EACH);
        if !self.probe() {
            log::warn!("W5100 not responding (TMSR readback mismatch)");
            return Err(Error::NotResponding);
        }

        self.bus.write_reg8(common::IMR, IMR_DEFAULT.bits());

        self.local_port = [0; MAX_SOCKETS];
        self.next_ephemeral = EPHEMERAL_PORT_START;
        self.irq.reset();
        self.unreachable = None;

        log::info!("W5100 ready, 4 sockets x {} byte rings", RING_SIZE);
        Ok(())
    }

    /// Whether the chip answers with the memory layout `init` programmed.
    pub fn probe(&mut self) -> bool {
        self.bus.read_reg8(common::TMSR) == MEM_SIZE_2K_EACH
    }

    pub fn spi(&self) -> &S {
        self.bus.spi()
    }

    /// Give the bus back to the board.
    pub fn release(self) -> S {
        self.bus.into_inner()
    }

    /// Sticky interrupt flags collected by `drain_interrupts`.
    pub fn interrupts(&self) -> &InterruptAggregate {
        &self.irq
    }

    // =========================================================================
    // Network configuration
    // =========================================================================

    /// Program MAC, IP, gateway and subnet in one go.
    pub fn configure(&mut self, cfg: &NetConfig) {
        self.set_mac_address(cfg.mac);
        self.set_ip_address(cfg.ip);
        self.set_gateway_ip(cfg.gateway);
        self.set_subnet_mask(cfg.subnet);
        log::info!("W5100 configured: ip={} gw={} mask={}", cfg.ip, cfg.gateway, cfg.subnet);
    }

    pub fn set_mac_address(&mut self, mac: EthernetAddress) {
        self.bus.write_reg_from(common::SHAR, &mac.0);
    }

    pub fn mac_address(&mut self) -> EthernetAddress {
        let mut mac = [0u8; 6];
        self.bus.read_reg_into(common::SHAR, &mut mac);
        EthernetAddress(mac)
    }

    pub fn set_ip_address(&mut self, ip: Ipv4Address) {
        self.bus.write_reg_from(common::SIPR, &ip.octets());
    }

    pub fn local_ip(&mut self) -> Ipv4Address {
        self.read_ipv4(common::SIPR)
    }

    pub fn set_gateway_ip(&mut self, ip: Ipv4Address) {
        self.bus.write_reg_from(common::GAR, &ip.octets());
    }

    pub fn gateway_ip(&mut self) -> Ipv4Address {
        self.read_ipv4(common::GAR)
    }

    pub fn set_subnet_mask(&mut self, mask: Ipv4Address) {
        self.bus.write_reg_from(common::SUBR, &mask.octets());
    }

    pub fn subnet_mask(&mut self) -> Ipv4Address {
        self.read_ipv4(common::SUBR)
    }

    pub fn set_retransmission(&mut self, retry: RetryConfig) {
        self.bus.write_reg16(common::RTR, retry.timeout);
        self.bus.write_reg8(common::RCR, retry.count);
    }

    pub fn retransmission(&mut self) -> RetryConfig {
        RetryConfig {
            timeout: self.bus.read_reg16(common::RTR),
            count: self.bus.read_reg8(common::RCR),
        }
    }

    /// Destination reported by the last UNREACH interrupt, if any.
    ///
    /// Latched from UIPR/UPORT by `drain_interrupts`.
    pub fn unreachable_destination(&self) -> Option<(Ipv4Address, u16)> {
        self.unreachable
    }

    pub(crate) fn read_ipv4(&mut self, reg: crate::regs::Register) -> Ipv4Address {
        let mut octets = [0u8; 4];
        self.bus.read_reg_into(reg, &mut octets);
        Ipv4Address::from(octets)
    }
}
