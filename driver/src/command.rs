//! Socket command engine and interrupt drain.

use core::hint::spin_loop;

use crate::bus::SpiBus;
use crate::chip::W5100;
use crate::regs::{common, socket, Interrupt, SocketCommand, SocketId, SocketInterrupt, SocketStatus};

/// IR re-reads per drain before giving up on a line that never goes quiet.
const DRAIN_PASS_LIMIT: u32 = 64;

impl<S: SpiBus> W5100<S> {
    /// Write `cmd` to Sn_CR and wait for the chip to accept it.
    ///
    /// Acceptance is Sn_CR reading back zero; the command's effect (a
    /// connection, a transmitted datagram) shows up later in Sn_SR/Sn_IR.
    pub fn execute(&mut self, s: SocketId, cmd: SocketCommand) {
        let cr = socket::CR.of(s);
        self.bus.write_reg8(cr, cmd as u8);
        while self.bus.read_reg8(cr) != 0 {
            spin_loop();
        }
        log::trace!("socket {} command {:?}", s.index(), cmd);
    }

    pub fn status(&mut self, s: SocketId) -> SocketStatus {
        SocketStatus::from(self.bus.read_reg8(socket::SR.of(s)))
    }

    /// Move pending chip interrupts into the sticky aggregate.
    ///
    /// Safe to call from polling code and from the interrupt handler alike.
    /// Returns every IR bit observed; empty means no bus writes happened.
    pub fn drain_interrupts(&mut self) -> Interrupt {
        let mut seen = Interrupt::empty();
        for _ in 0..DRAIN_PASS_LIMIT {
            let ir = Interrupt::from_bits_retain(self.bus.read_reg8(common::IR));
            if ir.is_empty() {
                return seen;
            }
            seen |= ir;

            for s in SocketId::ALL {
                if !ir.contains(s.interrupt_bit()) {
                    continue;
                }
                let sn_ir = socket::IR.of(s);
                let raw = self.bus.read_reg8(sn_ir);
                if raw != 0 {
                    self.irq.record_socket(s, SocketInterrupt::from_bits_retain(raw));
                    self.bus.write_reg8(sn_ir, raw);
                }
            }

            if ir.contains(Interrupt::UNREACH) {
                let ip = self.read_ipv4(common::UIPR);
                let port = self.bus.read_reg16(common::UPORT);
                log::debug!("destination unreachable: {}:{}", ip, port);
                self.unreachable = Some((ip, port));
            }
            if ir.contains(Interrupt::CONFLICT) {
                log::warn!("IP address conflict detected");
            }
            self.irq.record_global(ir);

            let global = ir & Interrupt::GLOBAL;
            if !global.is_empty() {
                self.bus.write_reg8(common::IR, global.bits());
            }
        }
        log::warn!("interrupt line still busy after {} passes", DRAIN_PASS_LIMIT);
        seen
    }
}
