//! Interrupt aggregation
//!
//! `drain_interrupts` moves the chip's interrupt registers into an
//! `InterruptAggregate`: one sticky byte per socket plus the sticky
//! CONFLICT/UNREACH flags. Producers OR bits in and consumers take them
//! with AND-NOT, so a bit raised between a consumer's read and its clear
//! survives.
//!
//! `SharedController` lets an interrupt handler reach the controller
//! without ever spinning on a lock held by the code it preempted.

use core::sync::atomic::{AtomicBool, AtomicU8, Ordering};

use crate::bus::SpiBus;
use crate::chip::W5100;
use crate::lock::Spinlock;
use crate::regs::{Interrupt, SocketId, SocketInterrupt, MAX_SOCKETS};

/// Sticky interrupt flags.
pub struct InterruptAggregate {
    sockets: [AtomicU8; MAX_SOCKETS],
    global: AtomicU8,
}

impl Default for InterruptAggregate {
    fn default() -> Self {
        Self::new()
    }
}

impl InterruptAggregate {
    pub const fn new() -> Self {
        Self {
            sockets: [AtomicU8::new(0), AtomicU8::new(0), AtomicU8::new(0), AtomicU8::new(0)],
            global: AtomicU8::new(0),
        }
    }

    pub(crate) fn record_socket(&self, s: SocketId, bits: SocketInterrupt) {
        self.sockets[s.index()].fetch_or(bits.bits(), Ordering::AcqRel);
    }

    pub(crate) fn record_global(&self, bits: Interrupt) {
        let sticky = bits & (Interrupt::CONFLICT | Interrupt::UNREACH);
        self.global.fetch_or(sticky.bits(), Ordering::AcqRel);
    }

    /// Current flags for `s` without consuming them.
    pub fn socket(&self, s: SocketId) -> SocketInterrupt {
        SocketInterrupt::from_bits_retain(self.sockets[s.index()].load(Ordering::Acquire))
    }

    /// Consume the bits of `mask` that are set for `s`.
    pub fn take_socket(&self, s: SocketId, mask: SocketInterrupt) -> SocketInterrupt {
        let prev = self.sockets[s.index()].fetch_and(!mask.bits(), Ordering::AcqRel);
        SocketInterrupt::from_bits_retain(prev) & mask
    }

    pub fn take_conflict(&self) -> bool {
        self.take_global(Interrupt::CONFLICT)
    }

    pub fn take_unreachable(&self) -> bool {
        self.take_global(Interrupt::UNREACH)
    }

    fn take_global(&self, bit: Interrupt) -> bool {
        self.global.fetch_and(!bit.bits(), Ordering::AcqRel) & bit.bits() != 0
    }

    pub(crate) fn clear_socket(&self, s: SocketId) {
        self.sockets[s.index()].store(0, Ordering::Release);
    }

    pub(crate) fn reset(&self) {
        for s in SocketId::ALL {
            self.clear_socket(s);
        }
        self.global.store(0, Ordering::Release);
    }
}

/// A controller slot shared between foreground code and the chip's
/// interrupt handler.
///
/// ```ignore
/// static ETH: SharedController<BoardSpi> = SharedController::new();
///
/// fn eth_irq() {
///     ETH.on_interrupt();
/// }
/// ```
pub struct SharedController<S> {
    chip: Spinlock<Option<W5100<S>>>,
    deferred: AtomicBool,
}

impl<S> Default for SharedController<S> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S> SharedController<S> {
    pub const fn new() -> Self {
        Self {
            chip: Spinlock::new(None),
            deferred: AtomicBool::new(false),
        }
    }
}

impl<S: SpiBus> SharedController<S> {
    pub fn install(&self, chip: W5100<S>) {
        *self.chip.lock() = Some(chip);
    }

    pub fn take(&self) -> Option<W5100<S>> {
        self.chip.lock().take()
    }

    /// Run `f` on the controller. `None` if nothing is installed.
    ///
    /// Drains requested by the interrupt handler while `f` ran are
    /// serviced before the lock is released.
    pub fn with<R>(&self, f: impl FnOnce(&mut W5100<S>) -> R) -> Option<R> {
        let mut guard = self.chip.lock();
        let chip = guard.as_mut()?;
        let result = f(chip);
        self.service(chip);
        drop(guard);
        self.catch_up();
        Some(result)
    }

    /// Interrupt entry point.
    ///
    /// Drains immediately when the controller is free; otherwise leaves a
    /// request that the current holder services.
    pub fn on_interrupt(&self) {
        self.deferred.store(true, Ordering::Release);
        self.catch_up();
    }

    /// Whether a drain request is waiting for the lock holder.
    pub fn drain_pending(&self) -> bool {
        self.deferred.load(Ordering::Acquire)
    }

    fn service(&self, chip: &mut W5100<S>) {
        while self.deferred.swap(false, Ordering::AcqRel) {
            chip.drain_interrupts();
        }
    }

    fn catch_up(&self) {
        while self.deferred.load(Ordering::Acquire) {
            let Some(mut guard) = self.chip.try_lock() else {
                // The holder services it before unlocking
                return;
            };
            match guard.as_mut() {
                Some(chip) => self.service(chip),
                None => {
                    self.deferred.store(false, Ordering::Release);
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::regs::socket;
    use crate::sim::{SimBus, SimChip, SimEvent};
    use alloc::rc::Rc;
    use rand_core::{impls, RngCore};

    const S0: SocketId = SocketId::ALL[0];
    const S2: SocketId = SocketId::ALL[2];

    #[test]
    fn test_take_is_selective() {
        let agg = InterruptAggregate::new();
        agg.record_socket(S2, SocketInterrupt::RECV | SocketInterrupt::SEND_OK);
        assert_eq!(agg.take_socket(S2, SocketInterrupt::SEND_OK), SocketInterrupt::SEND_OK);
        assert_eq!(agg.socket(S2), SocketInterrupt::RECV);
        assert!(agg.take_socket(S2, SocketInterrupt::SEND_OK).is_empty());
        assert!(agg.socket(S0).is_empty());
    }

    #[test]
    fn test_global_flags() {
        let agg = InterruptAggregate::new();
        agg.record_global(Interrupt::UNREACH | Interrupt::PPPOE | Interrupt::S1);
        assert!(!agg.take_conflict());
        assert!(agg.take_unreachable());
        assert!(!agg.take_unreachable());
    }

    #[test]
    fn test_with_requires_install() {
        let shared: SharedController<SimBus> = SharedController::new();
        assert!(shared.with(|_| ()).is_none());
        shared.on_interrupt();
        assert!(!shared.drain_pending());
    }

    #[test]
    fn test_interrupt_while_idle_drains_now() {
        let sim = SimChip::new();
        let shared = SharedController::new();
        shared.install(W5100::create(sim.bus()).unwrap());

        sim.raise(SimEvent::SocketInterrupt(S2, SocketInterrupt::RECV));
        shared.on_interrupt();
        assert!(!shared.drain_pending());
        assert!(sim.socket_interrupt(S2).is_empty());
        let got = shared.with(|c| c.interrupts().take_socket(S2, SocketInterrupt::all()));
        assert_eq!(got, Some(SocketInterrupt::RECV));
    }

    #[test]
    fn test_interrupt_while_held_is_deferred() {
        let sim = SimChip::new();
        let shared = SharedController::new();
        shared.install(W5100::create(sim.bus()).unwrap());

        let seen = shared.with(|c| {
            sim.raise(SimEvent::SocketInterrupt(S0, SocketInterrupt::CON));
            // Handler preempts us: lock is held, so it only leaves a request
            shared.on_interrupt();
            assert!(shared.drain_pending());
            c.interrupts().socket(S0)
        });
        assert_eq!(seen, Some(SocketInterrupt::empty()));
        assert!(!shared.drain_pending());
        let got = shared.with(|c| c.interrupts().take_socket(S0, SocketInterrupt::CON));
        assert_eq!(got, Some(SocketInterrupt::CON));
    }

    /// xorshift64, deterministic per seed.
    struct SimpleRng(u64);

    impl RngCore for SimpleRng {
        fn next_u32(&mut self) -> u32 {
            self.next_u64() as u32
        }

        fn next_u64(&mut self) -> u64 {
            let mut x = self.0;
            x ^= x << 13;
            x ^= x >> 7;
            x ^= x << 17;
            self.0 = x;
            x
        }

        fn fill_bytes(&mut self, dest: &mut [u8]) {
            impls::fill_bytes_via_next(self, dest)
        }

        fn try_fill_bytes(&mut self, dest: &mut [u8]) -> Result<(), rand_core::Error> {
            self.fill_bytes(dest);
            Ok(())
        }
    }

    fn run_fuzz(seed: u64) {
        let mut rng = SimpleRng(seed);
        let sim = SimChip::new();
        let shared = Rc::new(SharedController::new());
        shared.install(W5100::create(sim.bus()).unwrap());

        let handler = Rc::downgrade(&shared);
        sim.set_interrupt_hook(move || {
            if let Some(shared) = handler.upgrade() {
                shared.on_interrupt();
            }
        });

        for _round in 0..40 {
            let mut injected = [0u8; MAX_SOCKETS];
            let mut unreach = false;
            for _ in 0..(rng.next_u32() % 8 + 1) {
                let at = (rng.next_u32() % 60) as u64;
                if rng.next_u32() % 5 == 0 {
                    unreach = true;
                    sim.schedule(at, SimEvent::GlobalInterrupt(Interrupt::UNREACH));
                } else {
                    let s = SocketId::ALL[(rng.next_u32() % 4) as usize];
                    let bits = SocketInterrupt::from_bits_truncate(rng.next_u32() as u8);
                    let bits = if bits.is_empty() { SocketInterrupt::RECV } else { bits };
                    injected[s.index()] |= bits.bits();
                    sim.schedule(at, SimEvent::SocketInterrupt(s, bits));
                }
            }

            // Foreground keeps the bus busy; some passes drain, some only
            // poll sizes, and the handler fires from whichever is running.
            while sim.pending_events() > 0 {
                let pick = rng.next_u32() % 3;
                shared.with(|c| match pick {
                    0 => {
                        c.drain_interrupts();
                    }
                    1 => {
                        c.pending_rx_bytes(SocketId::ALL[0]);
                    }
                    _ => {
                        c.status(SocketId::ALL[3]);
                    }
                });
            }
            shared.with(|c| c.drain_interrupts());

            for s in SocketId::ALL {
                assert!(sim.socket_interrupt(s).is_empty(), "hardware left set on {:?}", s);
                let got = shared.with(|c| c.interrupts().take_socket(s, SocketInterrupt::all())).unwrap();
                assert_eq!(got.bits(), injected[s.index()], "seed {} socket {:?}", seed, s);
            }
            let got_unreach = shared.with(|c| c.interrupts().take_unreachable()).unwrap();
            assert_eq!(got_unreach, unreach, "seed {}", seed);
            assert_eq!(sim.peek_mem(socket::IR.of(S0).addr), 0);
        }
    }

    #[test]
    fn test_fuzz_no_lost_interrupt_bits() {
        for seed in [1, 0x5EED, 0xDEAD_BEEF, 42_4242, 0x1234_5678_9ABC] {
            run_fuzz(seed);
        }
    }
}
