//! Simulated W5100 behind the `SpiBus` trait.
//!
//! Decodes the 4-byte frames the driver clocks out and models enough of the
//! chip for host tests: the register file, the four TX/RX rings, command
//! side effects, clear-by-write-1 interrupt registers, the TX_WR read-back
//! latch (reads return the pointer committed by the last SEND), datagram
//! delivery with the UDP, IP-raw and MAC-raw headers, and events scheduled
//! by bus transaction count.
//!
//! `SimChip` is a cheap handle; clone it to keep inspecting the chip after
//! its `SimBus` has been moved into a controller.

use alloc::boxed::Box;
use alloc::rc::Rc;
use alloc::vec;
use alloc::vec::Vec;
use core::cell::RefCell;

use smoltcp::wire::Ipv4Address;

use crate::bus::{Frame, SpiBus};
use crate::regs::{
    common, socket, Interrupt, Mode, SocketCommand, SocketId, SocketInterrupt, SocketMode, SocketStatus, MAX_SOCKETS,
    MEM_SIZE_2K_EACH, RING_MASK, RING_SIZE, RX_MEM_BASE, TX_MEM_BASE,
};

/// One decoded bus transaction.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TraceEntry {
    pub write: bool,
    pub addr: u16,
    /// Byte written, or byte returned for a read
    pub data: u8,
    /// Whether the chip interrupt was masked during the frame
    pub masked: bool,
}

/// A datagram or stream segment the chip transmitted on SEND.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SentPacket {
    pub socket: SocketId,
    pub dest: Ipv4Address,
    pub port: u16,
    pub payload: Vec<u8>,
}

/// Scheduled stimulus.
#[derive(Clone, Debug)]
pub enum SimEvent {
    /// OR bits into Sn_IR
    SocketInterrupt(SocketId, SocketInterrupt),
    /// OR CONFLICT/UNREACH/PPPOE bits into IR
    GlobalInterrupt(Interrupt),
    DeliverUdp {
        socket: SocketId,
        source: Ipv4Address,
        port: u16,
        payload: Vec<u8>,
    },
    DeliverTcp {
        socket: SocketId,
        data: Vec<u8>,
    },
    DeliverIpRaw {
        socket: SocketId,
        source: Ipv4Address,
        payload: Vec<u8>,
    },
    DeliverMacRaw {
        socket: SocketId,
        frame: Vec<u8>,
    },
    /// Overwrite a big-endian 16-bit register
    SetReg16(u16, u16),
    SetStatus(SocketId, SocketStatus),
}

/// Reply produced by a responder for a transmitted packet.
#[derive(Clone, Debug)]
pub struct Reply {
    /// Transactions until delivery
    pub delay: u64,
    pub source: Ipv4Address,
    pub port: u16,
    pub payload: Vec<u8>,
}

type Responder = Box<dyn FnMut(&SentPacket) -> Option<Reply>>;
type InterruptHook = Box<dyn FnMut()>;

const MEM_SIZE: usize = 0x8000;
const RESET_LATENCY: u32 = 3;

#[derive(Clone, Copy, Default)]
struct SimSocket {
    /// TX_WR value returned to reads
    tx_wr_latched: u16,
    /// RX_RD value the chip has accepted through RECV
    rx_rd_committed: u16,
    cmd_busy: u8,
    send_timeout: bool,
}

struct SimState {
    mem: Vec<u8>,
    absent: Option<u8>,
    frame: Vec<u8>,
    selected: bool,
    masked: bool,
    irq_pending: bool,
    transactions: u64,
    trace: Vec<TraceEntry>,
    sockets: [SimSocket; MAX_SOCKETS],
    cmd_latency: u8,
    reset_busy: u32,
    events: Vec<(u64, SimEvent)>,
    sent: Vec<SentPacket>,
    responder: Option<Responder>,
}

fn sreg(reg: crate::regs::SocketRegister, s: usize) -> u16 {
    reg.of(SocketId::ALL[s]).addr
}

impl SimState {
    fn new(absent: Option<u8>) -> Self {
        let mut state = Self {
            mem: vec![0; MEM_SIZE],
            absent,
            frame: Vec::with_capacity(4),
            selected: false,
            masked: false,
            irq_pending: false,
            transactions: 0,
            trace: Vec::new(),
            sockets: [SimSocket::default(); MAX_SOCKETS],
            cmd_latency: 1,
            reset_busy: 0,
            events: Vec::new(),
            sent: Vec::new(),
            responder: None,
        };
        state.power_on();
        state
    }

    fn power_on(&mut self) {
        self.mem.iter_mut().for_each(|b| *b = 0);
        self.sockets = [SimSocket::default(); MAX_SOCKETS];
        self.set16(common::RTR.addr, 2000);
        self.mem[common::RCR.addr as usize] = 8;
        self.mem[common::TMSR.addr as usize] = MEM_SIZE_2K_EACH;
        self.mem[common::RMSR.addr as usize] = MEM_SIZE_2K_EACH;
        for s in 0..MAX_SOCKETS {
            self.set16(sreg(socket::TX_FSR, s), RING_SIZE);
        }
    }

    fn get16(&self, addr: u16) -> u16 {
        u16::from_be_bytes([self.mem[addr as usize], self.mem[addr as usize + 1]])
    }

    fn set16(&mut self, addr: u16, value: u16) {
        let [hi, lo] = value.to_be_bytes();
        self.mem[addr as usize] = hi;
        self.mem[addr as usize + 1] = lo;
    }

    /// Socket index and register offset for a socket-block address.
    fn socket_of(addr: u16) -> Option<(usize, u16)> {
        if (0x0400..0x0800).contains(&addr) {
            Some((((addr - 0x0400) >> 8) as usize, addr & 0xFF))
        } else {
            None
        }
    }

    fn ir_value(&self) -> u8 {
        let mut ir = self.mem[common::IR.addr as usize];
        for s in 0..MAX_SOCKETS {
            if self.mem[sreg(socket::IR, s) as usize] != 0 {
                ir |= 1 << s;
            }
        }
        ir
    }

    fn assert_line(&mut self) {
        if self.ir_value() & self.mem[common::IMR.addr as usize] != 0 {
            self.irq_pending = true;
        }
    }

    fn raise_socket(&mut self, s: usize, bits: SocketInterrupt) {
        self.mem[sreg(socket::IR, s) as usize] |= bits.bits();
        self.assert_line();
    }

    fn read(&mut self, addr: u16) -> u8 {
        if let Some(fill) = self.absent {
            return fill;
        }
        if addr as usize >= MEM_SIZE {
            return 0;
        }
        if addr == common::MR.addr && self.reset_busy > 0 {
            self.reset_busy -= 1;
            return self.mem[0] | Mode::RST.bits();
        }
        if addr == common::IR.addr {
            return self.ir_value();
        }
        if let Some((s, off)) = Self::socket_of(addr) {
            if off == socket::CR.offset {
                let sock = &mut self.sockets[s];
                if sock.cmd_busy > 0 {
                    sock.cmd_busy -= 1;
                    return self.mem[addr as usize];
                }
                return 0;
            }
            if off == socket::TX_WR.offset {
                return self.sockets[s].tx_wr_latched.to_be_bytes()[0];
            }
            if off == socket::TX_WR.offset + 1 {
                return self.sockets[s].tx_wr_latched.to_be_bytes()[1];
            }
        }
        self.mem[addr as usize]
    }

    fn write(&mut self, addr: u16, value: u8) {
        if self.absent.is_some() || addr as usize >= MEM_SIZE {
            return;
        }
        if addr == common::MR.addr {
            if value & Mode::RST.bits() != 0 {
                self.power_on();
                self.reset_busy = RESET_LATENCY;
            } else {
                self.mem[0] = value;
            }
            return;
        }
        if addr == common::IR.addr {
            self.mem[addr as usize] &= !(value & Interrupt::GLOBAL.bits());
            return;
        }
        if let Some((s, off)) = Self::socket_of(addr) {
            if off == socket::IR.offset {
                self.mem[addr as usize] &= !value;
                return;
            }
            if off == socket::CR.offset {
                self.mem[addr as usize] = value;
                self.sockets[s].cmd_busy = self.cmd_latency;
                self.command(s, value);
                return;
            }
        }
        self.mem[addr as usize] = value;
    }

    fn set_status(&mut self, s: usize, status: SocketStatus) {
        self.mem[sreg(socket::SR, s) as usize] = status.raw();
    }

    fn command(&mut self, s: usize, opcode: u8) {
        let mode = SocketMode::from_register(self.mem[sreg(socket::MR, s) as usize]);
        match opcode {
            op if op == SocketCommand::Open as u8 => {
                let status = match mode {
                    Some(SocketMode::Tcp) => SocketStatus::Init,
                    Some(SocketMode::Udp) => SocketStatus::Udp,
                    Some(SocketMode::IpRaw) => SocketStatus::IpRaw,
                    Some(SocketMode::MacRaw) => SocketStatus::MacRaw,
                    _ => SocketStatus::Closed,
                };
                self.set_status(s, status);
                self.reset_pointers(s, 0, 0);
            }
            op if op == SocketCommand::Close as u8 => {
                self.set_status(s, SocketStatus::Closed);
                self.mem[sreg(socket::IR, s) as usize] = 0;
            }
            op if op == SocketCommand::Listen as u8 => {
                self.set_status(s, SocketStatus::Listen);
            }
            op if op == SocketCommand::Connect as u8 => {
                self.set_status(s, SocketStatus::Established);
                self.raise_socket(s, SocketInterrupt::CON);
            }
            op if op == SocketCommand::Discon as u8 => {
                self.set_status(s, SocketStatus::Closed);
                self.raise_socket(s, SocketInterrupt::DISCON);
            }
            op if op == SocketCommand::Send as u8
                || op == SocketCommand::SendMac as u8
                || op == SocketCommand::SendKeep as u8 =>
            {
                self.transmit(s);
            }
            op if op == SocketCommand::Recv as u8 => {
                let rd = self.get16(sreg(socket::RX_RD, s));
                self.sockets[s].rx_rd_committed = rd;
                self.update_rsr(s);
            }
            _ => {}
        }
    }

    fn reset_pointers(&mut self, s: usize, tx: u16, rx: u16) {
        self.sockets[s].tx_wr_latched = tx;
        self.sockets[s].rx_rd_committed = rx;
        self.set16(sreg(socket::TX_WR, s), tx);
        self.set16(sreg(socket::TX_RD, s), tx);
        self.set16(sreg(socket::RX_WR, s), rx);
        self.set16(sreg(socket::RX_RD, s), rx);
        self.set16(sreg(socket::TX_FSR, s), RING_SIZE);
        self.set16(sreg(socket::RX_RSR, s), 0);
    }

    fn update_rsr(&mut self, s: usize) {
        let wr = self.get16(sreg(socket::RX_WR, s));
        let rsr = wr.wrapping_sub(self.sockets[s].rx_rd_committed);
        self.set16(sreg(socket::RX_RSR, s), rsr);
    }

    fn transmit(&mut self, s: usize) {
        let rd = self.get16(sreg(socket::TX_RD, s));
        let wr = self.get16(sreg(socket::TX_WR, s));
        let len = wr.wrapping_sub(rd) as usize;
        let base = TX_MEM_BASE as usize + s * RING_SIZE as usize;
        let payload = (0..len)
            .map(|i| self.mem[base + (rd.wrapping_add(i as u16) & RING_MASK) as usize])
            .collect();
        let dip = sreg(socket::DIPR, s) as usize;
        let packet = SentPacket {
            socket: SocketId::ALL[s],
            dest: Ipv4Address::new(self.mem[dip], self.mem[dip + 1], self.mem[dip + 2], self.mem[dip + 3]),
            port: self.get16(sreg(socket::DPORT, s)),
            payload,
        };

        self.set16(sreg(socket::TX_RD, s), wr);
        self.sockets[s].tx_wr_latched = wr;
        self.set16(sreg(socket::TX_FSR, s), RING_SIZE);

        if self.sockets[s].send_timeout {
            self.raise_socket(s, SocketInterrupt::TIMEOUT);
            if mode_is_tcp(self.mem[sreg(socket::MR, s) as usize]) {
                self.set_status(s, SocketStatus::Closed);
            }
            return;
        }
        self.raise_socket(s, SocketInterrupt::SEND_OK);

        let reply = self.responder.as_mut().and_then(|respond| respond(&packet));
        if let Some(reply) = reply {
            let at = self.transactions + reply.delay;
            self.events.push((
                at,
                SimEvent::DeliverUdp { socket: packet.socket, source: reply.source, port: reply.port, payload: reply.payload },
            ));
        }
        self.sent.push(packet);
    }

    fn write_rx(&mut self, s: usize, bytes: &[u8]) -> bool {
        let rsr = self.get16(sreg(socket::RX_RSR, s)) as usize;
        if rsr + bytes.len() > RING_SIZE as usize {
            return false;
        }
        let base = RX_MEM_BASE as usize + s * RING_SIZE as usize;
        let mut wr = self.get16(sreg(socket::RX_WR, s));
        for &b in bytes {
            self.mem[base + (wr & RING_MASK) as usize] = b;
            wr = wr.wrapping_add(1);
        }
        self.set16(sreg(socket::RX_WR, s), wr);
        self.update_rsr(s);
        self.raise_socket(s, SocketInterrupt::RECV);
        true
    }

    fn apply(&mut self, event: SimEvent) {
        match event {
            SimEvent::SocketInterrupt(s, bits) => self.raise_socket(s.index(), bits),
            SimEvent::GlobalInterrupt(bits) => {
                self.mem[common::IR.addr as usize] |= (bits & Interrupt::GLOBAL).bits();
                self.assert_line();
            }
            SimEvent::DeliverUdp { socket, source, port, payload } => {
                let mut datagram = Vec::with_capacity(8 + payload.len());
                datagram.extend_from_slice(&source.octets());
                datagram.extend_from_slice(&port.to_be_bytes());
                datagram.extend_from_slice(&(payload.len() as u16).to_be_bytes());
                datagram.extend_from_slice(&payload);
                self.write_rx(socket.index(), &datagram);
            }
            SimEvent::DeliverTcp { socket, data } => {
                self.write_rx(socket.index(), &data);
            }
            SimEvent::DeliverIpRaw { socket, source, payload } => {
                let mut datagram = Vec::with_capacity(6 + payload.len());
                datagram.extend_from_slice(&source.octets());
                datagram.extend_from_slice(&(payload.len() as u16).to_be_bytes());
                datagram.extend_from_slice(&payload);
                self.write_rx(socket.index(), &datagram);
            }
            SimEvent::DeliverMacRaw { socket, frame } => {
                let mut datagram = Vec::with_capacity(2 + frame.len());
                datagram.extend_from_slice(&(frame.len() as u16 + 2).to_be_bytes());
                datagram.extend_from_slice(&frame);
                self.write_rx(socket.index(), &datagram);
            }
            SimEvent::SetReg16(addr, value) => self.set16(addr, value),
            SimEvent::SetStatus(s, status) => self.set_status(s.index(), status),
        }
    }

    fn run_due_events(&mut self) {
        let now = self.transactions;
        let mut i = 0;
        while i < self.events.len() {
            if self.events[i].0 <= now {
                let (_, event) = self.events.remove(i);
                self.apply(event);
            } else {
                i += 1;
            }
        }
    }

    fn complete_frame(&mut self) {
        if self.frame.len() != 4 {
            self.frame.clear();
            return;
        }
        self.frame.clear();
        self.transactions += 1;
        self.run_due_events();
    }
}

fn mode_is_tcp(mr: u8) -> bool {
    SocketMode::from_register(mr) == Some(SocketMode::Tcp)
}

/// Handle to a simulated chip.
#[derive(Clone)]
pub struct SimChip {
    state: Rc<RefCell<SimState>>,
    hook: Rc<RefCell<Option<InterruptHook>>>,
}

impl Default for SimChip {
    fn default() -> Self {
        Self::new()
    }
}

impl SimChip {
    /// Powered-up chip with reset defaults.
    pub fn new() -> Self {
        Self::with_state(SimState::new(None))
    }

    /// No chip on the bus: every read returns `fill`, writes vanish.
    pub fn absent(fill: u8) -> Self {
        Self::with_state(SimState::new(Some(fill)))
    }

    fn with_state(state: SimState) -> Self {
        Self { state: Rc::new(RefCell::new(state)), hook: Rc::new(RefCell::new(None)) }
    }

    /// A bus endpoint wired to this chip.
    pub fn bus(&self) -> SimBus {
        SimBus { chip: self.clone() }
    }

    pub fn peek_mem(&self, addr: u16) -> u8 {
        self.state.borrow().mem[addr as usize]
    }

    pub fn poke_mem(&self, addr: u16, value: u8) {
        self.state.borrow_mut().mem[addr as usize] = value;
    }

    pub fn peek16(&self, addr: u16) -> u16 {
        self.state.borrow().get16(addr)
    }

    pub fn poke16(&self, addr: u16, value: u16) {
        self.state.borrow_mut().set16(addr, value);
    }

    /// Raw bytes of a socket's TX ring starting at logical pointer `ptr`.
    pub fn tx_ring(&self, s: SocketId, ptr: u16, len: usize) -> Vec<u8> {
        let state = self.state.borrow();
        let base = TX_MEM_BASE as usize + s.index() * RING_SIZE as usize;
        (0..len).map(|i| state.mem[base + (ptr.wrapping_add(i as u16) & RING_MASK) as usize]).collect()
    }

    /// Place all four ring pointers of `s` at the given logical positions.
    pub fn set_pointers(&self, s: SocketId, tx: u16, rx: u16) {
        self.state.borrow_mut().reset_pointers(s.index(), tx, rx);
    }

    /// TX_WR value a SEND would commit (not what reads return).
    pub fn pending_tx_write(&self, s: SocketId) -> u16 {
        self.peek16(socket::TX_WR.of(s).addr)
    }

    pub fn status(&self, s: SocketId) -> SocketStatus {
        SocketStatus::from(self.peek_mem(socket::SR.of(s).addr))
    }

    pub fn set_status(&self, s: SocketId, status: SocketStatus) {
        self.state.borrow_mut().set_status(s.index(), status);
    }

    pub fn socket_interrupt(&self, s: SocketId) -> SocketInterrupt {
        SocketInterrupt::from_bits_retain(self.peek_mem(socket::IR.of(s).addr))
    }

    pub fn raise(&self, event: SimEvent) {
        self.state.borrow_mut().apply(event);
    }

    pub fn deliver_udp(&self, s: SocketId, source: Ipv4Address, port: u16, payload: &[u8]) {
        self.raise(SimEvent::DeliverUdp { socket: s, source, port, payload: payload.to_vec() });
    }

    pub fn deliver_tcp(&self, s: SocketId, data: &[u8]) {
        self.raise(SimEvent::DeliverTcp { socket: s, data: data.to_vec() });
    }

    pub fn deliver_ip_raw(&self, s: SocketId, source: Ipv4Address, payload: &[u8]) {
        self.raise(SimEvent::DeliverIpRaw { socket: s, source, payload: payload.to_vec() });
    }

    /// Queue an Ethernet frame on a MAC-raw socket.
    pub fn deliver_mac_raw(&self, s: SocketId, frame: &[u8]) {
        self.raise(SimEvent::DeliverMacRaw { socket: s, frame: frame.to_vec() });
    }

    /// Apply `event` once `after` more transactions have completed.
    pub fn schedule(&self, after: u64, event: SimEvent) {
        let mut state = self.state.borrow_mut();
        let at = state.transactions + after;
        state.events.push((at, event));
    }

    pub fn pending_events(&self) -> usize {
        self.state.borrow().events.len()
    }

    pub fn transactions(&self) -> u64 {
        self.state.borrow().transactions
    }

    pub fn trace(&self) -> Vec<TraceEntry> {
        self.state.borrow().trace.clone()
    }

    pub fn clear_trace(&self) {
        self.state.borrow_mut().trace.clear();
    }

    /// Writes in the trace that targeted `addr`.
    pub fn writes_to(&self, addr: u16) -> Vec<u8> {
        self.state.borrow().trace.iter().filter(|t| t.write && t.addr == addr).map(|t| t.data).collect()
    }

    pub fn take_sent(&self) -> Vec<SentPacket> {
        core::mem::take(&mut self.state.borrow_mut().sent)
    }

    /// Number of reads of Sn_CR that return the opcode before it clears.
    pub fn set_command_latency(&self, reads: u8) {
        self.state.borrow_mut().cmd_latency = reads;
    }

    /// Make every SEND on `s` end in Sn_IR.TIMEOUT.
    pub fn set_send_timeout(&self, s: SocketId, timeout: bool) {
        self.state.borrow_mut().sockets[s.index()].send_timeout = timeout;
    }

    pub fn set_responder(&self, responder: impl FnMut(&SentPacket) -> Option<Reply> + 'static) {
        self.state.borrow_mut().responder = Some(Box::new(responder));
    }

    /// Called when the interrupt line asserts while unmasked.
    pub fn set_interrupt_hook(&self, hook: impl FnMut() + 'static) {
        *self.hook.borrow_mut() = Some(Box::new(hook));
    }

    fn fire_hook(&self) {
        let pending = core::mem::replace(&mut self.state.borrow_mut().irq_pending, false);
        if !pending {
            return;
        }
        match self.hook.try_borrow_mut() {
            Ok(mut hook) => {
                if let Some(hook) = hook.as_mut() {
                    hook();
                }
            }
            // Handler already running; leave the edge for the next unmask
            Err(_) => self.state.borrow_mut().irq_pending = true,
        }
    }
}

/// `SpiBus` endpoint of a `SimChip`.
pub struct SimBus {
    chip: SimChip,
}

impl SimBus {
    pub fn chip(&self) -> &SimChip {
        &self.chip
    }
}

impl SpiBus for SimBus {
    fn select(&mut self) {
        let mut state = self.chip.state.borrow_mut();
        state.selected = true;
        state.frame.clear();
    }

    fn deselect(&mut self) {
        let mut state = self.chip.state.borrow_mut();
        state.selected = false;
        state.complete_frame();
    }

    fn transfer(&mut self, byte: u8) -> u8 {
        let mut state = self.chip.state.borrow_mut();
        if !state.selected {
            return 0;
        }
        state.frame.push(byte);
        if state.frame.len() != 4 {
            return 0;
        }
        let op = state.frame[0];
        let addr = u16::from_be_bytes([state.frame[1], state.frame[2]]);
        let masked = state.masked;
        match op {
            Frame::OP_WRITE => {
                state.write(addr, byte);
                state.trace.push(TraceEntry { write: true, addr, data: byte, masked });
                0
            }
            Frame::OP_READ => {
                let value = state.read(addr);
                state.trace.push(TraceEntry { write: false, addr, data: value, masked });
                value
            }
            _ => 0,
        }
    }

    fn mask_irq(&mut self) -> bool {
        let mut state = self.chip.state.borrow_mut();
        let was_enabled = !state.masked;
        state.masked = true;
        was_enabled
    }

    fn restore_irq(&mut self, was_enabled: bool) {
        if !was_enabled {
            return;
        }
        self.chip.state.borrow_mut().masked = false;
        self.chip.fire_hook();
    }
}
