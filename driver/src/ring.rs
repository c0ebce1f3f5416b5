//! Socket ring buffers
//!
//! Each socket has a 2 KiB TX ring and a 2 KiB RX ring in chip memory. The
//! chip's TX_WR/RX_RD pointers are free-running 16-bit counters; only the
//! low 11 bits select a byte in the ring, so a transfer that runs past the
//! end of the ring is split into a tail part and a part at the ring base.
//!
//! ```text
//!  base                      phys           base+2048
//!   |  second part  |  ...  |  first part    |
//!   +---------------+-------+----------------+
//! ```
//!
//! Nothing here issues commands: staged bytes go out on SEND, and consumed
//! bytes are only released to the chip by RECV.

use crate::bus::SpiBus;
use crate::chip::W5100;
use crate::regs::{socket, Register, SocketId, RING_MASK, RING_SIZE};
use crate::{Error, Result};

/// Physical offset of `ptr` and how many bytes fit before the ring end.
fn split(ptr: u16, len: usize) -> (u16, usize) {
    let phys = ptr & RING_MASK;
    let room = (RING_SIZE - phys) as usize;
    (phys, len.min(room))
}

fn check_len(len: usize) -> Result<()> {
    if len > RING_SIZE as usize {
        return Err(Error::TransferTooLarge { len, capacity: RING_SIZE as usize });
    }
    Ok(())
}

impl<S: SpiBus> W5100<S> {
    /// Read a live 16-bit size register until two consecutive reads agree.
    ///
    /// The chip updates these registers byte by byte while we read them.
    pub(crate) fn read_stable(&mut self, reg: Register) -> u16 {
        let mut prev = self.bus.read_reg16(reg);
        loop {
            let cur = self.bus.read_reg16(reg);
            if cur == prev {
                return cur;
            }
            prev = cur;
        }
    }

    /// Free space in the socket's TX ring.
    pub fn free_tx_bytes(&mut self, s: SocketId) -> u16 {
        self.read_stable(socket::TX_FSR.of(s))
    }

    /// Bytes received and not yet released with RECV.
    pub fn pending_rx_bytes(&mut self, s: SocketId) -> u16 {
        self.read_stable(socket::RX_RSR.of(s))
    }

    /// Copy `data` into the TX ring at TX_WR + `offset` and move TX_WR past it.
    ///
    /// Does not check free space and does not send.
    pub fn stage_send(&mut self, s: SocketId, offset: u16, data: &[u8]) -> Result<()> {
        check_len(data.len())?;
        if data.is_empty() {
            return Ok(());
        }
        let wr = socket::TX_WR.of(s);
        let ptr = self.bus.read_reg16(wr).wrapping_add(offset);
        let base = self.tx_base[s.index()];

        let (phys, first) = split(ptr, data.len());
        self.bus.write_block(base + phys, &data[..first]);
        if first < data.len() {
            self.bus.write_block(base, &data[first..]);
        }

        self.bus.write_reg16(wr, ptr.wrapping_add(data.len() as u16));
        Ok(())
    }

    /// Copy `dest.len()` bytes from RX_RD into `dest`.
    ///
    /// Unless `peek` is set, RX_RD moves past the bytes read. The caller
    /// must not ask for more than `pending_rx_bytes`.
    pub fn consume_receive(&mut self, s: SocketId, dest: &mut [u8], peek: bool) -> Result<()> {
        check_len(dest.len())?;
        if dest.is_empty() {
            return Ok(());
        }
        let rd = socket::RX_RD.of(s);
        let ptr = self.bus.read_reg16(rd);
        let base = self.rx_base[s.index()];

        let len = dest.len();
        let (phys, first) = split(ptr, len);
        let (head, tail) = dest.split_at_mut(first);
        self.bus.read_block(base + phys, head);
        self.bus.read_block(base, tail);

        if !peek {
            self.bus.write_reg16(rd, ptr.wrapping_add(len as u16));
        }
        Ok(())
    }

    /// Move RX_RD forward without reading.
    pub fn discard_receive(&mut self, s: SocketId, len: u16) {
        if len == 0 {
            return;
        }
        let rd = socket::RX_RD.of(s);
        let ptr = self.bus.read_reg16(rd);
        self.bus.write_reg16(rd, ptr.wrapping_add(len));
    }
}
