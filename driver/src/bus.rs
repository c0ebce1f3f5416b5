//! SPI bus transport
//!
//! Every access to the W5100 is a 4-byte frame: opcode, address high,
//! address low, data. Block accesses are a run of frames with the address
//! incremented between them. The chip never acknowledges anything, so a
//! missing chip just reads back as 0x00 or 0xFF bytes; this layer has no
//! error path.
//!
//! ```text
//!   CS ‾‾\____________________________________/‾‾
//!  MOSI    [ 0xF0 | addr_hi | addr_lo | data ]      write
//!  MOSI    [ 0x0F | addr_hi | addr_lo | 0x00 ]      read
//!  MISO                                 [ data ]
//! ```

/// Board-side SPI hooks.
///
/// Implemented by the platform that owns the SPI peripheral and the chip
/// select pin (8 MHz, MSB first, mode 0).
pub trait SpiBus {
    /// Drive chip select low.
    fn select(&mut self);

    /// Drive chip select high.
    fn deselect(&mut self);

    /// Clock one byte out and return the byte clocked in.
    fn transfer(&mut self, byte: u8) -> u8;

    /// Mask the W5100 interrupt line.
    ///
    /// Returns whether it was unmasked before the call, which is handed back
    /// to `restore_irq`. Boards that poll and never wire the line keep the
    /// default.
    fn mask_irq(&mut self) -> bool {
        false
    }

    /// Undo `mask_irq`.
    fn restore_irq(&mut self, was_enabled: bool) {
        let _ = was_enabled;
    }
}

/// One W5100 SPI frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(transparent)]
pub struct Frame([u8; 4]);

impl Frame {
    pub const OP_WRITE: u8 = 0xF0;
    pub const OP_READ: u8 = 0x0F;

    pub const fn write(addr: u16, data: u8) -> Self {
        Self([Self::OP_WRITE, (addr >> 8) as u8, addr as u8, data])
    }

    pub const fn read(addr: u16) -> Self {
        Self([Self::OP_READ, (addr >> 8) as u8, addr as u8, 0])
    }

    pub fn as_bytes(&self) -> &[u8; 4] {
        &self.0
    }

    pub fn opcode(&self) -> u8 {
        self.0[0]
    }

    pub fn addr(&self) -> u16 {
        u16::from_be_bytes([self.0[1], self.0[2]])
    }

    pub fn data(&self) -> u8 {
        self.0[3]
    }

    pub fn set_data(&mut self, val: u8) {
        self.0[3] = val;
    }

    /// Step to the next address, wrapping at 0xFFFF.
    pub fn increment_addr(&mut self) {
        let [hi, lo] = self.addr().wrapping_add(1).to_be_bytes();
        self.0[1] = hi;
        self.0[2] = lo;
    }
}

/// Transaction layer over a `SpiBus`.
pub struct Bus<S> {
    spi: S,
}

impl<S: SpiBus> Bus<S> {
    pub fn new(spi: S) -> Self {
        Self { spi }
    }

    /// Borrow the underlying SPI implementation.
    pub fn spi(&self) -> &S {
        &self.spi
    }

    pub fn spi_mut(&mut self) -> &mut S {
        &mut self.spi
    }

    pub fn into_inner(self) -> S {
        self.spi
    }

    /// Run `f` with the chip interrupt masked.
    fn critical<R>(&mut self, f: impl FnOnce(&mut S) -> R) -> R {
        let was_enabled = self.spi.mask_irq();
        let result = f(&mut self.spi);
        self.spi.restore_irq(was_enabled);
        result
    }

    /// Clock one frame with chip select held, returning the data-phase byte.
    fn exchange(spi: &mut S, frame: &Frame) -> u8 {
        let [op, hi, lo, data] = *frame.as_bytes();
        spi.select();
        spi.transfer(op);
        spi.transfer(hi);
        spi.transfer(lo);
        let rx = spi.transfer(data);
        spi.deselect();
        rx
    }

    pub fn write_byte(&mut self, addr: u16, value: u8) {
        self.critical(|spi| {
            Self::exchange(spi, &Frame::write(addr, value));
        });
    }

    pub fn write_block(&mut self, addr: u16, data: &[u8]) {
        if data.is_empty() {
            return;
        }
        self.critical(|spi| {
            let mut frame = Frame::write(addr, 0);
            for &byte in data {
                frame.set_data(byte);
                Self::exchange(spi, &frame);
                frame.increment_addr();
            }
        });
    }

    pub fn read_byte(&mut self, addr: u16) -> u8 {
        self.critical(|spi| Self::exchange(spi, &Frame::read(addr)))
    }

    /// Fill `dest` from consecutive addresses starting at `addr`.
    pub fn read_block(&mut self, addr: u16, dest: &mut [u8]) {
        if dest.is_empty() {
            return;
        }
        self.critical(|spi| {
            let mut frame = Frame::read(addr);
            for slot in dest.iter_mut() {
                *slot = Self::exchange(spi, &frame);
                frame.increment_addr();
            }
        });
    }
}
