//! Driver for the WIZnet W5100 hardwired TCP/IP Ethernet controller.
//!
//! The chip sits on SPI and runs TCP, UDP and IP itself; this crate programs
//! its registers, moves payload through the four per-socket ring buffers
//! and drives socket commands. A small DNS resolver runs on top of the UDP
//! path.
//!
//! Layers, bottom up:
//!
//! - `bus`: 4-byte SPI frames, one critical section per transaction
//! - `regs`: register map and typed accessors
//! - `ring`: TX/RX ring copy with wraparound
//! - `command`, `irq`: socket commands, interrupt drain, sticky flags
//! - `socket`, `udp`: socket lifecycle and data transfer
//! - `dns`: A-record resolver
//!
//! ```ignore
//! let mut eth = W5100::create(board_spi)?;
//! eth.configure(&NetConfig::new(mac, ip));
//! let mut dns = DnsClient::new(gateway, seed);
//! let addr = dns.resolve(&mut eth, "example.com", DEFAULT_DNS_TIMEOUT_MS, now_ms)?;
//! ```

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod bus;
pub mod chip;
pub mod command;
pub mod config;
pub mod dns;
pub mod error;
pub mod irq;
pub mod lock;
pub mod logger;
pub mod regs;
pub mod ring;
pub mod socket;
pub mod udp;
pub mod utils;

#[cfg(any(test, feature = "sim"))]
pub mod sim;

pub use bus::SpiBus;
pub use chip::W5100;
pub use config::{NetConfig, RetryConfig, DEFAULT_DNS_TIMEOUT_MS, DNS_PORT};
pub use dns::{DnsClient, DnsError};
pub use error::{Error, Result};
pub use irq::{InterruptAggregate, SharedController};
pub use regs::{SocketFlags, SocketId, SocketMode, SocketStatus};
pub use socket::DatagramInfo;
pub use udp::UdpSocket;
