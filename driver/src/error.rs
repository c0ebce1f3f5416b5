//! Driver error types
//!
//! The bus, register and ring-buffer layers never fail on their own (the chip
//! gives no acknowledgement), so every variant here comes from a layer that
//! inspects what the chip reported or from a caller asking for something the
//! hardware cannot hold.

use core::fmt;

use crate::dns::DnsError;

pub type Result<T> = core::result::Result<T, Error>;

/// Errors reported by the controller and its socket layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// Chip did not hold the memory-size configuration after reset
    NotResponding,
    /// Mode register reset bit never self-cleared
    ResetTimeout,
    /// Socket index outside 0..=3
    InvalidSocket(u8),
    /// No socket slot is closed (or finishing) and available
    NoFreeSocket,
    /// Socket is not in a state that allows the operation
    UnexpectedStatus(u8),
    /// Destination address or port cannot be used (all-zero, broadcast, port 0)
    InvalidAddress,
    /// TX ring does not have room for the requested bytes
    InsufficientTxSpace {
        /// Bytes the caller tried to stage
        requested: usize,
        /// Bytes the chip reported free
        free: usize,
    },
    /// Transfer longer than a whole socket ring
    TransferTooLarge {
        /// Requested length
        len: usize,
        /// Ring capacity
        capacity: usize,
    },
    /// Chip flagged a timeout while sending
    SendTimeout,
    /// Peer closed the connection while data was in flight
    ConnectionClosed,
    /// No datagram started with `start_udp`/`begin_packet`
    NoPacket,
    /// DNS resolution failed
    Dns(DnsError),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotResponding => write!(f, "W5100 not responding"),
            Self::ResetTimeout => write!(f, "W5100 reset did not complete"),
            Self::InvalidSocket(s) => write!(f, "Invalid socket index {}", s),
            Self::NoFreeSocket => write!(f, "No free socket"),
            Self::UnexpectedStatus(sr) => write!(f, "Unexpected socket status 0x{:02x}", sr),
            Self::InvalidAddress => write!(f, "Invalid destination address"),
            Self::InsufficientTxSpace { requested, free } => {
                write!(f, "TX buffer full: need {} bytes, {} free", requested, free)
            }
            Self::TransferTooLarge { len, capacity } => {
                write!(f, "Transfer of {} bytes exceeds {} byte ring", len, capacity)
            }
            Self::SendTimeout => write!(f, "Send timed out"),
            Self::ConnectionClosed => write!(f, "Connection closed"),
            Self::NoPacket => write!(f, "No packet in progress"),
            Self::Dns(e) => write!(f, "DNS: {}", e),
        }
    }
}

impl From<DnsError> for Error {
    fn from(e: DnsError) -> Self {
        Error::Dns(e)
    }
}

impl embedded_io::Error for Error {
    fn kind(&self) -> embedded_io::ErrorKind {
        match self {
            Error::ConnectionClosed => embedded_io::ErrorKind::ConnectionReset,
            Error::SendTimeout => embedded_io::ErrorKind::TimedOut,
            Error::InvalidAddress | Error::InvalidSocket(_) | Error::TransferTooLarge { .. } => {
                embedded_io::ErrorKind::InvalidInput
            }
            Error::NoPacket => embedded_io::ErrorKind::NotConnected,
            Error::InsufficientTxSpace { .. } => embedded_io::ErrorKind::OutOfMemory,
            _ => embedded_io::ErrorKind::Other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::string::ToString;
    use embedded_io::Error as _;

    #[test]
    fn test_display_includes_sizes() {
        let e = Error::InsufficientTxSpace { requested: 300, free: 12 };
        assert_eq!(e.to_string(), "TX buffer full: need 300 bytes, 12 free");
    }

    #[test]
    fn test_dns_errors_convert() {
        let e: Error = DnsError::Timeout.into();
        assert_eq!(e, Error::Dns(DnsError::Timeout));
    }

    #[test]
    fn test_io_kinds() {
        assert_eq!(Error::ConnectionClosed.kind(), embedded_io::ErrorKind::ConnectionReset);
        assert_eq!(Error::SendTimeout.kind(), embedded_io::ErrorKind::TimedOut);
        assert_eq!(Error::NoFreeSocket.kind(), embedded_io::ErrorKind::Other);
    }
}
