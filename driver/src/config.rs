//! Network configuration and protocol constants.

use smoltcp::wire::{EthernetAddress, Ipv4Address};

/// DNS server port
pub const DNS_PORT: u16 = 53;

/// Largest DNS message over UDP without EDNS
pub const DNS_MAX_MESSAGE: usize = 512;

/// Default resolver timeout
pub const DEFAULT_DNS_TIMEOUT_MS: i64 = 5000;

/// First port handed out when a socket is opened with port 0
pub const EPHEMERAL_PORT_START: u16 = 49152;

/// Bounded poll count for the MR.RST self-clear after a soft reset
pub const RESET_POLL_LIMIT: u32 = 10_000;

/// Static addressing for the chip.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct NetConfig {
    pub mac: EthernetAddress,
    pub ip: Ipv4Address,
    pub gateway: Ipv4Address,
    pub subnet: Ipv4Address,
    /// Resolver to use; not programmed into the chip
    pub dns: Ipv4Address,
}

impl NetConfig {
    /// Conventional defaults: gateway and DNS at .1 of the local /24.
    pub fn new(mac: EthernetAddress, ip: Ipv4Address) -> Self {
        let [a, b, c, _] = ip.octets();
        let gateway = Ipv4Address::new(a, b, c, 1);
        Self {
            mac,
            ip,
            gateway,
            subnet: Ipv4Address::new(255, 255, 255, 0),
            dns: gateway,
        }
    }

    pub fn with_gateway(mut self, gateway: Ipv4Address) -> Self {
        self.gateway = gateway;
        self
    }

    pub fn with_subnet(mut self, subnet: Ipv4Address) -> Self {
        self.subnet = subnet;
        self
    }

    pub fn with_dns(mut self, dns: Ipv4Address) -> Self {
        self.dns = dns;
        self
    }
}

/// Hardware retransmission settings (RTR/RCR).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryConfig {
    /// Retry period in 100 µs units
    pub timeout: u16,
    /// Retries before Sn_IR.TIMEOUT fires
    pub count: u8,
}

impl RetryConfig {
    /// Build from milliseconds, saturating at the register maximum.
    pub fn from_millis(ms: u32, count: u8) -> Self {
        let ticks = ms.saturating_mul(10).min(u16::MAX as u32) as u16;
        Self { timeout: ticks, count }
    }
}

impl Default for RetryConfig {
    /// Chip reset values: 200 ms, 8 retries.
    fn default() -> Self {
        Self { timeout: 2000, count: 8 }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_netconfig_defaults() {
        let cfg = NetConfig::new(
            EthernetAddress([0xDE, 0xAD, 0xBE, 0xEF, 0xFE, 0xED]),
            Ipv4Address::new(192, 168, 7, 40),
        );
        assert_eq!(cfg.gateway, Ipv4Address::new(192, 168, 7, 1));
        assert_eq!(cfg.dns, cfg.gateway);
        assert_eq!(cfg.subnet, Ipv4Address::new(255, 255, 255, 0));

        let cfg = cfg.with_dns(Ipv4Address::new(8, 8, 8, 8));
        assert_eq!(cfg.dns, Ipv4Address::new(8, 8, 8, 8));
        assert_eq!(cfg.gateway, Ipv4Address::new(192, 168, 7, 1));
    }

    #[test]
    fn test_retry_config() {
        assert_eq!(RetryConfig::default(), RetryConfig { timeout: 2000, count: 8 });
        assert_eq!(RetryConfig::from_millis(50, 3).timeout, 500);
        assert_eq!(RetryConfig::from_millis(100_000, 3).timeout, u16::MAX);
    }
}
