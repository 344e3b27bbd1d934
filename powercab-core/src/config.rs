//! Engine configuration.

use std::net::SocketAddr;
use std::time::Duration;

/// Tunables for the protocol engine and TCP server.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// TCP listen address for station connections.
    pub bind_addr: SocketAddr,

    /// Suspicious-packet budget; the connection is force-closed once the
    /// counter exceeds this ceiling.
    pub max_suspicious: u32,

    /// A connection whose last heartbeat is older than this is swept.
    pub heartbeat_timeout: Duration,

    /// Interval of the registry sweep task.
    pub sweep_interval: Duration,

    /// Socket read idle timeout.
    pub idle_timeout: Duration,

    /// Deadline for a station's asynchronous borrow reply.
    pub borrow_timeout: Duration,

    /// Default deadline for an error-return to be physically seated.
    pub error_return_timeout: Duration,

    /// Deadline for inventory/eject/admin round trips.
    pub command_timeout: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:7020".parse().expect("valid default address"),
            max_suspicious: 5,
            heartbeat_timeout: Duration::from_secs(300),
            sweep_interval: Duration::from_secs(60),
            idle_timeout: Duration::from_secs(180),
            borrow_timeout: Duration::from_secs(15),
            error_return_timeout: Duration::from_secs(30),
            command_timeout: Duration::from_secs(10),
        }
    }
}

impl EngineConfig {
    /// Set the listen address.
    pub fn with_bind_addr(mut self, addr: SocketAddr) -> Self {
        self.bind_addr = addr;
        self
    }

    /// Set the suspicious-packet budget.
    pub fn with_max_suspicious(mut self, max: u32) -> Self {
        self.max_suspicious = max;
        self
    }

    /// Set the heartbeat timeout.
    pub fn with_heartbeat_timeout(mut self, timeout: Duration) -> Self {
        self.heartbeat_timeout = timeout;
        self
    }

    /// Set the sweep interval.
    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }

    /// Set the borrow reply deadline.
    pub fn with_borrow_timeout(mut self, timeout: Duration) -> Self {
        self.borrow_timeout = timeout;
        self
    }

    /// Set the default error-return deadline.
    pub fn with_error_return_timeout(mut self, timeout: Duration) -> Self {
        self.error_return_timeout = timeout;
        self
    }
}
