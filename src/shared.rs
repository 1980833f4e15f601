//! Event plumbing between `Endpoint` and `Connection`, and protocol
//! configuration

use std::net::Ipv4Addr;
use std::time::{Duration, Instant};

use thiserror::Error;

use crate::packet::SalContext;
use crate::{DeviceId, FlowId};

/// Events sent from an `Endpoint` to a `Connection`
#[derive(Debug)]
pub struct ConnectionEvent(pub(crate) ConnectionEventInner);

#[derive(Debug)]
pub(crate) enum ConnectionEventInner {
    /// A packet has been received for the flow
    Datagram {
        now: Instant,
        /// Network-layer source of the packet
        remote: Ipv4Addr,
        /// Address of the interface the packet arrived on
        local: Ipv4Addr,
        /// Interface the packet arrived on
        device: DeviceId,
        /// Parsed header and payload
        ctx: SalContext,
    },
}

/// Events sent from a `Connection` to an `Endpoint`
#[derive(Debug)]
pub struct EndpointEvent(pub(crate) EndpointEventInner);

impl EndpointEvent {
    /// Construct an event indicating that a `Connection` will no longer emit
    /// events
    ///
    /// Useful for notifying an `Endpoint` that a `Connection` has been
    /// destroyed outside of the usual state machine flow, e.g. when being
    /// dropped by the user.
    pub fn drained() -> Self {
        Self(EndpointEventInner::Drained)
    }

    /// Determine whether this is the last event a `Connection` will emit
    ///
    /// Useful for determining when flow-related event loop state can be
    /// freed.
    pub fn is_drained(&self) -> bool {
        self.0 == EndpointEventInner::Drained
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub(crate) enum EndpointEventInner {
    /// The flow has reached Closed and released its resources
    Drained,
    /// A listener spawned a pending child flow; packets for `FlowId` should
    /// be routed to the listener until the child is accepted
    FlowOpened(FlowId),
}

/// Parameters governing the protocol logic of all flows
///
/// Constructed with sensible defaults; adjust through the setters.
#[derive(Debug, Clone)]
pub struct Config {
    pub(crate) initial_rto: Duration,
    pub(crate) rto_min: Duration,
    pub(crate) rto_max: Duration,
    pub(crate) max_retransmits: u32,
    pub(crate) time_wait: Duration,
    pub(crate) accept_backlog: usize,
    pub(crate) keepalive_interval: Option<Duration>,
    pub(crate) forward: bool,
    pub(crate) send_window: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            initial_rto: Duration::from_secs(1),
            rto_min: Duration::from_millis(200),
            rto_max: Duration::from_secs(120),
            max_retransmits: 10,
            time_wait: Duration::from_secs(60),
            accept_backlog: 128,
            keepalive_interval: None,
            forward: true,
            send_window: 512,
        }
    }
}

impl Config {
    /// Bounds applied to the computed retransmission timeout
    ///
    /// `min` must be nonzero and no greater than `max`.
    pub fn rto_bounds(&mut self, min: Duration, max: Duration) -> Result<&mut Self, ConfigError> {
        if min.is_zero() || min > max {
            return Err(ConfigError::IllegalValue);
        }
        self.rto_min = min;
        self.rto_max = max;
        Ok(self)
    }

    /// Timeout used before the first round-trip measurement
    pub fn initial_rto(&mut self, value: Duration) -> Result<&mut Self, ConfigError> {
        if value.is_zero() {
            return Err(ConfigError::IllegalValue);
        }
        self.initial_rto = value;
        Ok(self)
    }

    /// Consecutive retransmission failures after which a flow is closed with
    /// a timeout error
    pub fn max_retransmits(&mut self, value: u32) -> Result<&mut Self, ConfigError> {
        if value == 0 {
            return Err(ConfigError::IllegalValue);
        }
        self.max_retransmits = value;
        Ok(self)
    }

    /// How long a flow lingers in TIME-WAIT before releasing its resources
    pub fn time_wait(&mut self, value: Duration) -> &mut Self {
        self.time_wait = value;
        self
    }

    /// Maximum number of connection requests pending acceptance per listener
    pub fn accept_backlog(&mut self, value: usize) -> &mut Self {
        self.accept_backlog = value;
        self
    }

    /// Probe an idle established flow with a bare acknowledgement at this
    /// interval
    pub fn keepalive_interval(&mut self, value: Option<Duration>) -> &mut Self {
        self.keepalive_interval = value;
        self
    }

    /// Whether packets for non-local services are forwarded
    ///
    /// When disabled, resolution only demultiplexes onto local flows.
    pub fn forward(&mut self, value: bool) -> &mut Self {
        self.forward = value;
        self
    }
}

/// Errors in configuration parameters
#[derive(Debug, Copy, Clone, Eq, PartialEq, Error)]
pub enum ConfigError {
    /// The supplied value is outside the legal range
    #[error("illegal configuration value")]
    IllegalValue,
}
