//! IPv4 duplicate address detection.
//!
//! The probe protocol itself lives behind [`DadProber`]. This module tracks
//! the state of one probe per static template and turns probe events into
//! readiness rechecks or removals (see [`Manager::process_dad_event`]).
//!
//! [`Manager::process_dad_event`]: crate::Manager::process_dad_event

use std::net::Ipv4Addr;

use crate::error::Result;

/// State of one probe.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum DadState {
    #[default]
    None,
    Probing,
    /// No other host answered; the address may be kept.
    Bound,
    /// Another host already uses the address.
    Conflicted,
    Stopped,
}

/// Event reported by the probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DadEvent {
    Stop,
    Bind,
    Conflict,
}

/// Starts and stops probes on the wire.
pub trait DadProber {
    /// Begin probing `address` on `ifindex`, using `mac` as the sender.
    fn start(&mut self, ifindex: u32, mac: Option<[u8; 6]>, address: Ipv4Addr) -> Result<()>;

    /// Tear the probe down.
    fn stop(&mut self, ifindex: u32, address: Ipv4Addr);
}

/// Prober for links that never probe. Starting always succeeds.
#[derive(Debug, Default)]
pub struct NoopProber;

impl DadProber for NoopProber {
    fn start(&mut self, _ifindex: u32, _mac: Option<[u8; 6]>, _address: Ipv4Addr) -> Result<()> {
        Ok(())
    }

    fn stop(&mut self, _ifindex: u32, _address: Ipv4Addr) {}
}

/// A probe bound to one link and one address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ipv4Dad {
    pub ifindex: u32,
    pub mac: Option<[u8; 6]>,
    pub address: Ipv4Addr,
    state: DadState,
}

impl Ipv4Dad {
    pub fn new(ifindex: u32, mac: Option<[u8; 6]>, address: Ipv4Addr) -> Self {
        Self {
            ifindex,
            mac,
            address,
            state: DadState::None,
        }
    }

    pub fn state(&self) -> DadState {
        self.state
    }

    pub fn is_probing(&self) -> bool {
        self.state == DadState::Probing
    }

    /// Start probing.
    pub fn start(&mut self, prober: &mut dyn DadProber) -> Result<()> {
        prober.start(self.ifindex, self.mac, self.address)?;
        self.state = DadState::Probing;
        Ok(())
    }

    /// Apply an event. Returns the new state, or `None` when the event does
    /// not apply to a running probe.
    pub fn handle(&mut self, event: DadEvent) -> Option<DadState> {
        if self.state != DadState::Probing {
            return None;
        }

        self.state = match event {
            DadEvent::Stop => DadState::Stopped,
            DadEvent::Bind => DadState::Bound,
            DadEvent::Conflict => DadState::Conflicted,
        };
        Some(self.state)
    }

    /// Stop the probe after a decision.
    pub fn stop(&mut self, prober: &mut dyn DadProber) {
        prober.stop(self.ifindex, self.address);
        self.state = DadState::Stopped;
    }
}
