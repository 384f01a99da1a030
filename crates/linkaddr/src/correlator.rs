//! Request/reply correlation.
//!
//! Every request is registered under its sequence number together with the
//! handler its reply needs. Static adds and removals also move the link's
//! [`RequestCounters`](crate::link::RequestCounters); the counters, not reply
//! order, decide when the address stage completes and when a deferred apply
//! pass reruns.

use tracing::{debug, error, warn};

use crate::Manager;
use crate::error::{Error, Result};
use crate::link::LinkState;
use crate::netlink::AddressRequest;

/// What to do when a reply arrives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    /// Static address add or replace, counted in `pending_adds`.
    Configure,
    /// Removal counted in `pending_removals`; completes a deferred apply.
    RemoveStatic,
    /// Best-effort removal, not counted.
    Remove,
    /// Add or replace issued for another producer, not counted.
    External,
}

/// A request waiting for its reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingRequest {
    pub ifindex: u32,
    pub kind: RequestKind,
    /// Display form of the address, for logging.
    pub address: String,
}

impl Manager {
    /// Hand a request to the transport and remember how to complete it.
    pub(crate) fn send_request(
        &mut self,
        ifindex: u32,
        request: AddressRequest,
        kind: RequestKind,
    ) -> Result<u32> {
        let address = format!("{}/{}", request.local, request.prefixlen);

        let seq = self.transport.send(&request).inspect_err(|e| {
            error!(ifindex, address = %address, "could not send address request: {}", e);
        })?;

        if let Some(link) = self.links.get_mut(&ifindex) {
            match kind {
                RequestKind::Configure => link.counters.pending_adds += 1,
                RequestKind::RemoveStatic => link.counters.pending_removals += 1,
                RequestKind::Remove | RequestKind::External => {}
            }
        }

        debug!(ifindex, seq, "sent request: {}", request);

        self.pending.insert(
            seq,
            PendingRequest {
                ifindex,
                kind,
                address,
            },
        );
        Ok(seq)
    }

    /// Handle the kernel's reply to request `seq`.
    ///
    /// `error` is the value of the netlink error payload: zero for success,
    /// a negative errno otherwise. Returns false for unknown sequence
    /// numbers.
    pub fn process_reply(&mut self, seq: u32, error: i32) -> bool {
        let Some(request) = self.pending.remove(&seq) else {
            debug!(seq, "reply for unknown request, ignoring");
            return false;
        };

        let result = if error == 0 {
            Ok(())
        } else {
            Err(Error::from_errno(error))
        };

        match request.kind {
            RequestKind::Configure => self.address_handler(&request, result),
            RequestKind::RemoveStatic => self.remove_static_handler(&request, result),
            RequestKind::Remove => self.remove_handler(&request, result),
            RequestKind::External => self.external_handler(&request, result),
        }

        true
    }

    fn address_handler(&mut self, request: &PendingRequest, result: Result<()>) {
        let ifindex = request.ifindex;
        let Some(link) = self.links.get_mut(&ifindex) else {
            return;
        };

        link.counters.pending_adds = link.counters.pending_adds.saturating_sub(1);

        if link.is_failed_or_linger() {
            return;
        }

        if let Err(e) = result
            && !e.is_already_exists()
        {
            warn!(ifindex, link = %link.name, address = %request.address, "could not set address: {}", e);
            self.link_enter_failed(ifindex);
            return;
        }

        if link.counters.pending_adds > 0 {
            return;
        }

        debug!(ifindex, link = %link.name, "addresses set");
        link.addresses_configured = true;

        // Every static address may already be ready, in which case no
        // notification will run the callback.
        let first = link
            .addresses
            .first_static_mut()
            .map(|a| (a.key(), a.callback.is_some()));

        match first {
            None => {
                warn!(ifindex, link = %link.name, "no static address is stored");
                self.link_enter_failed(ifindex);
            }
            Some((_, false)) if link.addresses_ready => {
                debug!(ifindex, link = %link.name, "static addresses already ready");
            }
            Some((_, false)) => {
                warn!(ifindex, link = %link.name, "address ready callback is not set");
                self.link_enter_failed(ifindex);
            }
            Some((key, true)) => {
                if let Err(e) = self.run_ready_callback(ifindex, &key) {
                    warn!(ifindex, "address ready callback failed: {}", e);
                    self.link_enter_failed(ifindex);
                }
            }
        }
    }

    fn remove_static_handler(&mut self, request: &PendingRequest, result: Result<()>) {
        let ifindex = request.ifindex;
        let Some(link) = self.links.get_mut(&ifindex) else {
            return;
        };

        link.counters.pending_removals = link.counters.pending_removals.saturating_sub(1);

        if link.is_failed_or_linger() {
            return;
        }

        if let Err(e) = result
            && !e.is_address_not_available()
        {
            warn!(ifindex, link = %link.name, address = %request.address, "could not drop address: {}", e);
        }

        if link.counters.pending_removals == 0 && link.counters.deferred_apply {
            link.state = LinkState::Configuring;
            if let Err(e) = self.set_addresses(ifindex) {
                warn!(ifindex, "could not set addresses after removal: {}", e);
                self.link_enter_failed(ifindex);
            }
        }
    }

    fn remove_handler(&mut self, request: &PendingRequest, result: Result<()>) {
        let Some(link) = self.links.get(&request.ifindex) else {
            return;
        };
        if link.is_failed_or_linger() {
            return;
        }

        if let Err(e) = result
            && !e.is_address_not_available()
        {
            warn!(ifindex = request.ifindex, link = %link.name, address = %request.address, "could not drop address: {}", e);
        }
    }

    fn external_handler(&mut self, request: &PendingRequest, result: Result<()>) {
        let Some(link) = self.links.get(&request.ifindex) else {
            return;
        };
        if link.is_failed_or_linger() {
            return;
        }

        if let Err(e) = result
            && !e.is_already_exists()
        {
            warn!(ifindex = request.ifindex, link = %link.name, address = %request.address, "could not set address: {}", e);
            self.link_enter_failed(request.ifindex);
        }
    }

    /// Ready callback of static addresses: once the stage is complete and
    /// every static address is ready, disarm the callbacks and move on to
    /// routes.
    pub(crate) fn static_address_ready(&mut self, ifindex: u32) -> Result<()> {
        let Some(link) = self.links.get_mut(&ifindex) else {
            return Ok(());
        };

        if !link.addresses_configured {
            return Ok(());
        }

        if let Some(address) = link.addresses.statics().find(|a| !a.is_ready()) {
            debug!(ifindex, link = %link.name, address = %address, "an address is not ready");
            return Ok(());
        }

        link.addresses.clear_static_callbacks();
        link.addresses_ready = true;

        self.hooks.configure_routes(ifindex)
    }
}
