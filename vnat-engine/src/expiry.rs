//! Idle-flow expiry sweeps.
//!
//! Datagram flows have no close signal, so each carries a deadline that is
//! refreshed on traffic and checked once per event-loop tick. Stream flows
//! are never swept here; their control blocks own timeout logic.

use tracing::debug;

use crate::config::Millis;
use crate::engine::Nat;
use crate::host::HostBackend;

impl<B: HostBackend> Nat<B> {
    /// Tear down every expirable flow whose deadline has passed. Returns
    /// how many flows were dropped. Teardown is the same synchronous path
    /// as a definite receive error: unlink, release buffers and descriptor.
    pub fn sweep_expired(&mut self, now: Millis) -> usize {
        let mut dropped = 0;
        for handle in self.datagrams.handles() {
            let expired = self
                .datagrams
                .get(handle)
                .and_then(|flow| flow.expiry)
                .is_some_and(|deadline| deadline <= now);
            if expired {
                if let Some(flow) = self.datagrams.remove(handle) {
                    debug!(local = %flow.local, foreign = %flow.foreign, "idle flow expired");
                    dropped += 1;
                }
            }
        }
        dropped
    }
}
