// Copyright 2024 MaidSafe.net limited.
//
// This SAFE Network Software is licensed to you under The General Public License (GPL), version 3.
// Unless required by applicable law or agreed to in writing, the SAFE Network Software distributed
// under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied. Please review the Licences for the specific language governing
// permissions and limitations relating to use of the SAFE Network Software.

//! Background periodic maintenance (component C6, §4.6): bootstrap,
//! routing-table refresh, stale-peer eviction, provider republish, and
//! record/provider expiry sweeps.
//!
//! Every job here is a plain [`Delay`]-driven timer polled from
//! [`crate::behaviour::Behaviour::poll`] — there is no task spawned and no
//! executor dependency, matching §5's "executor-agnostic" requirement.
//! [`crate::behaviour::Behaviour`] is the only thing that acts on a fired
//! job; this module only knows when one is due.

use futures_timer::Delay;
use std::time::Duration;

/// A single recurring timer: fires once, then immediately rearms for the
/// next interval. Distinct from `futures_timer`'s own interval helper only
/// in that it is `poll`-based rather than `Stream`-based, to match the
/// rest of this crate's `ConnectionHandler`/`NetworkBehaviour` polling style.
struct PeriodicJob {
    interval: Duration,
    delay: Delay,
}

impl PeriodicJob {
    fn new(interval: Duration) -> Self {
        Self {
            interval,
            delay: Delay::new(interval),
        }
    }

    fn poll(&mut self, cx: &mut std::task::Context<'_>) -> std::task::Poll<()> {
        match std::pin::Pin::new(&mut self.delay).poll(cx) {
            std::task::Poll::Ready(()) => {
                self.delay.reset(self.interval);
                std::task::Poll::Ready(())
            }
            std::task::Poll::Pending => std::task::Poll::Pending,
        }
    }
}

/// What background maintenance task is due. [`crate::behaviour::Behaviour::poll`]
/// matches on this and performs the actual work (starting lookups, walking
/// the record store) since only it holds the routing table and stores.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum JobEvent {
    /// Fires once, shortly after construction: a `FIND_NODE` for the local
    /// key, followed by one per non-empty bucket (§4.6 "Bootstrap").
    Bootstrap,
    /// Walk every non-empty bucket and, for any that have gone untouched
    /// for a full refresh period, issue a `FIND_NODE` for a random key in
    /// that bucket's range (§4.6 "Routing table refresh").
    RefreshBuckets,
    /// Evict routing-table entries that have not responded to a liveness
    /// probe within the stale threshold (§4.6 "Stale peer eviction").
    CheckStalePeers,
    /// Re-announce every locally-provided key whose republish deadline has
    /// elapsed (§4.6 "Provider republish").
    RepublishProviders,
    /// Drop value records and provider records past their TTL (§4.6
    /// "Expiry sweep").
    SweepExpired,
}

/// Owns every periodic timer; `Behaviour` polls this once per wakeup and
/// acts on whatever comes back. At most one [`JobEvent`] is returned per
/// poll so the coordinator's work stays bounded per tick; remaining due
/// jobs are picked up on the next poll because their `Delay` has already
/// fired and `futures` re-wakes immediately-ready futures.
pub(crate) struct Jobs {
    bootstrap_pending: bool,
    refresh: PeriodicJob,
    stale_check: PeriodicJob,
    provider_republish: PeriodicJob,
    expiry_sweep: PeriodicJob,
}

impl Jobs {
    pub(crate) fn new(
        routing_table_refresh_interval: Duration,
        stale_check_interval: Duration,
        provider_republish_interval: Duration,
        expiry_sweep_interval: Duration,
    ) -> Self {
        Self {
            bootstrap_pending: true,
            refresh: PeriodicJob::new(routing_table_refresh_interval),
            stale_check: PeriodicJob::new(stale_check_interval),
            provider_republish: PeriodicJob::new(provider_republish_interval),
            expiry_sweep: PeriodicJob::new(expiry_sweep_interval),
        }
    }

    pub(crate) fn poll(&mut self, cx: &mut std::task::Context<'_>) -> std::task::Poll<JobEvent> {
        if self.bootstrap_pending {
            self.bootstrap_pending = false;
            return std::task::Poll::Ready(JobEvent::Bootstrap);
        }
        if self.refresh.poll(cx).is_ready() {
            return std::task::Poll::Ready(JobEvent::RefreshBuckets);
        }
        if self.stale_check.poll(cx).is_ready() {
            return std::task::Poll::Ready(JobEvent::CheckStalePeers);
        }
        if self.provider_republish.poll(cx).is_ready() {
            return std::task::Poll::Ready(JobEvent::RepublishProviders);
        }
        if self.expiry_sweep.poll(cx).is_ready() {
            return std::task::Poll::Ready(JobEvent::SweepExpired);
        }
        std::task::Poll::Pending
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::task::noop_waker_ref;

    #[test]
    fn bootstrap_fires_exactly_once() {
        let mut jobs = Jobs::new(
            Duration::from_secs(600),
            Duration::from_secs(600),
            Duration::from_secs(600),
            Duration::from_secs(600),
        );
        let waker = noop_waker_ref();
        let mut cx = std::task::Context::from_waker(waker);
        assert_eq!(jobs.poll(&mut cx), std::task::Poll::Ready(JobEvent::Bootstrap));
        // Immediately polling again must not yield another Bootstrap; the
        // long intervals mean nothing else is due yet either.
        assert_eq!(jobs.poll(&mut cx), std::task::Poll::Pending);
    }
}
