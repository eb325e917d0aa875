//! Beacon inbox: beacons received but not yet consumed by the state machine.
//!
//! Handlers look for the beacon kinds they care about and leave everything
//! else in place for a later handler.

use std::collections::VecDeque;

use winenet_core::{AgencyUid, Beacon, BeaconMask};

/// A received beacon together with its sender.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingBeacon {
    pub from: AgencyUid,
    pub beacon: Beacon,
}

#[derive(Debug, Default)]
pub struct Inbox {
    queue: VecDeque<PendingBeacon>,
}

impl Inbox {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, pending: PendingBeacon) {
        self.queue.push_back(pending);
    }

    /// First beacon in arrival order whose id is in `mask`.
    pub fn peek_matching(&self, mask: impl Into<BeaconMask>) -> Option<&PendingBeacon> {
        let mask = mask.into();
        self.queue
            .iter()
            .find(|p| mask.contains(p.beacon.kind.id()))
    }

    /// Remove and return the first beacon whose id is in `mask`.
    pub fn take_matching(&mut self, mask: impl Into<BeaconMask>) -> Option<PendingBeacon> {
        self.take_where(mask, |_| true)
    }

    /// Remove and return the first beacon whose id is in `mask` and that
    /// satisfies `pred`.
    pub fn take_where(
        &mut self,
        mask: impl Into<BeaconMask>,
        pred: impl Fn(&PendingBeacon) -> bool,
    ) -> Option<PendingBeacon> {
        let mask = mask.into();
        let pos = self
            .queue
            .iter()
            .position(|p| mask.contains(p.beacon.kind.id()) && pred(p))?;
        self.queue.remove(pos)
    }

    /// Remove every beacon whose id is in `mask` and that satisfies `pred`,
    /// returning them in arrival order.
    pub fn drain_where(
        &mut self,
        mask: impl Into<BeaconMask>,
        pred: impl Fn(&PendingBeacon) -> bool,
    ) -> Vec<PendingBeacon> {
        let mask = mask.into();
        let mut taken = Vec::new();
        let mut kept = VecDeque::with_capacity(self.queue.len());
        for p in self.queue.drain(..) {
            if mask.contains(p.beacon.kind.id()) && pred(&p) {
                taken.push(p);
            } else {
                kept.push_back(p);
            }
        }
        self.queue = kept;
        taken
    }

    /// Drop every beacon whose id is in `mask`. Returns how many were dropped.
    pub fn remove_matching(&mut self, mask: impl Into<BeaconMask>) -> usize {
        self.drain_where(mask, |_| true).len()
    }

    pub fn clear(&mut self) -> usize {
        let n = self.queue.len();
        self.queue.clear();
        n
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}
