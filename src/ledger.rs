//! The subscription ledger: who wants what, and what the server has
//! confirmed.
//!
//! Two maps carry all subscription state. `confirmed` holds targets the
//! server has acknowledged; `pending` holds targets we want but have not yet
//! had acknowledged (including everything while disconnected). A target
//! lives in at most one of the two maps, its subscriber set is never empty,
//! and all mutation happens on the connection driver task.
//!
//! Every operation is a pure state transformation that returns what the
//! caller must do on the wire; the ledger itself performs no I/O.

use std::collections::{HashMap, HashSet};
use std::fmt;

use bytes::Bytes;

use crate::subscriber::SubscriberId;

/// A subscription subject: an exact channel name or a glob pattern.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) enum Target {
    Channel(Bytes),
    Pattern(Bytes),
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Target::Channel(name) => write!(f, "channel \"{}\"", String::from_utf8_lossy(name)),
            Target::Pattern(name) => write!(f, "pattern \"{}\"", String::from_utf8_lossy(name)),
        }
    }
}

/// Which kind of target a request names.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TargetKind {
    Channel,
    Pattern,
}

impl TargetKind {
    pub(crate) fn target(self, name: Bytes) -> Target {
        match self {
            TargetKind::Channel => Target::Channel(name),
            TargetKind::Pattern => Target::Pattern(name),
        }
    }
}

/// Partition targets into channel names and pattern names, preserving order.
pub(crate) fn split_targets(targets: Vec<Target>) -> (Vec<Bytes>, Vec<Bytes>) {
    let mut channels = Vec::new();
    let mut patterns = Vec::new();
    for target in targets {
        match target {
            Target::Channel(name) => channels.push(name),
            Target::Pattern(name) => patterns.push(name),
        }
    }
    (channels, patterns)
}

/// Result of recording new interest.
pub(crate) struct AddInterest {
    /// Targets that were unknown and must now be subscribed on the wire.
    pub to_wire: Vec<Target>,

    /// Targets already confirmed by the server; the subscriber gets its
    /// subscribed event without any wire traffic.
    pub already_confirmed: Vec<Target>,
}

/// The confirmed/pending two-map ledger.
#[derive(Debug, Default)]
pub(crate) struct Ledger {
    confirmed: HashMap<Target, HashSet<SubscriberId>>,
    pending: HashMap<Target, HashSet<SubscriberId>>,
}

impl Ledger {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Record that `who` wants `targets`.
    ///
    /// Targets already confirmed gain the subscriber and are reported back
    /// as such; targets already pending gain the subscriber silently; new
    /// targets become pending and are reported for wire subscription.
    pub(crate) fn add_interest(
        &mut self,
        targets: impl IntoIterator<Item = Target>,
        who: SubscriberId,
    ) -> AddInterest {
        let mut outcome = AddInterest {
            to_wire: Vec::new(),
            already_confirmed: Vec::new(),
        };

        for target in targets {
            if let Some(set) = self.confirmed.get_mut(&target) {
                set.insert(who);
                outcome.already_confirmed.push(target);
            } else if let Some(set) = self.pending.get_mut(&target) {
                set.insert(who);
            } else {
                self.pending.insert(target.clone(), HashSet::from([who]));
                outcome.to_wire.push(target);
            }
        }

        outcome
    }

    /// Drop `who`'s interest in `targets`, returning the targets that became
    /// orphaned and must be unsubscribed on the wire. Targets the subscriber
    /// never held are ignored.
    pub(crate) fn remove_interest(&mut self, targets: &[Target], who: SubscriberId) -> Vec<Target> {
        let mut orphans = Vec::new();
        for target in targets {
            if Self::remove_from(&mut self.confirmed, target, who)
                || Self::remove_from(&mut self.pending, target, who)
            {
                orphans.push(target.clone());
            }
        }
        orphans
    }

    /// Remove `who` from `target`'s set in `map`; true if the target became
    /// orphaned and was removed.
    fn remove_from(
        map: &mut HashMap<Target, HashSet<SubscriberId>>,
        target: &Target,
        who: SubscriberId,
    ) -> bool {
        if let Some(set) = map.get_mut(target) {
            set.remove(&who);
            if set.is_empty() {
                map.remove(target);
                return true;
            }
        }
        false
    }

    /// Drop `who` from every subscriber set, returning the orphaned channel
    /// and pattern names for wire unsubscription.
    pub(crate) fn drop_subscriber(&mut self, who: SubscriberId) -> (Vec<Bytes>, Vec<Bytes>) {
        let mut channels = Vec::new();
        let mut patterns = Vec::new();
        for map in [&mut self.confirmed, &mut self.pending] {
            map.retain(|target, set| {
                set.remove(&who);
                if set.is_empty() {
                    match target {
                        Target::Channel(name) => channels.push(name.clone()),
                        Target::Pattern(name) => patterns.push(name.clone()),
                    }
                    false
                } else {
                    true
                }
            });
        }
        (channels, patterns)
    }

    /// The server confirmed `target`: migrate its pending set to confirmed
    /// and return the migrated subscribers so each can be notified.
    ///
    /// An empty result means nobody wants the target anymore (everyone
    /// unsubscribed before the ack arrived); the caller drops the ack.
    pub(crate) fn confirm(&mut self, target: &Target) -> Vec<SubscriberId> {
        match self.pending.remove(target) {
            Some(set) => {
                let migrated: Vec<SubscriberId> = set.iter().copied().collect();
                self.confirmed.insert(target.clone(), set);
                migrated
            }
            None => Vec::new(),
        }
    }

    /// The server confirmed an unsubscribe for `target`. If local interest
    /// still exists the unsubscribe was server-initiated: the set moves back
    /// to pending and the caller must re-issue the subscribe. Returns true
    /// in that case.
    pub(crate) fn revive(&mut self, target: &Target) -> bool {
        match self.confirmed.remove(target) {
            Some(set) => {
                self.pending.insert(target.clone(), set);
                true
            }
            None => false,
        }
    }

    /// The connection was lost: everything confirmed becomes pending again.
    pub(crate) fn reset_to_pending(&mut self) {
        for (target, set) in self.confirmed.drain() {
            self.pending.entry(target).or_default().extend(set);
        }
    }

    /// Subscribers currently confirmed for `target`, for message dispatch.
    pub(crate) fn confirmed_members(&self, target: &Target) -> Vec<SubscriberId> {
        self.confirmed
            .get(target)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default()
    }

    /// True if `who` appears in any subscriber set.
    pub(crate) fn contains(&self, who: SubscriberId) -> bool {
        self.confirmed.values().any(|set| set.contains(&who))
            || self.pending.values().any(|set| set.contains(&who))
    }

    /// All pending channel and pattern names, for (re-)subscription after a
    /// connect. While disconnected this is the full interest set.
    pub(crate) fn wire_targets(&self) -> (Vec<Bytes>, Vec<Bytes>) {
        let mut channels = Vec::new();
        let mut patterns = Vec::new();
        for target in self.pending.keys() {
            match target {
                Target::Channel(name) => channels.push(name.clone()),
                Target::Pattern(name) => patterns.push(name.clone()),
            }
        }
        (channels, patterns)
    }

    /// Number of distinct targets across both maps.
    pub(crate) fn target_count(&self) -> usize {
        self.confirmed.len() + self.pending.len()
    }

    #[cfg(test)]
    fn assert_invariants(&self) {
        for (target, set) in self.confirmed.iter().chain(self.pending.iter()) {
            assert!(!set.is_empty(), "empty subscriber set kept for {target}");
        }
        for target in self.confirmed.keys() {
            assert!(
                !self.pending.contains_key(target),
                "{target} in both confirmed and pending"
            );
        }
    }
}
