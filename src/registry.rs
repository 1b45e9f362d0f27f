//! Registry of live subscribers: refs and death notifications.

use std::collections::HashMap;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::ledger::Ledger;
use crate::subscriber::{ConnectionId, Event, EventKind, Subscriber, SubscriberId, SubscriberRef};

struct Entry {
    reference: SubscriberRef,
    sender: mpsc::UnboundedSender<Event>,
    /// Watch task that signals the driver when the subscriber's event
    /// stream is dropped. Aborted when the entry is released.
    watch: JoinHandle<()>,
}

/// Tracks live subscribers for one connection.
///
/// Each entry owns the subscriber's ref, its event endpoint, and a death
/// watch. The watch resolves when the subscriber drops its [`EventStream`]
/// (the channel-close signal standing in for a process monitor) and reports
/// the death back to the driver through the `deaths` channel.
///
/// [`EventStream`]: crate::subscriber::EventStream
pub(crate) struct SubscriberRegistry {
    connection: ConnectionId,
    entries: HashMap<SubscriberId, Entry>,
    deaths: mpsc::UnboundedSender<SubscriberId>,
    next_ref: u64,
}

impl SubscriberRegistry {
    pub(crate) fn new(connection: ConnectionId, deaths: mpsc::UnboundedSender<SubscriberId>) -> Self {
        Self {
            connection,
            entries: HashMap::new(),
            deaths,
            next_ref: 1,
        }
    }

    /// Look up or create the entry for `subscriber`, returning its ref.
    ///
    /// Idempotent: repeated calls for a live subscriber return the same ref
    /// and install no second watch.
    pub(crate) fn acquire(&mut self, subscriber: &Subscriber) -> SubscriberRef {
        if let Some(entry) = self.entries.get(&subscriber.id()) {
            return entry.reference;
        }

        let reference = SubscriberRef(self.next_ref);
        self.next_ref += 1;

        let id = subscriber.id();
        let sender = subscriber.sender().clone();
        let deaths = self.deaths.clone();
        let watch = tokio::spawn({
            // The spawned future must own a handle of its own.
            let sender = sender.clone();
            async move {
                sender.closed().await;
                let _ = deaths.send(id);
            }
        });

        tracing::debug!(subscriber = %id, reference = %reference, "registered subscriber");
        self.entries.insert(
            id,
            Entry {
                reference,
                sender,
                watch,
            },
        );
        reference
    }

    /// Drop the entry for `who` if the ledger holds no interest for it,
    /// cancelling the death watch.
    pub(crate) fn release_if_idle(&mut self, who: SubscriberId, ledger: &Ledger) {
        if !ledger.contains(who) {
            self.remove(who);
        }
    }

    /// Drop the entry for `who` unconditionally.
    pub(crate) fn remove(&mut self, who: SubscriberId) {
        if let Some(entry) = self.entries.remove(&who) {
            entry.watch.abort();
            tracing::debug!(subscriber = %who, "released subscriber");
        }
    }

    /// Deliver an event to one subscriber. A send failure means the
    /// subscriber is gone; its death notification will clean up shortly.
    pub(crate) fn notify(&self, who: SubscriberId, kind: EventKind) {
        if let Some(entry) = self.entries.get(&who) {
            let _ = entry.sender.send(Event {
                connection: self.connection,
                reference: entry.reference,
                kind,
            });
        }
    }

    /// Deliver the same event to every registered subscriber.
    pub(crate) fn notify_all(&self, kind: EventKind) {
        for entry in self.entries.values() {
            let _ = entry.sender.send(Event {
                connection: self.connection,
                reference: entry.reference,
                kind: kind.clone(),
            });
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }
}

impl Drop for SubscriberRegistry {
    fn drop(&mut self) {
        for entry in self.entries.values() {
            entry.watch.abort();
        }
    }
}
