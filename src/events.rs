// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Topic-based event emitter.
//!
//! Fan-out is synchronous: `emit` invokes every listener for the event's
//! topic before returning. A panicking listener is caught and logged so it
//! cannot prevent the remaining listeners from running, and cannot poison
//! the engine's state.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use crate::locks::{resilient_read, resilient_write};
use crate::types::ItemStatus;

/// Event topics a caller can subscribe to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topic {
    Registered,
    Status,
    Progress,
    Complete,
    Expired,
    Error,
    Deferred,
    Deleted,
    Stopped,
    Connectivity,
}

/// Why a `registered` event fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistrationReason {
    /// The id was not previously registered.
    New,
    /// An existing id was re-registered with a strictly greater version.
    VersionUpdated,
}

impl std::fmt::Display for RegistrationReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RegistrationReason::New => write!(f, "new"),
            RegistrationReason::VersionUpdated => write!(f, "version-updated"),
        }
    }
}

/// Events published by the registry manager and download engine.
#[derive(Debug, Clone)]
pub enum Event {
    Registered {
        id: String,
        reason: RegistrationReason,
    },
    Status {
        id: String,
        status: ItemStatus,
    },
    Progress {
        id: String,
        bytes_downloaded: u64,
        total_bytes: Option<u64>,
        percent: Option<u32>,
    },
    Complete {
        id: String,
        mime_type: String,
    },
    Expired {
        id: String,
    },
    Error {
        id: String,
        error: String,
        retry_count: u32,
        /// `Some(false)` only on the terminal attempt; `None` for failures
        /// outside the retry pipeline (e.g. quota during registration).
        will_retry: Option<bool>,
    },
    Deferred {
        id: String,
        reason: String,
    },
    Deleted {
        id: String,
        registry_removed: bool,
    },
    Stopped,
    Connectivity {
        online: bool,
    },
}

impl Event {
    /// The topic this event is published on.
    pub fn topic(&self) -> Topic {
        match self {
            Event::Registered { .. } => Topic::Registered,
            Event::Status { .. } => Topic::Status,
            Event::Progress { .. } => Topic::Progress,
            Event::Complete { .. } => Topic::Complete,
            Event::Expired { .. } => Topic::Expired,
            Event::Error { .. } => Topic::Error,
            Event::Deferred { .. } => Topic::Deferred,
            Event::Deleted { .. } => Topic::Deleted,
            Event::Stopped => Topic::Stopped,
            Event::Connectivity { .. } => Topic::Connectivity,
        }
    }
}

/// Handle returned by [`EventBus::on`] and [`EventBus::once`], used to
/// unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscriptionId {
    topic: Topic,
    id: u64,
}

struct Subscription {
    id: u64,
    once: bool,
    listener: Arc<dyn Fn(&Event) + Send + Sync>,
}

/// Synchronous topic emitter shared by all components.
pub struct EventBus {
    listeners: RwLock<HashMap<Topic, Vec<Subscription>>>,
    next_id: AtomicU64,
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            listeners: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Subscribe to a topic. The listener runs synchronously inside `emit`.
    pub fn on<F>(&self, topic: Topic, listener: F) -> SubscriptionId
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        self.subscribe(topic, listener, false)
    }

    /// Subscribe to a topic for a single delivery.
    pub fn once<F>(&self, topic: Topic, listener: F) -> SubscriptionId
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        self.subscribe(topic, listener, true)
    }

    fn subscribe<F>(&self, topic: Topic, listener: F, once: bool) -> SubscriptionId
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut listeners = resilient_write(&self.listeners);
        listeners.entry(topic).or_default().push(Subscription {
            id,
            once,
            listener: Arc::new(listener),
        });
        SubscriptionId { topic, id }
    }

    /// Remove a subscription. Returns false when it was already gone.
    pub fn off(&self, subscription: SubscriptionId) -> bool {
        let mut listeners = resilient_write(&self.listeners);
        if let Some(subs) = listeners.get_mut(&subscription.topic) {
            let before = subs.len();
            subs.retain(|s| s.id != subscription.id);
            return subs.len() != before;
        }
        false
    }

    /// Publish an event to every listener of its topic.
    ///
    /// The listener snapshot is taken before invocation so listeners may
    /// subscribe or unsubscribe from inside a callback without deadlocking.
    pub fn emit(&self, event: &Event) {
        let topic = event.topic();
        let snapshot: Vec<(u64, bool, Arc<dyn Fn(&Event) + Send + Sync>)> = {
            let listeners = resilient_read(&self.listeners);
            match listeners.get(&topic) {
                Some(subs) => subs
                    .iter()
                    .map(|s| (s.id, s.once, Arc::clone(&s.listener)))
                    .collect(),
                None => return,
            }
        };

        let mut spent = Vec::new();
        for (id, once, listener) in snapshot {
            if catch_unwind(AssertUnwindSafe(|| listener(event))).is_err() {
                tracing::warn!(target: "events", topic = ?topic, "event listener panicked; continuing fan-out");
            }
            if once {
                spent.push(id);
            }
        }

        if !spent.is_empty() {
            let mut listeners = resilient_write(&self.listeners);
            if let Some(subs) = listeners.get_mut(&topic) {
                subs.retain(|s| !spent.contains(&s.id));
            }
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
