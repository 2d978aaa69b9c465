//! Per-user subscription registry and update fan-out.
//!
//! User sessions (WebSocket handlers, tests) register an [`UpdateListener`]
//! under their user id; device and position updates are delivered to every
//! listener of every user allowed to see the device, events are targeted at
//! a single user, and keepalives go to everyone.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock, Weak};

use tracing::warn;

use crate::model::{Device, Event, Position};
use crate::storage::PermissionsOracle;

/// Callbacks a subscribed user session receives.
///
/// Callbacks run while the registry is locked for reading: they must not
/// block and must not call back into [`Hub::add_listener`] /
/// [`Hub::remove_listener`] (defer such mutations to another task). Delivery
/// failures are the listener's own to swallow — a listener with a closed
/// downstream simply drops the frame.
pub trait UpdateListener: Send + Sync {
    fn on_keepalive(&self);

    fn on_update_device(&self, device: &Device);

    fn on_update_position(&self, position: &Position);

    fn on_update_event(&self, event: &Event);
}

/// The fan-out hub.
///
/// The registry holds only weak references: a listener's owner controls its
/// lifetime and must call [`Hub::remove_listener`] on its shutdown path.
/// A registration leaked past its owner is a caller bug; the hub merely
/// skips dead entries.
pub struct Hub {
    permissions: Arc<dyn PermissionsOracle>,
    listeners: RwLock<HashMap<i64, Vec<Weak<dyn UpdateListener>>>>,
}

fn same_listener(weak: &Weak<dyn UpdateListener>, listener: &Arc<dyn UpdateListener>) -> bool {
    weak.upgrade()
        .is_some_and(|candidate| Arc::ptr_eq(&candidate, listener))
}

impl Hub {
    pub fn new(permissions: Arc<dyn PermissionsOracle>) -> Arc<Self> {
        Arc::new(Self {
            permissions,
            listeners: RwLock::new(HashMap::new()),
        })
    }

    /// Register a listener for a user. Idempotent: registering the same
    /// listener twice leaves a single entry.
    pub fn add_listener(&self, user_id: i64, listener: &Arc<dyn UpdateListener>) {
        let mut listeners = self.listeners.write().unwrap();
        let entry = listeners.entry(user_id).or_default();
        entry.retain(|weak| weak.strong_count() > 0);
        if !entry.iter().any(|weak| same_listener(weak, listener)) {
            entry.push(Arc::downgrade(listener));
        }
    }

    /// Remove a listener. Removing from a user with no registrations is a
    /// no-op.
    pub fn remove_listener(&self, user_id: i64, listener: &Arc<dyn UpdateListener>) {
        let mut listeners = self.listeners.write().unwrap();
        if let Some(entry) = listeners.get_mut(&user_id) {
            entry.retain(|weak| weak.strong_count() > 0 && !same_listener(weak, listener));
            if entry.is_empty() {
                listeners.remove(&user_id);
            }
        }
    }

    /// Invoke `on_keepalive` on every registered listener across all users.
    pub fn send_keepalive(&self) {
        let listeners = self.listeners.read().unwrap();
        for entry in listeners.values() {
            for weak in entry {
                if let Some(listener) = weak.upgrade() {
                    listener.on_keepalive();
                }
            }
        }
    }

    /// Push an updated device record to every user allowed to see it.
    pub async fn update_device(&self, device: &Device) {
        let users = self.visible_users(device.id).await;
        let listeners = self.listeners.read().unwrap();
        for user_id in users {
            if let Some(entry) = listeners.get(&user_id) {
                for weak in entry {
                    if let Some(listener) = weak.upgrade() {
                        listener.on_update_device(device);
                    }
                }
            }
        }
    }

    /// Push a position to every user allowed to see its device.
    pub async fn update_position(&self, position: &Position) {
        let users = self.visible_users(position.device_id).await;
        let listeners = self.listeners.read().unwrap();
        for user_id in users {
            if let Some(entry) = listeners.get(&user_id) {
                for weak in entry {
                    if let Some(listener) = weak.upgrade() {
                        listener.on_update_position(position);
                    }
                }
            }
        }
    }

    /// Push an event to a single user's listeners.
    pub fn update_event(&self, user_id: i64, event: &Event) {
        let listeners = self.listeners.read().unwrap();
        if let Some(entry) = listeners.get(&user_id) {
            for weak in entry {
                if let Some(listener) = weak.upgrade() {
                    listener.on_update_event(event);
                }
            }
        }
    }

    /// Number of live registrations across all users.
    pub fn listener_count(&self) -> usize {
        let listeners = self.listeners.read().unwrap();
        listeners
            .values()
            .map(|entry| entry.iter().filter(|w| w.strong_count() > 0).count())
            .sum()
    }

    async fn visible_users(&self, device_id: i64) -> HashSet<i64> {
        match self.permissions.device_users(device_id).await {
            Ok(users) => users,
            Err(e) => {
                warn!(device_id, error = %e, "Permission lookup failed; dropping update");
                HashSet::new()
            }
        }
    }
}
