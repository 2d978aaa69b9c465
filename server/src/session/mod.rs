//! Device session tracking and the status state machine.
//!
//! The [`ConnectionManager`] is the in-memory authority on which device is
//! currently connected, over which endpoint, and in which liveness state.
//! Protocol workers call [`ConnectionManager::bind`] once a connection has
//! identified itself and [`ConnectionManager::disconnect`] when the transport
//! closes; every processed message refreshes the online status, which arms a
//! decay timeout that demotes a silent device to `unknown`.

pub mod endpoint;
pub mod timeout;

pub use endpoint::{Endpoint, TrackerChannel};

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::config::AppConfig;
use crate::evaluators::StateEvaluator;
use crate::hub::Hub;
use crate::model::{Device, DeviceStatus, Event};
use crate::session::timeout::Timeout;
use crate::storage::{DeviceCache, DeviceStore, NotificationSink};

/// Immutable binding of a device identity to a live endpoint, created when a
/// connection first identifies itself.
#[derive(Debug, Clone)]
pub struct DeviceSession {
    pub device_id: i64,
    pub unique_id: String,
    pub protocol: String,
    pub endpoint: Endpoint,
    /// Protocol-layer scratch space, shared between both table indexes.
    pub attributes: Arc<Mutex<HashMap<String, String>>>,
}

impl DeviceSession {
    fn new(device_id: i64, unique_id: &str, protocol: &str, endpoint: Endpoint) -> Self {
        Self {
            device_id,
            unique_id: unique_id.to_string(),
            protocol: protocol.to_string(),
            endpoint,
            attributes: Arc::new(Mutex::new(HashMap::new())),
        }
    }
}

/// The two session indexes. Guarded as a single resource: every mutation
/// happens under one lock so the indexes can never disagree.
#[derive(Default)]
struct SessionTables {
    by_device: HashMap<i64, DeviceSession>,
    by_endpoint: HashMap<Endpoint, HashMap<String, DeviceSession>>,
}

impl SessionTables {
    /// Remove a device's session from both indexes, dropping the endpoint
    /// key when its submap empties.
    fn evict_device(&mut self, device_id: i64) -> Option<DeviceSession> {
        let session = self.by_device.remove(&device_id)?;
        if let Some(submap) = self.by_endpoint.get_mut(&session.endpoint) {
            submap.remove(&session.unique_id);
            if submap.is_empty() {
                self.by_endpoint.remove(&session.endpoint);
            }
        }
        Some(session)
    }
}

/// In-memory session and liveness core.
pub struct ConnectionManager {
    devices: Arc<dyn DeviceStore>,
    notifications: Arc<dyn NotificationSink>,
    cache: Arc<dyn DeviceCache>,
    hub: Arc<Hub>,
    evaluators: Vec<Arc<dyn StateEvaluator>>,

    device_timeout: Duration,
    update_device_state: bool,
    register_unknown: bool,

    sessions: Mutex<SessionTables>,
    timeouts: Mutex<HashMap<i64, Timeout>>,
    /// Serializes status transitions so each device observes a total order
    /// of status changes and the emit -> persist -> fan-out sequence is
    /// never interleaved.
    transitions: tokio::sync::Mutex<()>,
}

impl ConnectionManager {
    pub fn new(
        devices: Arc<dyn DeviceStore>,
        notifications: Arc<dyn NotificationSink>,
        cache: Arc<dyn DeviceCache>,
        hub: Arc<Hub>,
        evaluators: Vec<Arc<dyn StateEvaluator>>,
        config: &AppConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            devices,
            notifications,
            cache,
            hub,
            evaluators,
            device_timeout: Duration::from_secs(config.status.timeout_secs),
            update_device_state: config.status.update_device_state,
            register_unknown: config.database.register_unknown,
            sessions: Mutex::new(SessionTables::default()),
            timeouts: Mutex::new(HashMap::new()),
            transitions: tokio::sync::Mutex::new(()),
        })
    }

    /// The live session for a device, if any.
    pub fn lookup_by_device(&self, device_id: i64) -> Option<DeviceSession> {
        self.sessions.lock().unwrap().by_device.get(&device_id).cloned()
    }

    /// Number of live device sessions.
    pub fn session_count(&self) -> usize {
        self.sessions.lock().unwrap().by_device.len()
    }

    /// Whether a decay timeout is currently armed for the device.
    pub fn has_decay_timeout(&self, device_id: i64) -> bool {
        self.timeouts.lock().unwrap().contains_key(&device_id)
    }

    /// Resolve a device session for an identified connection.
    ///
    /// `unique_ids` are the identifiers the device presented, probed in
    /// order. With an empty list an arbitrary existing session on the
    /// endpoint is returned — only meaningful for endpoints carrying a
    /// single device; callers use it to re-find the session for follow-up
    /// messages.
    ///
    /// Returns `None` (after logging) when no identifier resolves to a
    /// device, when the device is disabled, or when the identity lookup
    /// fails; transient lookup errors are never propagated to protocol
    /// workers.
    pub async fn bind(
        &self,
        protocol: &str,
        channel: &TrackerChannel,
        unique_ids: &[&str],
    ) -> Option<DeviceSession> {
        let endpoint = channel.endpoint();

        {
            let tables = self.sessions.lock().unwrap();
            if let Some(submap) = tables.by_endpoint.get(&endpoint) {
                if unique_ids.is_empty() {
                    return submap.values().next().cloned();
                }
                for unique_id in unique_ids {
                    if let Some(session) = submap.get(*unique_id) {
                        return Some(session.clone());
                    }
                }
            } else if unique_ids.is_empty() {
                return None;
            }
        }

        let mut device: Option<Device> = None;
        for unique_id in unique_ids {
            match self.devices.device_by_unique_id(unique_id).await {
                Ok(Some(found)) => {
                    device = Some(found);
                    break;
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(unique_id = %unique_id, error = %e, "Find device error");
                    break;
                }
            }
        }

        if device.is_none() && self.register_unknown {
            if let Some(first) = unique_ids.first() {
                match self.devices.register_unknown_device(first).await {
                    Ok(created) => {
                        info!(
                            unique_id = %first,
                            device_id = created.id,
                            "Automatically registered device"
                        );
                        device = Some(created);
                    }
                    Err(e) => {
                        warn!(unique_id = %first, error = %e, "Failed to register device");
                    }
                }
            }
        }

        let device = match device {
            Some(device) => device,
            None => {
                warn!(
                    unique_ids = ?unique_ids,
                    remote = %channel.remote_addr(),
                    "Unknown device"
                );
                return None;
            }
        };

        if device.disabled {
            warn!(
                device_id = device.id,
                unique_id = %device.unique_id,
                remote = %channel.remote_addr(),
                "Disabled device"
            );
            return None;
        }

        let session = DeviceSession::new(device.id, &device.unique_id, protocol, endpoint);
        {
            let mut tables = self.sessions.lock().unwrap();
            if let Some(old) = tables.evict_device(device.id) {
                debug!(
                    device_id = device.id,
                    old = %old.endpoint,
                    new = %endpoint,
                    "Rebinding device session"
                );
            }
            tables.by_device.insert(device.id, session.clone());
            tables
                .by_endpoint
                .entry(endpoint)
                .or_default()
                .insert(session.unique_id.clone(), session.clone());
        }
        self.cache.add_device(device.id);

        info!(
            device_id = device.id,
            unique_id = %device.unique_id,
            protocol,
            endpoint = %endpoint,
            "Device session bound"
        );
        Some(session)
    }

    /// Tear down every session on a closed channel's endpoint: both indexes
    /// are cleaned in one critical section, then each affected device is
    /// transitioned to offline and dropped from the hot cache. A second
    /// disconnect on the same endpoint is a no-op.
    pub async fn disconnect(self: &Arc<Self>, channel: &TrackerChannel) {
        let endpoint = channel.endpoint();
        let removed: Vec<DeviceSession> = {
            let mut tables = self.sessions.lock().unwrap();
            match tables.by_endpoint.remove(&endpoint) {
                Some(submap) => {
                    let mut removed = Vec::with_capacity(submap.len());
                    for (_, session) in submap {
                        tables.by_device.remove(&session.device_id);
                        removed.push(session);
                    }
                    removed
                }
                None => return,
            }
        };

        for session in removed {
            info!(
                device_id = session.device_id,
                endpoint = %endpoint,
                "Device disconnected"
            );
            self.update_status(session.device_id, DeviceStatus::Offline, None)
                .await;
            self.cache.remove_device(session.device_id);
        }
    }

    /// Drop a single device whose online status decayed: transition to
    /// `unknown` and surgically remove its session. The endpoint itself is
    /// left open — it may still carry other devices.
    pub fn forget(
        self: &Arc<Self>,
        device_id: i64,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send + '_>> {
        Box::pin(async move {
            self.update_status(device_id, DeviceStatus::Unknown, None)
                .await;

            let session = self.sessions.lock().unwrap().evict_device(device_id);
            if let Some(session) = session {
                self.cache.remove_device(device_id);
                info!(
                    device_id,
                    endpoint = %session.endpoint,
                    "Device session forgotten"
                );
            }
        })
    }

    /// Apply a status transition for a device.
    ///
    /// The status is written (and persisted, and fanned out) even when it
    /// did not change, which refreshes `last_update`; a synthetic status
    /// event is emitted only on an actual change. Ordering within the
    /// transition is fixed: events first, then persistence, then fan-out.
    pub async fn update_status(
        self: &Arc<Self>,
        device_id: i64,
        status: DeviceStatus,
        time: Option<DateTime<Utc>>,
    ) {
        let _transition = self.transitions.lock().await;

        let mut device = match self.devices.device_by_id(device_id).await {
            Ok(Some(device)) => device,
            Ok(None) => {
                warn!(device_id, "Status update for unknown device");
                return;
            }
            Err(e) => {
                warn!(device_id, error = %e, "Device lookup failed");
                return;
            }
        };

        let old_status = device.status;
        device.status = status;
        if let Some(time) = time {
            device.last_update = Some(time);
        }

        if status != old_status {
            let mut events = vec![(Event::for_status(status, device_id), None)];
            if status != DeviceStatus::Online && self.update_device_state {
                for evaluator in &self.evaluators {
                    if let Some((event, position)) = evaluator.conclude(device_id) {
                        events.push((event, position));
                    }
                }
            }
            info!(
                device_id,
                from = old_status.as_str(),
                to = status.as_str(),
                "Device status changed"
            );
            self.notifications.update_events(&events).await;
        }

        // Swap the decay timeout. Remove-and-cancel happens in one critical
        // section so a concurrently firing task observes the cancel flag.
        {
            let mut timeouts = self.timeouts.lock().unwrap();
            if let Some(old) = timeouts.remove(&device_id) {
                old.cancel();
            }
            if status == DeviceStatus::Online {
                let manager = Arc::downgrade(self);
                let timeout = Timeout::arm(self.device_timeout, move || async move {
                    if let Some(manager) = manager.upgrade() {
                        debug!(device_id, "Online status decayed");
                        manager.forget(device_id).await;
                    }
                });
                timeouts.insert(device_id, timeout);
            }
        }

        if let Err(e) = self.devices.update_device_status(&device).await {
            warn!(device_id, error = %e, "Failed to persist device status");
        }

        self.hub.update_device(&device).await;
    }

    /// Stop the liveness machinery: drop all armed timeouts and clear the
    /// session tables. Pending decay tasks observe their cancel flag and
    /// take no action.
    pub fn shutdown(&self) {
        let mut timeouts = self.timeouts.lock().unwrap();
        for (_, timeout) in timeouts.drain() {
            timeout.cancel();
        }
        drop(timeouts);

        let mut tables = self.sessions.lock().unwrap();
        tables.by_device.clear();
        tables.by_endpoint.clear();
        info!("Session tables cleared");
    }

    #[cfg(test)]
    fn assert_indexes_consistent(&self) {
        let tables = self.sessions.lock().unwrap();
        for (device_id, session) in &tables.by_device {
            let submap = tables
                .by_endpoint
                .get(&session.endpoint)
                .unwrap_or_else(|| panic!("endpoint missing for device {device_id}"));
            assert!(
                submap.contains_key(&session.unique_id),
                "unique id missing from endpoint submap"
            );
        }
        for (endpoint, submap) in &tables.by_endpoint {
            assert!(!submap.is_empty(), "empty submap left behind for {endpoint}");
            for session in submap.values() {
                assert_eq!(
                    tables.by_device.get(&session.device_id).map(|s| s.endpoint),
                    Some(*endpoint),
                    "by-device entry disagrees with endpoint index"
                );
            }
        }
    }
}
