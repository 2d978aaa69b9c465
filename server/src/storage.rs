//! Trait seams for the collaborators the session core depends on.
//!
//! The core holds these as `Arc<dyn ...>` handed in at construction; the
//! production implementations live in [`crate::db`] (SQLite) and
//! [`crate::cache`], tests substitute in-memory fakes.

use std::collections::HashSet;

use anyhow::Result;
use async_trait::async_trait;

use crate::model::{Device, Event, Group, Position};

/// Device identity resolution and status persistence.
#[async_trait]
pub trait DeviceStore: Send + Sync {
    async fn device_by_id(&self, id: i64) -> Result<Option<Device>>;

    async fn device_by_unique_id(&self, unique_id: &str) -> Result<Option<Device>>;

    /// Create a device record for an unseen unique id. Only called when the
    /// `database.register_unknown` policy is enabled.
    async fn register_unknown_device(&self, unique_id: &str) -> Result<Device>;

    /// Persist the device's current status and last-update timestamp.
    async fn update_device_status(&self, device: &Device) -> Result<()>;

    async fn list_devices(&self) -> Result<Vec<Device>>;
}

#[async_trait]
pub trait PositionStore: Send + Sync {
    /// Insert a position and return its row id.
    async fn add_position(&self, position: &Position) -> Result<i64>;

    /// Most recent position for a device, if any.
    async fn latest_position(&self, device_id: i64) -> Result<Option<Position>>;
}

#[async_trait]
pub trait GroupStore: Send + Sync {
    async fn fetch_groups(&self) -> Result<Vec<Group>>;

    async fn insert_group(&self, group: &Group) -> Result<i64>;

    async fn update_group(&self, group: &Group) -> Result<()>;
}

#[async_trait]
pub trait EventStore: Send + Sync {
    /// Record an event and return its row id.
    async fn add_event(&self, event: &Event) -> Result<i64>;
}

/// Answers device visibility questions. Permission *evaluation* is out of
/// scope here; the core only consumes the answers.
#[async_trait]
pub trait PermissionsOracle: Send + Sync {
    /// All user ids allowed to see the given device.
    async fn device_users(&self, device_id: i64) -> Result<HashSet<i64>>;

    async fn check_device(&self, user_id: i64, device_id: i64) -> Result<bool>;
}

/// Records synthetic events (status changes, motion, overspeed), optionally
/// tied to the position that produced them. Implementations absorb their own
/// failures; event recording is never allowed to fail a status transition.
#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn update_events(&self, events: &[(Event, Option<Position>)]);
}

/// Tracks which devices are "hot" (have a live session). The session core
/// tells it when to add or drop a device; readers use it to skip cold
/// lookups.
pub trait DeviceCache: Send + Sync {
    fn add_device(&self, device_id: i64);

    fn remove_device(&self, device_id: i64);

    fn contains(&self, device_id: i64) -> bool;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
