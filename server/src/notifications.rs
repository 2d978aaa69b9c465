//! Event recording and per-user event delivery.
//!
//! The session core hands every batch of synthetic events (status changes
//! plus evaluator output) to a [`NotificationSink`]; the production sink
//! persists each event and pushes it to the listeners of every user allowed
//! to see the originating device. Recording is strictly best-effort — a
//! storage failure is logged and never fails the status transition that
//! produced the event.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::warn;

use crate::hub::Hub;
use crate::model::{Event, Position};
use crate::storage::{EventStore, NotificationSink, PermissionsOracle};

pub struct EventRecorder {
    events: Arc<dyn EventStore>,
    permissions: Arc<dyn PermissionsOracle>,
    hub: Arc<Hub>,
}

impl EventRecorder {
    pub fn new(
        events: Arc<dyn EventStore>,
        permissions: Arc<dyn PermissionsOracle>,
        hub: Arc<Hub>,
    ) -> Self {
        Self {
            events,
            permissions,
            hub,
        }
    }
}

#[async_trait]
impl NotificationSink for EventRecorder {
    async fn update_events(&self, events: &[(Event, Option<Position>)]) {
        for (event, _position) in events {
            if let Err(e) = self.events.add_event(event).await {
                warn!(
                    event_type = %event.event_type,
                    device_id = event.device_id,
                    error = %e,
                    "Failed to record event"
                );
            }

            match self.permissions.device_users(event.device_id).await {
                Ok(users) => {
                    for user_id in users {
                        self.hub.update_event(user_id, event);
                    }
                }
                Err(e) => {
                    warn!(
                        device_id = event.device_id,
                        error = %e,
                        "Permission lookup failed; event not delivered"
                    );
                }
            }
        }
    }
}
