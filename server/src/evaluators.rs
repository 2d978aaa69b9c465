//! Derived-state evaluators fed by the position stream.
//!
//! Each evaluator keeps a small amount of per-device state updated on every
//! position and may emit a closing event when the device's session lapses
//! (goes offline or decays to unknown). The session core only knows the
//! [`StateEvaluator`] trait; wiring the concrete motion/overspeed trackers is
//! the composition root's job.

use std::collections::HashMap;
use std::sync::Mutex;

use crate::model::{event_type, Device, Event, Position};

/// Speed below which a fix is considered stationary (GPS jitter), in knots.
const MOTION_SPEED_THRESHOLD: f64 = 0.5;

pub trait StateEvaluator: Send + Sync {
    /// Feed a fresh position report for a device.
    fn observe(&self, device: &Device, position: &Position);

    /// Called once when the device leaves the online state. May emit a
    /// closing event (with the position that produced it); resets the
    /// tracked state either way.
    fn conclude(&self, device_id: i64) -> Option<(Event, Option<Position>)>;
}

/// Tracks whether a device is in motion; a device that drops out of coverage
/// while moving yields a `deviceStopped` event.
#[derive(Default)]
pub struct MotionEvaluator {
    moving: Mutex<HashMap<i64, Position>>,
}

impl MotionEvaluator {
    pub fn new() -> Self {
        Self::default()
    }
}

impl StateEvaluator for MotionEvaluator {
    fn observe(&self, _device: &Device, position: &Position) {
        let mut moving = self.moving.lock().unwrap();
        if position.speed > MOTION_SPEED_THRESHOLD {
            moving.insert(position.device_id, position.clone());
        } else {
            moving.remove(&position.device_id);
        }
    }

    fn conclude(&self, device_id: i64) -> Option<(Event, Option<Position>)> {
        let last = self.moving.lock().unwrap().remove(&device_id)?;
        Some((
            Event::new(event_type::DEVICE_STOPPED, device_id),
            Some(last),
        ))
    }
}

/// Tracks speed-limit violations. The limit comes from the device's
/// `speed_limit` attribute (knots) or a server-wide default; a limit of zero
/// disables the check.
pub struct OverspeedEvaluator {
    default_limit: f64,
    violations: Mutex<HashMap<i64, Position>>,
}

impl OverspeedEvaluator {
    pub fn new(default_limit: f64) -> Self {
        Self {
            default_limit,
            violations: Mutex::new(HashMap::new()),
        }
    }
}

impl StateEvaluator for OverspeedEvaluator {
    fn observe(&self, device: &Device, position: &Position) {
        let limit = device.attribute_f64("speed_limit", self.default_limit);
        if limit <= 0.0 {
            return;
        }
        let mut violations = self.violations.lock().unwrap();
        if position.speed > limit {
            violations.insert(position.device_id, position.clone());
        } else {
            violations.remove(&position.device_id);
        }
    }

    fn conclude(&self, device_id: i64) -> Option<(Event, Option<Position>)> {
        let worst = self.violations.lock().unwrap().remove(&device_id)?;
        let mut event = Event::new(event_type::DEVICE_OVERSPEED, device_id);
        event.attributes = serde_json::json!({ "speed": worst.speed });
        Some((event, Some(worst)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::DeviceStatus;
    use chrono::Utc;

    fn device(attributes: serde_json::Value) -> Device {
        Device {
            id: 1,
            name: None,
            unique_id: "imei-1".into(),
            status: DeviceStatus::Online,
            disabled: false,
            last_update: None,
            group_id: None,
            attributes,
        }
    }

    fn position(speed: f64) -> Position {
        Position {
            id: 0,
            device_id: 1,
            fix_time: Utc::now(),
            latitude: 59.33,
            longitude: 18.06,
            speed,
            course: 0.0,
            attributes: serde_json::Value::Null,
        }
    }

    #[test]
    fn test_motion_stop_event_after_moving() {
        let evaluator = MotionEvaluator::new();
        let dev = device(serde_json::Value::Null);

        evaluator.observe(&dev, &position(12.0));
        let (event, pos) = evaluator.conclude(1).expect("moving device concludes");
        assert_eq!(event.event_type, event_type::DEVICE_STOPPED);
        assert_eq!(pos.unwrap().speed, 12.0);

        // State was reset; a second conclude is silent.
        assert!(evaluator.conclude(1).is_none());
    }

    #[test]
    fn test_motion_stationary_is_silent() {
        let evaluator = MotionEvaluator::new();
        let dev = device(serde_json::Value::Null);

        evaluator.observe(&dev, &position(12.0));
        evaluator.observe(&dev, &position(0.0)); // came to rest before lapsing
        assert!(evaluator.conclude(1).is_none());
    }

    #[test]
    fn test_overspeed_uses_device_attribute_over_default() {
        let evaluator = OverspeedEvaluator::new(100.0);
        let dev = device(serde_json::json!({"speed_limit": 50.0}));

        evaluator.observe(&dev, &position(60.0));
        let (event, _) = evaluator.conclude(1).expect("violation recorded");
        assert_eq!(event.event_type, event_type::DEVICE_OVERSPEED);
        assert_eq!(event.attributes["speed"], 60.0);
    }

    #[test]
    fn test_overspeed_disabled_without_limit() {
        let evaluator = OverspeedEvaluator::new(0.0);
        let dev = device(serde_json::Value::Null);

        evaluator.observe(&dev, &position(200.0));
        assert!(evaluator.conclude(1).is_none());
    }
}
