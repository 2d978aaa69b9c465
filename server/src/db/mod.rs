use std::collections::HashSet;
use std::str::FromStr;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};
use tracing::info;

use crate::model::{Device, DeviceStatus, Event, Group, Position};
use crate::storage::{DeviceStore, EventStore, GroupStore, PermissionsOracle, PositionStore};

/// DDL for a fresh database, embedded at compile time.
const SCHEMA: &str = include_str!("schema.sql");

/// Current schema version, stored in SQLite's `user_version` pragma.
const SCHEMA_VERSION: i64 = 1;

/// Open the SQLite pool (creating the file if needed) and bring the schema
/// up to date.
pub async fn init(database_url: &str) -> Result<SqlitePool> {
    let options = SqliteConnectOptions::from_str(database_url)?
        .create_if_missing(true)
        .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
        .busy_timeout(std::time::Duration::from_secs(5));

    // ":memory:" gives every new connection its own blank database, so an
    // in-memory pool must stay at a single connection.
    let max_connections = if database_url == ":memory:" { 1 } else { 5 };

    let pool = SqlitePoolOptions::new()
        .max_connections(max_connections)
        .connect_with(options)
        .await?;

    migrate(&pool).await?;

    Ok(pool)
}

/// Create the schema on databases older than [`SCHEMA_VERSION`].
///
/// `PRAGMA user_version` starts at 0 on a blank database. The DDL runs one
/// statement per query.
async fn migrate(pool: &SqlitePool) -> Result<()> {
    let version: i64 = sqlx::query_scalar("PRAGMA user_version")
        .fetch_one(pool)
        .await?;
    if version >= SCHEMA_VERSION {
        return Ok(());
    }

    for statement in SCHEMA.split(';').map(str::trim).filter(|s| !s.is_empty()) {
        sqlx::query(statement).execute(pool).await?;
    }
    sqlx::query(&format!("PRAGMA user_version = {SCHEMA_VERSION}"))
        .execute(pool)
        .await?;

    info!(version = SCHEMA_VERSION, "Database schema created");
    Ok(())
}

/// SQLite-backed implementation of the storage traits the session core and
/// the API consume.
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

const DEVICE_COLUMNS: &str =
    "id, name, unique_id, status, disabled, last_update, group_id, attributes";

fn parse_time(value: Option<String>) -> Option<DateTime<Utc>> {
    value
        .as_deref()
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|t| t.with_timezone(&Utc))
}

fn parse_attributes(value: String) -> serde_json::Value {
    serde_json::from_str(&value).unwrap_or(serde_json::Value::Null)
}

fn device_from_row(row: &SqliteRow) -> Result<Device, sqlx::Error> {
    Ok(Device {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        unique_id: row.try_get("unique_id")?,
        status: DeviceStatus::from_db(&row.try_get::<String, _>("status")?),
        disabled: row.try_get::<i64, _>("disabled")? != 0,
        last_update: parse_time(row.try_get("last_update")?),
        group_id: row.try_get("group_id")?,
        attributes: parse_attributes(row.try_get("attributes")?),
    })
}

fn position_from_row(row: &SqliteRow) -> Result<Position, sqlx::Error> {
    Ok(Position {
        id: row.try_get("id")?,
        device_id: row.try_get("device_id")?,
        fix_time: parse_time(row.try_get("fix_time")?).unwrap_or_else(Utc::now),
        latitude: row.try_get("latitude")?,
        longitude: row.try_get("longitude")?,
        speed: row.try_get("speed")?,
        course: row.try_get("course")?,
        attributes: parse_attributes(row.try_get("attributes")?),
    })
}

#[async_trait]
impl DeviceStore for Database {
    async fn device_by_id(&self, id: i64) -> Result<Option<Device>> {
        let row = sqlx::query(&format!("SELECT {DEVICE_COLUMNS} FROM devices WHERE id = ?"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.as_ref().map(device_from_row).transpose()?)
    }

    async fn device_by_unique_id(&self, unique_id: &str) -> Result<Option<Device>> {
        let row = sqlx::query(&format!(
            "SELECT {DEVICE_COLUMNS} FROM devices WHERE unique_id = ?"
        ))
        .bind(unique_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.as_ref().map(device_from_row).transpose()?)
    }

    async fn register_unknown_device(&self, unique_id: &str) -> Result<Device> {
        let result =
            sqlx::query("INSERT INTO devices (name, unique_id, status) VALUES (?, ?, 'unknown')")
                .bind(unique_id)
                .bind(unique_id)
                .execute(&self.pool)
                .await?;

        info!(unique_id, id = result.last_insert_rowid(), "Device registered");

        self.device_by_id(result.last_insert_rowid())
            .await?
            .ok_or_else(|| anyhow::anyhow!("registered device vanished"))
    }

    async fn update_device_status(&self, device: &Device) -> Result<()> {
        sqlx::query("UPDATE devices SET status = ?, last_update = ? WHERE id = ?")
            .bind(device.status.as_str())
            .bind(device.last_update.map(|t| t.to_rfc3339()))
            .bind(device.id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn list_devices(&self) -> Result<Vec<Device>> {
        let rows = sqlx::query(&format!("SELECT {DEVICE_COLUMNS} FROM devices ORDER BY id"))
            .fetch_all(&self.pool)
            .await?;
        Ok(rows
            .iter()
            .map(device_from_row)
            .collect::<Result<Vec<_>, _>>()?)
    }
}

#[async_trait]
impl PositionStore for Database {
    async fn add_position(&self, position: &Position) -> Result<i64> {
        let result = sqlx::query(
            "INSERT INTO positions (device_id, fix_time, latitude, longitude, speed, course, attributes) \
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(position.device_id)
        .bind(position.fix_time.to_rfc3339())
        .bind(position.latitude)
        .bind(position.longitude)
        .bind(position.speed)
        .bind(position.course)
        .bind(serde_json::to_string(&position.attributes).unwrap_or_else(|_| "{}".to_string()))
        .execute(&self.pool)
        .await?;
        Ok(result.last_insert_rowid())
    }

    async fn latest_position(&self, device_id: i64) -> Result<Option<Position>> {
        let row = sqlx::query(
            "SELECT id, device_id, fix_time, latitude, longitude, speed, course, attributes \
             FROM positions WHERE device_id = ? ORDER BY fix_time DESC, id DESC LIMIT 1",
        )
        .bind(device_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.as_ref().map(position_from_row).transpose()?)
    }
}

#[async_trait]
impl EventStore for Database {
    async fn add_event(&self, event: &Event) -> Result<i64> {
        let result = sqlx::query(
            "INSERT INTO events (type, device_id, event_time, attributes) VALUES (?, ?, ?, ?)",
        )
        .bind(&event.event_type)
        .bind(event.device_id)
        .bind(event.event_time.to_rfc3339())
        .bind(serde_json::to_string(&event.attributes).unwrap_or_else(|_| "{}".to_string()))
        .execute(&self.pool)
        .await?;
        Ok(result.last_insert_rowid())
    }
}

#[async_trait]
impl GroupStore for Database {
    async fn fetch_groups(&self) -> Result<Vec<Group>> {
        let rows = sqlx::query("SELECT id, name, group_id FROM groups ORDER BY id")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows
            .into_iter()
            .map(|row| Group {
                id: row.get("id"),
                name: row.get("name"),
                group_id: row.get("group_id"),
            })
            .collect())
    }

    async fn insert_group(&self, group: &Group) -> Result<i64> {
        let result = sqlx::query("INSERT INTO groups (name, group_id) VALUES (?, ?)")
            .bind(&group.name)
            .bind(group.group_id)
            .execute(&self.pool)
            .await?;
        Ok(result.last_insert_rowid())
    }

    async fn update_group(&self, group: &Group) -> Result<()> {
        sqlx::query("UPDATE groups SET name = ?, group_id = ? WHERE id = ?")
            .bind(&group.name)
            .bind(group.group_id)
            .bind(group.id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl PermissionsOracle for Database {
    async fn device_users(&self, device_id: i64) -> Result<HashSet<i64>> {
        let rows = sqlx::query("SELECT user_id FROM user_devices WHERE device_id = ?")
            .bind(device_id)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(|row| row.get("user_id")).collect())
    }

    async fn check_device(&self, user_id: i64, device_id: i64) -> Result<bool> {
        let exists: bool = sqlx::query_scalar(
            "SELECT COUNT(*) > 0 FROM user_devices WHERE user_id = ? AND device_id = ?",
        )
        .bind(user_id)
        .bind(device_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(exists)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Helper: an in-memory database with the full schema in place.
    async fn test_database() -> Database {
        Database::new(init(":memory:").await.expect("DB init failed"))
    }

    #[tokio::test]
    async fn test_register_and_lookup_device() {
        let db = test_database().await;

        assert!(db.device_by_unique_id("imei-1").await.unwrap().is_none());

        let device = db.register_unknown_device("imei-1").await.unwrap();
        assert_eq!(device.unique_id, "imei-1");
        assert_eq!(device.status, DeviceStatus::Unknown);
        assert!(!device.disabled);

        let found = db
            .device_by_unique_id("imei-1")
            .await
            .unwrap()
            .expect("device resolvable after registration");
        assert_eq!(found.id, device.id);
    }

    #[tokio::test]
    async fn test_update_device_status_round_trips() {
        let db = test_database().await;
        let mut device = db.register_unknown_device("imei-1").await.unwrap();

        device.status = DeviceStatus::Online;
        device.last_update = Some(Utc::now());
        db.update_device_status(&device).await.unwrap();

        let reloaded = db.device_by_id(device.id).await.unwrap().unwrap();
        assert_eq!(reloaded.status, DeviceStatus::Online);
        assert!(reloaded.last_update.is_some());
    }

    #[tokio::test]
    async fn test_latest_position_orders_by_fix_time() {
        let db = test_database().await;
        let device = db.register_unknown_device("imei-1").await.unwrap();

        let older = Position {
            id: 0,
            device_id: device.id,
            fix_time: Utc::now() - chrono::Duration::minutes(5),
            latitude: 1.0,
            longitude: 1.0,
            speed: 0.0,
            course: 0.0,
            attributes: serde_json::Value::Null,
        };
        let newer = Position {
            fix_time: Utc::now(),
            latitude: 2.0,
            ..older.clone()
        };
        db.add_position(&newer).await.unwrap();
        db.add_position(&older).await.unwrap();

        let latest = db.latest_position(device.id).await.unwrap().unwrap();
        assert_eq!(latest.latitude, 2.0);
    }

    #[tokio::test]
    async fn test_permissions_reflect_user_devices_rows() {
        let db = test_database().await;
        let device = db.register_unknown_device("imei-1").await.unwrap();

        sqlx::query("INSERT INTO users (id, name) VALUES (1, 'u1'), (2, 'u2')")
            .execute(db.pool())
            .await
            .unwrap();
        sqlx::query("INSERT INTO user_devices (user_id, device_id) VALUES (1, ?)")
            .bind(device.id)
            .execute(db.pool())
            .await
            .unwrap();

        let users = db.device_users(device.id).await.unwrap();
        assert_eq!(users, HashSet::from([1]));
        assert!(db.check_device(1, device.id).await.unwrap());
        assert!(!db.check_device(2, device.id).await.unwrap());
    }

    #[tokio::test]
    async fn test_group_store_round_trip() {
        let db = test_database().await;

        let id = db
            .insert_group(&Group {
                id: 0,
                name: "fleet".into(),
                group_id: None,
            })
            .await
            .unwrap();
        db.update_group(&Group {
            id,
            name: "fleet".into(),
            group_id: Some(999),
        })
        .await
        .unwrap();

        let groups = db.fetch_groups().await.unwrap();
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].group_id, Some(999));
    }
}
