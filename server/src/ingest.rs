//! Line-oriented TCP ingest for tracker devices.
//!
//! This is the reference transport; vendor protocol decoders live outside
//! this repository and talk to the same session core. A device identifies
//! itself once, then streams position reports over the same connection:
//!
//! ```text
//! id,<unique-id>[,<alias>...]
//! pos,<latitude>,<longitude>[,<speed>[,<course>]]
//! ```
//!
//! Each accepted line is acknowledged with `ok`, rejected lines with `rej`.
//! Closing the socket (gracefully or not) tears down every session bound to
//! the connection's endpoint.

use std::net::SocketAddr;
use std::sync::Arc;

use chrono::Utc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

use crate::evaluators::StateEvaluator;
use crate::hub::Hub;
use crate::model::{DeviceStatus, Position};
use crate::session::{ConnectionManager, TrackerChannel};
use crate::storage::{DeviceStore, PositionStore};

const PROTOCOL: &str = "text";

#[derive(Clone)]
pub struct IngestDeps {
    pub manager: Arc<ConnectionManager>,
    pub hub: Arc<Hub>,
    pub devices: Arc<dyn DeviceStore>,
    pub positions: Arc<dyn PositionStore>,
    pub evaluators: Vec<Arc<dyn StateEvaluator>>,
}

/// Bind the ingest listener and start accepting tracker connections in the
/// background.
pub async fn start_ingest_task(port: u16, deps: IngestDeps) -> anyhow::Result<SocketAddr> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    let local_addr = listener.local_addr()?;
    info!(addr = %local_addr, "Ingest listener started");

    tokio::spawn(async move {
        loop {
            match listener.accept().await {
                Ok((stream, remote_addr)) => {
                    debug!(remote = %remote_addr, "Tracker connection accepted");
                    let deps = deps.clone();
                    tokio::spawn(async move {
                        handle_connection(stream, remote_addr, deps).await;
                    });
                }
                Err(e) => {
                    warn!(error = %e, "Failed to accept tracker connection");
                }
            }
        }
    });

    Ok(local_addr)
}

async fn handle_connection(stream: TcpStream, remote_addr: SocketAddr, deps: IngestDeps) {
    let channel = TrackerChannel::new(remote_addr);
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();

    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                warn!(remote = %remote_addr, error = %e, "Tracker read error");
                break;
            }
        };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let accepted = handle_line(line, &channel, &deps).await;
        let ack: &[u8] = if accepted { b"ok\n" } else { b"rej\n" };
        if writer.write_all(ack).await.is_err() {
            break;
        }
    }

    deps.manager.disconnect(&channel).await;
}

/// Process one line; returns whether it was accepted.
async fn handle_line(line: &str, channel: &TrackerChannel, deps: &IngestDeps) -> bool {
    let mut fields = line.split(',');
    match fields.next() {
        Some("id") => {
            let unique_ids: Vec<&str> = fields.map(str::trim).filter(|s| !s.is_empty()).collect();
            if unique_ids.is_empty() {
                return false;
            }
            deps.manager
                .bind(PROTOCOL, channel, &unique_ids)
                .await
                .is_some()
        }
        Some("pos") => handle_position(fields, channel, deps).await,
        _ => {
            debug!(line, "Unrecognized tracker line");
            false
        }
    }
}

async fn handle_position<'a>(
    mut fields: impl Iterator<Item = &'a str>,
    channel: &TrackerChannel,
    deps: &IngestDeps,
) -> bool {
    // Position lines rely on the endpoint being identified already.
    let session = match deps.manager.bind(PROTOCOL, channel, &[]).await {
        Some(session) => session,
        None => {
            warn!(remote = %channel.remote_addr(), "Position from unidentified endpoint");
            return false;
        }
    };

    let latitude: f64 = match fields.next().map(str::parse) {
        Some(Ok(v)) => v,
        _ => return false,
    };
    let longitude: f64 = match fields.next().map(str::parse) {
        Some(Ok(v)) => v,
        _ => return false,
    };
    let speed: f64 = fields.next().and_then(|s| s.parse().ok()).unwrap_or(0.0);
    let course: f64 = fields.next().and_then(|s| s.parse().ok()).unwrap_or(0.0);

    let mut position = Position {
        id: 0,
        device_id: session.device_id,
        fix_time: Utc::now(),
        latitude,
        longitude,
        speed,
        course,
        attributes: serde_json::Value::Null,
    };

    if let Ok(Some(device)) = deps.devices.device_by_id(session.device_id).await {
        for evaluator in &deps.evaluators {
            evaluator.observe(&device, &position);
        }
    }

    match deps.positions.add_position(&position).await {
        Ok(id) => position.id = id,
        Err(e) => {
            warn!(device_id = session.device_id, error = %e, "Failed to store position");
        }
    }

    deps.manager
        .update_status(session.device_id, DeviceStatus::Online, Some(position.fix_time))
        .await;
    deps.hub.update_position(&position).await;

    true
}
