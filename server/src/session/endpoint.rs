use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};

/// Monotonic id assigned to each accepted transport channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChannelId(u64);

static NEXT_CHANNEL_ID: AtomicU64 = AtomicU64::new(1);

/// Opaque handle to a live transport channel.
///
/// The session core never performs I/O through the handle; it only relies on
/// identity (equality and hashing) and the remote address. The transport
/// layer that accepted the connection owns the actual socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TrackerChannel {
    id: ChannelId,
    remote_addr: SocketAddr,
}

impl TrackerChannel {
    /// Allocate a handle for a freshly accepted connection.
    pub fn new(remote_addr: SocketAddr) -> Self {
        Self {
            id: ChannelId(NEXT_CHANNEL_ID.fetch_add(1, Ordering::Relaxed)),
            remote_addr,
        }
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    /// The endpoint key this channel contributes to the session table.
    pub fn endpoint(&self) -> Endpoint {
        Endpoint {
            channel: self.id,
            remote_addr: self.remote_addr,
        }
    }
}

/// Transport-layer identity of a connection: (channel, remote address).
/// Two endpoints are equal iff both components are equal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Endpoint {
    channel: ChannelId,
    remote_addr: SocketAddr,
}

impl Endpoint {
    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "chan-{}@{}", self.channel.0, self.remote_addr)
    }
}
