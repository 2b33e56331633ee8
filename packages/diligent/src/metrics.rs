//! Server metrics for observability
//!
//! Counters for the switchboard and the HTTP surface, exposed on `/metrics`
//! and summarized on `/health`.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Server-wide metrics
#[derive(Debug, Default)]
pub struct ServerMetrics {
    // Connection metrics
    /// Currently open websocket connections
    pub active_connections: AtomicU64,
    /// Total connections since server start
    pub total_connections: AtomicU64,
    /// Register frames accepted
    pub registrations: AtomicU64,

    // Frame metrics
    /// Deliver frames handed to a recipient's outbound queue
    pub frames_routed: AtomicU64,
    /// Frames dropped because the recipient's queue was full or gone
    pub frames_dropped: AtomicU64,
    /// Inbound frames that failed to parse or arrived before Register
    pub frames_rejected: AtomicU64,

    // Storage metrics
    /// Messages persisted through `POST /api/messages`
    pub messages_stored: AtomicU64,

    // Error metrics
    /// Websocket transport errors
    pub websocket_errors: AtomicU64,

    /// Server start time (for uptime calculation)
    start_time: Option<Instant>,
}

impl ServerMetrics {
    pub fn new() -> Self {
        Self {
            start_time: Some(Instant::now()),
            ..Default::default()
        }
    }

    pub fn connection_opened(&self) {
        self.active_connections.fetch_add(1, Ordering::Relaxed);
        self.total_connections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_closed(&self) {
        self.active_connections.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn registered(&self) {
        self.registrations.fetch_add(1, Ordering::Relaxed);
    }

    pub fn frame_routed(&self) {
        self.frames_routed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn frame_dropped(&self) {
        self.frames_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn frame_rejected(&self) {
        self.frames_rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn message_stored(&self) {
        self.messages_stored.fetch_add(1, Ordering::Relaxed);
    }

    pub fn websocket_error(&self) {
        self.websocket_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Get uptime in seconds
    pub fn uptime_secs(&self) -> u64 {
        self.start_time.map(|t| t.elapsed().as_secs()).unwrap_or(0)
    }

    /// Create a snapshot of all metrics
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            uptime_secs: self.uptime_secs(),
            connections: ConnectionMetrics {
                active: self.active_connections.load(Ordering::Relaxed),
                total: self.total_connections.load(Ordering::Relaxed),
                registrations: self.registrations.load(Ordering::Relaxed),
            },
            frames: FrameMetrics {
                routed: self.frames_routed.load(Ordering::Relaxed),
                dropped: self.frames_dropped.load(Ordering::Relaxed),
                rejected: self.frames_rejected.load(Ordering::Relaxed),
            },
            messages_stored: self.messages_stored.load(Ordering::Relaxed),
            errors: ErrorMetrics {
                websocket: self.websocket_errors.load(Ordering::Relaxed),
            },
        }
    }
}

/// Serializable snapshot of metrics
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub uptime_secs: u64,
    pub connections: ConnectionMetrics,
    pub frames: FrameMetrics,
    pub messages_stored: u64,
    pub errors: ErrorMetrics,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionMetrics {
    pub active: u64,
    pub total: u64,
    pub registrations: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FrameMetrics {
    pub routed: u64,
    pub dropped: u64,
    pub rejected: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorMetrics {
    pub websocket: u64,
}

/// Health check response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthStatus {
    pub status: String,
    /// Identities with a live registered connection
    pub online: u64,
    pub connections: u64,
    pub uptime_secs: u64,
}
