//! Observability and Metrics
//!
//! Atomic traffic and failure counters for servers, pools and bridge nodes.
//!
//! A [`Metrics`] instance is constructed by whoever owns the component and
//! handed down as `Arc<Metrics>`; several components may share one instance
//! or keep their own. Dropped, unhandled and failed frames are counted here so
//! callers can observe local recoveries that never surface as errors.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tracing::{debug, info};

/// Metrics collector for framing, dispatch and bridge operations
#[derive(Debug)]
pub struct Metrics {
    /// Total connections established
    pub connections_total: AtomicU64,
    /// Currently active connections
    pub connections_active: AtomicU64,
    /// Connections refused at accept time
    pub connections_rejected: AtomicU64,
    /// Complete frames decoded from sockets
    pub frames_received: AtomicU64,
    /// Frames written to sockets
    pub frames_sent: AtomicU64,
    /// Total bytes read from sockets
    pub bytes_received: AtomicU64,
    /// Total bytes written to sockets
    pub bytes_sent: AtomicU64,
    /// Frames handed to a registered handler
    pub frames_dispatched: AtomicU64,
    /// Frames dropped because no handler matched their type id
    pub frames_unhandled: AtomicU64,
    /// Frames dropped because their payload did not deserialize
    pub deserialize_failures: AtomicU64,
    /// Handler invocations that returned an error or panicked
    pub handler_failures: AtomicU64,
    /// Connections torn down on a framing violation
    pub framing_errors: AtomicU64,
    /// Connections torn down on a socket failure
    pub transport_errors: AtomicU64,
    /// Bridge requests issued
    pub requests_sent: AtomicU64,
    /// Bridge responses matched to a pending request
    pub responses_matched: AtomicU64,
    /// Bridge responses with no pending request (late or duplicate)
    pub responses_discarded: AtomicU64,
    /// Bridge requests completed by the timeout sweep
    pub request_timeouts: AtomicU64,
    /// Bridge requests answered with a no-handler error
    pub no_handler_replies: AtomicU64,
    /// Start time for uptime calculation
    start_time: Instant,
}

impl Metrics {
    /// Create a new metrics collector
    pub fn new() -> Self {
        Self {
            connections_total: AtomicU64::new(0),
            connections_active: AtomicU64::new(0),
            connections_rejected: AtomicU64::new(0),
            frames_received: AtomicU64::new(0),
            frames_sent: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
            frames_dispatched: AtomicU64::new(0),
            frames_unhandled: AtomicU64::new(0),
            deserialize_failures: AtomicU64::new(0),
            handler_failures: AtomicU64::new(0),
            framing_errors: AtomicU64::new(0),
            transport_errors: AtomicU64::new(0),
            requests_sent: AtomicU64::new(0),
            responses_matched: AtomicU64::new(0),
            responses_discarded: AtomicU64::new(0),
            request_timeouts: AtomicU64::new(0),
            no_handler_replies: AtomicU64::new(0),
            start_time: Instant::now(),
        }
    }

    /// Record a new connection
    pub fn connection_established(&self) {
        self.connections_total.fetch_add(1, Ordering::Relaxed);
        self.connections_active.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a connection closed
    pub fn connection_closed(&self) {
        // Saturating: a connection that was never counted must not wrap the gauge
        let _ = self
            .connections_active
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| {
                Some(v.saturating_sub(1))
            });
    }

    /// Record a connection refused at accept time
    pub fn connection_rejected(&self) {
        self.connections_rejected.fetch_add(1, Ordering::Relaxed);
    }

    /// Record raw bytes read from a socket
    pub fn bytes_read(&self, byte_count: u64) {
        self.bytes_received.fetch_add(byte_count, Ordering::Relaxed);
    }

    /// Record a complete frame decoded
    pub fn frame_received(&self) {
        self.frames_received.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a frame written
    pub fn frame_sent(&self, byte_count: u64) {
        self.frames_sent.fetch_add(1, Ordering::Relaxed);
        self.bytes_sent.fetch_add(byte_count, Ordering::Relaxed);
    }

    /// Record a frame delivered to a handler
    pub fn frame_dispatched(&self) {
        self.frames_dispatched.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a frame with no matching handler
    pub fn frame_unhandled(&self) {
        self.frames_unhandled.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a payload that failed to deserialize
    pub fn deserialize_failure(&self) {
        self.deserialize_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a handler that failed or panicked
    pub fn handler_failure(&self) {
        self.handler_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a framing violation
    pub fn framing_error(&self) {
        self.framing_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a socket failure
    pub fn transport_error(&self) {
        self.transport_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a bridge request issued
    pub fn request_sent(&self) {
        self.requests_sent.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a bridge response matched to its request
    pub fn response_matched(&self) {
        self.responses_matched.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a bridge response with no pending request
    pub fn response_discarded(&self) {
        self.responses_discarded.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a bridge request that expired
    pub fn request_timeout(&self) {
        self.request_timeouts.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a bridge request answered with no-handler
    pub fn no_handler_reply(&self) {
        self.no_handler_replies.fetch_add(1, Ordering::Relaxed);
    }

    /// Get current metrics snapshot
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            connections_total: self.connections_total.load(Ordering::Relaxed),
            connections_active: self.connections_active.load(Ordering::Relaxed),
            connections_rejected: self.connections_rejected.load(Ordering::Relaxed),
            frames_received: self.frames_received.load(Ordering::Relaxed),
            frames_sent: self.frames_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            frames_dispatched: self.frames_dispatched.load(Ordering::Relaxed),
            frames_unhandled: self.frames_unhandled.load(Ordering::Relaxed),
            deserialize_failures: self.deserialize_failures.load(Ordering::Relaxed),
            handler_failures: self.handler_failures.load(Ordering::Relaxed),
            framing_errors: self.framing_errors.load(Ordering::Relaxed),
            transport_errors: self.transport_errors.load(Ordering::Relaxed),
            requests_sent: self.requests_sent.load(Ordering::Relaxed),
            responses_matched: self.responses_matched.load(Ordering::Relaxed),
            responses_discarded: self.responses_discarded.load(Ordering::Relaxed),
            request_timeouts: self.request_timeouts.load(Ordering::Relaxed),
            no_handler_replies: self.no_handler_replies.load(Ordering::Relaxed),
            uptime_seconds: self.start_time.elapsed().as_secs(),
        }
    }

    /// Log current metrics
    pub fn log_metrics(&self) {
        let snapshot = self.snapshot();
        info!(
            connections_total = snapshot.connections_total,
            connections_active = snapshot.connections_active,
            connections_rejected = snapshot.connections_rejected,
            frames_received = snapshot.frames_received,
            frames_sent = snapshot.frames_sent,
            bytes_received = snapshot.bytes_received,
            bytes_sent = snapshot.bytes_sent,
            frames_dispatched = snapshot.frames_dispatched,
            frames_unhandled = snapshot.frames_unhandled,
            deserialize_failures = snapshot.deserialize_failures,
            handler_failures = snapshot.handler_failures,
            framing_errors = snapshot.framing_errors,
            transport_errors = snapshot.transport_errors,
            requests_sent = snapshot.requests_sent,
            responses_matched = snapshot.responses_matched,
            responses_discarded = snapshot.responses_discarded,
            request_timeouts = snapshot.request_timeouts,
            no_handler_replies = snapshot.no_handler_replies,
            uptime_seconds = snapshot.uptime_seconds,
            "Metrics snapshot"
        );
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Snapshot of metrics at a point in time
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub connections_total: u64,
    pub connections_active: u64,
    pub connections_rejected: u64,
    pub frames_received: u64,
    pub frames_sent: u64,
    pub bytes_received: u64,
    pub bytes_sent: u64,
    pub frames_dispatched: u64,
    pub frames_unhandled: u64,
    pub deserialize_failures: u64,
    pub handler_failures: u64,
    pub framing_errors: u64,
    pub transport_errors: u64,
    pub requests_sent: u64,
    pub responses_matched: u64,
    pub responses_discarded: u64,
    pub request_timeouts: u64,
    pub no_handler_replies: u64,
    pub uptime_seconds: u64,
}

/// Timer for measuring operation duration
pub struct Timer {
    start: Instant,
    operation: &'static str,
}

impl Timer {
    /// Start timing an operation
    pub fn start(operation: &'static str) -> Self {
        Self {
            start: Instant::now(),
            operation,
        }
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        let duration = self.start.elapsed();
        debug!(
            operation = self.operation,
            duration_ms = duration.as_millis() as u64,
            "Operation completed"
        );
    }
}
