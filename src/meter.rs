//! Per-session byte accounting and the metered copy pump.
//!
//! A session's two copy directions share one `UsageMeter`. The pump checks
//! the limit before pulling the next chunk, so a chunk already read is always
//! delivered; overshoot is bounded by one chunk and usage is never
//! undercounted.

use std::sync::atomic::{AtomicU64, Ordering};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::GatewayError;

/// Copy buffer size; also the permitted quota overshoot bound.
pub const COPY_CHUNK: usize = 32 * 1024;

/// Which way bytes are flowing, from the gateway's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Client to upstream.
    Up,
    /// Upstream to client.
    Down,
}

/// Thread-safe usage counter for one session.
///
/// `base` is the account's stored `traffic_used` at session start; the meter
/// is authoritative for the remainder of the session. Deltas are handed to
/// the store through `take_unflushed`.
#[derive(Debug)]
pub struct UsageMeter {
    base: u64,
    limit: u64,
    bytes_up: AtomicU64,
    bytes_down: AtomicU64,
    flushed: AtomicU64,
}

impl UsageMeter {
    /// `limit` of 0 means unlimited.
    pub fn new(base: u64, limit: u64) -> Self {
        Self {
            base,
            limit,
            bytes_up: AtomicU64::new(0),
            bytes_down: AtomicU64::new(0),
            flushed: AtomicU64::new(0),
        }
    }

    pub fn record(&self, direction: Direction, n: u64) {
        match direction {
            Direction::Up => self.bytes_up.fetch_add(n, Ordering::Relaxed),
            Direction::Down => self.bytes_down.fetch_add(n, Ordering::Relaxed),
        };
    }

    pub fn bytes_up(&self) -> u64 {
        self.bytes_up.load(Ordering::Relaxed)
    }

    pub fn bytes_down(&self) -> u64 {
        self.bytes_down.load(Ordering::Relaxed)
    }

    /// Total bytes transferred this session, both directions.
    pub fn total(&self) -> u64 {
        self.bytes_up() + self.bytes_down()
    }

    /// Whether the account's limit has been reached.
    pub fn exhausted(&self) -> bool {
        self.limit > 0 && self.base.saturating_add(self.total()) >= self.limit
    }

    /// Bytes transferred since the last call; what the flusher writes out.
    ///
    /// Both flush paths (periodic and final) may race; the swap makes each
    /// byte claimed by exactly one caller.
    pub fn take_unflushed(&self) -> u64 {
        let total = self.total();
        let prev = self.flushed.swap(total, Ordering::AcqRel);
        total.saturating_sub(prev)
    }
}

/// Copy `reader` to `writer` through the meter until EOF, error, or quota
/// exhaustion. Returns bytes copied; exhaustion surfaces as `QuotaExhausted`
/// after the in-flight chunk has been delivered and recorded.
pub async fn pump<R, W>(
    mut reader: R,
    mut writer: W,
    meter: &UsageMeter,
    direction: Direction,
) -> Result<u64, GatewayError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; COPY_CHUNK];
    let mut copied: u64 = 0;

    loop {
        if meter.exhausted() {
            return Err(GatewayError::QuotaExhausted);
        }

        let n = reader.read(&mut buf).await?;
        if n == 0 {
            let _ = writer.shutdown().await;
            return Ok(copied);
        }

        writer.write_all(&buf[..n]).await?;
        meter.record(direction, n as u64);
        copied += n as u64;
    }
}
