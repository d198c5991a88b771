//! Resource accounting for one sandboxed run: memory footprint and wall-clock deadline.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::Value;

use super::error::{SandboxError, SandboxResult};

/// Longest single sleep slice; bounds how late a deadline or cancel is noticed.
const SLEEP_SLICE: Duration = Duration::from_millis(10);

/// Approximate heap footprint of a value, in bytes.
pub fn estimate_size(value: &Value) -> usize {
    match value {
        Value::Null | Value::Bool(_) => 8,
        Value::Number(_) => 16,
        Value::String(s) => 24 + s.len(),
        Value::Array(items) => 24 + items.iter().map(estimate_size).sum::<usize>(),
        Value::Object(map) => {
            32 + map
                .iter()
                .map(|(k, v)| k.len() + 24 + estimate_size(v))
                .sum::<usize>()
        }
    }
}

/// Limits and live counters for one run. Owned by the interpreter.
#[derive(Debug)]
pub struct Budget {
    limit_bytes: usize,
    live_bytes: usize,
    limit_ms: u64,
    deadline: Instant,
    cancel: Arc<AtomicBool>,
}

impl Budget {
    pub fn new(memory_limit_mb: u64, timeout: Duration, cancel: Arc<AtomicBool>) -> Self {
        Self {
            limit_bytes: (memory_limit_mb as usize).saturating_mul(1024 * 1024),
            live_bytes: 0,
            limit_ms: timeout.as_millis() as u64,
            deadline: Instant::now() + timeout,
            cancel,
        }
    }

    pub fn live_bytes(&self) -> usize {
        self.live_bytes
    }

    /// Fails if `extra` more bytes would not fit beside the live footprint.
    pub fn reserve(&self, extra: usize) -> SandboxResult<()> {
        let needed = self.live_bytes.saturating_add(extra);
        if needed > self.limit_bytes {
            return Err(SandboxError::MemoryLimit {
                used_bytes: needed,
                limit_bytes: self.limit_bytes,
            });
        }
        Ok(())
    }

    /// Replaces `old` bytes of live footprint with `new` bytes, checking the limit.
    pub fn account(&mut self, old: usize, new: usize) -> SandboxResult<()> {
        if new > old {
            self.reserve(new - old)?;
        }
        self.live_bytes = self.live_bytes.saturating_sub(old).saturating_add(new);
        Ok(())
    }

    pub fn release(&mut self, bytes: usize) {
        self.live_bytes = self.live_bytes.saturating_sub(bytes);
    }

    /// Checked on every statement and loop iteration.
    pub fn tick(&self) -> SandboxResult<()> {
        if self.cancel.load(Ordering::Relaxed) || Instant::now() >= self.deadline {
            return Err(self.timeout());
        }
        Ok(())
    }

    /// Blocks the current thread, waking early on deadline or cancellation.
    pub fn sleep(&self, duration: Duration) -> SandboxResult<()> {
        let wake = Instant::now() + duration;
        loop {
            self.tick()?;
            let now = Instant::now();
            if now >= wake {
                return Ok(());
            }
            let slice = (wake - now)
                .min(SLEEP_SLICE)
                .min(self.deadline.saturating_duration_since(now));
            std::thread::sleep(slice);
        }
    }

    pub fn timeout(&self) -> SandboxError {
        SandboxError::Timeout {
            limit_ms: self.limit_ms,
        }
    }
}
