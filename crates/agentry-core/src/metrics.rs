//! Process-wide atomic counters.
//!
//! Counters are bumped at the call site. [`Metrics::flush`] emits the current
//! values as one `tracing::info!` event.

use std::sync::atomic::{AtomicU64, Ordering};

/// Global metrics singleton.
pub static METRICS: Metrics = Metrics::new();

/// Lock-free counters.
pub struct Metrics {
    agent_invocations: AtomicU64,
    function_executions: AtomicU64,
    fallbacks: AtomicU64,
    depth_rejections: AtomicU64,
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Point-in-time copy of every counter.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct MetricsSnapshot {
    pub agent_invocations: u64,
    pub function_executions: u64,
    pub fallbacks: u64,
    pub depth_rejections: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
}

impl Metrics {
    pub const fn new() -> Self {
        Self {
            agent_invocations: AtomicU64::new(0),
            function_executions: AtomicU64::new(0),
            fallbacks: AtomicU64::new(0),
            depth_rejections: AtomicU64::new(0),
            cache_hits: AtomicU64::new(0),
            cache_misses: AtomicU64::new(0),
        }
    }

    fn bump(counter: &AtomicU64, name: &'static str) {
        counter.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = name, "counter incremented");
    }

    pub fn inc_agent_invocations(&self) {
        Self::bump(&self.agent_invocations, "agent_invocations");
    }

    pub fn inc_function_executions(&self) {
        Self::bump(&self.function_executions, "function_executions");
    }

    pub fn inc_fallbacks(&self) {
        Self::bump(&self.fallbacks, "fallbacks");
    }

    pub fn inc_depth_rejections(&self) {
        Self::bump(&self.depth_rejections, "depth_rejections");
    }

    pub fn inc_cache_hits(&self) {
        Self::bump(&self.cache_hits, "cache_hits");
    }

    pub fn inc_cache_misses(&self) {
        Self::bump(&self.cache_misses, "cache_misses");
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            agent_invocations: self.agent_invocations.load(Ordering::Relaxed),
            function_executions: self.function_executions.load(Ordering::Relaxed),
            fallbacks: self.fallbacks.load(Ordering::Relaxed),
            depth_rejections: self.depth_rejections.load(Ordering::Relaxed),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            cache_misses: self.cache_misses.load(Ordering::Relaxed),
        }
    }

    /// Emit all current counter values as a single `info!` event.
    ///
    /// Call at natural boundaries (end of a CLI command, shutdown) rather
    /// than on every increment.
    pub fn flush(&self) {
        let s = self.snapshot();
        tracing::info!(
            metric = "flush",
            agent_invocations = s.agent_invocations,
            function_executions = s.function_executions,
            fallbacks = s.fallbacks,
            depth_rejections = s.depth_rejections,
            cache_hits = s.cache_hits,
            cache_misses = s.cache_misses,
        );
    }

    /// Reset all counters to zero (useful in tests).
    pub fn reset(&self) {
        for counter in [
            &self.agent_invocations,
            &self.function_executions,
            &self.fallbacks,
            &self.depth_rejections,
            &self.cache_hits,
            &self.cache_misses,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_increment() {
        let m = Metrics::new();
        m.inc_agent_invocations();
        m.inc_agent_invocations();
        m.inc_cache_hits();
        m.inc_depth_rejections();

        let s = m.snapshot();
        assert_eq!(s.agent_invocations, 2);
        assert_eq!(s.cache_hits, 1);
        assert_eq!(s.depth_rejections, 1);
        assert_eq!(s.fallbacks, 0);
    }

    #[test]
    fn reset_zeroes_all() {
        let m = Metrics::new();
        m.inc_function_executions();
        m.inc_fallbacks();
        m.inc_cache_misses();
        m.reset();
        assert_eq!(m.snapshot(), MetricsSnapshot::default());
    }
}
