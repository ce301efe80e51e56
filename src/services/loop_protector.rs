//! Windowed emission guard against runaway event storms.
//!
//! Every emit site consults the protector before an event reaches the
//! queue. The guard keeps a rolling buffer of recent emissions; exceeding
//! the hard count inside the window kills the emit, while rate and
//! pattern anomalies only warn.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::warn;

use crate::domain::errors::{RuntimeError, RuntimeResult};

/// Configuration for loop protection.
#[derive(Debug, Clone)]
pub struct LoopProtectorConfig {
    pub enabled: bool,
    /// Hard cap on emissions inside the window.
    pub max_event_count: usize,
    /// Soft cap on emissions per second; exceeding it warns but proceeds.
    pub max_event_rate: f64,
    /// Rolling window length in milliseconds.
    pub window_ms: u64,
}

impl Default for LoopProtectorConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_event_count: 100,
            max_event_rate: 50.0,
            window_ms: 5_000,
        }
    }
}

/// How many trailing emissions the same-type dominance check inspects.
const DOMINANCE_SAMPLE: usize = 20;
/// Fraction of identical types within the sample that triggers a warning.
const DOMINANCE_RATIO: f64 = 0.7;
/// How many trailing emissions the alternation check inspects.
const ALTERNATION_SAMPLE: usize = 6;

/// Counters exposed for status surfaces and tests.
#[derive(Debug, Clone, Default, Serialize)]
pub struct LoopProtectorStats {
    pub window_len: usize,
    pub total_admitted: u64,
    pub total_rejected: u64,
    pub rate_warnings: u64,
    pub pattern_warnings: u64,
}

/// Rolling-window emission guard.
pub struct LoopProtector {
    config: LoopProtectorConfig,
    buffer: VecDeque<(Instant, String)>,
    stats: LoopProtectorStats,
}

impl LoopProtector {
    pub fn new(config: LoopProtectorConfig) -> Self {
        Self {
            config,
            buffer: VecDeque::new(),
            stats: LoopProtectorStats::default(),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(LoopProtectorConfig::default())
    }

    /// Admit or reject one emission of `event_type`.
    pub fn admit(&mut self, event_type: &str) -> RuntimeResult<()> {
        if !self.config.enabled {
            self.stats.total_admitted += 1;
            return Ok(());
        }
        self.admit_at(event_type, Instant::now())
    }

    /// Clock-injected admission, used directly by tests.
    pub fn admit_at(&mut self, event_type: &str, now: Instant) -> RuntimeResult<()> {
        let window = Duration::from_millis(self.config.window_ms);
        while let Some((ts, _)) = self.buffer.front() {
            if now.duration_since(*ts) > window {
                self.buffer.pop_front();
            } else {
                break;
            }
        }

        self.buffer.push_back((now, event_type.to_string()));

        if self.buffer.len() > self.config.max_event_count {
            self.stats.total_rejected += 1;
            return Err(RuntimeError::LoopDetected {
                emitted: self.buffer.len(),
                max: self.config.max_event_count,
                window_ms: self.config.window_ms,
            });
        }

        let window_secs = (self.config.window_ms as f64 / 1_000.0).max(f64::EPSILON);
        let rate = self.buffer.len() as f64 / window_secs;
        if rate > self.config.max_event_rate {
            self.stats.rate_warnings += 1;
            warn!(
                event_type,
                rate,
                max_rate = self.config.max_event_rate,
                "event emission rate above threshold"
            );
        }

        self.check_patterns(event_type);
        self.stats.total_admitted += 1;
        Ok(())
    }

    /// Warn on same-type dominance and strict A-B alternation.
    fn check_patterns(&mut self, event_type: &str) {
        let len = self.buffer.len();
        if len >= DOMINANCE_SAMPLE {
            let tail = self.buffer.iter().rev().take(DOMINANCE_SAMPLE);
            let same = tail.filter(|(_, t)| t == event_type).count();
            if same as f64 / DOMINANCE_SAMPLE as f64 >= DOMINANCE_RATIO {
                self.stats.pattern_warnings += 1;
                warn!(
                    event_type,
                    same,
                    sample = DOMINANCE_SAMPLE,
                    "same-type events dominate recent emissions"
                );
                return;
            }
        }

        if len >= ALTERNATION_SAMPLE {
            let tail: Vec<&str> = self
                .buffer
                .iter()
                .rev()
                .take(ALTERNATION_SAMPLE)
                .map(|(_, t)| t.as_str())
                .collect();
            let a = tail[0];
            let b = tail[1];
            if a != b
                && tail
                    .iter()
                    .enumerate()
                    .all(|(i, t)| *t == if i % 2 == 0 { a } else { b })
            {
                self.stats.pattern_warnings += 1;
                warn!(type_a = a, type_b = b, "strict A-B alternation in recent emissions");
            }
        }
    }

    pub fn stats(&self) -> LoopProtectorStats {
        LoopProtectorStats {
            window_len: self.buffer.len(),
            ..self.stats.clone()
        }
    }

    /// Drop the rolling buffer, e.g. after a resume.
    pub fn reset(&mut self) {
        self.buffer.clear();
    }
}
