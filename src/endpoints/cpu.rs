//! `cpu` endpoint: processor counts and architecture.
//!
//! Counts come from `sysconf(3)` and are re-read on every refresh, since
//! CPUs can be brought online or offline while the server runs.

use super::Producer;
use chrono::Utc;
use serde_json::{json, Map, Value};
use std::time::Duration;

/// Default refresh period.
pub const DEFAULT_REFRESH: Duration = Duration::from_secs(10);

const UNKNOWN_MODEL: &str = "unknown";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cpu {
    pub num_configured: i64,
    pub num_online: i64,
    /// Not portably discoverable; always 0.
    pub clock_speed: u64,
    pub word_size: u32,
    pub architecture: &'static str,
    pub model: &'static str,
    /// Unix timestamp of the last refresh.
    pub updated_at: i64,
    refresh_every: Duration,
}

fn sysconf(name: libc::c_int) -> i64 {
    // SAFETY: sysconf has no memory-safety preconditions.
    let value = unsafe { libc::sysconf(name) };
    value.max(0) as i64
}

impl Cpu {
    pub fn new() -> Self {
        Self::with_refresh(DEFAULT_REFRESH)
    }

    pub fn with_refresh(refresh_every: Duration) -> Self {
        let mut cpu = Self {
            num_configured: 0,
            num_online: 0,
            clock_speed: 0,
            word_size: usize::BITS,
            architecture: std::env::consts::ARCH,
            model: UNKNOWN_MODEL,
            updated_at: 0,
            refresh_every,
        };
        cpu.sample();
        cpu
    }

    fn sample(&mut self) {
        self.num_configured = sysconf(libc::_SC_NPROCESSORS_CONF);
        self.num_online = sysconf(libc::_SC_NPROCESSORS_ONLN);
        self.updated_at = Utc::now().timestamp();
    }
}

impl Default for Cpu {
    fn default() -> Self {
        Self::new()
    }
}

impl Producer for Cpu {
    fn name(&self) -> &'static str {
        "cpu"
    }

    fn emit(&self, out: &mut Map<String, Value>) {
        out.insert("numConfigured".into(), json!(self.num_configured));
        out.insert("numOnline".into(), json!(self.num_online));
        out.insert("clockSpeed".into(), json!(self.clock_speed));
        out.insert("wordSize".into(), json!(self.word_size));
        out.insert("architecture".into(), json!(self.architecture));
        out.insert("model".into(), json!(self.model));
        out.insert("updatedAt".into(), json!(self.updated_at));
    }

    fn refresh(&mut self) {
        self.sample();
    }

    fn refresh_interval(&self) -> Option<Duration> {
        Some(self.refresh_every)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counts_are_positive() {
        let cpu = Cpu::new();
        assert!(cpu.num_configured >= 1);
        assert!(cpu.num_online >= 1);
        assert_eq!(cpu.word_size, usize::BITS);
    }

    #[test]
    fn test_refresh_updates_timestamp() {
        let mut cpu = Cpu::new();
        cpu.updated_at = 0;
        cpu.refresh();
        assert!(cpu.updated_at > 0);
    }

    #[test]
    fn test_emit_keys() {
        let mut out = Map::new();
        Cpu::with_refresh(Duration::from_secs(1)).emit(&mut out);
        assert_eq!(out["model"], "unknown");
        assert_eq!(out["clockSpeed"], 0);
        assert_eq!(out.len(), 7);
    }
}
