//! Server Configuration
//!
//! Every setting is a command-line flag that can also be supplied through
//! an environment variable prefixed with `SYSMON_`.
//!
//! ```bash
//! sysmon --port 8080 --backend poll --read-timeout 30
//! SYSMON_PORT=8080 SYSMON_LOG_LEVEL=debug sysmon
//! ```

use crate::error::ServerError;
use crate::poller::BackendKind;
use clap::Parser;
use std::time::Duration;

/// Descriptors kept back from the connection pool for the listener, logs
/// and anything else the process opens.
pub const SPARE_FDS: usize = 10;

/// Pool size used when `--max-connections` is not given and the descriptor
/// limit is larger.
pub const DEFAULT_MAX_CONNECTIONS: usize = 8192;

/// Runtime configuration of the server.
#[derive(Debug, Clone, Parser)]
#[command(name = "sysmon")]
#[command(about = "Serves host information as JSON over HTTP")]
#[command(version)]
pub struct Config {
    /// Address to bind to
    #[arg(long, default_value = crate::DEFAULT_HOST, env = "SYSMON_HOST")]
    pub host: String,

    /// Port to listen on
    #[arg(short, long, default_value_t = crate::DEFAULT_PORT, env = "SYSMON_PORT")]
    pub port: u16,

    /// Listen backlog
    #[arg(long, default_value_t = 1024, env = "SYSMON_BACKLOG")]
    pub backlog: u32,

    /// Readiness backend
    #[arg(long, value_enum, default_value_t = BackendKind::platform_default(), env = "SYSMON_BACKEND")]
    pub backend: BackendKind,

    /// Connection pool size (default: descriptor limit minus spares, at most 8192)
    #[arg(long = "max-connections", env = "SYSMON_MAX_CONNECTIONS")]
    pub max_connections: Option<usize>,

    // === Timeouts ===
    /// Seconds a connection may sit idle while reading its request
    #[arg(long = "read-timeout", default_value_t = 60, env = "SYSMON_READ_TIMEOUT")]
    pub read_timeout_secs: u64,

    /// Seconds a connection may sit idle while sending its response
    #[arg(long = "send-timeout", default_value_t = 300, env = "SYSMON_SEND_TIMEOUT")]
    pub send_timeout_secs: u64,

    /// Milliseconds between idle sweeps
    #[arg(long = "sweep-interval", default_value_t = 5000, env = "SYSMON_SWEEP_INTERVAL")]
    pub sweep_interval_ms: u64,

    /// Milliseconds to keep draining input after the response is sent
    #[arg(long = "linger", default_value_t = 500, env = "SYSMON_LINGER")]
    pub linger_ms: u64,

    /// Milliseconds added to a connection's write backoff per blocked write
    #[arg(long = "wouldblock-delay", default_value_t = 100, env = "SYSMON_WOULDBLOCK_DELAY")]
    pub wouldblock_delay_ms: u64,

    // === Maintenance ===
    /// Seconds between cpu endpoint refreshes
    #[arg(long = "cpu-refresh", default_value_t = 10, env = "SYSMON_CPU_REFRESH")]
    pub cpu_refresh_secs: u64,

    /// Seconds between statistics log lines (0 disables)
    #[arg(long = "stats-interval", default_value_t = 3600, env = "SYSMON_STATS_INTERVAL")]
    pub stats_interval_secs: u64,

    /// Default log filter, overridden by RUST_LOG
    #[arg(long = "log-level", default_value = "info", env = "SYSMON_LOG_LEVEL")]
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: crate::DEFAULT_HOST.to_string(),
            port: crate::DEFAULT_PORT,
            backlog: 1024,
            backend: BackendKind::platform_default(),
            max_connections: None,
            read_timeout_secs: 60,
            send_timeout_secs: 300,
            sweep_interval_ms: 5000,
            linger_ms: 500,
            wouldblock_delay_ms: 100,
            cpu_refresh_secs: 10,
            stats_interval_secs: 3600,
            log_level: "info".to_string(),
        }
    }
}

impl Config {
    /// Parses the process arguments.
    pub fn from_args() -> Self {
        Config::parse()
    }

    /// `host:port` for binding.
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout_secs)
    }

    pub fn send_timeout(&self) -> Duration {
        Duration::from_secs(self.send_timeout_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }

    pub fn linger(&self) -> Duration {
        Duration::from_millis(self.linger_ms)
    }

    pub fn wouldblock_delay(&self) -> Duration {
        Duration::from_millis(self.wouldblock_delay_ms)
    }

    pub fn cpu_refresh(&self) -> Duration {
        Duration::from_secs(self.cpu_refresh_secs)
    }

    /// `None` when periodic statistics are disabled.
    pub fn stats_interval(&self) -> Option<Duration> {
        (self.stats_interval_secs > 0).then(|| Duration::from_secs(self.stats_interval_secs))
    }

    /// Pool capacity for a multiplexer that can track `descriptors` fds.
    pub fn pool_capacity(&self, descriptors: usize) -> usize {
        let available = descriptors.saturating_sub(SPARE_FDS);
        match self.max_connections {
            Some(max) => max.min(available),
            None => available.min(DEFAULT_MAX_CONNECTIONS),
        }
    }

    /// Checks values the server cannot run with. Port 0 is refused here
    /// because it only makes sense for tests binding an ephemeral port.
    pub fn validate(&self) -> Result<(), ServerError> {
        let fail = |msg: &str| Err(ServerError::Config(msg.to_string()));

        if self.port == 0 {
            return fail("port must be between 1 and 65535");
        }
        if self.backlog == 0 {
            return fail("backlog must be >= 1");
        }
        if self.max_connections == Some(0) {
            return fail("max-connections must be >= 1");
        }
        if self.read_timeout_secs == 0 || self.send_timeout_secs == 0 {
            return fail("timeouts must be >= 1 second");
        }
        if self.send_timeout_secs <= self.read_timeout_secs {
            return fail("send-timeout must be longer than read-timeout");
        }
        if self.sweep_interval_ms == 0 {
            return fail("sweep-interval must be >= 1 ms");
        }
        if self.wouldblock_delay_ms == 0 {
            return fail("wouldblock-delay must be >= 1 ms");
        }
        if self.cpu_refresh_secs == 0 {
            return fail("cpu-refresh must be >= 1 second");
        }
        Ok(())
    }
}
