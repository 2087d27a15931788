//! Runtime configuration, loaded from the environment the way the donor
//! service does it: `.env` via `dotenvy`, then `env::var` with defaults for
//! everything tunable.

use std::env;
use std::time::Duration;

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

/// Process manager + scheduling tunables.
#[derive(Debug, Clone)]
pub struct ProcessConfig {
    pub max_concurrent: usize,
    pub max_processes: u64,
    pub mailbox_cap: usize,
    pub reap_delay: Duration,
    pub shutdown_grace: Duration,
}

impl Default for ProcessConfig {
    fn default() -> Self {
        Self {
            max_concurrent: env_or("AETHER_MAX_CONCURRENT", 8),
            max_processes: env_or("AETHER_MAX_PROCESSES", 10_000u64),
            mailbox_cap: env_or("AETHER_MAILBOX_CAP", 256),
            reap_delay: Duration::from_millis(env_or("AETHER_REAP_DELAY_MS", 1500)),
            shutdown_grace: Duration::from_millis(env_or("AETHER_SHUTDOWN_GRACE_MS", 3000)),
        }
    }
}

/// Resource governor default quotas.
#[derive(Debug, Clone, Copy)]
pub struct QuotaDefaults {
    pub max_tokens_per_session: u64,
    pub max_tokens_per_day: u64,
    pub max_steps: u64,
    pub max_wall_clock_ms: u64,
    pub runaway_overshoot_pct: f64,
}

impl Default for QuotaDefaults {
    fn default() -> Self {
        Self {
            max_tokens_per_session: env_or("AETHER_QUOTA_TOKENS_SESSION", 500_000u64),
            max_tokens_per_day: env_or("AETHER_QUOTA_TOKENS_DAY", 2_000_000u64),
            max_steps: env_or("AETHER_QUOTA_STEPS", 200u64),
            max_wall_clock_ms: env_or("AETHER_QUOTA_WALL_CLOCK_MS", 3_600_000u64),
            runaway_overshoot_pct: 0.20,
        }
    }
}

/// Subprocess supervisor tunables.
#[derive(Debug, Clone)]
pub struct SubprocessConfig {
    pub max_buffer_chars: usize,
}

impl Default for SubprocessConfig {
    fn default() -> Self {
        Self {
            max_buffer_chars: env_or("AETHER_SUBPROCESS_BUFFER_CHARS", 100_000),
        }
    }
}

/// Cron + trigger scheduler tunables.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub tick_interval: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs(env_or("AETHER_CRON_TICK_SECS", 30)),
        }
    }
}

/// Webhook delivery retry/backoff policy.
#[derive(Debug, Clone)]
pub struct WebhookConfig {
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub default_timeout: Duration,
    pub log_body_truncate: usize,
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(env_or("AETHER_WEBHOOK_BASE_DELAY_MS", 1000)),
            max_delay: Duration::from_millis(env_or("AETHER_WEBHOOK_MAX_DELAY_MS", 16_000)),
            default_timeout: Duration::from_millis(env_or("AETHER_WEBHOOK_TIMEOUT_MS", 10_000)),
            log_body_truncate: 4096,
        }
    }
}

/// VFS tunables.
#[derive(Debug, Clone)]
pub struct VfsConfig {
    pub real_root: std::path::PathBuf,
}

impl Default for VfsConfig {
    fn default() -> Self {
        Self {
            real_root: env::var("AETHER_VFS_ROOT")
                .map(std::path::PathBuf::from)
                .unwrap_or_else(|_| std::env::temp_dir().join("aether-vfs")),
        }
    }
}

/// WebSocket fan-out tunables.
#[derive(Debug, Clone, Copy)]
pub struct WsFanoutConfig {
    pub batch_max_size: usize,
    pub max_queued_events: usize,
    pub max_buffer_bytes: usize,
    pub flush_interval: Duration,
}

impl Default for WsFanoutConfig {
    fn default() -> Self {
        Self {
            batch_max_size: env_or("AETHER_WS_BATCH_MAX", 20),
            max_queued_events: env_or("AETHER_WS_MAX_QUEUED", 500),
            max_buffer_bytes: env_or("AETHER_WS_MAX_BUFFER_BYTES", 1_000_000),
            flush_interval: Duration::from_millis(env_or("AETHER_WS_FLUSH_MS", 50)),
        }
    }
}

/// Audit log retention tunables.
#[derive(Debug, Clone, Copy)]
pub struct AuditConfig {
    pub retention_days: i64,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            retention_days: env_or("AETHER_AUDIT_RETENTION_DAYS", 30),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct AppConfig {
    pub process: ProcessConfig,
    pub quotas: QuotaDefaults,
    pub subprocess: SubprocessConfig,
    pub scheduler: SchedulerConfig,
    pub webhook: WebhookConfig,
    pub vfs: VfsConfig,
    pub ws: WsFanoutConfig,
    pub audit: AuditConfig,
}

impl AppConfig {
    /// Load configuration from `.env` + process environment.
    pub fn from_env() -> Self {
        dotenvy::dotenv().ok();
        Self::default()
    }

    pub fn port(&self) -> u16 {
        env_or("PORT", 8000)
    }
}

/// Initialize the global tracing subscriber the way the donor's `main.rs`
/// does it.
pub fn init_tracing() {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .with_env_filter(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "aether_kernel=debug,tower_http=info".to_string()),
        )
        .init();
}
