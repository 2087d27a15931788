//! Component F — the resource governor.
//!
//! Tracks per-PID token/step/wall-clock consumption against quotas and
//! pre-emptively terminates runaway agents. Holds only a narrow signaling
//! capability back into the process manager (a closure, not the manager
//! itself) so this module never gains a dependency edge onto the full
//! process table — mirrors the donor's pattern of passing a thin callback
//! into services that only need to trigger one action on another subsystem.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::Serialize;

use super::event_bus::EventBus;
use crate::config::QuotaDefaults;

/// What the governor is allowed to do to a runaway process: terminate it.
/// A trait object rather than a concrete `ProcessManager` reference so unit
/// tests can observe terminations without constructing a full manager.
pub trait Terminator: Send + Sync {
    fn terminate(&self, pid: u64);
}

/// Per-PID resource-usage record per §3: input/output tokens tracked
/// separately, a monotonically increasing step count, the session's start
/// timestamp, the provider the usage was billed against, and the cost
/// estimate recomputed from the running totals on every record.
#[derive(Debug, Clone, Serialize, Default)]
pub struct Usage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub tokens_today: u64,
    pub steps: u64,
    pub started_at: Option<DateTime<Utc>>,
    pub provider: Option<String>,
    pub cost_usd: f64,
}

impl Usage {
    fn tokens_session(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct Quota {
    pub max_tokens_per_session: u64,
    pub max_tokens_per_day: u64,
    pub max_steps: u64,
    pub max_wall_clock_ms: u64,
}

impl From<QuotaDefaults> for Quota {
    fn from(d: QuotaDefaults) -> Self {
        Self {
            max_tokens_per_session: d.max_tokens_per_session,
            max_tokens_per_day: d.max_tokens_per_day,
            max_steps: d.max_steps,
            max_wall_clock_ms: d.max_wall_clock_ms,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExceededKind {
    Tokens,
    Steps,
    WallClock,
}

/// Per-provider token pricing, USD per million tokens, input and output
/// priced separately per §4.3.
#[derive(Debug, Clone, Copy)]
pub struct ProviderRate {
    pub input_per_million: f64,
    pub output_per_million: f64,
}

/// Providers not in the map fall back to `default_rate`, per §4.3's
/// "unknown providers use a default rate" requirement.
pub struct CostModel {
    rates: HashMap<String, ProviderRate>,
    default_rate: ProviderRate,
}

impl Default for CostModel {
    fn default() -> Self {
        let mut rates = HashMap::new();
        rates.insert(
            "anthropic".to_string(),
            ProviderRate { input_per_million: 3.0, output_per_million: 15.0 },
        );
        rates.insert(
            "openai".to_string(),
            ProviderRate { input_per_million: 2.50, output_per_million: 10.0 },
        );
        Self {
            rates,
            default_rate: ProviderRate { input_per_million: 2.0, output_per_million: 6.0 },
        }
    }
}

impl CostModel {
    pub fn estimate_usd(&self, provider: &str, input_tokens: u64, output_tokens: u64) -> f64 {
        let rate = self.rates.get(provider).copied().unwrap_or(self.default_rate);
        (input_tokens as f64 / 1_000_000.0) * rate.input_per_million
            + (output_tokens as f64 / 1_000_000.0) * rate.output_per_million
    }
}

struct Tracked {
    usage: Usage,
    quota: Quota,
    started_at: Instant,
    day_started_at: Instant,
}

pub struct ResourceGovernor {
    tracked: Mutex<HashMap<u64, Tracked>>,
    default_quota: Quota,
    cost_model: CostModel,
    bus: EventBus,
}

impl ResourceGovernor {
    pub fn new(defaults: QuotaDefaults, bus: EventBus) -> Self {
        Self {
            tracked: Mutex::new(HashMap::new()),
            default_quota: defaults.into(),
            cost_model: CostModel::default(),
            bus,
        }
    }

    pub fn register(&self, pid: u64, quota: Option<Quota>) {
        let mut map = self.tracked.lock().unwrap();
        map.insert(
            pid,
            Tracked {
                usage: Usage { started_at: Some(Utc::now()), ..Usage::default() },
                quota: quota.unwrap_or(self.default_quota),
                started_at: Instant::now(),
                day_started_at: Instant::now(),
            },
        );
    }

    pub fn unregister(&self, pid: u64) {
        self.tracked.lock().unwrap().remove(&pid);
    }

    pub fn usage(&self, pid: u64) -> Option<Usage> {
        self.tracked.lock().unwrap().get(&pid).map(|t| t.usage)
    }

    /// Records input/output token usage for a completed step against the
    /// given `provider`, then evaluates quotas. Returns every boundary
    /// crossed so callers can decide whether to terminate on the worst one.
    pub fn record_token_usage(
        &self,
        pid: u64,
        input_tokens: u64,
        output_tokens: u64,
        provider: &str,
        terminator: &dyn Terminator,
    ) -> Vec<ExceededKind> {
        let (exceeded, usage) = {
            let mut map = self.tracked.lock().unwrap();
            let Some(tracked) = map.get_mut(&pid) else {
                return Vec::new();
            };
            if tracked.day_started_at.elapsed().as_secs() >= 86_400 {
                tracked.usage.tokens_today = 0;
                tracked.day_started_at = Instant::now();
            }
            tracked.usage.input_tokens += input_tokens;
            tracked.usage.output_tokens += output_tokens;
            tracked.usage.tokens_today += input_tokens + output_tokens;
            tracked.usage.steps += 1;
            tracked.usage.provider = Some(provider.to_string());
            tracked.usage.cost_usd = self.cost_model.estimate_usd(
                provider,
                tracked.usage.input_tokens,
                tracked.usage.output_tokens,
            );

            let exceeded = self.check_quota_locked(tracked);
            (exceeded, tracked.usage.clone())
        };

        for kind in &exceeded {
            self.bus.publish(
                "resource.exceeded",
                serde_json::json!({ "pid": pid, "kind": format!("{kind:?}"), "reason": exceeded_reason(*kind) }),
            );
        }
        self.bus.publish(
            "resource.usage",
            serde_json::json!({
                "pid": pid,
                "input_tokens": input_tokens,
                "output_tokens": output_tokens,
                "total_input_tokens": usage.input_tokens,
                "total_output_tokens": usage.output_tokens,
                "steps": usage.steps,
                "provider": usage.provider,
                "cost_usd": usage.cost_usd,
            }),
        );
        if !exceeded.is_empty() {
            terminator.terminate(pid);
        }
        exceeded
    }

    fn check_quota_locked(&self, tracked: &Tracked) -> Vec<ExceededKind> {
        let mut hits = Vec::new();
        if tracked.usage.tokens_session() > tracked.quota.max_tokens_per_session
            || tracked.usage.tokens_today > tracked.quota.max_tokens_per_day
        {
            hits.push(ExceededKind::Tokens);
        }
        if tracked.usage.steps > tracked.quota.max_steps {
            hits.push(ExceededKind::Steps);
        }
        if tracked.started_at.elapsed().as_millis() as u64 > tracked.quota.max_wall_clock_ms {
            hits.push(ExceededKind::WallClock);
        }
        hits
    }

    /// Evaluates quotas without recording new usage — for the kernel's
    /// periodic maintenance tick to catch wall-clock-only overruns between
    /// steps.
    pub fn check_quota(&self, pid: u64, terminator: &dyn Terminator) -> Vec<ExceededKind> {
        let map = self.tracked.lock().unwrap();
        let Some(tracked) = map.get(&pid) else {
            return Vec::new();
        };
        let hits = self.check_quota_locked(tracked);
        drop(map);
        if !hits.is_empty() {
            terminator.terminate(pid);
        }
        hits
    }

    /// True once usage overshoots its quota by more than the configured
    /// runaway percentage — a distinct, noisier signal than a plain
    /// exceeded check, meant to flag agents that blew straight through
    /// their budget rather than edging over it.
    pub fn is_runaway(&self, pid: u64, overshoot_pct: f64) -> bool {
        let map = self.tracked.lock().unwrap();
        let Some(tracked) = map.get(&pid) else {
            return false;
        };
        let token_limit = tracked.quota.max_tokens_per_session as f64;
        if token_limit <= 0.0 {
            return false;
        }
        let ratio = tracked.usage.tokens_session() as f64 / token_limit;
        ratio > 1.0 + overshoot_pct
    }

    pub fn estimate_cost_usd(&self, provider: &str, input_tokens: u64, output_tokens: u64) -> f64 {
        self.cost_model.estimate_usd(provider, input_tokens, output_tokens)
    }
}

/// Human-readable reason string for the §8 scenario ("reason 'Session
/// token limit exceeded'") and for `checkQuota`'s diagnostic surface.
fn exceeded_reason(kind: ExceededKind) -> &'static str {
    match kind {
        ExceededKind::Tokens => "Session token limit exceeded",
        ExceededKind::Steps => "Step limit exceeded",
        ExceededKind::WallClock => "Wall-clock limit exceeded",
    }
}
