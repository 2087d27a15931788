//! The kernel: owns every subsystem manager as a plain field and wires them
//! together. Nothing here is an actor — callers reach subsystems by calling
//! methods directly on `Kernel`, the same way the donor's `AppState`/
//! `WebSocketState` hand out `Arc`-wrapped services rather than routing
//! everything through message-passing.

pub mod audit;
pub mod cron;
pub mod event_bus;
pub mod governor;
pub mod process;
pub mod scheduler;
pub mod skill;
pub mod subprocess;
pub mod vfs;
pub mod webhook;
pub mod ws_fanout;

use std::sync::Arc;

use tracing::{info, warn};

use crate::config::AppConfig;
use crate::state_store::memory::MemoryStateStore;
use crate::state_store::StateStore;

use audit::AuditLog;
use event_bus::EventBus;
use governor::{ResourceGovernor, Terminator};
use process::{Process, ProcessManager, Signal, SpawnConfig, SpawnOutcome};
use scheduler::Scheduler;
use skill::SkillExecutor;
use subprocess::{LaunchConfig, RuntimeKind, SubprocessSupervisor};
use vfs::Vfs;
use webhook::WebhookEngine;
use ws_fanout::WsFanout;

/// Thin capability handed to the governor so it can terminate a runaway
/// process without the governor depending on the whole `ProcessManager`.
struct ProcessTerminator {
    processes: Arc<ProcessManager>,
}

impl Terminator for ProcessTerminator {
    fn terminate(&self, pid: u64) {
        self.processes.signal(pid, Signal::Sigterm);
    }
}

#[derive(Clone)]
pub struct Kernel {
    pub config: Arc<AppConfig>,
    pub bus: EventBus,
    pub processes: Arc<ProcessManager>,
    pub subprocesses: Arc<SubprocessSupervisor>,
    pub governor: Arc<ResourceGovernor>,
    pub vfs: Arc<Vfs>,
    pub skills: Arc<SkillExecutor>,
    pub scheduler: Arc<Scheduler>,
    pub webhooks: Arc<WebhookEngine>,
    pub audit: Arc<AuditLog>,
    pub ws_fanout: Arc<WsFanout>,
    pub state_store: Arc<dyn StateStore>,
    terminator: Arc<ProcessTerminator>,
}

impl Kernel {
    pub fn new(config: AppConfig) -> Self {
        let config = Arc::new(config);
        let bus = EventBus::new();
        let processes = Arc::new(ProcessManager::new(config.process.clone(), bus.clone()));
        let subprocesses = Arc::new(SubprocessSupervisor::new(config.subprocess.clone(), bus.clone()));
        let governor = Arc::new(ResourceGovernor::new(config.quotas, bus.clone()));
        let vfs = Arc::new(Vfs::new(config.vfs.clone()));
        let skills = Arc::new(SkillExecutor::new());
        let scheduler = Arc::new(Scheduler::new(bus.clone()));
        let webhooks = Arc::new(WebhookEngine::new(config.webhook.clone(), bus.clone()));
        let audit = Arc::new(AuditLog::new(config.audit));
        let ws_fanout = Arc::new(WsFanout::new());
        let state_store: Arc<dyn StateStore> = Arc::new(MemoryStateStore::new());
        let terminator = Arc::new(ProcessTerminator { processes: processes.clone() });

        Self {
            config,
            bus,
            processes,
            subprocesses,
            governor,
            vfs,
            skills,
            scheduler,
            webhooks,
            audit,
            ws_fanout,
            state_store,
            terminator,
        }
    }

    pub fn terminator(&self) -> Arc<dyn Terminator> {
        self.terminator.clone()
    }

    fn runtime_from_str(raw: &str) -> RuntimeKind {
        match raw {
            "claude-code" => RuntimeKind::ClaudeCode,
            "openclaw" => RuntimeKind::Openclaw,
            _ => RuntimeKind::Builtin,
        }
    }

    /// Admits `config` into the process table and, if a concurrency slot
    /// was free, provisions its home and launches the runtime subprocess.
    /// Shared by the `/agents` spawn handler and every automatic spawner
    /// (cron jobs, event triggers, inbound webhooks) so "what happens when
    /// an agent is spawned" has exactly one implementation.
    pub async fn spawn_agent(
        &self,
        config: SpawnConfig,
        parent_pid: u64,
    ) -> Result<SpawnOutcome, process::ProcessError> {
        let outcome = self.processes.spawn(config.clone(), parent_pid)?;
        self.governor.register(outcome.pid, None);

        if !outcome.queued {
            let uid = Process::uid_for(outcome.pid);
            self.vfs.create_home(&uid).await.ok();
            let work_dir = self.vfs.home_dir_path(&uid);
            let launch = LaunchConfig {
                runtime: Self::runtime_from_str(&config.runtime),
                role: config.role.clone(),
                goal: config.goal.clone(),
                args: vec![],
                mcp_endpoint: "http://127.0.0.1:8000/ws".to_string(),
            };
            if let Err(e) = self.subprocesses.start(outcome.pid, launch, work_dir).await {
                warn!(pid = outcome.pid, error = %e, "failed to launch subprocess for spawned agent");
            } else {
                self.processes.start_running(outcome.pid);
            }
        }
        Ok(outcome)
    }

    /// Starts the background machinery: VFS root, audit's bus subscriber,
    /// the cron/reap/webhook-retry timer wheel, and the WS fan-out's bus
    /// forwarding loop. Call once at process start, after `new`.
    pub async fn start(&self) -> anyhow::Result<()> {
        self.vfs.init().await?;
        self.scheduler.recompute_stale_schedules(chrono::Utc::now());

        AuditLog::spawn_bus_subscriber(self.audit.clone(), self.bus.clone());
        WebhookEngine::spawn_bus_subscriber(self.webhooks.clone(), self.bus.clone());
        self.spawn_fanout_forwarder();
        self.spawn_cron_ticker();
        self.spawn_trigger_listener();
        self.spawn_reap_ticker();

        self.bus.publish("kernel.ready", serde_json::json!({}));
        info!("kernel started");
        Ok(())
    }

    fn spawn_fanout_forwarder(&self) {
        let mut rx = self.bus.subscribe();
        let fanout = self.ws_fanout.clone();
        tokio::spawn(async move {
            while let Ok(event) = rx.recv().await {
                fanout.broadcast(&event).await;
            }
        });
    }

    /// Deserializes a `spawn_config` JSON blob carried by a cron job or
    /// event trigger and hands it to [`Kernel::spawn_agent`] with the
    /// kernel itself as parent, since nothing else owns these spawns.
    async fn spawn_from_value(kernel: &Self, source: &str, spawn_config: &serde_json::Value) {
        match serde_json::from_value::<SpawnConfig>(spawn_config.clone()) {
            Ok(config) => {
                if let Err(e) = kernel.spawn_agent(config, process::KERNEL_PID).await {
                    warn!(%source, error = %e, "automatic spawn rejected");
                }
            }
            Err(e) => warn!(%source, error = %e, "spawn_config did not deserialize into SpawnConfig"),
        }
    }

    fn spawn_cron_ticker(&self) {
        let kernel = self.clone();
        let tick_interval = self.config.scheduler.tick_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(tick_interval);
            loop {
                ticker.tick().await;
                let fired = kernel.scheduler.tick(chrono::Utc::now());
                for job in fired {
                    Self::spawn_from_value(&kernel, "cron", &job.spawn_config).await;
                }
            }
        });
    }

    /// Feeds every bus event into the scheduler's trigger matcher and
    /// spawns an agent for each trigger that fires — the live-traffic
    /// counterpart to `Scheduler::handle_event`, which is otherwise only
    /// exercised directly in tests.
    fn spawn_trigger_listener(&self) {
        let kernel = self.clone();
        tokio::spawn(async move {
            let mut rx = kernel.bus.subscribe();
            while let Ok(event) = rx.recv().await {
                let fired = kernel.scheduler.handle_event(&event.kind, &event.payload);
                for trigger in fired {
                    Self::spawn_from_value(&kernel, "trigger", &trigger.spawn_config).await;
                }
            }
        });
    }

    /// Reaps zombie processes after their grace period, pumps the wait
    /// queue (admission can also free up when a quota-terminated process's
    /// delayed reap completes, not only on `exit`/`signal`), and re-checks
    /// every running process's quota so a wall-clock-only overrun is caught
    /// between steps rather than only when new token usage is recorded.
    fn spawn_reap_ticker(&self) {
        let processes = self.processes.clone();
        let governor = self.governor.clone();
        let terminator = self.terminator();
        let reap_delay = self.config.process.reap_delay;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(reap_delay.max(std::time::Duration::from_millis(250)));
            loop {
                ticker.tick().await;
                let running: Vec<u64> = processes
                    .list()
                    .into_iter()
                    .filter(|p| p.state == process::ProcessState::Running)
                    .map(|p| p.pid)
                    .collect();
                for pid in &running {
                    governor.check_quota(*pid, terminator.as_ref());
                }

                let zombies: Vec<u64> = processes
                    .list()
                    .into_iter()
                    .filter(|p| p.state == process::ProcessState::Zombie)
                    .map(|p| p.pid)
                    .collect();
                for pid in zombies {
                    processes.reap(pid);
                }
                processes.pump_wait_queue();
            }
        });
    }

    /// Graceful shutdown ordering: stop accepting new scheduled/webhook
    /// work first, SIGTERM subprocesses, shut the process manager down
    /// (which itself SIGTERMs/SIGKILLs remaining table entries), and drain
    /// the event bus last so every subsystem's final events are observed
    /// by any subscriber still listening (audit, ws fan-out).
    pub async fn shutdown(&self) {
        info!("kernel shutting down");
        self.bus.publish("kernel.shutting_down", serde_json::json!({}));
        self.subprocesses.shutdown().await;
        self.processes.shutdown().await;
    }
}
