//! Component D — the process manager.
//!
//! Owns the process table (an arena keyed by PID, per the design notes —
//! rows are reused once dead rather than heap-churned per spawn), the
//! bounded-concurrency / priority wait queue, per-PID IPC mailboxes, and the
//! lifecycle state machine. Every operation that only touches in-memory
//! state (admission, signal delivery, IPC) holds `self.inner` across the
//! check-then-act so no other task can observe a half-applied transition —
//! this is the "purely in-memory operations must not suspend" rule from §5,
//! implemented with a plain `std::sync::Mutex` rather than an async one.

use std::collections::{BinaryHeap, HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::event_bus::EventBus;
use crate::config::ProcessConfig;

pub const KERNEL_PID: u64 = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessState {
    Created,
    Running,
    Sleeping,
    Stopped,
    Paused,
    Zombie,
    Dead,
}

impl ProcessState {
    fn is_terminal_for_admission(self) -> bool {
        matches!(self, ProcessState::Zombie | ProcessState::Dead)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Booting,
    Thinking,
    Acting,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Signal {
    Sigterm,
    Sigkill,
    Sigstop,
    Sigcont,
    Sigint,
    Unknown,
}

/// Immutable spawn configuration — set once at `spawn()` and never mutated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpawnConfig {
    pub role: String,
    pub goal: String,
    pub runtime: String,
    pub model: Option<String>,
    #[serde(default)]
    pub tools: Vec<String>,
    pub priority: u8,
    pub max_steps: u64,
    #[serde(default)]
    pub env: HashMap<String, String>,
    pub working_directory: String,
}

impl SpawnConfig {
    pub fn validate(&self) -> Result<(), String> {
        if !(1..=5).contains(&self.priority) {
            return Err(format!("priority {} must be within 1..5", self.priority));
        }
        if self.role.trim().is_empty() {
            return Err("role must not be empty".to_string());
        }
        if self.goal.trim().is_empty() {
            return Err("goal must not be empty".to_string());
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IpcMessage {
    pub id: String,
    pub from_pid: u64,
    pub to_pid: u64,
    pub from_uid: String,
    pub to_uid: String,
    pub channel: String,
    pub payload: serde_json::Value,
    pub timestamp: DateTime<Utc>,
    pub delivered: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Process {
    pub pid: u64,
    pub owner_uid: String,
    pub parent_pid: u64,
    pub config: SpawnConfig,
    pub state: ProcessState,
    pub phase: Phase,
    pub exit_code: Option<i32>,
    pub created_at: DateTime<Utc>,
    pub cpu_percent: f64,
    pub memory_mb: f64,
    #[serde(skip, default = "VecDeque::new")]
    pub mailbox: VecDeque<IpcMessage>,
}

impl Process {
    pub fn uid_for(pid: u64) -> String {
        format!("agent_{pid}")
    }
}

/// A spawn request waiting for a concurrency slot.
#[derive(Debug, Clone)]
struct Waiting {
    pid: u64,
    owner_uid: String,
    priority: u8,
    enqueued_at: Instant,
    seq: u64,
    config: SpawnConfig,
    parent_pid: u64,
}

impl PartialEq for Waiting {
    fn eq(&self, other: &Self) -> bool {
        self.pid == other.pid
    }
}
impl Eq for Waiting {}

impl Ord for Waiting {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // BinaryHeap is a max-heap; we want the lowest priority number and
        // earliest enqueue time to pop first, so reverse the comparison.
        other
            .priority
            .cmp(&self.priority)
            .then_with(|| other.enqueued_at.cmp(&self.enqueued_at))
            .then_with(|| other.seq.cmp(&self.seq))
    }
}
impl PartialOrd for Waiting {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

pub struct SpawnOutcome {
    pub pid: u64,
    pub queued: bool,
    pub queue_position: Option<usize>,
}

#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    #[error("process table full ({0} non-dead rows)")]
    TableFull(u64),
    #[error("invalid spawn configuration: {0}")]
    InvalidConfig(String),
}

struct Inner {
    table: HashMap<u64, Process>,
    wait_queue: BinaryHeap<Waiting>,
    next_pid: u64,
    wait_seq: u64,
}

pub struct ProcessManager {
    inner: Mutex<Inner>,
    config: ProcessConfig,
    bus: EventBus,
}

impl ProcessManager {
    pub fn new(config: ProcessConfig, bus: EventBus) -> Self {
        Self {
            inner: Mutex::new(Inner {
                table: HashMap::new(),
                wait_queue: BinaryHeap::new(),
                next_pid: 1,
                wait_seq: 0,
            }),
            config,
            bus,
        }
    }

    fn active_count(inner: &Inner) -> usize {
        inner
            .table
            .values()
            .filter(|p| !p.state.is_terminal_for_admission())
            .count()
    }

    fn non_dead_count(inner: &Inner) -> u64 {
        inner
            .table
            .values()
            .filter(|p| p.state != ProcessState::Dead)
            .count() as u64
    }

    fn allocate_pid(inner: &mut Inner, max_processes: u64) -> u64 {
        let wrap_at = 2 * max_processes.max(1);
        for _ in 0..wrap_at {
            let pid = inner.next_pid.max(1);
            inner.next_pid = if pid + 1 >= wrap_at { 1 } else { pid + 1 };
            match inner.table.get(&pid) {
                None => return pid,
                Some(p) if p.state == ProcessState::Dead => return pid,
                _ => continue,
            }
        }
        unreachable!("PID space exhausted despite table-size invariant");
    }

    /// `spawn()` from §4.1: immediately create if a concurrency slot is
    /// free, otherwise enqueue and report the queue position.
    pub fn spawn(
        &self,
        config: SpawnConfig,
        parent_pid: u64,
    ) -> Result<SpawnOutcome, ProcessError> {
        config
            .validate()
            .map_err(ProcessError::InvalidConfig)?;

        let mut inner = self.inner.lock().unwrap();

        if Self::non_dead_count(&inner) >= self.config.max_processes {
            return Err(ProcessError::TableFull(self.config.max_processes));
        }

        if Self::active_count(&inner) >= self.config.max_concurrent {
            let pid = Self::allocate_pid(&mut inner, self.config.max_processes);
            inner.wait_seq += 1;
            let waiting = Waiting {
                pid,
                owner_uid: Process::uid_for(pid),
                priority: config.priority,
                enqueued_at: Instant::now(),
                seq: inner.wait_seq,
                config,
                parent_pid,
            };
            inner.wait_queue.push(waiting);
            let position = inner.wait_queue.len();
            drop(inner);
            self.bus.publish(
                "process.queued",
                serde_json::json!({ "pid": pid, "position": position }),
            );
            return Ok(SpawnOutcome {
                pid,
                queued: true,
                queue_position: Some(position),
            });
        }

        let pid = Self::allocate_pid(&mut inner, self.config.max_processes);
        let process = Process {
            pid,
            owner_uid: Process::uid_for(pid),
            parent_pid,
            config,
            state: ProcessState::Created,
            phase: Phase::Booting,
            exit_code: None,
            created_at: Utc::now(),
            cpu_percent: 0.0,
            memory_mb: 0.0,
            mailbox: VecDeque::new(),
        };
        inner.table.insert(pid, process);
        drop(inner);
        self.bus.publish("process.spawned", serde_json::json!({ "pid": pid }));
        Ok(SpawnOutcome {
            pid,
            queued: false,
            queue_position: None,
        })
    }

    fn transition(&self, inner: &mut Inner, pid: u64, to: ProcessState) -> bool {
        let Some(process) = inner.table.get_mut(&pid) else {
            return false;
        };
        let allowed = match (process.state, to) {
            (ProcessState::Created, ProcessState::Running) => true,
            (ProcessState::Running, ProcessState::Sleeping) => true,
            (ProcessState::Sleeping, ProcessState::Running) => true,
            (ProcessState::Running, ProcessState::Stopped) => true,
            (ProcessState::Sleeping, ProcessState::Stopped) => true,
            (ProcessState::Stopped, ProcessState::Running) => true,
            (ProcessState::Running, ProcessState::Paused) => true,
            (ProcessState::Sleeping, ProcessState::Paused) => true,
            (ProcessState::Paused, ProcessState::Running) => true,
            (ProcessState::Created, ProcessState::Zombie) => true,
            (ProcessState::Running, ProcessState::Zombie) => true,
            (ProcessState::Sleeping, ProcessState::Zombie) => true,
            (ProcessState::Stopped, ProcessState::Zombie) => true,
            (ProcessState::Paused, ProcessState::Zombie) => true,
            (ProcessState::Zombie, ProcessState::Dead) => true,
            _ => false,
        };
        if !allowed {
            return false;
        }
        process.state = to;
        true
    }

    pub fn start_running(&self, pid: u64) -> bool {
        let mut inner = self.inner.lock().unwrap();
        let ok = self.transition(&mut inner, pid, ProcessState::Running);
        drop(inner);
        if ok {
            self.bus
                .publish("process.state_changed", serde_json::json!({ "pid": pid, "state": "running" }));
        }
        ok
    }

    pub fn set_sleeping(&self, pid: u64) -> bool {
        let mut inner = self.inner.lock().unwrap();
        let ok = self.transition(&mut inner, pid, ProcessState::Sleeping);
        drop(inner);
        if ok {
            self.bus
                .publish("process.state_changed", serde_json::json!({ "pid": pid, "state": "sleeping" }));
        }
        ok
    }

    /// §4.1 `pause()` — explicit human-takeover transition, only from
    /// running/sleeping.
    pub fn pause(&self, pid: u64) -> bool {
        let mut inner = self.inner.lock().unwrap();
        let ok = self.transition(&mut inner, pid, ProcessState::Paused);
        drop(inner);
        if ok {
            self.bus
                .publish("process.paused", serde_json::json!({ "pid": pid }));
        }
        ok
    }

    /// §4.1 `resume()` — only from paused.
    pub fn resume(&self, pid: u64) -> bool {
        let mut inner = self.inner.lock().unwrap();
        let ok = self.transition(&mut inner, pid, ProcessState::Running);
        drop(inner);
        if ok {
            self.bus
                .publish("process.resumed", serde_json::json!({ "pid": pid }));
        }
        ok
    }

    /// Exit with an explicit code, e.g. from the agent loop/subprocess
    /// supervisor completing normally.
    pub fn exit(&self, pid: u64, code: i32) {
        self.zombie(pid, code, if code == 0 { Phase::Completed } else { Phase::Failed });
    }

    fn zombie(&self, pid: u64, code: i32, phase: Phase) -> bool {
        let (transitioned, reap_delay) = {
            let mut inner = self.inner.lock().unwrap();
            let ok = self.transition(&mut inner, pid, ProcessState::Zombie);
            if ok {
                if let Some(process) = inner.table.get_mut(&pid) {
                    process.exit_code = Some(code);
                    process.phase = phase;
                }
            }
            let admitted = self.try_admit_locked(&mut inner);
            (ok, admitted)
        };
        if transitioned {
            self.bus.publish(
                "process.exit",
                serde_json::json!({ "pid": pid, "code": code }),
            );
            for admitted_pid in reap_delay {
                self.bus
                    .publish("process.admitted", serde_json::json!({ "pid": admitted_pid }));
            }
            self.schedule_reap(pid);
        }
        transitioned
    }

    fn schedule_reap(&self, pid: u64) {
        // Timer resolution is >= 1s per §5; the reap scheduling itself is
        // driven by the kernel's timer wheel (see `kernel::mod`), which
        // calls `reap()` after `reap_delay`. Kept here as a hook so callers
        // without a timer wheel (unit tests) can call `reap` directly.
        let _ = pid;
    }

    /// `reap()` — scheduled ~1-2s after zombie; clears the mailbox, emits
    /// a home-dir cleanup event, transitions to dead.
    pub fn reap(&self, pid: u64) -> bool {
        let mut inner = self.inner.lock().unwrap();
        let ok = self.transition(&mut inner, pid, ProcessState::Dead);
        if ok {
            if let Some(process) = inner.table.get_mut(&pid) {
                process.mailbox.clear();
            }
        }
        drop(inner);
        if ok {
            self.bus.publish("process.reaped", serde_json::json!({ "pid": pid }));
            self.bus
                .publish("workspace.cleaned", serde_json::json!({ "pid": pid }));
        }
        ok
    }

    /// Attempts to dequeue and admit the highest-priority waiter, assuming
    /// the caller already holds `inner`'s lock. Returns the PIDs admitted
    /// (0 or 1 — admission only frees one slot at a time, but a caller may
    /// loop this if multiple slots freed at once).
    fn try_admit_locked(&self, inner: &mut Inner) -> Vec<u64> {
        let mut admitted = Vec::new();
        while Self::active_count(inner) < self.config.max_concurrent {
            let Some(waiting) = inner.wait_queue.pop() else {
                break;
            };
            let process = Process {
                pid: waiting.pid,
                owner_uid: waiting.owner_uid,
                parent_pid: waiting.parent_pid,
                config: waiting.config,
                state: ProcessState::Created,
                phase: Phase::Booting,
                exit_code: None,
                created_at: Utc::now(),
                cpu_percent: 0.0,
                memory_mb: 0.0,
                mailbox: VecDeque::new(),
            };
            inner.table.insert(waiting.pid, process);
            admitted.push(waiting.pid);
        }
        admitted
    }

    /// Drives queue admission independent of a just-completed exit — used
    /// by the kernel's periodic maintenance tick as a safety net.
    pub fn pump_wait_queue(&self) -> Vec<u64> {
        let mut inner = self.inner.lock().unwrap();
        self.try_admit_locked(&mut inner)
    }

    pub fn signal(&self, pid: u64, signal: Signal) -> bool {
        match signal {
            Signal::Sigterm => self.zombie(pid, 143, Phase::Failed),
            Signal::Sigkill => self.zombie(pid, 137, Phase::Failed),
            Signal::Sigstop => {
                let mut inner = self.inner.lock().unwrap();
                let ok = self.transition(&mut inner, pid, ProcessState::Stopped);
                drop(inner);
                if ok {
                    self.bus
                        .publish("process.stopped", serde_json::json!({ "pid": pid }));
                }
                ok
            }
            Signal::Sigcont => {
                let mut inner = self.inner.lock().unwrap();
                let ok = self.transition(&mut inner, pid, ProcessState::Running);
                drop(inner);
                if ok {
                    self.bus
                        .publish("process.state_changed", serde_json::json!({ "pid": pid, "state": "running" }));
                }
                ok
            }
            Signal::Sigint | Signal::Unknown => {
                let exists = self.inner.lock().unwrap().table.contains_key(&pid);
                if exists {
                    self.bus.publish(
                        "process.signal",
                        serde_json::json!({ "pid": pid, "signal": format!("{:?}", signal) }),
                    );
                }
                exists
            }
        }
    }

    pub fn get(&self, pid: u64) -> Option<Process> {
        self.inner.lock().unwrap().table.get(&pid).cloned()
    }

    pub fn list(&self) -> Vec<Process> {
        let mut v: Vec<Process> = self.inner.lock().unwrap().table.values().cloned().collect();
        v.sort_by_key(|p| p.pid);
        v
    }

    pub fn queue_len(&self) -> usize {
        self.inner.lock().unwrap().wait_queue.len()
    }

    pub fn active_len(&self) -> usize {
        Self::active_count(&self.inner.lock().unwrap())
    }

    // ── IPC ──────────────────────────────────────────────────────────────

    pub fn send_message(
        &self,
        from_pid: u64,
        to_pid: u64,
        channel: &str,
        payload: serde_json::Value,
    ) -> Result<IpcMessage, String> {
        let mut inner = self.inner.lock().unwrap();
        let from_uid = inner
            .table
            .get(&from_pid)
            .map(|p| p.owner_uid.clone())
            .unwrap_or_else(|| Process::uid_for(from_pid));

        let to_dead = inner
            .table
            .get(&to_pid)
            .map(|p| p.state == ProcessState::Dead)
            .unwrap_or(false);
        let from_dead = inner
            .table
            .get(&from_pid)
            .map(|p| p.state == ProcessState::Dead)
            .unwrap_or(false);
        if to_dead || from_dead {
            return Err("cannot deliver IPC to/from a dead process".to_string());
        }

        let to_uid = inner
            .table
            .get(&to_pid)
            .map(|p| p.owner_uid.clone())
            .unwrap_or_else(|| Process::uid_for(to_pid));

        let message = IpcMessage {
            id: uuid::Uuid::new_v4().to_string(),
            from_pid,
            to_pid,
            from_uid,
            to_uid,
            channel: channel.to_string(),
            payload,
            timestamp: Utc::now(),
            delivered: false,
        };

        if let Some(process) = inner.table.get_mut(&to_pid) {
            let cap = self.config.mailbox_cap;
            if process.mailbox.len() >= cap {
                process.mailbox.pop_front();
            }
            process.mailbox.push_back(message.clone());
        } else {
            return Err(format!("unknown recipient pid {to_pid}"));
        }
        drop(inner);
        self.bus.publish(
            "ipc.message",
            serde_json::json!({
                "id": message.id, "from": from_pid, "to": to_pid, "channel": message.channel
            }),
        );
        Ok(message)
    }

    /// Atomically drains and marks delivered every message in `pid`'s
    /// mailbox.
    pub fn drain(&self, pid: u64) -> Vec<IpcMessage> {
        let mut inner = self.inner.lock().unwrap();
        let Some(process) = inner.table.get_mut(&pid) else {
            return Vec::new();
        };
        let mut drained: Vec<IpcMessage> = process.mailbox.drain(..).collect();
        for m in drained.iter_mut() {
            m.delivered = true;
        }
        drop(inner);
        for m in &drained {
            self.bus
                .publish("ipc.delivered", serde_json::json!({ "id": m.id, "to": m.to_pid }));
        }
        drained
    }

    pub fn peek(&self, pid: u64) -> Vec<IpcMessage> {
        let inner = self.inner.lock().unwrap();
        inner
            .table
            .get(&pid)
            .map(|p| p.mailbox.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Graceful shutdown: SIGTERM everything active, wait `shutdown_grace`,
    /// SIGKILL the remainder, clear the wait queue.
    pub async fn shutdown(&self) {
        let pids: Vec<u64> = {
            let inner = self.inner.lock().unwrap();
            inner
                .table
                .values()
                .filter(|p| !p.state.is_terminal_for_admission())
                .map(|p| p.pid)
                .collect()
        };
        for pid in &pids {
            self.signal(*pid, Signal::Sigterm);
        }
        tokio::time::sleep(self.config.shutdown_grace).await;
        for pid in &pids {
            if let Some(p) = self.get(*pid) {
                if p.state != ProcessState::Zombie && p.state != ProcessState::Dead {
                    self.signal(*pid, Signal::Sigkill);
                }
            }
        }
        let mut inner = self.inner.lock().unwrap();
        inner.wait_queue.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg(priority: u8) -> SpawnConfig {
        SpawnConfig {
            role: "tester".into(),
            goal: "run tests".into(),
            runtime: "builtin".into(),
            model: None,
            tools: vec![],
            priority,
            max_steps: 10,
            env: HashMap::new(),
            working_directory: "/home/agent".into(),
        }
    }

    fn manager(max_concurrent: usize) -> ProcessManager {
        let mut pc = ProcessConfig::default();
        pc.max_concurrent = max_concurrent;
        pc.max_processes = 100;
        pc.mailbox_cap = 4;
        ProcessManager::new(pc, EventBus::new())
    }

    #[test]
    fn admission_control_queues_when_full() {
        let mgr = manager(2);
        let a = mgr.spawn(cfg(3), KERNEL_PID).unwrap();
        let b = mgr.spawn(cfg(3), KERNEL_PID).unwrap();
        assert!(!a.queued && !b.queued);
        assert_eq!(mgr.active_len(), 2);

        let c = mgr.spawn(cfg(3), KERNEL_PID).unwrap();
        assert!(c.queued);
        assert_eq!(c.queue_position, Some(1));
        assert_eq!(mgr.queue_len(), 1);

        mgr.signal(a.pid, Signal::Sigterm);
        assert_eq!(mgr.queue_len(), 0);
        let list = mgr.list();
        assert_eq!(list.len(), 3);
        let created = list.iter().filter(|p| p.state == ProcessState::Created).count();
        assert_eq!(created, 1);
    }

    #[test]
    fn pids_are_unique_while_non_terminal() {
        let mgr = manager(10);
        let mut pids = std::collections::HashSet::new();
        for _ in 0..10 {
            let outcome = mgr.spawn(cfg(3), KERNEL_PID).unwrap();
            assert!(pids.insert(outcome.pid));
        }
    }

    #[test]
    fn table_full_errors_without_queuing() {
        let mut pc = ProcessConfig::default();
        pc.max_concurrent = 100;
        pc.max_processes = 2;
        let mgr = ProcessManager::new(pc, EventBus::new());
        mgr.spawn(cfg(3), KERNEL_PID).unwrap();
        mgr.spawn(cfg(3), KERNEL_PID).unwrap();
        let err = mgr.spawn(cfg(3), KERNEL_PID).unwrap_err();
        assert!(matches!(err, ProcessError::TableFull(2)));
    }

    #[test]
    fn priority_ordering_in_wait_queue() {
        let mgr = manager(0);
        let low = mgr.spawn(cfg(5), KERNEL_PID).unwrap();
        let high = mgr.spawn(cfg(1), KERNEL_PID).unwrap();
        assert!(low.queued && high.queued);
        // Highest priority (lowest number) sits at the top of the heap.
        let inner = mgr.inner.lock().unwrap();
        let top = inner.wait_queue.peek().unwrap();
        assert_eq!(top.pid, high.pid);
    }

    #[test]
    fn unknown_pid_signal_is_false_not_panic() {
        let mgr = manager(2);
        assert!(!mgr.signal(9999, Signal::Sigstop));
    }

    #[test]
    fn pause_resume_requires_running_or_paused() {
        let mgr = manager(2);
        let a = mgr.spawn(cfg(3), KERNEL_PID).unwrap();
        // created -> pause should fail (not running/sleeping)
        assert!(!mgr.pause(a.pid));
        assert!(mgr.start_running(a.pid));
        assert!(mgr.pause(a.pid));
        assert_eq!(mgr.get(a.pid).unwrap().state, ProcessState::Paused);
        assert!(mgr.resume(a.pid));
        assert_eq!(mgr.get(a.pid).unwrap().state, ProcessState::Running);
    }

    #[test]
    fn mailbox_drops_head_on_overflow() {
        let mgr = manager(2);
        let a = mgr.spawn(cfg(3), KERNEL_PID).unwrap();
        for i in 0..6 {
            mgr.send_message(KERNEL_PID, a.pid, "chat", serde_json::json!({ "i": i }))
                .unwrap();
        }
        let msgs = mgr.peek(a.pid);
        assert_eq!(msgs.len(), 4);
        assert_eq!(msgs[0].payload["i"], 2);
    }

    #[test]
    fn drain_marks_delivered_and_empties() {
        let mgr = manager(2);
        let a = mgr.spawn(cfg(3), KERNEL_PID).unwrap();
        mgr.send_message(KERNEL_PID, a.pid, "chat", serde_json::json!({})).unwrap();
        let drained = mgr.drain(a.pid);
        assert_eq!(drained.len(), 1);
        assert!(drained[0].delivered);
        assert!(mgr.peek(a.pid).is_empty());
    }

    #[test]
    fn reject_invalid_priority() {
        let mgr = manager(2);
        let err = mgr.spawn(cfg(9), KERNEL_PID).unwrap_err();
        assert!(matches!(err, ProcessError::InvalidConfig(_)));
    }
}
