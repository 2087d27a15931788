//! Component E — the subprocess supervisor.
//!
//! Launches external agent runtimes (claude-code, openclaw, or a built-in
//! in-process loop) as child OS processes, captures their stdout/stderr into
//! a bounded ring buffer, and forwards POSIX signals. Mirrors the donor's
//! `WebSocketState` shape: a `Clone` handle wrapping `Arc<RwLock<_>>` maps,
//! so every clone shares the same subprocess table.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;

use serde::Serialize;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{Mutex, RwLock};

use super::event_bus::EventBus;
use crate::config::SubprocessConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, serde::Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RuntimeKind {
    Builtin,
    ClaudeCode,
    Openclaw,
}

impl RuntimeKind {
    fn command(&self) -> &'static str {
        match self {
            RuntimeKind::Builtin => "true",
            RuntimeKind::ClaudeCode => "claude-code",
            RuntimeKind::Openclaw => "openclaw",
        }
    }
}

#[derive(Debug, Clone)]
pub struct LaunchConfig {
    pub runtime: RuntimeKind,
    pub role: String,
    pub goal: String,
    pub args: Vec<String>,
    pub mcp_endpoint: String,
}

/// Ring buffer that keeps at most `max_chars` of tail text, truncating from
/// the head on overflow per the capped-buffer invariant in §3.
#[derive(Debug, Default, Clone)]
pub struct CappedBuffer {
    data: String,
    max_chars: usize,
}

impl CappedBuffer {
    fn new(max_chars: usize) -> Self {
        Self { data: String::new(), max_chars }
    }

    fn push(&mut self, chunk: &str) {
        self.data.push_str(chunk);
        let len = self.data.chars().count();
        if len > self.max_chars {
            let excess = len - self.max_chars;
            let byte_offset = self
                .data
                .char_indices()
                .nth(excess)
                .map(|(i, _)| i)
                .unwrap_or(self.data.len());
            self.data.drain(..byte_offset);
        }
    }

    pub fn as_str(&self) -> &str {
        &self.data
    }
}

struct Handle {
    os_pid: Option<u32>,
    runtime: RuntimeKind,
    started_at: chrono::DateTime<chrono::Utc>,
    stdout: CappedBuffer,
    stderr: CappedBuffer,
    child: Arc<Mutex<Child>>,
    stdin: Arc<Mutex<tokio::process::ChildStdin>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SubprocessInfo {
    pub kernel_pid: u64,
    pub os_pid: Option<u32>,
    pub runtime: RuntimeKind,
    pub started_at: chrono::DateTime<chrono::Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SubprocessOutput {
    pub stdout: String,
    pub stderr: String,
}

#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error("spawn failed: {0}")]
    SpawnFailed(String),
    #[error("no such subprocess for pid {0}")]
    NotFound(u64),
    #[error("io error: {0}")]
    Io(String),
}

#[derive(Clone)]
pub struct SubprocessSupervisor {
    handles: Arc<RwLock<HashMap<u64, Handle>>>,
    config: SubprocessConfig,
    bus: EventBus,
}

impl SubprocessSupervisor {
    pub fn new(config: SubprocessConfig, bus: EventBus) -> Self {
        Self {
            handles: Arc::new(RwLock::new(HashMap::new())),
            config,
            bus,
        }
    }

    async fn materialize_config(work_dir: &PathBuf, cfg: &LaunchConfig) -> std::io::Result<()> {
        tokio::fs::create_dir_all(work_dir).await?;
        let briefing = format!("role: {}\ngoal: {}\n", cfg.role, cfg.goal);
        tokio::fs::write(work_dir.join("BRIEFING.md"), briefing).await?;
        let manifest = serde_json::json!({
            "mcp_endpoint": cfg.mcp_endpoint,
            "role": cfg.role,
            "goal": cfg.goal,
        });
        tokio::fs::write(
            work_dir.join("capabilities.json"),
            serde_json::to_vec_pretty(&manifest).unwrap(),
        )
        .await
    }

    pub async fn start(
        &self,
        kernel_pid: u64,
        cfg: LaunchConfig,
        work_dir: PathBuf,
    ) -> Result<SubprocessInfo, SupervisorError> {
        Self::materialize_config(&work_dir, &cfg)
            .await
            .map_err(|e| SupervisorError::Io(e.to_string()))?;

        let mut command = Command::new(cfg.runtime.command());
        command
            .args(&cfg.args)
            .current_dir(&work_dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = command
            .spawn()
            .map_err(|e| SupervisorError::SpawnFailed(e.to_string()))?;

        let os_pid = child.id();
        let stdout = child.stdout.take().expect("piped stdout");
        let stderr = child.stderr.take().expect("piped stderr");
        let stdin = child.stdin.take().expect("piped stdin");

        let started_at = chrono::Utc::now();
        let handle = Handle {
            os_pid,
            runtime: cfg.runtime,
            started_at,
            stdout: CappedBuffer::new(self.config.max_buffer_chars),
            stderr: CappedBuffer::new(self.config.max_buffer_chars),
            child: Arc::new(Mutex::new(child)),
            stdin: Arc::new(Mutex::new(stdin)),
        };
        self.handles.write().await.insert(kernel_pid, handle);

        self.spawn_reader(kernel_pid, stdout, true);
        self.spawn_reader(kernel_pid, stderr, false);
        self.spawn_waiter(kernel_pid);

        self.bus.publish(
            "subprocess.started",
            serde_json::json!({ "pid": kernel_pid, "os_pid": os_pid }),
        );
        Ok(SubprocessInfo {
            kernel_pid,
            os_pid,
            runtime: cfg.runtime,
            started_at,
        })
    }

    fn spawn_reader<R>(&self, kernel_pid: u64, reader: R, is_stdout: bool)
    where
        R: tokio::io::AsyncRead + Unpin + Send + 'static,
    {
        let bus = self.bus.clone();
        let handles = self.handles.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(reader).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                {
                    let mut map = handles.write().await;
                    if let Some(handle) = map.get_mut(&kernel_pid) {
                        let buf = if is_stdout { &mut handle.stdout } else { &mut handle.stderr };
                        buf.push(&line);
                        buf.push("\n");
                    }
                }
                bus.publish(
                    "subprocess.output",
                    serde_json::json!({
                        "pid": kernel_pid,
                        "stream": if is_stdout { "stdout" } else { "stderr" },
                        "chunk": line,
                    }),
                );
                if is_stdout {
                    bus.publish(
                        "agent.log",
                        serde_json::json!({ "pid": kernel_pid, "role": "observation", "text": line }),
                    );
                }
            }
        });
    }

    /// Waits for the child to exit in the background, then emits
    /// `subprocess.exited` and drops the record.
    fn spawn_waiter(&self, kernel_pid: u64) {
        let bus = self.bus.clone();
        let handles = self.handles.clone();
        tokio::spawn(async move {
            let child = {
                let map = handles.read().await;
                map.get(&kernel_pid).map(|h| h.child.clone())
            };
            let Some(child) = child else { return };
            let status = {
                let mut guard = child.lock().await;
                guard.wait().await
            };
            let (code, signal) = match status {
                Ok(status) => (status.code(), exit_signal(&status)),
                Err(_) => (None, None),
            };
            handles.write().await.remove(&kernel_pid);
            bus.publish(
                "subprocess.exited",
                serde_json::json!({ "pid": kernel_pid, "code": code, "signal": signal }),
            );
        });
    }

    pub async fn stop(&self, kernel_pid: u64) -> Result<(), SupervisorError> {
        self.signal_term(kernel_pid).await?;
        // Resolve once the waiter removes the record (child exited).
        for _ in 0..200 {
            if !self.handles.read().await.contains_key(&kernel_pid) {
                return Ok(());
            }
            tokio::time::sleep(std::time::Duration::from_millis(25)).await;
        }
        Ok(())
    }

    async fn signal_term(&self, kernel_pid: u64) -> Result<(), SupervisorError> {
        let os_pid = {
            let map = self.handles.read().await;
            map.get(&kernel_pid).and_then(|h| h.os_pid).ok_or(SupervisorError::NotFound(kernel_pid))?
        };
        Self::send_unix_signal(os_pid, UnixSignal::Term);
        Ok(())
    }

    /// §4.2 `pause`/`resume`: SIGSTOP/SIGCONT on POSIX, no-op elsewhere.
    pub async fn pause(&self, kernel_pid: u64) -> Result<(), SupervisorError> {
        let os_pid = {
            let map = self.handles.read().await;
            map.get(&kernel_pid).and_then(|h| h.os_pid).ok_or(SupervisorError::NotFound(kernel_pid))?
        };
        Self::send_unix_signal(os_pid, UnixSignal::Stop);
        Ok(())
    }

    pub async fn resume(&self, kernel_pid: u64) -> Result<(), SupervisorError> {
        let os_pid = {
            let map = self.handles.read().await;
            map.get(&kernel_pid).and_then(|h| h.os_pid).ok_or(SupervisorError::NotFound(kernel_pid))?
        };
        Self::send_unix_signal(os_pid, UnixSignal::Cont);
        Ok(())
    }

    #[cfg(unix)]
    fn send_unix_signal(os_pid: u32, signal: UnixSignal) {
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid;
        let sig = match signal {
            UnixSignal::Term => Signal::SIGTERM,
            UnixSignal::Stop => Signal::SIGSTOP,
            UnixSignal::Cont => Signal::SIGCONT,
        };
        let _ = kill(Pid::from_raw(os_pid as i32), sig);
    }

    #[cfg(not(unix))]
    fn send_unix_signal(_os_pid: u32, _signal: UnixSignal) {}

    pub async fn send_input(&self, kernel_pid: u64, text: &str) -> Result<(), SupervisorError> {
        let stdin = {
            let map = self.handles.read().await;
            map.get(&kernel_pid)
                .map(|h| h.stdin.clone())
                .ok_or(SupervisorError::NotFound(kernel_pid))?
        };
        let mut guard = stdin.lock().await;
        guard
            .write_all(format!("{text}\n").as_bytes())
            .await
            .map_err(|e| SupervisorError::Io(e.to_string()))
    }

    pub async fn get_output(&self, kernel_pid: u64) -> Result<SubprocessOutput, SupervisorError> {
        let map = self.handles.read().await;
        let handle = map.get(&kernel_pid).ok_or(SupervisorError::NotFound(kernel_pid))?;
        Ok(SubprocessOutput {
            stdout: handle.stdout.as_str().to_string(),
            stderr: handle.stderr.as_str().to_string(),
        })
    }

    pub async fn info(&self, kernel_pid: u64) -> Option<SubprocessInfo> {
        let map = self.handles.read().await;
        map.get(&kernel_pid).map(|h| SubprocessInfo {
            kernel_pid,
            os_pid: h.os_pid,
            runtime: h.runtime,
            started_at: h.started_at,
        })
    }

    pub async fn shutdown(&self) {
        let pids: Vec<u64> = self.handles.read().await.keys().copied().collect();
        for pid in pids {
            let _ = self.stop(pid).await;
        }
    }
}

enum UnixSignal {
    Term,
    Stop,
    Cont,
}

#[cfg(unix)]
fn exit_signal(status: &std::process::ExitStatus) -> Option<i32> {
    use std::os::unix::process::ExitStatusExt;
    status.signal()
}

#[cfg(not(unix))]
fn exit_signal(_status: &std::process::ExitStatus) -> Option<i32> {
    None
}
