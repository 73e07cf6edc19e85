//! Worker-process engine adapter.
//!
//! Each document gets its own engine worker, spawned as
//! `command args.. <document path>`. The worker talks line-delimited JSON:
//!
//! ```text
//! worker -> {"ok": {"state": {..}, "bond_graph": {"x": ["y"]}}}   (after first run)
//! server -> {"method": "apply_bonds", "bonds": {"x": {"value": 3}}}
//! worker -> {"ok": {"ran_ids": ["y"], "state": {..}}}
//!        |  {"error": "message"}
//! server -> {"method": "shutdown"}
//! ```
//!
//! The worker's stderr is inherited so engine diagnostics land in the
//! daemon's own output. A dedicated task owns each worker's pipes and reads
//! the reply to every request it writes, whether or not the caller is still
//! waiting. Dropping the live handle shuts the worker down; a worker whose
//! task is torn down with the runtime is killed.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::{
    BondGraph, BondValues, CellId, EngineError, LiveNotebook, LoadedNotebook, NotebookEngine,
    NotebookState, Recomputed,
};

/// How long a worker gets to exit after a shutdown request.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Commands that may wait for a worker. Callers already take turns, so one
/// is in flight and at most one more is queued behind it.
const COMMAND_QUEUE_DEPTH: usize = 2;

/// Worker command line and environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessEngineConfig {
    /// Program followed by its leading arguments.
    pub command: Vec<String>,
    /// Working directory for workers, if not the daemon's.
    pub cwd: Option<PathBuf>,
}

/// Engine that runs one worker process per document.
#[derive(Debug, Clone)]
pub struct ProcessEngine {
    config: ProcessEngineConfig,
}

impl ProcessEngine {
    /// Creates an engine from its command configuration.
    #[must_use]
    pub const fn new(config: ProcessEngineConfig) -> Self {
        Self { config }
    }

    fn command_for(&self, path: &Path) -> Result<Command, EngineError> {
        let (program, args) =
            self.config
                .command
                .split_first()
                .ok_or_else(|| EngineError::Spawn {
                    path: path.display().to_string(),
                    message: "engine command is empty".to_string(),
                })?;

        let mut cmd = Command::new(program);
        cmd.args(args)
            .arg(path)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);
        if let Some(cwd) = &self.config.cwd {
            cmd.current_dir(cwd);
        }
        Ok(cmd)
    }
}

#[derive(Serialize)]
#[serde(tag = "method", rename_all = "snake_case")]
enum WorkerRequest<'a> {
    ApplyBonds { bonds: &'a BondValues },
    Shutdown,
}

#[derive(Deserialize)]
#[serde(rename_all = "snake_case")]
enum WorkerReply<T> {
    Ok(T),
    Error(String),
}

#[derive(Deserialize)]
struct LoadReply {
    state: NotebookState,
    #[serde(default)]
    bond_graph: BondGraph,
}

#[derive(Deserialize)]
struct RecomputeReply {
    ran_ids: Vec<CellId>,
    state: NotebookState,
}

#[async_trait]
impl NotebookEngine for ProcessEngine {
    async fn load(&self, path: &Path) -> Result<LoadedNotebook, EngineError> {
        let path_str = path.display().to_string();
        let mut child = self
            .command_for(path)?
            .spawn()
            .map_err(|e| EngineError::Spawn {
                path: path_str.clone(),
                message: e.to_string(),
            })?;

        let (Some(stdin), Some(stdout)) = (child.stdin.take(), child.stdout.take()) else {
            return Err(EngineError::Spawn {
                path: path_str,
                message: "worker pipes unavailable".to_string(),
            });
        };

        let mut worker = WorkerChannel {
            child,
            stdin,
            stdout: BufReader::new(stdout).lines(),
        };

        let reply = match worker.read_reply::<LoadReply>().await {
            Ok(WorkerReply::Ok(reply)) => reply,
            Ok(WorkerReply::Error(message)) => {
                return Err(EngineError::Load {
                    path: path_str,
                    message,
                });
            },
            Err(e) => {
                return Err(EngineError::Load {
                    path: path_str,
                    message: e.to_string(),
                });
            },
        };

        debug!(
            path = %path_str,
            bonds = reply.bond_graph.len(),
            "engine worker ready"
        );

        let (commands, receiver) = mpsc::channel(COMMAND_QUEUE_DEPTH);
        let driver = tokio::spawn(drive_worker(path_str.clone(), worker, receiver));

        Ok(LoadedNotebook {
            live: Box::new(ProcessNotebook {
                path: path_str,
                commands,
                driver: Some(driver),
                bond_graph: reply.bond_graph,
            }),
            state: reply.state,
        })
    }
}

struct WorkerChannel {
    child: Child,
    stdin: ChildStdin,
    stdout: Lines<BufReader<ChildStdout>>,
}

impl WorkerChannel {
    async fn send(&mut self, request: &WorkerRequest<'_>) -> Result<(), EngineError> {
        let mut line = serde_json::to_vec(request)
            .map_err(|e| EngineError::Protocol(format!("request encode failed: {e}")))?;
        line.push(b'\n');
        self.stdin.write_all(&line).await?;
        self.stdin.flush().await?;
        Ok(())
    }

    async fn read_reply<T: DeserializeOwned>(&mut self) -> Result<WorkerReply<T>, EngineError> {
        let line = self
            .stdout
            .next_line()
            .await?
            .ok_or(EngineError::WorkerExited)?;
        serde_json::from_str(&line)
            .map_err(|e| EngineError::Protocol(format!("unreadable worker reply: {e}")))
    }

    async fn recompute(&mut self, bonds: &BondValues) -> Result<Recomputed, EngineError> {
        self.send(&WorkerRequest::ApplyBonds { bonds }).await?;
        match self.read_reply::<RecomputeReply>().await? {
            WorkerReply::Ok(reply) => Ok(Recomputed {
                ran_ids: reply.ran_ids,
                state: reply.state,
            }),
            WorkerReply::Error(message) => Err(EngineError::Recompute(message)),
        }
    }

    async fn shutdown(&mut self, path: &str) {
        if let Err(e) = self.send(&WorkerRequest::Shutdown).await {
            debug!(path = %path, error = %e, "shutdown request not delivered");
        }
        match tokio::time::timeout(SHUTDOWN_GRACE, self.child.wait()).await {
            Ok(Ok(status)) => debug!(path = %path, %status, "engine worker exited"),
            Ok(Err(e)) => warn!(path = %path, error = %e, "failed to reap engine worker"),
            Err(_) => {
                warn!(path = %path, "engine worker ignored shutdown, killing");
                if let Err(e) = self.child.kill().await {
                    warn!(path = %path, error = %e, "failed to kill engine worker");
                }
            },
        }
    }
}

/// Work handed to the task that owns a worker's pipes.
enum WorkerCommand {
    ApplyBonds {
        bonds: BondValues,
        reply: oneshot::Sender<Result<Recomputed, EngineError>>,
    },
    Shutdown,
}

/// Owns the worker and answers commands one at a time.
///
/// Every request written to the worker has its reply read here, even when the
/// caller that asked for it has gone away, so the pipe never holds a reply
/// meant for an earlier request.
async fn drive_worker(
    path: String,
    mut worker: WorkerChannel,
    mut commands: mpsc::Receiver<WorkerCommand>,
) {
    while let Some(command) = commands.recv().await {
        match command {
            WorkerCommand::ApplyBonds { bonds, reply } => {
                let result = worker.recompute(&bonds).await;
                if reply.send(result).is_err() {
                    debug!(path = %path, "recompute finished after its caller left");
                }
            },
            WorkerCommand::Shutdown => break,
        }
    }
    worker.shutdown(&path).await;
}

/// A document held by a running worker process.
struct ProcessNotebook {
    path: String,
    commands: mpsc::Sender<WorkerCommand>,
    driver: Option<JoinHandle<()>>,
    bond_graph: BondGraph,
}

#[async_trait]
impl LiveNotebook for ProcessNotebook {
    async fn apply_bonds(&mut self, bonds: BondValues) -> Result<Recomputed, EngineError> {
        let (reply, answer) = oneshot::channel();
        self.commands
            .send(WorkerCommand::ApplyBonds { bonds, reply })
            .await
            .map_err(|_| EngineError::WorkerExited)?;
        answer.await.map_err(|_| EngineError::WorkerExited)?
    }

    fn bond_graph(&self) -> BondGraph {
        self.bond_graph.clone()
    }

    async fn shutdown(&mut self) {
        let Some(driver) = self.driver.take() else {
            return;
        };
        if self.commands.send(WorkerCommand::Shutdown).await.is_err() {
            debug!(path = %self.path, "engine worker task already stopped");
        }
        if let Err(e) = driver.await {
            warn!(path = %self.path, error = %e, "engine worker task failed");
        }
    }
}
