//! Spawning worker subprocesses.
//!
//! A worker is any program that speaks the framed protocol on its
//! stdin/stdout. Its stderr is inherited so worker logs land next to the
//! master's.

use std::process::Stdio;

use tokio::process::{Child, Command};

use crate::master::WorkerConnection;

#[derive(Debug, thiserror::Error)]
pub enum SpawnError {
    #[error("failed to spawn process: {0}")]
    Spawn(#[from] std::io::Error),
    #[error("spawn failed: {0}")]
    Other(String),
}

/// Extension point for different worker spawn strategies.
pub trait WorkerSpawner: Send + Sync {
    fn spawn(&self) -> Result<Child, SpawnError>;
}

/// Runs `program args...` with piped stdin/stdout.
#[derive(Debug, Clone)]
pub struct CommandSpawner {
    program: String,
    args: Vec<String>,
}

impl CommandSpawner {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Re-runs the current executable in worker mode.
    pub fn current_exe(worker_arg: &str) -> Result<Self, SpawnError> {
        let exe = std::env::current_exe()?;
        let program = exe
            .to_str()
            .ok_or_else(|| SpawnError::Other(format!("non UTF-8 executable path: {:?}", exe)))?;
        Ok(Self::new(program).arg(worker_arg))
    }
}

impl WorkerSpawner for CommandSpawner {
    fn spawn(&self) -> Result<Child, SpawnError> {
        let child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()?;
        tracing::debug!(program = %self.program, pid = ?child.id(), "Spawned worker process");
        Ok(child)
    }
}

/// Spawns `count` workers and wraps each in a connection ready to register.
pub fn spawn_workers(
    spawner: &dyn WorkerSpawner,
    count: usize,
) -> Result<Vec<WorkerConnection>, SpawnError> {
    (0..count)
        .map(|_| -> Result<WorkerConnection, SpawnError> {
            let child = spawner.spawn()?;
            Ok(WorkerConnection::from_child(child)?)
        })
        .collect()
}
