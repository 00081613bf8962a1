//! Worker pool supervisor.
//!
//! Launches N worker processes, each a fresh invocation of this
//! executable's `worker` subcommand with its own stable identifier, and
//! keeps them alive: a worker that exits is restarted under the same id
//! after a short delay. The broker is pre-flighted once before the pool
//! starts so workers are not spawned against a dead broker.

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use thiserror::Error;
use tokio::process::{Child, Command};
use tracing::{info, warn};

use crate::queue::{QueueNames, TaskQueue};

/// Errors that can occur while supervising the pool.
#[derive(Debug, Error)]
pub enum SupervisorError {
    /// The broker pre-flight check failed; the pool was not started.
    #[error("Broker unreachable, refusing to start workers: {0}")]
    BrokerUnreachable(String),

    /// Spawning or signalling a worker process failed.
    #[error("Process error: {0}")]
    Process(#[from] std::io::Error),

    /// The named worker is not managed by this supervisor.
    #[error("Worker '{0}' not found")]
    WorkerNotFound(String),
}

/// Pool configuration.
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Number of worker processes to run.
    pub num_workers: usize,
    /// Broker connection URL, passed through to each worker.
    pub broker_url: String,
    /// Log level passed to each worker.
    pub log_level: String,
    /// How often the monitor checks worker liveness.
    pub check_interval: Duration,
    /// Delay before restarting a dead worker.
    pub restart_delay: Duration,
    /// Delay between successive spawns during startup.
    pub spawn_stagger: Duration,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            num_workers: 3,
            broker_url: "redis://localhost:6379".to_string(),
            log_level: "info".to_string(),
            check_interval: Duration::from_secs(30),
            restart_delay: Duration::from_secs(2),
            spawn_stagger: Duration::from_secs(1),
        }
    }
}

impl SupervisorConfig {
    pub fn new(num_workers: usize) -> Self {
        Self {
            num_workers,
            ..Default::default()
        }
    }

    pub fn with_broker_url(mut self, url: impl Into<String>) -> Self {
        self.broker_url = url.into();
        self
    }

    pub fn with_log_level(mut self, level: impl Into<String>) -> Self {
        self.log_level = level.into();
        self
    }

    pub fn with_check_interval(mut self, interval: Duration) -> Self {
        self.check_interval = interval;
        self
    }

    pub fn with_restart_delay(mut self, delay: Duration) -> Self {
        self.restart_delay = delay;
        self
    }

    pub fn with_spawn_stagger(mut self, delay: Duration) -> Self {
        self.spawn_stagger = delay;
        self
    }
}

/// Liveness of one supervised worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerStatus {
    Running { pid: Option<u32> },
    Stopped { exit_code: Option<i32> },
}

impl WorkerStatus {
    pub fn is_running(&self) -> bool {
        matches!(self, WorkerStatus::Running { .. })
    }
}

impl fmt::Display for WorkerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkerStatus::Running { pid: Some(pid) } => write!(f, "running (pid {pid})"),
            WorkerStatus::Running { pid: None } => write!(f, "running"),
            WorkerStatus::Stopped {
                exit_code: Some(code),
            } => write!(f, "stopped (exit code: {code})"),
            WorkerStatus::Stopped { exit_code: None } => write!(f, "stopped (killed)"),
        }
    }
}

/// Manages a pool of worker processes.
pub struct WorkerSupervisor {
    config: SupervisorConfig,
    workers: BTreeMap<String, Child>,
    /// Program and base arguments used to spawn a worker; defaults to
    /// re-invoking the current executable's `worker` subcommand.
    worker_command: Option<(String, Vec<String>)>,
}

impl WorkerSupervisor {
    pub fn new(config: SupervisorConfig) -> Self {
        Self {
            config,
            workers: BTreeMap::new(),
            worker_command: None,
        }
    }

    /// Overrides the spawned command. Used by tests.
    pub fn with_worker_command(
        mut self,
        program: impl Into<String>,
        base_args: Vec<String>,
    ) -> Self {
        self.worker_command = Some((program.into(), base_args));
        self
    }

    /// Checks the broker once before starting the pool.
    pub async fn preflight_broker(&self) -> Result<(), SupervisorError> {
        let queue = TaskQueue::connect(&self.config.broker_url, QueueNames::default())
            .await
            .map_err(|e| SupervisorError::BrokerUnreachable(e.to_string()))?;
        queue
            .declare()
            .await
            .map_err(|e| SupervisorError::BrokerUnreachable(e.to_string()))?;
        info!("Broker pre-flight check passed");
        Ok(())
    }

    /// Starts one worker under the given id.
    pub fn start_worker(&mut self, worker_id: &str) -> Result<(), SupervisorError> {
        if let Some(child) = self.workers.get_mut(worker_id) {
            if child.try_wait()?.is_none() {
                warn!(worker_id, "Worker already running, not starting another");
                return Ok(());
            }
        }

        let (program, base_args) = match &self.worker_command {
            Some((program, args)) => (program.clone(), args.clone()),
            None => {
                let exe = std::env::current_exe()?;
                (exe.to_string_lossy().into_owned(), vec!["worker".to_string()])
            }
        };

        let child = Command::new(&program)
            .args(&base_args)
            .arg("--worker-id")
            .arg(worker_id)
            .arg("--log-level")
            .arg(&self.config.log_level)
            .env("BROKER_URL", &self.config.broker_url)
            .kill_on_drop(true)
            .spawn()?;

        info!(worker_id, pid = ?child.id(), "Started worker");
        self.workers.insert(worker_id.to_string(), child);
        Ok(())
    }

    /// Pre-flights the broker, then starts the configured number of
    /// workers as `worker-1..worker-N`.
    pub async fn start_all(&mut self) -> Result<(), SupervisorError> {
        self.preflight_broker().await?;

        info!(num_workers = self.config.num_workers, "Starting worker pool");
        for i in 1..=self.config.num_workers {
            self.start_worker(&format!("worker-{i}"))?;
            if i < self.config.num_workers {
                tokio::time::sleep(self.config.spawn_stagger).await;
            }
        }
        Ok(())
    }

    /// Stops one worker without disturbing the others.
    ///
    /// The child stays in the pool until the kill succeeds, so a failed
    /// kill leaves it managed and retryable.
    pub async fn stop_worker(&mut self, worker_id: &str) -> Result<(), SupervisorError> {
        let child = self
            .workers
            .get_mut(worker_id)
            .ok_or_else(|| SupervisorError::WorkerNotFound(worker_id.to_string()))?;

        if child.try_wait()?.is_none() {
            child.kill().await?;
        }
        self.workers.remove(worker_id);
        info!(worker_id, "Stopped worker");
        Ok(())
    }

    /// Stops every worker in the pool.
    pub async fn stop_all(&mut self) -> Result<(), SupervisorError> {
        let ids: Vec<String> = self.workers.keys().cloned().collect();
        for id in ids {
            self.stop_worker(&id).await?;
        }
        info!("Worker pool stopped");
        Ok(())
    }

    /// Restarts one worker under the same id after the configured delay.
    pub async fn restart_worker(&mut self, worker_id: &str) -> Result<(), SupervisorError> {
        if self.workers.contains_key(worker_id) {
            self.stop_worker(worker_id).await?;
        }
        tokio::time::sleep(self.config.restart_delay).await;
        self.start_worker(worker_id)
    }

    /// Per-worker liveness snapshot.
    pub fn status(&mut self) -> Result<BTreeMap<String, WorkerStatus>, SupervisorError> {
        let mut statuses = BTreeMap::new();
        for (id, child) in self.workers.iter_mut() {
            let status = match child.try_wait()? {
                None => WorkerStatus::Running { pid: child.id() },
                Some(exit) => WorkerStatus::Stopped {
                    exit_code: exit.code(),
                },
            };
            statuses.insert(id.clone(), status);
        }
        Ok(statuses)
    }

    /// One monitoring pass: restarts workers that have exited. Returns
    /// the ids that were restarted.
    pub async fn restart_dead_workers(&mut self) -> Result<Vec<String>, SupervisorError> {
        let mut dead = Vec::new();
        for (id, child) in self.workers.iter_mut() {
            if let Some(exit) = child.try_wait()? {
                warn!(worker_id = %id, exit_code = ?exit.code(), "Worker exited unexpectedly");
                dead.push(id.clone());
            }
        }

        for id in &dead {
            info!(worker_id = %id, "Restarting dead worker");
            self.restart_worker(id).await?;
        }
        Ok(dead)
    }

    /// Monitors the pool until cancelled, restarting dead workers at the
    /// configured interval.
    pub async fn monitor(&mut self) -> Result<(), SupervisorError> {
        info!(
            check_interval_secs = self.config.check_interval.as_secs(),
            "Worker monitoring started"
        );
        loop {
            tokio::time::sleep(self.config.check_interval).await;
            self.restart_dead_workers().await?;
        }
    }

    /// Number of workers currently managed (running or not).
    pub fn pool_size(&self) -> usize {
        self.workers.len()
    }
}
