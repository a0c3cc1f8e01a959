//! Multi-process supervisor.
//!
//! Spawns `cluster.workers` copies of the current executable, each with
//! `HERALD_WORKER_ID` set and binding the same port with `SO_REUSEPORT`.
//! Workers that exit unexpectedly are restarted after a delay. Broadcast
//! control messages written by one worker are relayed to every other one.
//! On shutdown every worker is sent `shutdown`, given a grace period, and then
//! killed.

use crate::config::Config;
use crate::worker::{ControlMessage, WORKER_ID_ENV};
use anyhow::{Context, Result};
use dashmap::DashMap;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

type WorkerId = usize;

/// Line writers of the live workers.
#[derive(Debug, Default)]
pub struct RelayHub {
    workers: DashMap<WorkerId, mpsc::UnboundedSender<String>>,
}

impl RelayHub {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a worker's writer, replacing a previous incarnation.
    pub fn attach(&self, id: WorkerId, writer: mpsc::UnboundedSender<String>) {
        self.workers.insert(id, writer);
    }

    pub fn detach(&self, id: WorkerId) {
        self.workers.remove(&id);
    }

    /// Forward a line from worker `from` to every other worker.
    ///
    /// Returns the number of workers it was queued for.
    pub fn relay(&self, from: WorkerId, line: &str) -> usize {
        let mut sent = 0;
        for worker in self.workers.iter() {
            if *worker.key() == from {
                continue;
            }
            if worker.value().send(line.to_string()).is_ok() {
                sent += 1;
            }
        }
        sent
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.workers.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }
}

/// The supervisor.
pub struct Supervisor {
    workers: usize,
    restart_delay: Duration,
    shutdown_grace: Duration,
    hub: Arc<RelayHub>,
}

impl Supervisor {
    #[must_use]
    pub fn new(config: &Config) -> Self {
        Self {
            workers: config.cluster.worker_count(),
            restart_delay: Duration::from_millis(config.cluster.restart_delay_ms),
            shutdown_grace: Duration::from_millis(config.cluster.shutdown_grace_ms),
            hub: Arc::new(RelayHub::new()),
        }
    }

    /// Run the workers until `shutdown` is cancelled and they have exited.
    ///
    /// # Errors
    ///
    /// Returns an error if the current executable cannot be located.
    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        let exe = std::env::current_exe().context("Failed to locate current executable")?;
        let args: Vec<_> = std::env::args_os().skip(1).collect();
        info!(workers = self.workers, "Starting supervisor");

        let mut slots = JoinSet::new();
        for id in 0..self.workers {
            let slot = WorkerSlot {
                id,
                exe: exe.clone(),
                args: args.clone(),
                restart_delay: self.restart_delay,
                shutdown_grace: self.shutdown_grace,
                hub: self.hub.clone(),
            };
            slots.spawn(slot.run(shutdown.clone()));
        }

        while slots.join_next().await.is_some() {}
        info!("All workers stopped");
        Ok(())
    }
}

/// One worker position, restarted as long as the supervisor runs.
struct WorkerSlot {
    id: WorkerId,
    exe: std::path::PathBuf,
    args: Vec<std::ffi::OsString>,
    restart_delay: Duration,
    shutdown_grace: Duration,
    hub: Arc<RelayHub>,
}

impl WorkerSlot {
    async fn run(self, shutdown: CancellationToken) {
        while !shutdown.is_cancelled() {
            let mut child = match self.spawn() {
                Ok(child) => child,
                Err(e) => {
                    error!(worker = self.id, error = %e, "Failed to spawn worker");
                    if self.wait_restart(&shutdown).await {
                        continue;
                    }
                    break;
                }
            };
            let pid = child.id();
            info!(worker = self.id, pid, "Worker started");

            let (writer_tx, writer_rx) = mpsc::unbounded_channel();
            if let Some(stdin) = child.stdin.take() {
                tokio::spawn(pump_stdin(self.id, stdin, writer_rx));
            }
            if let Some(stdout) = child.stdout.take() {
                tokio::spawn(pump_stdout(self.id, stdout, self.hub.clone()));
            }
            self.hub.attach(self.id, writer_tx.clone());

            tokio::select! {
                status = child.wait() => {
                    self.hub.detach(self.id);
                    match status {
                        Ok(status) if shutdown.is_cancelled() => {
                            info!(worker = self.id, %status, "Worker exited");
                        }
                        Ok(status) => {
                            warn!(worker = self.id, %status, "Worker exited unexpectedly");
                        }
                        Err(e) => error!(worker = self.id, error = %e, "Failed to wait for worker"),
                    }
                    if !self.wait_restart(&shutdown).await {
                        break;
                    }
                }
                _ = shutdown.cancelled() => {
                    self.stop(&mut child, &writer_tx).await;
                    self.hub.detach(self.id);
                    break;
                }
            }
        }
    }

    fn spawn(&self) -> std::io::Result<Child> {
        Command::new(&self.exe)
            .args(&self.args)
            .env(WORKER_ID_ENV, self.id.to_string())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
    }

    /// Sleep before a restart. Returns `false` if shutdown began meanwhile.
    async fn wait_restart(&self, shutdown: &CancellationToken) -> bool {
        tokio::select! {
            _ = shutdown.cancelled() => false,
            _ = tokio::time::sleep(self.restart_delay) => true,
        }
    }

    async fn stop(&self, child: &mut Child, writer: &mpsc::UnboundedSender<String>) {
        if let Ok(line) = ControlMessage::Shutdown.to_line() {
            let _ = writer.send(line);
        }
        match tokio::time::timeout(self.shutdown_grace, child.wait()).await {
            Ok(Ok(status)) => info!(worker = self.id, %status, "Worker stopped"),
            Ok(Err(e)) => error!(worker = self.id, error = %e, "Failed to wait for worker"),
            Err(_) => {
                warn!(worker = self.id, "Worker did not stop in time, killing");
                if let Err(e) = child.kill().await {
                    error!(worker = self.id, error = %e, "Failed to kill worker");
                }
            }
        }
    }
}

async fn pump_stdin(
    id: WorkerId,
    mut stdin: ChildStdin,
    mut lines: mpsc::UnboundedReceiver<String>,
) {
    while let Some(line) = lines.recv().await {
        if let Err(e) = stdin.write_all(line.as_bytes()).await {
            debug!(worker = id, error = %e, "Worker stdin closed");
            break;
        }
        if stdin.flush().await.is_err() {
            break;
        }
    }
}

async fn pump_stdout(id: WorkerId, stdout: ChildStdout, hub: Arc<RelayHub>) {
    let mut lines = BufReader::new(stdout).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => match ControlMessage::from_line(&line) {
                Ok(ControlMessage::Broadcast { .. }) => {
                    let mut line = line;
                    line.push('\n');
                    hub.relay(id, &line);
                }
                Ok(ControlMessage::Shutdown) => {
                    debug!(worker = id, "Ignoring shutdown sent by worker");
                }
                Err(e) => debug!(worker = id, error = %e, "Discarding worker output"),
            },
            Ok(None) => break,
            Err(e) => {
                debug!(worker = id, error = %e, "Worker stdout failed");
                break;
            }
        }
    }
}

/// Wait for SIGINT or SIGTERM.
pub async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => info!("Received SIGINT, shutting down"),
                    _ = sigterm.recv() => info!("Received SIGTERM, shutting down"),
                }
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                let _ = tokio::signal::ctrl_c().await;
                info!("Received SIGINT, shutting down");
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        info!("Received SIGINT, shutting down");
    }
}
