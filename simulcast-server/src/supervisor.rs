//! Worker process supervision
//!
//! The primary process forks one worker per CPU (configurable) and
//! restarts any worker that exits. Respawns are rate-limited with a
//! sliding time window per worker slot: a slot that respawns more than
//! `max_respawns` times inside `window` backs off before the next spawn,
//! so a crash-looping worker cannot starve the host.

use crate::config::ServerConfig;
use simulcast_common::Result;
use std::collections::VecDeque;
use std::path::PathBuf;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Respawn rate limiting per worker slot
#[derive(Debug, Clone)]
pub struct RespawnPolicy {
    pub max_respawns: usize,
    pub window: Duration,
    pub backoff: Duration,
    /// How long a worker gets to exit after a shutdown signal before it
    /// is killed
    pub shutdown_grace: Duration,
}

impl Default for RespawnPolicy {
    fn default() -> Self {
        Self {
            max_respawns: 5,
            window: Duration::from_secs(60),
            backoff: Duration::from_secs(5),
            shutdown_grace: Duration::from_secs(5),
        }
    }
}

/// Sliding-window counter deciding whether a slot must back off.
///
/// Kept separate from the spawn loop so the policy is testable without
/// spawning processes.
#[derive(Debug)]
pub struct RespawnWindow {
    policy: RespawnPolicy,
    respawns: VecDeque<Instant>,
}

impl RespawnWindow {
    pub fn new(policy: RespawnPolicy) -> Self {
        Self {
            policy,
            respawns: VecDeque::new(),
        }
    }

    /// Record one respawn at `now`; returns the backoff to apply before
    /// the next spawn, if the window is saturated.
    pub fn record(&mut self, now: Instant) -> Option<Duration> {
        while let Some(&front) = self.respawns.front() {
            if now.duration_since(front) > self.policy.window {
                self.respawns.pop_front();
            } else {
                break;
            }
        }
        self.respawns.push_back(now);
        if self.respawns.len() > self.policy.max_respawns {
            Some(self.policy.backoff)
        } else {
            None
        }
    }
}

/// Run the supervisor: spawn workers, restart on exit, stop on signal
pub async fn run(
    config: &ServerConfig,
    config_path: Option<PathBuf>,
    policy: RespawnPolicy,
) -> Result<()> {
    let worker_count = config.effective_workers();
    info!("Supervising {} worker processes", worker_count);

    let shutdown = CancellationToken::new();
    let mut slots = Vec::with_capacity(worker_count);
    for slot in 0..worker_count {
        let port = config.base_port + slot as u16;
        slots.push(tokio::spawn(manage_slot(
            slot,
            port,
            worker_count,
            config_path.clone(),
            policy.clone(),
            shutdown.child_token(),
        )));
    }

    tokio::signal::ctrl_c().await?;
    info!("Supervisor shutting down workers");
    shutdown.cancel();
    for slot in slots {
        let _ = slot.await;
    }
    info!("All workers stopped");
    Ok(())
}

/// Keep one worker slot occupied until shutdown
async fn manage_slot(
    slot: usize,
    port: u16,
    worker_count: usize,
    config_path: Option<PathBuf>,
    policy: RespawnPolicy,
    shutdown: CancellationToken,
) {
    let exe = match std::env::current_exe() {
        Ok(exe) => exe,
        Err(e) => {
            error!("Worker slot {}: cannot locate executable: {}", slot, e);
            return;
        }
    };
    let mut window = RespawnWindow::new(policy.clone());

    loop {
        let mut command = tokio::process::Command::new(&exe);
        command.arg("--worker").arg("--port").arg(port.to_string());
        // Workers must know the deployment size to gate the push stream
        command.arg("--workers").arg(worker_count.to_string());
        if let Some(path) = &config_path {
            command.arg("--config").arg(path);
        }
        command.kill_on_drop(true);

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(e) => {
                error!("Worker slot {} failed to spawn: {}", slot, e);
                tokio::time::sleep(policy.backoff).await;
                continue;
            }
        };
        info!("Worker slot {} listening on port {} (pid {:?})", slot, port, child.id());

        tokio::select! {
            status = child.wait() => {
                match status {
                    Ok(status) => warn!("Worker slot {} exited: {}", slot, status),
                    Err(e) => error!("Worker slot {} wait failed: {}", slot, e),
                }
                if shutdown.is_cancelled() {
                    return;
                }
                if let Some(backoff) = window.record(Instant::now()) {
                    warn!(
                        "Worker slot {} respawning too fast, backing off {:?}",
                        slot, backoff
                    );
                    tokio::time::sleep(backoff).await;
                }
            }
            _ = shutdown.cancelled() => {
                let _ = child.start_kill();
                match tokio::time::timeout(policy.shutdown_grace, child.wait()).await {
                    Ok(_) => info!("Worker slot {} stopped", slot),
                    Err(_) => {
                        warn!("Worker slot {} did not exit within grace, killing", slot);
                        let _ = child.kill().await;
                    }
                }
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> RespawnPolicy {
        RespawnPolicy {
            max_respawns: 3,
            window: Duration::from_secs(10),
            backoff: Duration::from_secs(2),
            shutdown_grace: Duration::from_secs(1),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn respawns_within_limit_do_not_back_off() {
        let mut window = RespawnWindow::new(policy());
        let now = Instant::now();
        assert_eq!(window.record(now), None);
        assert_eq!(window.record(now), None);
        assert_eq!(window.record(now), None);
    }

    #[tokio::test(start_paused = true)]
    async fn saturated_window_backs_off() {
        let mut window = RespawnWindow::new(policy());
        let now = Instant::now();
        for _ in 0..3 {
            assert_eq!(window.record(now), None);
        }
        assert_eq!(window.record(now), Some(Duration::from_secs(2)));
    }

    #[tokio::test(start_paused = true)]
    async fn old_respawns_fall_out_of_the_window() {
        let mut window = RespawnWindow::new(policy());
        let start = Instant::now();
        for _ in 0..3 {
            assert_eq!(window.record(start), None);
        }
        // Far enough in the future that the earlier respawns expired
        tokio::time::advance(Duration::from_secs(11)).await;
        assert_eq!(window.record(Instant::now()), None);
    }
}
