//! Control plane: owns the periodic routines and the queue API server, and
//! stops them together.

use std::time::Duration;

use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use super::periodic::PeriodicRoutine;
use crate::error::Result;
use crate::server::{Readiness, Server};

/// Intervals for the built-in routines.
#[derive(Debug, Clone)]
pub struct ControlConfig {
    /// Period between discovery passes.
    pub enqueuer_interval: Duration,
    /// Period between stall sweeps.
    pub reclaim_interval: Duration,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            enqueuer_interval: Duration::from_secs(12 * 60 * 60),
            reclaim_interval: Duration::from_secs(15),
        }
    }
}

/// The process-wide driver. Routines and the server coordinate only through
/// the store; the control plane just starts and stops them.
pub struct ControlPlane {
    routines: Vec<PeriodicRoutine>,
    server: Option<Server>,
    readiness: Readiness,
    shutdown: CancellationToken,
}

impl ControlPlane {
    pub fn new(readiness: Readiness) -> Self {
        Self {
            routines: Vec::new(),
            server: None,
            readiness,
            shutdown: CancellationToken::new(),
        }
    }

    pub fn routine(mut self, routine: PeriodicRoutine) -> Self {
        self.routines.push(routine);
        self
    }

    pub fn server(mut self, server: Server) -> Self {
        self.server = Some(server);
        self
    }

    /// A token that stops the control plane when cancelled.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Signal the control plane to shut down.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Mark the process ready, then run every routine and the server until
    /// shutdown. A server failure shuts everything else down too.
    pub async fn run(self) -> Result<()> {
        let mut tasks = JoinSet::new();

        for routine in self.routines {
            let token = self.shutdown.child_token();
            tasks.spawn(async move {
                routine.run(token).await;
                Ok(())
            });
        }

        self.readiness.mark_ready();
        info!("control plane ready");

        if let Some(server) = self.server {
            let token = self.shutdown.child_token();
            tasks.spawn(async move { server.run(token).await });
        }

        let mut first_error = None;
        while let Some(joined) = tasks.join_next().await {
            let result = match joined {
                Ok(result) => result,
                Err(e) => {
                    error!(error = %e, "control plane task panicked");
                    Err(crate::error::Error::Other(format!("task failed: {e}")))
                }
            };
            if let Err(e) = result {
                warn!(error = %e, "control plane task exited with error, shutting down");
                self.shutdown.cancel();
                first_error.get_or_insert(e);
            }
        }

        info!("control plane stopped");
        first_error.map_or(Ok(()), Err)
    }
}
