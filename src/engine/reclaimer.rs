//! Stall recovery: return expired leases on every configured queue to the
//! queue so another worker can pick them up.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{info, warn};

use super::periodic::Handler;
use crate::error::{ErrorList, Result};
use crate::store::QueueStore;

pub struct StallReclaimer {
    queues: Vec<(String, Arc<dyn QueueStore>)>,
}

impl StallReclaimer {
    pub fn new(queues: Vec<(String, Arc<dyn QueueStore>)>) -> Self {
        Self { queues }
    }

    /// Sweep every queue once. Returns the total number of records reclaimed.
    pub async fn sweep(&self) -> Result<u64> {
        let mut total = 0;
        let mut errors = ErrorList::default();

        for (queue, store) in &self.queues {
            match store.reclaim_stalled(queue).await {
                Ok(0) => {}
                Ok(n) => {
                    info!(queue = %queue, reclaimed = n, "reclaimed stalled work records");
                    total += n;
                }
                Err(e) => {
                    warn!(queue = %queue, error = %e, "stall sweep failed");
                    errors.push(e);
                }
            }
        }

        errors.into_result()?;
        Ok(total)
    }
}

#[async_trait]
impl Handler for StallReclaimer {
    async fn handle(&self) -> Result<()> {
        self.sweep().await.map(|_| ())
    }
}
