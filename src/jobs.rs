//! Periodic jobs a node runs between process start and shutdown.

use anyhow::Result;
use std::future::Future;
use std::sync::Arc;
use tokio::time::{interval, MissedTickBehavior};

use symmetric_sync_engine::{DirectoryTransport, SyncEngine};

use crate::config::JobSchedule;

/// Runs the route, push, pull, ack and purge jobs of one node over a
/// directory transport.
pub struct JobRunner {
    engine: Arc<SyncEngine>,
    transport: Arc<DirectoryTransport>,
    schedule: JobSchedule,
}

impl JobRunner {
    pub fn new(engine: Arc<SyncEngine>, transport: Arc<DirectoryTransport>, schedule: JobSchedule) -> Self {
        Self {
            engine,
            transport,
            schedule,
        }
    }

    pub async fn route(&self) -> Result<usize> {
        Ok(self.engine.route().await?.unwrap_or(0))
    }

    /// Extract waiting batches for every node this node pushes to.
    pub async fn push(&self) -> Result<usize> {
        self.engine.push_to_all(self.transport.as_ref()).await
    }

    /// Load every payload other nodes left for this node. Returns the number
    /// of batches acknowledged.
    pub async fn pull(&self) -> Result<usize> {
        let mut loaded = 0;
        for source in self.transport.pending_sources().await? {
            let Some(node) = self.engine.config().node(&source).await? else {
                tracing::warn!("Skipping payloads from unknown node {}", source);
                continue;
            };
            if let Some(acks) = self.engine.pull(&node, self.transport.as_ref()).await? {
                loaded += acks.len();
            }
        }
        Ok(loaded)
    }

    /// Apply ack files addressed to this node.
    pub async fn ack(&self) -> Result<usize> {
        let acks = self.transport.take_acks().await?;
        if acks.is_empty() {
            return Ok(0);
        }
        self.engine.ack(&acks).await
    }

    pub async fn purge(&self) -> Result<usize> {
        Ok(self
            .engine
            .purge()
            .await?
            .map(|(stranded, staged)| stranded + staged)
            .unwrap_or(0))
    }

    /// Fire each job on its interval until `shutdown` completes. A failing
    /// job is logged and runs again on its next tick.
    pub async fn run(&self, shutdown: impl Future<Output = ()>) -> Result<()> {
        self.engine.start().await?;
        let mut route = interval(self.schedule.route);
        let mut push = interval(self.schedule.push);
        let mut pull = interval(self.schedule.pull);
        let mut ack = interval(self.schedule.ack);
        let mut purge = interval(self.schedule.purge);
        for timer in [&mut route, &mut push, &mut pull, &mut ack, &mut purge] {
            timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
        }

        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    tracing::info!("Shutting down node {}", self.engine.identity().node_id);
                    return Ok(());
                }
                _ = route.tick() => log_failure("route", self.route().await),
                _ = push.tick() => log_failure("push", self.push().await),
                _ = pull.tick() => log_failure("pull", self.pull().await),
                _ = ack.tick() => log_failure("ack", self.ack().await),
                _ = purge.tick() => log_failure("purge", self.purge().await),
            }
        }
    }
}

fn log_failure(job: &str, result: Result<usize>) {
    match result {
        Ok(0) => {}
        Ok(count) => tracing::debug!("The {} job processed {}", job, count),
        Err(e) => tracing::error!("The {} job failed: {:#}", job, e),
    }
}
