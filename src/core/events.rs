use crate::core::error::ErrorKind;
use crate::core::jobs::BatchSummary;
use crate::core::model::{JobId, Resource, ResourceId};
use crate::core::pool::GenerationId;
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::broadcast;

#[derive(Debug, Clone)]
pub enum EngineEvent {
    AnalysisStarted { job_id: JobId, url: String },
    ResourcesFound { job_id: JobId, resources: Vec<Resource> },
    AnalysisFailed { job_id: JobId, kind: ErrorKind, reason: String },
    DownloadStarted { resource_id: ResourceId, attempt: u32 },
    Progress {
        resource_id: ResourceId,
        /// `None` while the total is unknown.
        fraction: Option<f64>,
        downloaded: u64,
        total: Option<u64>,
    },
    MergeStarted { resource_id: ResourceId, segments: usize },
    Retrying { resource_id: ResourceId, attempt: u32, delay: Duration, reason: String },
    Paused { resource_id: ResourceId },
    Resumed { resource_id: ResourceId },
    Completed { resource_id: ResourceId, path: PathBuf },
    Failed { resource_id: ResourceId, kind: ErrorKind, reason: String },
    Cancelled { resource_id: ResourceId },
    BatchFinished { job_id: JobId, summary: BatchSummary },
    PoolRestarted { generation: GenerationId },
}

impl EngineEvent {
    pub fn resource_id(&self) -> Option<&ResourceId> {
        match self {
            EngineEvent::DownloadStarted { resource_id, .. }
            | EngineEvent::Progress { resource_id, .. }
            | EngineEvent::MergeStarted { resource_id, .. }
            | EngineEvent::Retrying { resource_id, .. }
            | EngineEvent::Paused { resource_id }
            | EngineEvent::Resumed { resource_id }
            | EngineEvent::Completed { resource_id, .. }
            | EngineEvent::Failed { resource_id, .. }
            | EngineEvent::Cancelled { resource_id } => Some(resource_id),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            EngineEvent::Completed { .. } | EngineEvent::Failed { .. } | EngineEvent::Cancelled { .. }
        )
    }
}

/// Many-listener fan-out. Publishing with nobody subscribed is a no-op.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<EngineEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(16));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.tx.subscribe()
    }

    pub fn publish(&self, event: EngineEvent) {
        let _ = self.tx.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn publish_without_listeners_is_silent() {
        let bus = EventBus::new(4);
        bus.publish(EngineEvent::PoolRestarted { generation: 1 });
        let rx = bus.subscribe();
        drop(rx);
        bus.publish(EngineEvent::PoolRestarted { generation: 2 });
    }

    #[tokio::test]
    async fn listeners_see_publish_order() {
        let bus = EventBus::new(8);
        let mut a = bus.subscribe();
        let mut b = bus.subscribe();
        let id = ResourceId::from_raw("r1");
        bus.publish(EngineEvent::DownloadStarted { resource_id: id.clone(), attempt: 1 });
        bus.publish(EngineEvent::Cancelled { resource_id: id.clone() });
        for rx in [&mut a, &mut b] {
            assert!(matches!(rx.recv().await.unwrap(), EngineEvent::DownloadStarted { attempt: 1, .. }));
            let last = rx.recv().await.unwrap();
            assert!(last.is_terminal());
            assert_eq!(last.resource_id(), Some(&id));
        }
    }
}
