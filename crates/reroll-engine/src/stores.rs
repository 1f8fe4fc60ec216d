//! Store wiring for the configured backend.
//!
//! The `memory` backend keeps everything in process. The `dragonfly`
//! backend puts entities in `Dragonfly`, the timeline in `PostgreSQL`, and
//! turns on the `PostgreSQL` notification log.

use std::sync::Arc;

use reroll_core::config::{InfrastructureConfig, StoreBackend};
use reroll_core::store::{EntityStore, MemoryStore, TimelineStore};
use reroll_db::{ColdStore, DragonflyPool, NotificationLog};
use tracing::info;

use crate::error::EngineBinError;

/// Stores the engine runs on.
pub struct StoreHandles {
    /// Participant and God Pack records.
    pub entities: Arc<dyn EntityStore>,
    /// Timeline snapshots.
    pub timeline: Arc<dyn TimelineStore>,
    /// Durable notification history, when the backend has one.
    pub notification_log: Option<NotificationLog>,
    /// `PostgreSQL` pool to close on shutdown.
    pub postgres: Option<ColdStore>,
}

/// Connect the stores named by `infra.backend`.
///
/// # Errors
///
/// Returns [`EngineBinError::Db`] if a connection or migration fails.
pub async fn connect(infra: &InfrastructureConfig) -> Result<StoreHandles, EngineBinError> {
    match infra.backend {
        StoreBackend::Memory => {
            info!("Using in-memory store; state is lost on restart");
            let store = Arc::new(MemoryStore::new());
            Ok(StoreHandles {
                entities: store.clone(),
                timeline: store,
                notification_log: None,
                postgres: None,
            })
        }
        StoreBackend::Dragonfly => {
            let dragonfly = DragonflyPool::connect(&infra.dragonfly_url).await?;
            let postgres = ColdStore::open(&infra.postgres_url, infra.postgres_max_connections).await?;
            Ok(StoreHandles {
                entities: Arc::new(dragonfly),
                timeline: Arc::new(postgres.timeline()),
                notification_log: Some(postgres.notification_log()),
                postgres: Some(postgres),
            })
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn memory_backend_needs_no_services() {
        let handles = connect(&InfrastructureConfig::default()).await.unwrap();
        assert!(handles.notification_log.is_none());
        assert!(handles.postgres.is_none());
        assert!(handles.entities.list_participants().await.unwrap().is_empty());
    }
}
