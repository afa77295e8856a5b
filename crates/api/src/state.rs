//! Application state

use std::sync::Arc;

use sqlx::PgPool;
use winback_recovery::{
    InMemoryRecordStore, InMemoryStatsStore, InvariantChecker, RecoveryConfig, RecoveryResult,
    RecoveryService,
};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub recovery: Arc<RecoveryService>,
    /// Only available when running on Postgres
    pub invariants: Option<Arc<InvariantChecker>>,
}

impl AppState {
    pub fn new(recovery: Arc<RecoveryService>, invariants: Option<Arc<InvariantChecker>>) -> Self {
        Self {
            recovery,
            invariants,
        }
    }

    pub fn postgres(config: &RecoveryConfig, pool: PgPool) -> RecoveryResult<Self> {
        let recovery = RecoveryService::postgres(config, pool.clone())?;
        Ok(Self::new(
            Arc::new(recovery),
            Some(Arc::new(InvariantChecker::new(pool))),
        ))
    }

    /// Real collaborators over in-memory stores; data is lost on restart
    pub fn in_memory(config: &RecoveryConfig) -> RecoveryResult<Self> {
        let recovery = RecoveryService::from_config(
            config,
            Arc::new(InMemoryRecordStore::new()),
            Arc::new(InMemoryStatsStore::new()),
        )?;
        Ok(Self::new(Arc::new(recovery), None))
    }
}
