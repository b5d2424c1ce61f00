//! Control-plane wiring.
//!
//! Builds every service over one set of stores, one node client and one
//! audit sink, and owns the background tasks the server runs.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::task::JoinHandle;

use crate::audit::{AuditSink, FileAuditLog, MemoryAuditLog};
use crate::config::ControlPlaneConfig;
use crate::credential::{Actor, CredentialEngine, CredentialError, RotationCheck};
use crate::failover::{FailoverOrchestrator, FailoverResult, FailoverWorker};
use crate::federation::{FederationService, NullTransport, SyncTransport};
use crate::pg::{NodeClient, PgNodeClient};
use crate::registry::NodeRegistry;
use crate::store::{Entity, FileRepository, MemoryRepository, Repository, StoreResult};

/// Source of entity collections.
trait Stores {
    fn repo<T: Entity>(&self) -> StoreResult<Arc<dyn Repository<T>>>;
}

/// One directory per collection under the data directory.
struct FileStores {
    root: PathBuf,
}

impl Stores for FileStores {
    fn repo<T: Entity>(&self) -> StoreResult<Arc<dyn Repository<T>>> {
        Ok(Arc::new(FileRepository::<T>::open(&self.root)?))
    }
}

struct MemoryStores;

impl Stores for MemoryStores {
    fn repo<T: Entity>(&self) -> StoreResult<Arc<dyn Repository<T>>> {
        Ok(Arc::new(MemoryRepository::<T>::new()))
    }
}

/// Every service of one control-plane instance.
pub struct ControlPlane {
    config: ControlPlaneConfig,
    registry: Arc<NodeRegistry>,
    failover: Arc<FailoverOrchestrator>,
    credentials: Arc<CredentialEngine>,
    federation: Arc<FederationService>,
    audit: Arc<dyn AuditSink>,
}

impl ControlPlane {
    /// Open the persistent control plane under `config.data_dir`, talking to
    /// real Postgres nodes.
    pub fn open(config: ControlPlaneConfig) -> StoreResult<Self> {
        let audit: Arc<dyn AuditSink> = Arc::new(FileAuditLog::open(&config.audit_log_path())?);
        let client: Arc<dyn NodeClient> = Arc::new(PgNodeClient::new(config.failover.node_timeout()));
        let stores = FileStores {
            root: config.data_dir.join("state"),
        };
        Self::assemble(&stores, config, client, audit, Arc::new(NullTransport))
    }

    /// In-memory control plane over the given node client and transport.
    pub fn in_memory(
        config: ControlPlaneConfig,
        client: Arc<dyn NodeClient>,
        transport: Arc<dyn SyncTransport>,
    ) -> StoreResult<Self> {
        Self::assemble(
            &MemoryStores,
            config,
            client,
            Arc::new(MemoryAuditLog::new()),
            transport,
        )
    }

    fn assemble(
        stores: &impl Stores,
        config: ControlPlaneConfig,
        client: Arc<dyn NodeClient>,
        audit: Arc<dyn AuditSink>,
        transport: Arc<dyn SyncTransport>,
    ) -> StoreResult<Self> {
        let registry = Arc::new(NodeRegistry::new(stores.repo()?, stores.repo()?, stores.repo()?));
        let credentials = Arc::new(CredentialEngine::new(
            stores.repo()?,
            stores.repo()?,
            stores.repo()?,
            registry.clone(),
            client.clone(),
            audit.clone(),
            config.credential.clone(),
        ));
        let failover = Arc::new(FailoverOrchestrator::new(
            registry.clone(),
            stores.repo()?,
            client,
            credentials.clone(),
            audit.clone(),
            config.failover.clone(),
        ));
        let federation = Arc::new(FederationService::new(
            stores.repo()?,
            stores.repo()?,
            stores.repo()?,
            stores.repo()?,
            registry.clone(),
            transport,
            audit.clone(),
            config.federation.clone(),
        ));

        Ok(Self {
            config,
            registry,
            failover,
            credentials,
            federation,
            audit,
        })
    }

    pub fn config(&self) -> &ControlPlaneConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<NodeRegistry> {
        &self.registry
    }

    pub fn failover(&self) -> &Arc<FailoverOrchestrator> {
        &self.failover
    }

    pub fn credentials(&self) -> &Arc<CredentialEngine> {
        &self.credentials
    }

    pub fn federation(&self) -> &Arc<FederationService> {
        &self.federation
    }

    pub fn audit(&self) -> &Arc<dyn AuditSink> {
        &self.audit
    }

    // =========================================================================
    // BACKGROUND TASKS
    // =========================================================================

    /// Start the failover worker, resuming interrupted operations, and the
    /// rotation and federation pollers.
    pub fn spawn_background(&self) -> FailoverResult<Vec<JoinHandle<()>>> {
        let worker = FailoverWorker::new(self.failover.clone());
        let resumed = worker.resume_interrupted()?;
        if resumed > 0 {
            tracing::info!(resumed, "resumed interrupted failovers");
        }

        let rotation_every = Duration::from_secs(self.config.credential.check_interval_secs.max(1));
        let poll_every = Duration::from_secs(self.config.federation.poll_interval_secs.max(1));

        Ok(vec![
            worker.spawn(),
            tokio::spawn(rotation_loop(self.credentials.clone(), rotation_every)),
            tokio::spawn(federation_loop(self.federation.clone(), poll_every)),
        ])
    }
}

/// Rotate on schedule and propagate the new password.
async fn rotation_loop(credentials: Arc<CredentialEngine>, every: Duration) {
    let actor = Actor::system();
    let mut ticker = tokio::time::interval(every);
    loop {
        ticker.tick().await;
        match credentials.check_rotation(&actor, false).await {
            Ok(RotationCheck::Rotated { .. }) => {
                if let Err(err) = credentials.propagate_all(&actor).await {
                    tracing::error!(error = %err, "propagation after scheduled rotation failed");
                }
            }
            Ok(RotationCheck::NotDue { days_remaining }) => {
                tracing::debug!(days_remaining, "credential rotation not due");
            }
            Err(CredentialError::NotInitialized) => {
                tracing::debug!("no superuser credential configured");
            }
            Err(err) => tracing::error!(error = %err, "scheduled rotation check failed"),
        }
    }
}

/// Resolve expired promotion requests.
async fn federation_loop(federation: Arc<FederationService>, every: Duration) {
    let mut ticker = tokio::time::interval(every);
    loop {
        ticker.tick().await;
        match federation.resolve_expired_promotions(Utc::now()).await {
            Ok(resolved) if !resolved.is_empty() => {
                tracing::info!(count = resolved.len(), "resolved expired promotion requests");
            }
            Ok(_) => {}
            Err(err) => tracing::error!(error = %err, "promotion timeout poll failed"),
        }
    }
}
