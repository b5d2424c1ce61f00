//! Credential Rotation Tests
//!
//! End-to-end rotation and propagation against a simulated fleet:
//! - History is bounded and newest-first
//! - Propagation tries the current password first
//! - Nodes on an older password are repaired
//! - Unreachable passwords raise exactly one open alert per node
//! - A stalled node times out without holding up the rest of the fleet
//! - Rotation never interleaves with an in-flight propagation

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use pgfleet::audit::MemoryAuditLog;
use pgfleet::config::CredentialConfig;
use pgfleet::credential::{
    Actor, CredentialEngine, CredentialStatus, PropagationStatus, SuperuserCredential,
};
use pgfleet::pg::{ConnectParams, FakeFleet, NodeClient, PgResult, ReplicationSlot, WalActivity};
use pgfleet::registry::{Node, NodeRegistry, NodeRole};
use pgfleet::store::{MemoryRepository, Repository};

struct Harness {
    engine: CredentialEngine,
    credentials: Arc<MemoryRepository<SuperuserCredential>>,
    registry: Arc<NodeRegistry>,
    fleet: Arc<FakeFleet>,
    audit: Arc<MemoryAuditLog>,
}

impl Harness {
    fn new() -> Self {
        let fleet = Arc::new(FakeFleet::new());
        Self::with_client(fleet.clone(), fleet, CredentialConfig::default())
    }

    /// Engine talking to `fleet` through `client`.
    fn with_client(
        fleet: Arc<FakeFleet>,
        client: Arc<dyn NodeClient>,
        config: CredentialConfig,
    ) -> Self {
        let credentials = Arc::new(MemoryRepository::new());
        let registry = Arc::new(NodeRegistry::in_memory());
        let audit = Arc::new(MemoryAuditLog::new());
        let engine = CredentialEngine::new(
            credentials.clone(),
            Arc::new(MemoryRepository::new()),
            Arc::new(MemoryRepository::new()),
            registry.clone(),
            client,
            audit.clone(),
            config,
        );
        Self {
            engine,
            credentials,
            registry,
            fleet,
            audit,
        }
    }

    fn credential(&self) -> SuperuserCredential {
        self.credentials.list().unwrap().remove(0)
    }

    /// Register a node whose live password is `password`.
    fn node(&self, name: &str, host: &str, password: &str) -> Node {
        let cluster = match self.registry.list_clusters().unwrap().into_iter().next() {
            Some(cluster) => cluster,
            None => self.registry.create_cluster("orders").unwrap(),
        };
        let node = self
            .registry
            .register_node(Node::new(cluster.id, name, host, 5432, NodeRole::Replica))
            .unwrap();
        self.fleet.add_node(&node, password);
        node
    }
}

fn admin() -> Actor {
    Actor::new("admin", true)
}

/// Fake fleet whose logins take `delay`, or hang on the `stalled` address.
/// Tracks how many logins are in flight at once.
struct SlowLogins {
    fleet: Arc<FakeFleet>,
    delay: Duration,
    stalled: Option<String>,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
}

impl SlowLogins {
    fn new(fleet: Arc<FakeFleet>, delay: Duration, stalled: Option<String>) -> Self {
        Self {
            fleet,
            delay,
            stalled,
            in_flight: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        }
    }

    fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl NodeClient for SlowLogins {
    async fn ping(&self, target: &ConnectParams) -> PgResult<()> {
        self.fleet.ping(target).await
    }

    async fn authenticate(&self, target: &ConnectParams) -> PgResult<()> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        let _guard = InFlight(&self.in_flight);
        self.peak.fetch_max(now, Ordering::SeqCst);
        if self.stalled.as_deref() == Some(target.address().as_str()) {
            tokio::time::sleep(Duration::from_secs(30)).await;
        }
        tokio::time::sleep(self.delay).await;
        self.fleet.authenticate(target).await
    }

    async fn is_in_recovery(&self, target: &ConnectParams) -> PgResult<bool> {
        self.fleet.is_in_recovery(target).await
    }

    async fn current_wal_lsn(&self, target: &ConnectParams) -> PgResult<String> {
        self.fleet.current_wal_lsn(target).await
    }

    async fn replication_lag_ms(&self, target: &ConnectParams) -> PgResult<u64> {
        self.fleet.replication_lag_ms(target).await
    }

    async fn active_connections(&self, target: &ConnectParams) -> PgResult<u64> {
        self.fleet.active_connections(target).await
    }

    async fn terminate_backends(
        &self,
        target: &ConnectParams,
        excluded_users: &[String],
    ) -> PgResult<u64> {
        self.fleet.terminate_backends(target, excluded_users).await
    }

    async fn promote(&self, target: &ConnectParams, wait: bool, timeout_secs: u32) -> PgResult<bool> {
        self.fleet.promote(target, wait, timeout_secs).await
    }

    async fn set_password(
        &self,
        target: &ConnectParams,
        user: &str,
        new_password: &str,
    ) -> PgResult<()> {
        self.fleet.set_password(target, user, new_password).await
    }

    async fn replication_slots(&self, target: &ConnectParams) -> PgResult<Vec<ReplicationSlot>> {
        self.fleet.replication_slots(target).await
    }

    async fn wal_activity(&self, target: &ConnectParams) -> PgResult<WalActivity> {
        self.fleet.wal_activity(target).await
    }
}

// =============================================================================
// Rotation
// =============================================================================

/// The password current before a rotation becomes history[0] after it.
#[tokio::test]
async fn test_rotation_pushes_previous_password_to_front() {
    let h = Harness::new();
    h.engine.initialize(&admin()).await.unwrap();

    for _ in 0..3 {
        let before = h.credential().current_password;
        h.engine.rotate(&admin()).await.unwrap();
        let after = h.credential();
        assert_eq!(after.password_history[0], before);
        assert_ne!(after.current_password, before);
        assert!(after.password_history.len() <= 6);
    }
}

/// Seven rotations keep the six most recently superseded passwords.
#[tokio::test]
async fn test_seven_rotations_drop_oldest() {
    let h = Harness::new();
    h.engine.initialize(&admin()).await.unwrap();

    let mut superseded = Vec::new();
    for _ in 0..7 {
        superseded.push(h.credential().current_password);
        h.engine.rotate(&admin()).await.unwrap();
    }

    let credential = h.credential();
    let expected: Vec<String> = superseded.iter().rev().take(6).cloned().collect();
    assert_eq!(credential.password_history, expected);
    assert!(!credential.password_history.contains(&superseded[0]));
}

/// Rotation without MFA is refused and leaves the credential untouched.
#[tokio::test]
async fn test_rotation_requires_mfa() {
    let h = Harness::new();
    h.engine.initialize(&admin()).await.unwrap();
    let before = h.credential();

    assert!(h.engine.rotate(&Actor::new("admin", false)).await.is_err());
    assert_eq!(h.credential(), before);
}

// =============================================================================
// Propagation
// =============================================================================

/// A node already on the current password is not altered.
#[tokio::test]
async fn test_current_password_tried_first() {
    let h = Harness::new();
    h.engine.initialize(&admin()).await.unwrap();
    let current = h.credential().current_password;
    let node = h.node("a", "10.0.0.1", &current);

    let result = h.engine.propagate(&admin(), node.id).await.unwrap();
    assert_eq!(result.status, PropagationStatus::Success);
    assert_eq!(result.password_used.as_deref(), Some("current"));

    let attempts = h.fleet.calls_to(&node.address(), "authenticate");
    assert_eq!(attempts.len(), 1);
    assert_eq!(attempts[0].password, current);
    assert!(h.fleet.calls_to(&node.address(), "set_password").is_empty());
}

/// A node on history[i] is logged into with that password and updated.
#[tokio::test]
async fn test_history_password_is_repaired() {
    let h = Harness::new();
    h.engine.initialize(&admin()).await.unwrap();
    h.engine.rotate(&admin()).await.unwrap();
    h.engine.rotate(&admin()).await.unwrap();

    let credential = h.credential();
    let node = h.node("a", "10.0.0.1", &credential.password_history[1]);

    let result = h.engine.propagate(&admin(), node.id).await.unwrap();
    assert_eq!(result.status, PropagationStatus::Success);
    assert_eq!(result.password_used.as_deref(), Some("history_1"));
    assert_eq!(
        h.fleet.node(&node.address()).unwrap().password,
        credential.current_password
    );

    let tried: Vec<String> = h
        .fleet
        .calls_to(&node.address(), "authenticate")
        .into_iter()
        .map(|c| c.password)
        .collect();
    assert_eq!(
        tried,
        vec![
            credential.current_password.clone(),
            credential.password_history[0].clone(),
            credential.password_history[1].clone(),
        ]
    );
}

/// Two full propagations against a lost node raise one open alert.
#[tokio::test]
async fn test_reenrollment_alert_is_deduplicated() {
    let h = Harness::new();
    h.engine.initialize(&admin()).await.unwrap();
    let current = h.credential().current_password;
    h.node("good", "10.0.0.1", &current);
    let lost = h.node("lost", "10.0.0.2", "nobody-knows-this");

    for _ in 0..2 {
        let report = h.engine.propagate_all(&admin()).await.unwrap();
        assert_eq!(report.succeeded, 1);
        assert_eq!(report.needs_reenrollment, 1);
        assert_eq!(report.credential_status, CredentialStatus::NeedsReenrollment);
    }

    let alerts = h.engine.alerts(false).unwrap();
    assert_eq!(alerts.len(), 1);
    assert_eq!(alerts[0].node_id, lost.id);
    assert_eq!(h.credential().status, CredentialStatus::NeedsReenrollment);

    // Once resolved, a new failure raises a fresh alert.
    h.engine.resolve_alert(&admin(), alerts[0].id).unwrap();
    h.engine.propagate_all(&admin()).await.unwrap();
    assert_eq!(h.engine.alerts(false).unwrap().len(), 1);
    assert_eq!(h.engine.alerts(true).unwrap().len(), 2);
}

/// Results are ordered by node id and an unreachable node is FAILED, not
/// re-enrollment.
#[tokio::test]
async fn test_propagate_all_orders_results_and_isolates_failures() {
    let h = Harness::new();
    h.engine.initialize(&admin()).await.unwrap();
    let current = h.credential().current_password;
    let mut nodes = vec![
        h.node("a", "10.0.0.1", &current),
        h.node("b", "10.0.0.2", &current),
        h.node("c", "10.0.0.3", &current),
    ];
    h.fleet.update(&nodes[1].address(), |n| n.reachable = false);

    let report = h.engine.propagate_all(&admin()).await.unwrap();
    nodes.sort_by_key(|n| n.id);
    let ids: Vec<_> = report.results.iter().map(|r| r.node_id).collect();
    assert_eq!(ids, nodes.iter().map(|n| n.id).collect::<Vec<_>>());
    assert_eq!(report.failed, 1);
    assert_eq!(report.succeeded, 2);
    assert_eq!(report.credential_status, CredentialStatus::Active);
    assert!(h.engine.alerts(false).unwrap().is_empty());
    assert!(!h.audit.is_empty());
}

/// A node that never answers is FAILED with a timeout after the node budget
/// while the rest of the fleet is still brought in line, at most
/// `propagation_concurrency` logins at a time.
#[tokio::test]
async fn test_stalled_node_times_out_within_concurrency_bound() {
    let fleet = Arc::new(FakeFleet::new());
    let client = Arc::new(SlowLogins::new(
        fleet.clone(),
        Duration::from_millis(50),
        Some("10.0.0.3:5432".into()),
    ));
    let config = CredentialConfig {
        node_timeout_secs: 1,
        propagation_concurrency: 2,
        ..CredentialConfig::default()
    };
    let h = Harness::with_client(fleet, client.clone(), config);
    h.engine.initialize(&admin()).await.unwrap();
    let current = h.credential().current_password;
    let mut nodes = vec![
        h.node("a", "10.0.0.1", &current),
        h.node("b", "10.0.0.2", &current),
        h.node("stalled", "10.0.0.3", &current),
        h.node("d", "10.0.0.4", &current),
        h.node("e", "10.0.0.5", &current),
    ];

    let started = std::time::Instant::now();
    let report = h.engine.propagate_all(&admin()).await.unwrap();
    assert!(started.elapsed() < Duration::from_secs(5));

    assert_eq!(report.succeeded, 4);
    assert_eq!(report.failed, 1);
    assert_eq!(report.credential_status, CredentialStatus::Active);
    nodes.sort_by_key(|n| n.id);
    let ids: Vec<_> = report.results.iter().map(|r| r.node_id).collect();
    assert_eq!(ids, nodes.iter().map(|n| n.id).collect::<Vec<_>>());

    let stalled = report
        .results
        .iter()
        .find(|r| r.status == PropagationStatus::Failed)
        .unwrap();
    assert_eq!(h.registry.get_node(stalled.node_id).unwrap().name, "stalled");
    assert!(stalled
        .error_message
        .as_deref()
        .unwrap()
        .contains("timed out after 1s"));
    assert!(h.engine.alerts(false).unwrap().is_empty());
    assert!(client.peak() <= 2, "peak concurrency {}", client.peak());
    assert_eq!(client.peak(), 2);
}

/// A rotation requested while a propagation is mid-flight waits for it, so
/// the node's row never claims SUCCESS for a password that is no longer
/// current.
#[tokio::test]
async fn test_rotation_waits_for_inflight_propagation() {
    let fleet = Arc::new(FakeFleet::new());
    let client = Arc::new(SlowLogins::new(fleet.clone(), Duration::from_millis(100), None));
    let h = Harness::with_client(fleet, client, CredentialConfig::default());
    h.engine.initialize(&admin()).await.unwrap();
    let first = h.credential().current_password;
    let node = h.node("a", "10.0.0.1", &first);

    let propagator = admin();
    let (report, rotated) = tokio::join!(h.engine.propagate_all(&propagator), async {
        tokio::time::sleep(Duration::from_millis(20)).await;
        h.engine.rotate(&admin()).await
    });
    let report = report.unwrap();
    rotated.unwrap();

    // The fan-out finished against the old password before rotation began.
    assert_eq!(report.succeeded, 1);
    assert_eq!(report.results[0].password_used.as_deref(), Some("current"));

    let latest = h.credential();
    assert_eq!(latest.password_history[0], first);
    assert_eq!(latest.status, CredentialStatus::Syncing);
    assert_eq!(h.fleet.node(&node.address()).unwrap().password, first);
    let rows = h.engine.status().unwrap().propagations;
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].status, PropagationStatus::Pending);
    assert!(rows[0].password_used.is_none());

    let repaired = h.engine.propagate(&admin(), node.id).await.unwrap();
    assert_eq!(repaired.status, PropagationStatus::Success);
    assert_eq!(repaired.password_used.as_deref(), Some("history_0"));
    assert_eq!(
        h.fleet.node(&node.address()).unwrap().password,
        h.credential().current_password
    );
}

/// Same ordering for a single-node propagation.
#[tokio::test]
async fn test_rotation_waits_for_single_node_propagation() {
    let fleet = Arc::new(FakeFleet::new());
    let client = Arc::new(SlowLogins::new(fleet.clone(), Duration::from_millis(100), None));
    let h = Harness::with_client(fleet, client, CredentialConfig::default());
    h.engine.initialize(&admin()).await.unwrap();
    let first = h.credential().current_password;
    let node = h.node("a", "10.0.0.1", &first);

    let propagator = admin();
    let (result, rotated) = tokio::join!(h.engine.propagate(&propagator, node.id), async {
        tokio::time::sleep(Duration::from_millis(20)).await;
        h.engine.rotate(&admin()).await
    });
    assert_eq!(result.unwrap().password_used.as_deref(), Some("current"));
    rotated.unwrap();

    let rows = h.engine.status().unwrap().propagations;
    assert_eq!(rows[0].status, PropagationStatus::Pending);
    assert_ne!(
        h.fleet.node(&node.address()).unwrap().password,
        h.credential().current_password
    );
}
