//! Failover pre-checks.
//!
//! Checks are advisory records: a failing check never prevents the
//! operation from being created. Node I/O failures become failed checks.

use std::time::Duration;

use super::operation::PreCheck;
use crate::config::FailoverConfig;
use crate::pg::{with_timeout, ConnectParams, NodeClient, PgResult, SuperuserLogin};
use crate::registry::{Node, NodeRole, NodeStatus};

pub const SOURCE_IS_PRIMARY: &str = "Source Is Primary";
pub const TARGET_IS_REPLICA: &str = "Target Is Replica";
pub const TARGET_ONLINE: &str = "Target Online";
pub const SOURCE_REACHABLE: &str = "Source Reachable";
pub const TARGET_REACHABLE: &str = "Target Reachable";
pub const REPLICATION_LAG: &str = "Replication Lag";
pub const SOURCE_CONNECTIONS: &str = "Source Connections";

/// Run every pre-check for a source/target pair, in a fixed order.
///
/// The live checks against both nodes run concurrently, each bounded by
/// the configured node timeout.
pub async fn run_prechecks(
    client: &dyn NodeClient,
    login: Option<&SuperuserLogin>,
    source: &Node,
    target: &Node,
    config: &FailoverConfig,
) -> Vec<PreCheck> {
    let mut checks = vec![
        role_check(SOURCE_IS_PRIMARY, source, NodeRole::Primary),
        role_check(TARGET_IS_REPLICA, target, NodeRole::Replica),
        if target.status == NodeStatus::Online {
            PreCheck::pass(TARGET_ONLINE, "Target node is ONLINE")
        } else {
            PreCheck::fail(TARGET_ONLINE, format!("Target node is {}", target.status))
        },
    ];

    let Some(login) = login else {
        let message = "No superuser credential configured";
        checks.extend(
            [SOURCE_REACHABLE, TARGET_REACHABLE, REPLICATION_LAG, SOURCE_CONNECTIONS]
                .into_iter()
                .map(|name| PreCheck::fail(name, message)),
        );
        return checks;
    };

    let timeout = config.node_timeout();
    let source_params = ConnectParams::for_node(source, login);
    let target_params = ConnectParams::for_node(target, login);

    let (source_ping, target_ping, lag, connections) = tokio::join!(
        bounded(timeout, &source_params, client.ping(&source_params)),
        bounded(timeout, &target_params, client.ping(&target_params)),
        bounded(timeout, &target_params, client.replication_lag_ms(&target_params)),
        bounded(timeout, &source_params, client.active_connections(&source_params)),
    );

    checks.push(reachability(SOURCE_REACHABLE, &source_params, source_ping));
    checks.push(reachability(TARGET_REACHABLE, &target_params, target_ping));

    checks.push(match lag {
        Ok(ms) if ms < config.max_replication_lag_ms => PreCheck::pass(
            REPLICATION_LAG,
            format!("Replication lag {}ms", ms),
        ),
        Ok(ms) => PreCheck::fail(
            REPLICATION_LAG,
            format!(
                "Replication lag {}ms exceeds {}ms",
                ms, config.max_replication_lag_ms
            ),
        ),
        Err(err) => PreCheck::fail(REPLICATION_LAG, format!("Could not measure lag: {}", err)),
    });

    checks.push(match connections {
        Ok(n) if n < config.max_active_connections => {
            PreCheck::pass(SOURCE_CONNECTIONS, format!("{} active connections", n))
        }
        Ok(n) => PreCheck::fail(
            SOURCE_CONNECTIONS,
            format!(
                "{} active connections exceeds {}",
                n, config.max_active_connections
            ),
        ),
        Err(err) => PreCheck::fail(
            SOURCE_CONNECTIONS,
            format!("Could not count connections: {}", err),
        ),
    });

    checks
}

async fn bounded<T>(
    timeout: Duration,
    params: &ConnectParams,
    fut: impl std::future::Future<Output = PgResult<T>>,
) -> PgResult<T> {
    with_timeout(timeout, params.address(), fut).await
}

fn role_check(name: &str, node: &Node, expected: NodeRole) -> PreCheck {
    if node.role == expected {
        PreCheck::pass(name, format!("{} is {}", node.name, expected))
    } else {
        PreCheck::fail(name, format!("{} is {}, expected {}", node.name, node.role, expected))
    }
}

fn reachability(name: &str, params: &ConnectParams, result: PgResult<()>) -> PreCheck {
    match result {
        Ok(()) => PreCheck::pass(name, format!("{} is reachable", params.address())),
        Err(err) => PreCheck::fail(name, err.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pg::FakeFleet;
    use uuid::Uuid;

    fn login() -> SuperuserLogin {
        SuperuserLogin {
            username: "postgres".into(),
            password: "pw".into(),
            ssl: false,
        }
    }

    fn pair() -> (Node, Node) {
        let cluster = Uuid::new_v4();
        (
            Node::new(cluster, "a", "10.0.0.1", 5432, NodeRole::Primary),
            Node::new(cluster, "b", "10.0.0.2", 5432, NodeRole::Replica),
        )
    }

    fn check<'a>(checks: &'a [PreCheck], name: &str) -> &'a PreCheck {
        checks.iter().find(|c| c.name == name).unwrap()
    }

    #[tokio::test]
    async fn test_all_checks_pass() {
        let fleet = FakeFleet::new();
        let (source, target) = pair();
        fleet.add_node(&source, "pw");
        fleet.add_node(&target, "pw");

        let checks =
            run_prechecks(&fleet, Some(&login()), &source, &target, &FailoverConfig::default())
                .await;
        assert_eq!(checks.len(), 7);
        assert!(checks.iter().all(|c| c.passed), "{checks:?}");
    }

    #[tokio::test]
    async fn test_lag_over_threshold_fails_only_that_check() {
        let fleet = FakeFleet::new();
        let (source, target) = pair();
        fleet.add_node(&source, "pw");
        fleet.add_node(&target, "pw");
        fleet.update(&target.address(), |n| n.replication_lag_ms = 6000);

        let checks =
            run_prechecks(&fleet, Some(&login()), &source, &target, &FailoverConfig::default())
                .await;
        assert!(!check(&checks, REPLICATION_LAG).passed);
        assert_eq!(checks.iter().filter(|c| !c.passed).count(), 1);
    }

    #[tokio::test]
    async fn test_unreachable_source() {
        let fleet = FakeFleet::new();
        let (source, target) = pair();
        fleet.add_node(&source, "pw");
        fleet.add_node(&target, "pw");
        fleet.update(&source.address(), |n| n.reachable = false);

        let checks =
            run_prechecks(&fleet, Some(&login()), &source, &target, &FailoverConfig::default())
                .await;
        assert!(!check(&checks, SOURCE_REACHABLE).passed);
        assert!(!check(&checks, SOURCE_CONNECTIONS).passed);
        assert!(check(&checks, TARGET_REACHABLE).passed);
    }

    #[tokio::test]
    async fn test_swapped_roles_and_no_credential() {
        let fleet = FakeFleet::new();
        let (source, target) = pair();

        let checks =
            run_prechecks(&fleet, None, &target, &source, &FailoverConfig::default()).await;
        assert!(!check(&checks, SOURCE_IS_PRIMARY).passed);
        assert!(!check(&checks, TARGET_IS_REPLICA).passed);
        assert!(!check(&checks, SOURCE_REACHABLE).passed);
        assert_eq!(checks.len(), 7);
    }
}
