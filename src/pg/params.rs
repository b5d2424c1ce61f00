//! Connection parameters.

use std::fmt;

use crate::registry::Node;

/// Everything needed to open a control connection to one node.
#[derive(Clone, PartialEq, Eq)]
pub struct ConnectParams {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub database: String,
    pub ssl: bool,
}

impl ConnectParams {
    /// Parameters for `node` using the given login.
    pub fn for_node(node: &Node, login: &SuperuserLogin) -> Self {
        Self::with_password(node, login, &login.password)
    }

    /// Parameters for `node` with an explicit password, used when trying
    /// older passwords from the rotation history.
    pub fn with_password(node: &Node, login: &SuperuserLogin, password: &str) -> Self {
        Self {
            host: node.host.clone(),
            port: node.port,
            user: login.username.clone(),
            password: password.to_string(),
            database: node.database.clone(),
            ssl: login.ssl,
        }
    }

    /// `host:port`.
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

// Passwords never reach logs.
impl fmt::Debug for ConnectParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectParams")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("password", &"<redacted>")
            .field("database", &self.database)
            .field("ssl", &self.ssl)
            .finish()
    }
}

/// The superuser login the control plane currently uses.
#[derive(Clone, PartialEq, Eq)]
pub struct SuperuserLogin {
    pub username: String,
    pub password: String,
    pub ssl: bool,
}

impl fmt::Debug for SuperuserLogin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SuperuserLogin")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("ssl", &self.ssl)
            .finish()
    }
}

/// Source of the current superuser login.
pub trait CredentialSource: Send + Sync {
    /// `None` until a credential has been initialized.
    fn superuser(&self) -> Option<SuperuserLogin>;
}

/// Fixed login, for tests and single-node tooling.
#[derive(Debug, Clone)]
pub struct StaticCredentials(pub SuperuserLogin);

impl StaticCredentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self(SuperuserLogin {
            username: username.into(),
            password: password.into(),
            ssl: false,
        })
    }
}

impl CredentialSource for StaticCredentials {
    fn superuser(&self) -> Option<SuperuserLogin> {
        Some(self.0.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::NodeRole;
    use uuid::Uuid;

    #[test]
    fn test_debug_redacts_password() {
        let node = Node::new(Uuid::new_v4(), "pg", "db.internal", 5433, NodeRole::Replica);
        let login = SuperuserLogin {
            username: "postgres".into(),
            password: "hunter2-secret".into(),
            ssl: true,
        };
        let params = ConnectParams::for_node(&node, &login);
        let rendered = format!("{:?} {:?}", params, login);
        assert!(!rendered.contains("hunter2-secret"));
        assert_eq!(params.address(), "db.internal:5433");
        assert!(params.ssl);
    }
}
