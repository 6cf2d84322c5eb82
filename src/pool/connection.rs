//! Logical connections and the hook that opens them.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;

/// One logical handle to a backend, owned by the pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Connection {
    pub id: u64,
    pub driver: String,
    pub in_use: bool,
    pub created_at: DateTime<Utc>,
    pub last_used_at: DateTime<Utc>,
}

impl Connection {
    pub(crate) fn new(id: u64, driver: &str) -> Self {
        let now = Utc::now();
        Self {
            id,
            driver: driver.to_string(),
            in_use: true,
            created_at: now,
            last_used_at: now,
        }
    }

    pub(crate) fn mark_in_use(&mut self) {
        self.in_use = true;
        self.last_used_at = Utc::now();
    }

    pub(crate) fn mark_idle(&mut self) {
        self.in_use = false;
        self.last_used_at = Utc::now();
    }
}

/// Opens the backend side of a new connection.
///
/// This is the only suspending step of connection creation. The pool has
/// already reserved capacity for the connection when `open` is called.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn open(&self, driver: &str) -> Result<()>;
}

/// Connector for purely logical connections: opening always succeeds.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopConnector;

#[async_trait]
impl Connector for NoopConnector {
    async fn open(&self, _driver: &str) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_connection_is_in_use() {
        let conn = Connection::new(7, "db1");
        assert!(conn.in_use);
        assert_eq!(conn.driver, "db1");
        assert_eq!(conn.created_at, conn.last_used_at);
    }

    #[test]
    fn test_mark_idle_touches_last_used() {
        let mut conn = Connection::new(1, "db1");
        conn.mark_idle();
        assert!(!conn.in_use);
        assert!(conn.last_used_at >= conn.created_at);
        conn.mark_in_use();
        assert!(conn.in_use);
    }

    #[tokio::test]
    async fn test_noop_connector() {
        assert!(NoopConnector.open("anything").await.is_ok());
    }
}
