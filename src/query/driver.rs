//! The driver boundary.
//!
//! A driver executes a fully transformed query against a real backend. The
//! runtime only knows drivers by the name they are registered under, which is
//! also the key used for connection pool accounting.

use anyhow::Result;
use async_trait::async_trait;

use super::types::{QueryDescriptor, Rows};
use crate::pool::Connection;

#[async_trait]
pub trait Driver: Send + Sync {
    /// Run `query` and return its rows. `connection` is the pooled handle
    /// leased for this execution, when the caller leased one.
    async fn execute(&self, query: &QueryDescriptor, connection: Option<&Connection>)
        -> Result<Rows>;
}
