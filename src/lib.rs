pub mod config;
pub mod error;
pub mod plugin;
pub mod pool;
pub mod query;
pub mod runtime;

pub use config::RuntimeConfig;
pub use error::{Error, Result};
pub use runtime::Runtime;
