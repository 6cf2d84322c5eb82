mod connection;
mod manager;
mod stats;

pub use connection::*;
pub use manager::*;
pub use stats::*;
