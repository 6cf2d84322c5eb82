/// Plugin model, registry and lifecycle.
///
/// ```text
/// register()        registry.rs   canonical set, registration order
///     ↓
/// resolve_order()   registry.rs   dependency-first topological order
///     ↓
/// setup()           lifecycle.rs  forward, rollback in reverse on failure
///     ↓
/// teardown()        lifecycle.rs  reverse of setup
/// ```
pub mod lifecycle;
pub mod manifest;
pub mod registry;
pub mod types;

pub use lifecycle::LifecycleManager;
pub use manifest::PluginManifest;
pub use registry::PluginRegistry;
pub use types::*;
