/// Query descriptors, the driver boundary and the plugin pipeline.
///
/// ```text
/// QueryDescriptor
///       ↓
/// validate          every validator, resolved order
///       ↓
/// before_query      waterfall, resolved order
///       ↓
/// Driver::execute   external collaborator
///       ↓
/// after_query       waterfall, same resolved order
///       ↓
/// Rows
/// ```
pub mod driver;
pub mod pipeline;
pub mod types;

pub use driver::Driver;
pub use pipeline::{PipelineContext, QueryOutcome, QueryPipeline, ValidationPolicy};
pub use types::*;
