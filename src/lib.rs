pub mod catalog;
pub mod config;
pub mod digest;
pub mod error;
pub mod ledger;
pub mod model;
pub mod notify;
pub mod queue;
pub mod reporter;
pub mod retailers;
pub mod scheduler;
pub mod store;
pub mod tracing;
pub mod util;
pub mod worker;

pub use error::PipelineError;
