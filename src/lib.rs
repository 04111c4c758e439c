pub mod aggregate;
pub mod catalog;
pub mod config;
pub mod constants;
pub mod error;
pub mod found;
pub mod logging;
pub mod matomo;
pub mod notify;
pub mod observability;
pub mod parser;
pub mod pipeline;
pub mod queue;
pub mod store;
pub mod taxonomy;

pub use config::Config;
pub use error::{MetricsError, Result};
pub use pipeline::{Pipeline, RunSummary};
