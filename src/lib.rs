pub mod analysis;
pub mod config;
pub mod data;
pub mod error;
pub mod format;
pub mod model;
pub mod pipeline;
pub mod remote;
pub mod request;
pub mod server;

pub use config::AppConfig;
pub use error::{DataError, ModelError, ServiceError};
pub use format::FormatTag;
pub use pipeline::{AnalysisInputs, AnalysisOutcome, AnalysisPipeline};
pub use server::build_router;
