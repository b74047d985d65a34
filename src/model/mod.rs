mod adapter;
mod loader;
mod runtime;
mod types;

pub use adapter::{ModelAdapter, Predict, WindowConfig};
pub use loader::{ModelLoader, ModelSource};
pub use runtime::{LinearEstimator, ModelRuntime, PickleRuntime, RuntimeRegistry};
pub use types::{Estimator, LoadOptions, TimeSeries};
