pub mod config;
pub mod error;
pub mod normalize;
pub mod safety;
pub mod telemetry;
pub mod types;

pub use config::Config;
pub use error::{DriftnetError, Result};
pub use normalize::normalize_url;
pub use safety::*;
pub use types::*;
