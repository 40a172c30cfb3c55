pub mod bridge;
pub mod extract;
pub mod fetcher;
pub mod handlers;
pub mod pipeline;
pub mod questions;
pub mod repair;
pub mod scheduler;
pub mod sidecar;
pub mod sweeper;

pub use bridge::ServiceRouter;
pub use fetcher::{FetchOutcome, FetchParams, Fetcher};
pub use pipeline::{JobContext, Pipeline, SourceHandler};
pub use repair::RepairPolicy;
pub use scheduler::Scheduler;
pub use sweeper::Sweeper;
