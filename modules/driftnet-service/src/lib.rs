pub mod audit;
pub mod service;

pub use audit::{AuditEntry, AuditQueue, AuditWriter, TracingAuditWriter};
pub use service::{
    Driftnet, QuestionParams, QuestionUpdate, ServiceOptions, SourceParams, SourceUpdate,
};
