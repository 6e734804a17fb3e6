pub mod digest;
pub mod error;
pub mod events;
pub mod id;
pub mod report;

pub use digest::Digest;
pub use error::{CoreError, ErrorCategory, Result};
pub use events::{EventBroadcaster, PipelineEvent, PipelineEventKind};
pub use id::ReportId;
pub use report::{ItemLineage, MimeFormat, Report, TaskAction, Topic};
