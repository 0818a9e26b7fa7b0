pub mod catalog;
pub mod copier;
pub mod enumerator;
pub mod events;
pub mod models;
pub mod monitor;
pub mod orchestrator;
pub mod validator;
pub mod wiper;

pub use catalog::{VersionCatalog, VersionRecord};
pub use copier::{CopyStats, copy_version};
pub use enumerator::{VolumeProvider, list_removable_volumes};
pub use events::{Event, EventSink, Severity};
pub use models::{
    CopySummary, FormatOutcome, Stage, TransferOutcome, TransferState, ValidationVerdict,
    VolumeDescriptor,
};
pub use monitor::{VolumeEvent, VolumeMonitor};
pub use orchestrator::{Orchestrator, TransferRequest};
pub use validator::{ValidationPolicy, validate_volume};
pub use wiper::{FilesystemKind, Formatter, clear_volume, format_volume};
