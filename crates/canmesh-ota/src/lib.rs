//! OTA orchestrator of the canmesh monitor node.
//!
//! Runs the per-ECU update pipeline: poll the update source for an
//! advertised version, download the image to SD and load it, segment it
//! into non-owning 1 KiB views, distribute the segments over the routing
//! layer, and hand the image to the platform partition to apply, with
//! rollback on terminal failure and durable version persistence in
//! `config.ini`. Retries around each step belong to the supervisor, not
//! this crate.

pub mod error;
pub mod orchestrator;
pub mod partition;
pub mod segment;
pub mod source;
pub mod state;
pub mod testing;

pub use error::{OtaError, OtaResult};
pub use orchestrator::{OtaEvent, OtaOrchestrator, MAX_OTA_SUBSCRIBERS};
pub use partition::OtaPartition;
pub use segment::{FirmwareSegments, SEGMENT_SIZE};
pub use source::UpdateSource;
pub use state::UpdateState;
