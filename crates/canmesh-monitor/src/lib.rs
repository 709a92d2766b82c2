//! Monitor node supervisor.
//!
//! The supervisor is the composition root of the monitor ECU: it brings up
//! the connectivity collaborators, initializes the routing layer, the OTA
//! orchestrator, the CAN transport, the diagnosis engine, the alert sink
//! and the persistent logger, and owns the periodic task set that ties
//! them together. It is the only entity that creates tasks and hands out
//! component references.

pub mod bench;
pub mod collaborators;
pub mod supervisor;

pub use collaborators::{MeshRadio, WifiLink};
pub use supervisor::{Collaborators, MonitorSupervisor};
