//! Configuration model and persistence for the canmesh monitor node.
//!
//! Every runtime knob of the monitor lives in a flat `config.ini` file
//! (`KEY=VALUE` lines, `#`/`;` comments). This crate owns the typed model of
//! that file, the single-pass parser, the serializer, and [`ConfigStore`],
//! the file-lock owner through which all components read and write the file.
//!
//! The persisted file is the single source of truth for knobs loaded at
//! boot; runtime mutations go through [`ConfigStore`] and are written back
//! before the mutating call reports success.

#![warn(rust_2018_idioms)]

pub mod ecu;
pub mod error;
pub mod parser;
pub mod record;
pub mod store;

pub use ecu::EcuId;
pub use error::{ConfigError, ConfigResult};
pub use record::{
    LoggerConfig, MonitorConfig, MonitorKnobs, OtaConfig, RoutingConfig, StorageConfig,
};
pub use store::ConfigStore;
