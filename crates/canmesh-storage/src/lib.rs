//! Storage and timekeeping collaborator seams.
//!
//! The monitor firmware talks to an SD card, a non-volatile key/value store
//! and a battery-backed RTC. On the node those are hardware drivers; here
//! they are traits so the runtime can be exercised against host-side
//! implementations ([`DirStorage`], [`FileKvStore`], [`SystemRtc`]) and the
//! in-memory doubles in [`testing`].

pub mod error;
pub mod kv;
pub mod rtc;
pub mod sd;
pub mod testing;

pub use error::{StorageError, StorageResult};
pub use kv::{FileKvStore, KvStore};
pub use rtc::{Rtc, SystemRtc};
pub use sd::{DirStorage, SdStorage};
