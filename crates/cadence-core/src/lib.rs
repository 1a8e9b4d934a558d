//! `cadence-core` — value types shared by the scheduler library and the
//! `cadence` binary.
//!
//! - [`config`]: `cadence.toml` + `CADENCE_*` environment overrides.
//! - [`trigger`]: recurrence rules and their next-fire-time computation.
//! - [`error`]: the crate error type.

pub mod config;
pub mod error;
pub mod trigger;

pub use error::{CoreError, Result};
pub use trigger::{Schedule, Trigger};
