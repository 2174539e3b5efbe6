//! Descriptor-table growth harness.
//!
//! A parent opens a target file, hands it to an actor (a forked copy, a
//! clone sharing the descriptor table, or a thread) and then opens enough
//! descriptors to force the table to grow. The actor writes through the
//! inherited descriptor afterwards; every step is reported as an
//! `FDGROW:` observation line for [`verdict::evaluate`] to judge.

#[cfg(not(target_os = "linux"))]
compile_error!("fdgrow observes Linux descriptor tables and only builds for Linux");

pub mod allocator;
pub mod cli;
pub mod config;
pub mod error;
pub mod logger;
pub mod observation;
pub mod oracle;
pub mod orchestrator;
pub mod probe;
pub mod spawner;
pub mod sync;
pub mod verdict;

pub use error::HarnessError;
pub use observation::Observation;
pub use spawner::ActorMode;
