//! `jobforge-core`: foundation types shared by the job subsystem.
//!
//! This crate contains identifiers, time sources and optimistic-concurrency
//! primitives. It has no knowledge of storage or threads.

pub mod clock;
pub mod error;
pub mod id;
pub mod version;

pub use clock::{Clock, ManualClock, SharedClock, SystemClock};
pub use error::DomainError;
pub use id::{JobId, ScopeId};
pub use version::ExpectedVersion;
