//! Optimistic concurrency expectations.

use crate::error::DomainError;

/// Version expectation for a mutation of a versioned record.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ExpectedVersion {
    /// Skip version checking (operator actions that must win regardless).
    Any,
    /// Require the record to be at an exact version.
    Exact(u64),
}

impl ExpectedVersion {
    /// `Err(VersionConflict)` unless `actual` satisfies the expectation.
    pub fn check(self, actual: u64) -> Result<(), DomainError> {
        match self {
            ExpectedVersion::Exact(expected) if expected != actual => {
                Err(DomainError::VersionConflict { expected, actual })
            }
            _ => Ok(()),
        }
    }
}

impl From<u64> for ExpectedVersion {
    fn from(value: u64) -> Self {
        ExpectedVersion::Exact(value)
    }
}
