//! Outcome of tearing sessions down

use std::fmt;

use sshubl_core::{ForwardId, MountId, SshublError, Target};

/// Resource whose release failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TeardownResource {
    Mount(MountId),
    Forward(ForwardId),
    Channel,
}

impl fmt::Display for TeardownResource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TeardownResource::Mount(id) => write!(f, "{}", id),
            TeardownResource::Forward(id) => write!(f, "{}", id),
            TeardownResource::Channel => write!(f, "control channel"),
        }
    }
}

/// A cleanup step that did not succeed
#[derive(Debug)]
pub struct TeardownFailure {
    pub target: Target,
    pub resource: TeardownResource,
    pub error: SshublError,
}

impl fmt::Display for TeardownFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}: {}", self.target, self.resource, self.error)
    }
}

/// Collected result of one or more teardowns
///
/// Failures never abort sibling resources or sessions.
#[derive(Debug, Default)]
pub struct TeardownReport {
    /// Sessions torn down
    pub sessions: usize,
    pub failures: Vec<TeardownFailure>,
}

impl TeardownReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }

    pub(crate) fn record(
        &mut self,
        target: &Target,
        resource: TeardownResource,
        error: impl Into<SshublError>,
    ) {
        let failure = TeardownFailure {
            target: target.clone(),
            resource,
            error: error.into(),
        };
        tracing::warn!("Teardown: {}", failure);
        self.failures.push(failure);
    }

    pub fn merge(&mut self, other: TeardownReport) {
        self.sessions += other.sessions;
        self.failures.extend(other.failures);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sshubl_core::error::MountError;
    use std::path::PathBuf;

    #[test]
    fn test_merge_reports() {
        let target = Target::new("example.com", 22, "alice");
        let mut report = TeardownReport {
            sessions: 1,
            failures: Vec::new(),
        };
        assert!(report.is_clean());

        let mut other = TeardownReport {
            sessions: 1,
            failures: Vec::new(),
        };
        other.record(
            &target,
            TeardownResource::Mount(MountId(3)),
            MountError::Busy(PathBuf::from("/mnt/x")),
        );

        report.merge(other);
        assert_eq!(report.sessions, 2);
        assert!(!report.is_clean());
        assert!(report.failures[0].to_string().contains("mnt-3"));
    }
}
