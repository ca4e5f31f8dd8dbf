//! Tri-state result for best-effort operations.
//!
//! Precaching a resource, enabling navigation preload, registering a
//! background wake and opening persistent storage are all allowed to degrade
//! without failing the caller. Each reports one of three outcomes so callers
//! (and tests) can tell "worked", "platform can't" and "tried and failed"
//! apart.

use std::fmt;

/// Outcome of a best-effort operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// The operation completed.
    Succeeded,
    /// The platform lacks the capability; nothing was attempted.
    SkippedUnsupported,
    /// The operation was attempted and failed; the caller carries on.
    FailedNonFatal(String),
}

impl Outcome {
    /// Map a fallible operation onto an outcome, keeping the error text.
    pub fn from_result<E: fmt::Display>(result: Result<(), E>) -> Self {
        match result {
            Ok(()) => Outcome::Succeeded,
            Err(e) => Outcome::FailedNonFatal(e.to_string()),
        }
    }

    pub fn is_succeeded(&self) -> bool {
        matches!(self, Outcome::Succeeded)
    }

    /// True for both degraded variants.
    pub fn is_degraded(&self) -> bool {
        !self.is_succeeded()
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Outcome::Succeeded => write!(f, "succeeded"),
            Outcome::SkippedUnsupported => write!(f, "skipped (unsupported)"),
            Outcome::FailedNonFatal(reason) => write!(f, "failed (non-fatal): {reason}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_result() {
        assert_eq!(Outcome::from_result::<String>(Ok(())), Outcome::Succeeded);
        assert_eq!(
            Outcome::from_result(Err("disk full")),
            Outcome::FailedNonFatal("disk full".to_string())
        );
    }

    #[test]
    fn test_degraded() {
        assert!(!Outcome::Succeeded.is_degraded());
        assert!(Outcome::SkippedUnsupported.is_degraded());
        assert!(Outcome::FailedNonFatal("x".into()).is_degraded());
    }

    #[test]
    fn test_display() {
        assert_eq!(Outcome::SkippedUnsupported.to_string(), "skipped (unsupported)");
        assert_eq!(
            Outcome::FailedNonFatal("quota".into()).to_string(),
            "failed (non-fatal): quota"
        );
    }
}
