//! Failure classification shared by every service.
//!
//! Each service returns its own `thiserror` enum. [`Classify`] sorts them into
//! the three buckets callers care about and provides the text shown to the
//! end user: a specific message for business failures, a generic retry prompt
//! for infrastructure trouble.

use crate::store::StoreError;

/// Shown for every infrastructure failure.
pub const RETRY_PROMPT: &str = "Something went wrong. Please try again.";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// A rule was violated; retrying the same request will fail the same way.
    Business,
    /// Lost a race with another participant; refresh state and retry.
    Conflict,
    /// Storage or gateway trouble; safe to retry later.
    Infrastructure,
}

pub trait Classify {
    fn class(&self) -> ErrorClass;

    /// Stable machine-readable code, e.g. `insufficient_balance`.
    fn code(&self) -> &'static str;

    fn user_message(&self) -> &'static str;

    fn is_business(&self) -> bool {
        self.class() == ErrorClass::Business
    }
}

impl Classify for StoreError {
    fn class(&self) -> ErrorClass {
        match self {
            StoreError::Conflict { .. } | StoreError::Contention { .. } => ErrorClass::Conflict,
            StoreError::Unavailable(_) | StoreError::Malformed { .. } | StoreError::Encode(_) => {
                ErrorClass::Infrastructure
            }
        }
    }

    fn code(&self) -> &'static str {
        match self {
            StoreError::Conflict { .. } => "write_conflict",
            StoreError::Contention { .. } => "contention",
            StoreError::Unavailable(_) => "store_unavailable",
            StoreError::Malformed { .. } => "malformed_document",
            StoreError::Encode(_) => "encode_failed",
        }
    }

    fn user_message(&self) -> &'static str {
        match self.class() {
            ErrorClass::Conflict => "This item was just updated. Refresh and try again.",
            _ => RETRY_PROMPT,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Collection;

    #[test]
    fn store_errors_are_not_business_failures() {
        let unavailable = StoreError::Unavailable("down".into());
        assert_eq!(unavailable.class(), ErrorClass::Infrastructure);
        assert_eq!(unavailable.user_message(), RETRY_PROMPT);
        assert!(!unavailable.is_business());

        let conflict = StoreError::Conflict {
            collection: Collection::Orders,
            id: "o".into(),
        };
        assert_eq!(conflict.class(), ErrorClass::Conflict);
        assert_ne!(conflict.user_message(), RETRY_PROMPT);
    }
}
