use super::types::ErrorClass;
use crate::circuit_breaker::BreakerError;
use crate::error::CoordinationError;

/// Decides whether an operation error is worth retrying
///
/// Implemented for any `Fn(&E) -> ErrorClass`, so a closure is usually enough.
pub trait ErrorClassifier<E>: Send + Sync {
    fn classify(&self, error: &E) -> ErrorClass;
}

impl<E, F> ErrorClassifier<E> for F
where
    F: Fn(&E) -> ErrorClass + Send + Sync,
{
    fn classify(&self, error: &E) -> ErrorClass {
        self(error)
    }
}

/// Treats every error as retryable
#[derive(Debug, Clone, Copy, Default)]
pub struct AlwaysRetry;

impl<E> ErrorClassifier<E> for AlwaysRetry {
    fn classify(&self, _error: &E) -> ErrorClass {
        ErrorClass::Retryable
    }
}

/// Classifier for errors produced by this crate's store-backed primitives
///
/// Store outages and contention are transient; invalid input, configuration
/// problems and cancellation are not.
#[derive(Debug, Clone, Copy, Default)]
pub struct TransientCoordinationErrors;

impl ErrorClassifier<CoordinationError> for TransientCoordinationErrors {
    fn classify(&self, error: &CoordinationError) -> ErrorClass {
        match error {
            CoordinationError::StoreUnavailable(_)
            | CoordinationError::LimitExceeded { .. }
            | CoordinationError::LockHeld { .. } => ErrorClass::Retryable,
            CoordinationError::InvalidArgument(_)
            | CoordinationError::Config(_)
            | CoordinationError::Cancelled
            | CoordinationError::Io(_) => ErrorClass::Fatal,
        }
    }
}

/// Wraps a classifier for operations guarded by a circuit breaker
///
/// An open circuit or a cancelled call is never retried, so a retry loop
/// cannot hammer a resource the breaker is protecting. A breaker call timeout
/// is retryable; operation errors go to the inner classifier.
#[derive(Debug, Clone, Copy, Default)]
pub struct BreakerAware<C> {
    inner: C,
}

impl<C> BreakerAware<C> {
    pub fn new(inner: C) -> Self {
        Self { inner }
    }
}

impl<E, C> ErrorClassifier<BreakerError<E>> for BreakerAware<C>
where
    C: ErrorClassifier<E>,
{
    fn classify(&self, error: &BreakerError<E>) -> ErrorClass {
        match error {
            BreakerError::Open { .. } | BreakerError::Cancelled => ErrorClass::Fatal,
            BreakerError::Timeout { .. } => ErrorClass::Retryable,
            BreakerError::Operation(inner) => self.inner.classify(inner),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::StoreError;
    use std::time::Duration;

    #[test]
    fn test_closure_classifier() {
        let classifier = |e: &&str| {
            if *e == "permanent" {
                ErrorClass::Fatal
            } else {
                ErrorClass::Retryable
            }
        };
        assert_eq!(classifier.classify(&"permanent"), ErrorClass::Fatal);
        assert_eq!(classifier.classify(&"flaky"), ErrorClass::Retryable);
    }

    #[test]
    fn test_breaker_aware_never_retries_open_circuit() {
        let classifier = BreakerAware::new(AlwaysRetry);

        let open: BreakerError<String> = BreakerError::Open {
            resource: "payments".to_string(),
            retry_after: Duration::from_secs(5),
        };
        assert_eq!(classifier.classify(&open), ErrorClass::Fatal);
        assert_eq!(
            classifier.classify(&BreakerError::<String>::Cancelled),
            ErrorClass::Fatal
        );

        let timeout: BreakerError<String> = BreakerError::Timeout {
            resource: "payments".to_string(),
            elapsed: Duration::from_millis(100),
        };
        assert_eq!(classifier.classify(&timeout), ErrorClass::Retryable);
        assert_eq!(
            classifier.classify(&BreakerError::Operation("io".to_string())),
            ErrorClass::Retryable
        );
    }

    #[test]
    fn test_breaker_aware_delegates_operation_errors() {
        let classifier = BreakerAware::new(|_: &String| ErrorClass::Fatal);
        assert_eq!(
            classifier.classify(&BreakerError::Operation("bad request".to_string())),
            ErrorClass::Fatal
        );
    }

    #[test]
    fn test_transient_coordination_errors() {
        let classifier = TransientCoordinationErrors;
        assert_eq!(
            classifier.classify(&CoordinationError::StoreUnavailable(StoreError::Timeout(
                Duration::from_millis(10)
            ))),
            ErrorClass::Retryable
        );
        assert_eq!(
            classifier.classify(&CoordinationError::LockHeld {
                key: "orders".to_string()
            }),
            ErrorClass::Retryable
        );
        assert_eq!(
            classifier.classify(&CoordinationError::Cancelled),
            ErrorClass::Fatal
        );
    }
}
