/// Transient classifier tests
///
/// Classification of driver errors buried under application, transaction
/// and lazy-initialization wrappers.
/// Run with: cargo test --test classifier_tests
use std::error::Error as StdError;

use reliabledb::DbError;
use reliabledb::driver::NativeError;
use reliabledb::transient::{TransientErrorClassifier, TransientErrorDetectionStrategy};
use thiserror::Error;

#[derive(Error, Debug)]
#[error("operation failed")]
struct GenericFailure {
    #[source]
    source: Box<dyn StdError + Send + Sync + 'static>,
}

#[derive(Error, Debug)]
#[error("the transaction could not be completed")]
struct TransactionFailure {
    #[source]
    source: GenericFailure,
}

fn generic(source: impl StdError + Send + Sync + 'static) -> GenericFailure {
    GenericFailure {
        source: Box::new(source),
    }
}

#[test]
fn test_code_wrapped_in_generic_and_transaction_errors() {
    let classifier = TransientErrorClassifier::with_codes([40197]);
    let error = TransactionFailure {
        source: generic(NativeError::single(40197, "The service has encountered an error.")),
    };

    assert!(classifier.is_transient(&error));
    assert!(!TransientErrorClassifier::with_codes([1205]).is_transient(&error));
}

#[test]
fn test_code_wrapped_in_anyhow_context() {
    let classifier = TransientErrorClassifier::sql_azure();
    let error = anyhow::Error::new(NativeError::single(40197, "error processing request"))
        .context("loading customer")
        .context("transaction rolled back");

    let outermost: &(dyn StdError + 'static) = error.as_ref();
    assert!(classifier.is_transient(outermost));
}

#[test]
fn test_wrap_depths() {
    let classifier = TransientErrorClassifier::sql_azure();

    let wrapped = |number: i32, depth: usize| -> Box<dyn StdError + Send + Sync> {
        let mut error: Box<dyn StdError + Send + Sync> =
            Box::new(DbError::from(NativeError::single(number, "failure")));
        for layer in 0..depth {
            error = Box::new(DbError::wrap(format!("layer {}", layer), generic_boxed(error)));
        }
        error
    };

    for depth in 0..=3 {
        assert!(classifier.is_transient(wrapped(40501, depth).as_ref()), "depth {}", depth);
        assert!(!classifier.is_transient(wrapped(2627, depth).as_ref()), "depth {}", depth);
    }
}

fn generic_boxed(source: Box<dyn StdError + Send + Sync>) -> GenericFailure {
    GenericFailure { source }
}

#[test]
fn test_timeouts_only_with_timeout_variant() {
    let timeout = DbError::Timeout("Execution timeout expired".into());
    let client_timeout = NativeError::single(-2, "Timeout expired.");

    let strict = TransientErrorClassifier::sql_azure();
    let lenient = TransientErrorClassifier::sql_azure_with_timeouts();

    assert!(!strict.is_transient(&timeout));
    assert!(!strict.is_transient(&client_timeout));
    assert!(lenient.is_transient(&timeout));
    assert!(lenient.is_transient(&client_timeout));
    assert!(lenient.is_transient(&generic(std::io::Error::from(std::io::ErrorKind::TimedOut))));
}

#[test]
fn test_custom_detection_closure() {
    let deadlocks_only = |error: &(dyn StdError + 'static)| {
        error
            .downcast_ref::<NativeError>()
            .is_some_and(|native| native.has_number(1205))
    };

    assert!(deadlocks_only.is_transient(&NativeError::single(1205, "deadlock victim")));
    assert!(!deadlocks_only.is_transient(&NativeError::single(40501, "busy")));
}
