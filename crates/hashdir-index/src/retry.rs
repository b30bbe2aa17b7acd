use tracing::info;

use crate::error::{IndexError, IndexResult};
use crate::index::Index;

/// Result of one attempt of a guarded operation.
#[derive(Debug)]
pub enum Attempt<T> {
    Done(T),
    /// An injected failure interrupted the attempt.
    RetryRequested,
    Fatal(IndexError),
}

impl<T> From<IndexResult<T>> for Attempt<T> {
    fn from(result: IndexResult<T>) -> Self {
        match result {
            Ok(value) => Attempt::Done(value),
            Err(e) if e.is_retryable() => Attempt::RetryRequested,
            Err(e) => Attempt::Fatal(e),
        }
    }
}

/// Runs a mutating operation until it completes without an injected
/// failure.
///
/// Injection is armed on the first index for the whole run. Between
/// attempts every registered index is cleaned up and the operation starts
/// over; recovery relies only on the operation being idempotent. Real
/// errors, including cleanup errors, end the run and are returned as-is.
pub struct RetryHarness<'a> {
    indexes: Vec<&'a Index>,
}

impl<'a> RetryHarness<'a> {
    pub fn new(index: &'a Index) -> Self {
        Self {
            indexes: vec![index],
        }
    }

    /// Also clean up `other` between attempts.
    pub fn cleaning(mut self, other: &'a Index) -> Self {
        self.indexes.push(other);
        self
    }

    pub fn run<T>(&self, mut op: impl FnMut() -> IndexResult<T>) -> IndexResult<T> {
        let injector = self.indexes[0].injector();
        injector.begin();
        let mut attempt = 0u32;
        let result = loop {
            attempt += 1;
            if attempt > 1 {
                if let Err(e) = self.cleanup() {
                    break Err(e);
                }
            }
            match Attempt::from(op()) {
                Attempt::Done(value) => break Ok(value),
                Attempt::RetryRequested => {
                    info!(attempt, "operation interrupted by injected failure; retrying");
                }
                Attempt::Fatal(e) => break Err(e),
            }
        };
        injector.finish();
        result
    }

    fn cleanup(&self) -> IndexResult<()> {
        for index in &self.indexes {
            index.cleanup()?;
        }
        Ok(())
    }
}
