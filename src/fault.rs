//! Failure injection.
//!
//! Components receive a `FailureInjector` at construction and consult it at
//! fixed checkpoints of the persist-and-ack protocol. A failure surfaces as an
//! `InjectedFailure` error that unwinds like a crash: the caller drops its
//! state and a fresh instance recovers from disk.

use rand::Rng;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Checkpoint {
    AfterChangingFile,
    AfterMetadataWrite,
    AfterFinishedWriting,
    AfterAck,
    BeforeForward,
}

#[derive(Debug, Error)]
#[error("injected failure at {0:?}")]
pub struct InjectedFailure(pub Checkpoint);

#[derive(Clone, Default)]
pub enum FailureInjector {
    #[default]
    Disabled,
    Random { probability: f64 },
    /// Fails once at each listed checkpoint, then never again there.
    Scripted(Arc<Mutex<HashSet<Checkpoint>>>),
}

impl FailureInjector {
    pub fn random(probability: f64) -> Self {
        if probability <= 0.0 {
            FailureInjector::Disabled
        } else {
            FailureInjector::Random {
                probability: probability.min(1.0),
            }
        }
    }

    pub fn scripted(checkpoints: impl IntoIterator<Item = Checkpoint>) -> Self {
        FailureInjector::Scripted(Arc::new(Mutex::new(checkpoints.into_iter().collect())))
    }

    pub fn check(&self, checkpoint: Checkpoint) -> Result<(), InjectedFailure> {
        let fail = match self {
            FailureInjector::Disabled => false,
            FailureInjector::Random { probability } => {
                rand::thread_rng().gen_bool(*probability)
            }
            FailureInjector::Scripted(pending) => pending
                .lock()
                .map(|mut set| set.remove(&checkpoint))
                .unwrap_or(false),
        };
        if fail {
            tracing::warn!("Injecting failure at {:?}", checkpoint);
            return Err(InjectedFailure(checkpoint));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scripted_fails_once() {
        let injector = FailureInjector::scripted([Checkpoint::AfterAck]);
        assert!(injector.check(Checkpoint::AfterChangingFile).is_ok());
        assert!(injector.check(Checkpoint::AfterAck).is_err());
        assert!(injector.check(Checkpoint::AfterAck).is_ok());
    }

    #[test]
    fn test_zero_probability_is_disabled() {
        let injector = FailureInjector::random(0.0);
        assert!(matches!(injector, FailureInjector::Disabled));
        for _ in 0..100 {
            assert!(injector.check(Checkpoint::BeforeForward).is_ok());
        }
    }
}
