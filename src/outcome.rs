//! Terminal states and the payloads a settled promise carries.

use crate::Error;
use std::any::Any;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// The lifecycle state of a promise node.
///
/// `Pending` is the only non-terminal state. The other three are written
/// exactly once, by whichever thread wins the completion race.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum State {
    Pending = 0b00,
    Resolved = 0b01,
    Rejected = 0b10,
    Canceled = 0b11,
}

impl State {
    pub fn is_pending(self) -> bool {
        self == State::Pending
    }

    pub fn is_terminal(self) -> bool {
        !self.is_pending()
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(match self {
            State::Pending => "pending",
            State::Resolved => "resolved",
            State::Rejected => "rejected",
            State::Canceled => "canceled",
        })
    }
}

/// Why a promise was rejected.
///
/// Reasons are cheaply cloneable so that every branch of a multi-consumer
/// promise can observe the same rejection. Two reasons compare equal only if
/// they are clones of the same rejection.
#[derive(Clone)]
pub struct Reason(Arc<anyhow::Error>);

impl Reason {
    pub fn new<E>(error: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self(Arc::new(anyhow::Error::new(error)))
    }

    pub fn msg<M>(message: M) -> Self
    where
        M: fmt::Display + fmt::Debug + Send + Sync + 'static,
    {
        Self(Arc::new(anyhow::Error::msg(message)))
    }

    pub fn downcast_ref<E>(&self) -> Option<&E>
    where
        E: fmt::Display + fmt::Debug + Send + Sync + 'static,
    {
        self.0.downcast_ref::<E>()
    }

    pub fn as_error(&self) -> &anyhow::Error {
        &self.0
    }
}

impl PartialEq for Reason {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl fmt::Debug for Reason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&*self.0, f)
    }
}

impl fmt::Display for Reason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&*self.0, f)
    }
}

impl From<anyhow::Error> for Reason {
    fn from(error: anyhow::Error) -> Self {
        Self(Arc::new(error))
    }
}

impl From<Error> for Reason {
    fn from(error: Error) -> Self {
        Self::new(error)
    }
}

impl From<Panicked> for Reason {
    fn from(panic: Panicked) -> Self {
        Self::new(panic)
    }
}

/// The payload of a settled promise.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome<T> {
    Resolved(T),
    Rejected(Reason),
    Canceled,
}

impl<T> Outcome<T> {
    pub fn state(&self) -> State {
        match self {
            Outcome::Resolved(_) => State::Resolved,
            Outcome::Rejected(_) => State::Rejected,
            Outcome::Canceled => State::Canceled,
        }
    }

    pub fn is_resolved(&self) -> bool {
        matches!(self, Outcome::Resolved(_))
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Outcome<U> {
        match self {
            Outcome::Resolved(value) => Outcome::Resolved(f(value)),
            Outcome::Rejected(reason) => Outcome::Rejected(reason),
            Outcome::Canceled => Outcome::Canceled,
        }
    }

    pub fn into_result(self) -> Result<T, Failure> {
        match self {
            Outcome::Resolved(value) => Ok(value),
            Outcome::Rejected(reason) => Err(Failure::Rejected(reason)),
            Outcome::Canceled => Err(Failure::Canceled),
        }
    }

    /// Re-types a non-resolved outcome. Returns the value back if resolved.
    pub(crate) fn into_failure<U>(self) -> Result<T, Outcome<U>> {
        match self {
            Outcome::Resolved(value) => Ok(value),
            Outcome::Rejected(reason) => Err(Outcome::Rejected(reason)),
            Outcome::Canceled => Err(Outcome::Canceled),
        }
    }
}

/// Everything awaiting a promise can produce besides its value.
#[derive(Debug, Clone, Error)]
pub enum Failure {
    #[error("promise was rejected: {0}")]
    Rejected(Reason),
    #[error("promise was canceled")]
    Canceled,
    #[error(transparent)]
    Invalid(#[from] Error),
}

/// A rejection that was disposed without any consumer observing it.
#[derive(Debug, Clone, Error)]
#[error("unhandled promise rejection: {reason}")]
pub struct UnhandledRejection {
    reason: Reason,
}

impl UnhandledRejection {
    pub(crate) fn new(reason: Reason) -> Self {
        Self { reason }
    }

    pub fn reason(&self) -> &Reason {
        &self.reason
    }
}

/// A panic caught while running a user callback.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("callback panicked: {message}")]
pub struct Panicked {
    message: String,
}

impl Panicked {
    pub(crate) fn from_payload(payload: Box<dyn Any + Send>) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&'static str>() {
            (*s).to_owned()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "Box<dyn Any>".to_owned()
        };
        Self { message }
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reason_equality_is_identity() {
        let a = Reason::msg("boom");
        let b = a.clone();
        assert_eq!(a, b);
        assert_ne!(a, Reason::msg("boom"));
        assert_eq!(a.to_string(), "boom");
    }

    #[test]
    fn reason_downcasts_to_crate_error() {
        let reason = Reason::from(Error::ProducerDropped);
        assert_eq!(reason.downcast_ref::<Error>(), Some(&Error::ProducerDropped));
    }

    #[test]
    fn outcome_into_result() {
        assert_eq!(Outcome::Resolved(3).into_result().unwrap(), 3);
        assert!(matches!(
            Outcome::<i32>::Canceled.into_result(),
            Err(Failure::Canceled)
        ));
        assert_eq!(Outcome::<i32>::Canceled.state(), State::Canceled);
    }

    #[test]
    fn panic_payloads_keep_their_message() {
        let payload = std::panic::catch_unwind(|| panic!("oh no {}", 1)).unwrap_err();
        assert_eq!(Panicked::from_payload(payload).message(), "oh no 1");
    }
}
