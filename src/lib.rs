//! Pooled, lock-free promises.
//!
//! A promise is produced by a [`Deferred`] and settles exactly once: it is
//! resolved with a value, rejected with a [`Reason`], or canceled. Consumers
//! chain continuations onto it, `.await` it, or block on it with
//! [`Promise::wait`].
//!
//! The hand-off between the completing side and the waiting side is a single
//! compare-and-swap on the node's waiter slot, so neither side takes a lock.
//! Nodes are reused through per-type pools; every handle carries the
//! generation id it was created with, and a handle left over from an earlier
//! use of a node is refused with [`Error::InvalidPromise`].
//!
//! ```
//! use promise_core::{merge, Deferred, Promise};
//!
//! let (deferred, pending) = Deferred::<u32>::new();
//! let all = merge(vec![Promise::resolved(1), pending, Promise::resolved(3)]).unwrap();
//! deferred.resolve(2).unwrap();
//! assert_eq!(all.wait().unwrap(), vec![1, 2, 3]);
//! ```

mod cancel;
mod combinators;
pub mod config;
pub mod continuation;
mod fields;
mod loom;
mod outcome;
pub mod pair;
pub mod poly;
pub mod pool;
mod promise;
pub mod scheduler;
#[cfg(test)]
mod test_util;

pub use cancel::{
    CallbackPanics, CancelationRegistration, CancelationSource, CancelationToken, RetainedToken,
};
pub use combinators::{first, first_with_index, merge, merge_settled, race, race_with_index};
pub use continuation::Continuation;
pub use outcome::{Failure, Outcome, Panicked, Reason, State, UnhandledRejection};
pub use pair::Deferred;
pub use poly::SharedPromise;
pub use promise::{Attach, Promise, PromiseFuture, RawPromise};
pub use scheduler::{ExecutionContext, ExecutionScheduler, Target};

/// Misuse of a promise or deferred handle.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    /// The producer was dropped before it settled the promise.
    #[error("the producer was dropped")]
    ProducerDropped,
    /// The promise was already awaited or forgotten, or its node was reused.
    #[error("invalid promise: already awaited, forgotten or reused")]
    InvalidPromise,
    #[error("the promise already has a waiter")]
    AlreadyAwaited,
    /// The deferred already settled its promise, or its node was reused.
    #[error("invalid deferred: already settled or reused")]
    InvalidDeferred,
}
