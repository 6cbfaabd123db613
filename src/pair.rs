//! Single-consumer promises.
//!
//! A [`Deferred`] (the producer) and a [`Promise`] (the consumer) share one
//! pooled [`PromiseNode`]. The promise can be awaited at most once; the
//! value is moved out to that single consumer.
//!
//! # Examples
//!
//! ```
//! use promise_core::Deferred;
//! use std::thread;
//!
//! let (deferred, promise) = Deferred::<String>::new();
//! let task = thread::spawn(move || promise.wait());
//! deferred.resolve("Hi".into()).unwrap();
//! assert_eq!(task.join().unwrap().unwrap(), "Hi");
//! ```

use crate::cancel::{CancelCallback, CancelationRegistration, CancelationToken};
use crate::continuation::{self, Continuation, LinkError, Previous, WaiterSlot};
use crate::fields::AtomicFields;
use crate::loom::cell::UnsafeCell;
use crate::pool::Pool;
use crate::promise::{Attach, Promise, RawPromise};
use crate::scheduler::ExecutionScheduler;
use crate::{Error, Outcome, Reason, State, UnhandledRejection};
use std::fmt;
use std::sync::{Arc, Weak};

/// One hold for the producer, one for the consumer.
const INITIAL_RETAINS: u64 = 2;

/// The shared state behind a single-consumer promise.
///
/// The payload is written once by the thread that wins
/// [`claim_completion`](AtomicFields::claim_completion) and is read once by
/// whichever side of the waiter hand-off ends up running the continuation.
/// The node goes back to its pool only when both the producer and the
/// consumer have released it.
pub(crate) struct PromiseNode<T> {
    this: Weak<PromiseNode<T>>,
    fields: AtomicFields,
    waiter: WaiterSlot<T>,
    outcome: UnsafeCell<Option<Outcome<T>>>,
}

// Safety: the payload cell is only accessed by the thread that owns it
// according to the completion protocol, and `T` is `Send`.
unsafe impl<T: Send> Send for PromiseNode<T> {}
// Safety: see above.
unsafe impl<T: Send> Sync for PromiseNode<T> {}

impl<T: Send + 'static> PromiseNode<T> {
    /// Takes a node from the pool (or allocates one) and hands out its two
    /// sides.
    pub(crate) fn create() -> (DeferredRef<T>, RawPromise<T>) {
        let node = Pool::<Self>::global().take().unwrap_or_else(|| {
            Arc::new_cyclic(|this| PromiseNode {
                this: this.clone(),
                fields: AtomicFields::new(),
                waiter: WaiterSlot::new(),
                outcome: UnsafeCell::new(None),
            })
        });

        node.waiter.reset();
        let fields = node.fields.reset(INITIAL_RETAINS);
        tracing::trace!(
            promise_id = fields.promise_id(),
            deferred_id = fields.deferred_id(),
            "PromiseNode::create"
        );

        let deferred = DeferredRef {
            node: node.clone(),
            id: fields.deferred_id(),
        };
        (deferred, RawPromise::new(node, fields.promise_id()))
    }

    /// Publishes `outcome` and hands it to the attached waiter, if any.
    pub(crate) fn complete(
        &self,
        deferred_id: u16,
        outcome: Outcome<T>,
        scheduler: &mut ExecutionScheduler,
    ) -> Result<(), Error> {
        self.fields.claim_completion(deferred_id, outcome.state())?;
        tracing::trace!(deferred_id, state = %outcome.state(), "PromiseNode::complete");

        // Safety: winning the claim grants exclusive write access to the
        // payload until the waiter slot is swapped below.
        self.outcome.with_mut(|slot| unsafe { *slot = Some(outcome) });

        match self.waiter.complete() {
            Previous::Waiter(continuation) => {
                let outcome = self.take_outcome();
                continuation::schedule(scheduler, continuation, outcome);
            }
            // The consumer will find the completed sentinel when it attaches,
            // or already gave up and the payload is disposed with the node.
            Previous::Empty | Previous::Invalid => {}
            Previous::Completed => unreachable!("completion was claimed twice"),
        }

        self.release(scheduler);
        Ok(())
    }

    pub(crate) fn attach(
        &self,
        id: u16,
        continuation: Box<dyn Continuation<T>>,
        scheduler: &mut ExecutionScheduler,
    ) -> Result<Attach, Error> {
        self.fields.consume_promise_id(id)?;

        match self.waiter.try_link(continuation) {
            Ok(()) => {
                tracing::trace!(id, "PromiseNode::attach; linked");
                self.release(scheduler);
                Ok(Attach::Pending)
            }
            Err(LinkError::Completed(continuation)) => {
                tracing::trace!(id, "PromiseNode::attach; already complete");
                let outcome = self.take_outcome();
                continuation::schedule(scheduler, continuation, outcome);
                self.release(scheduler);
                Ok(Attach::Immediate)
            }
            Err(LinkError::Occupied(_)) => {
                // The id check makes this unreachable for well-formed handles.
                // The consumer hold is deliberately leaked: the node can no
                // longer prove who owns it.
                tracing::warn!(id, "attach to a promise that was already awaited or forgotten");
                Err(Error::AlreadyAwaited)
            }
        }
    }

    pub(crate) fn forget(&self, id: u16, scheduler: &mut ExecutionScheduler) -> Result<(), Error> {
        self.fields.consume_promise_id(id)?;
        tracing::trace!(id, "PromiseNode::forget");

        match self.waiter.invalidate() {
            Previous::Empty | Previous::Completed => {}
            Previous::Waiter(_) | Previous::Invalid => {
                debug_assert!(false, "forgot a promise that was already awaited");
                return Err(Error::AlreadyAwaited);
            }
        }

        self.release(scheduler);
        Ok(())
    }

    pub(crate) fn state(&self, id: u16) -> Result<State, Error> {
        self.fields.check_promise_id(id).map(|f| f.state())
    }

    pub(crate) fn is_deferred_pending(&self, deferred_id: u16) -> bool {
        self.fields.is_deferred_pending(deferred_id)
    }

    fn take_outcome(&self) -> Outcome<T> {
        // Safety: only called by the single party the waiter hand-off (or the
        // final release) made responsible for the payload.
        self.outcome
            .with_mut(|slot| unsafe { (*slot).take() })
            .unwrap_or_else(|| unreachable!("completed node without a payload"))
    }

    fn release(&self, scheduler: &mut ExecutionScheduler) {
        if self.fields.release() {
            self.dispose(scheduler);
        }
    }

    fn dispose(&self, scheduler: &mut ExecutionScheduler) {
        debug_assert!(self.waiter.is_drained(), "disposing a node with a live waiter");

        // Safety: the last release synchronizes with every other holder.
        let leftover = self.outcome.with_mut(|slot| unsafe { (*slot).take() });
        if let Some(Outcome::Rejected(reason)) = leftover {
            scheduler.report_unhandled(UnhandledRejection::new(reason));
        }

        if !self.fields.mark_pooled() {
            debug_assert!(false, "promise node disposed twice");
            tracing::error!("promise node disposed twice; not returning it to the pool");
            return;
        }

        tracing::trace!("PromiseNode::dispose");
        if let Some(this) = self.this.upgrade() {
            Pool::global().give(this);
        }
    }
}

impl<T> fmt::Debug for PromiseNode<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PromiseNode")
            .field("fields", &self.fields)
            .field("waiter", &self.waiter)
            .finish_non_exhaustive()
    }
}

/// The producer side of a node: the node plus the deferred id it was handed.
pub(crate) struct DeferredRef<T> {
    node: Arc<PromiseNode<T>>,
    id: u16,
}

impl<T> Clone for DeferredRef<T> {
    fn clone(&self) -> Self {
        Self {
            node: self.node.clone(),
            id: self.id,
        }
    }
}

impl<T: Send + 'static> DeferredRef<T> {
    pub(crate) fn complete(
        &self,
        outcome: Outcome<T>,
        scheduler: &mut ExecutionScheduler,
    ) -> Result<(), Error> {
        self.node.complete(self.id, outcome, scheduler)
    }

    pub(crate) fn is_pending(&self) -> bool {
        self.node.is_deferred_pending(self.id)
    }
}

/// Cancels a deferred's node when its token is canceled.
struct CancelDeferred<T>(DeferredRef<T>);

impl<T: Send + 'static> CancelCallback for CancelDeferred<T> {
    fn on_cancel(self: Box<Self>, scheduler: &mut ExecutionScheduler) {
        if self.0.complete(Outcome::Canceled, scheduler).is_err() {
            tracing::trace!("deferred settled before its token was canceled");
        }
    }
}

/// The producer half of a single-consumer promise.
///
/// Dropping a deferred that is still pending rejects its promise with
/// [`Error::ProducerDropped`].
pub struct Deferred<T: Send + 'static> {
    inner: DeferredRef<T>,
    registration: Option<CancelationRegistration>,
}

impl<T: Send + 'static> Deferred<T> {
    /// Creates a pending promise together with the deferred that settles it.
    pub fn new() -> (Self, Promise<T>) {
        let (inner, raw) = PromiseNode::create();
        (
            Self {
                inner,
                registration: None,
            },
            Promise::from_raw(raw),
        )
    }

    /// Like [`Deferred::new`], but the promise is canceled as soon as `token`
    /// is, unless it settled first.
    ///
    /// ```
    /// use promise_core::{CancelationSource, Deferred, State};
    ///
    /// let source = CancelationSource::new();
    /// let (deferred, promise) = Deferred::<u32>::new_cancelable(&source.token());
    /// source.cancel().unwrap();
    ///
    /// assert!(!deferred.is_pending());
    /// assert_eq!(promise.state().unwrap(), State::Canceled);
    /// ```
    pub fn new_cancelable(token: &CancelationToken) -> (Self, Promise<T>) {
        let (mut deferred, promise) = Self::new();
        let mut scheduler = ExecutionScheduler::new();
        let registration = token.register_callback(
            Box::new(CancelDeferred(deferred.inner.clone())),
            &mut scheduler,
        );
        scheduler.execute();
        deferred.registration = registration.is_registered().then_some(registration);
        (deferred, promise)
    }

    pub fn is_pending(&self) -> bool {
        self.inner.is_pending()
    }

    pub fn resolve(self, value: T) -> Result<(), Error> {
        self.settle(Outcome::Resolved(value))
    }

    pub fn reject(self, reason: impl Into<Reason>) -> Result<(), Error> {
        self.settle(Outcome::Rejected(reason.into()))
    }

    pub fn cancel(self) -> Result<(), Error> {
        self.settle(Outcome::Canceled)
    }

    /// Resolves the promise unless it already settled, e.g. through its
    /// cancelation token.
    pub fn try_resolve(&self, value: T) -> bool {
        self.settle(Outcome::Resolved(value)).is_ok()
    }

    pub fn try_reject(&self, reason: impl Into<Reason>) -> bool {
        self.settle(Outcome::Rejected(reason.into())).is_ok()
    }

    pub fn try_cancel(&self) -> bool {
        self.settle(Outcome::Canceled).is_ok()
    }

    fn settle(&self, outcome: Outcome<T>) -> Result<(), Error> {
        let mut scheduler = ExecutionScheduler::new();
        let res = self.inner.complete(outcome, &mut scheduler);
        if res.is_ok() {
            if let Some(registration) = &self.registration {
                registration.unregister();
            }
        }
        scheduler.execute();
        res
    }
}

impl<T: Send + 'static> Drop for Deferred<T> {
    /// If this is an unresolved producer, reject with an error.
    fn drop(&mut self) {
        if self.inner.is_pending() && self.try_reject(Error::ProducerDropped) {
            tracing::debug!("deferred dropped while pending");
        }
    }
}

impl<T: Send + 'static> fmt::Debug for Deferred<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Deferred")
            .field("id", &self.inner.id)
            .field("pending", &self.is_pending())
            .field("cancelable", &self.registration.is_some())
            .finish()
    }
}
