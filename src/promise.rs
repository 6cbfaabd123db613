//! The consumer side: [`Promise`], its raw handle and its continuations.

use crate::continuation::{self, Continuation};
use crate::pair::{DeferredRef, PromiseNode};
use crate::scheduler::{ExecutionScheduler, Target};
use crate::{Error, Failure, Outcome, Panicked, Reason, State, UnhandledRejection};
use parking_lot::{Condvar, Mutex};
use std::fmt;
use std::future::{Future, IntoFuture};
use std::panic::{self, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll, Waker};

/// How an attached continuation will be run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Attach {
    /// Linked; the completing side will schedule it.
    Pending,
    /// The promise had already settled; it was scheduled on the attaching
    /// side's scheduler.
    Immediate,
}

/// The low-level handle to a pooled promise node: the node plus the id it
/// was created with.
///
/// Unlike [`Promise`] it can be cloned, which makes it possible to present
/// the same id twice. The node rejects every use after the first await or
/// forget with [`Error::InvalidPromise`], and does so again once the node is
/// reused for another promise.
pub struct RawPromise<T> {
    pub(crate) node: Arc<PromiseNode<T>>,
    id: u16,
}

impl<T> Clone for RawPromise<T> {
    fn clone(&self) -> Self {
        Self {
            node: self.node.clone(),
            id: self.id,
        }
    }
}

impl<T: Send + 'static> RawPromise<T> {
    pub(crate) fn new(node: Arc<PromiseNode<T>>, id: u16) -> Self {
        Self { node, id }
    }

    pub fn id(&self) -> u16 {
        self.id
    }

    /// Links `continuation` as the node's only waiter.
    ///
    /// If the node already settled, the continuation is queued on
    /// `scheduler` and [`Attach::Immediate`] is returned.
    pub fn attach(
        &self,
        continuation: Box<dyn Continuation<T>>,
        scheduler: &mut ExecutionScheduler,
    ) -> Result<Attach, Error> {
        self.node.attach(self.id, continuation, scheduler)
    }

    /// Gives up on the result without waiting for it.
    pub fn forget(&self, scheduler: &mut ExecutionScheduler) -> Result<(), Error> {
        self.node.forget(self.id, scheduler)
    }

    pub fn state(&self) -> Result<State, Error> {
        self.node.state(self.id)
    }
}

impl<T> fmt::Debug for RawPromise<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RawPromise")
            .field("id", &self.id)
            .field("node", &self.node)
            .finish()
    }
}

enum Repr<T> {
    /// Settled before any node was needed.
    Settled(Outcome<T>),
    Node(RawPromise<T>),
}

/// A value that will be resolved, rejected or canceled exactly once.
///
/// A promise has a single consumer: chaining, awaiting, waiting and
/// forgetting all consume it. Dropping a promise forgets it. A rejection
/// nobody observes is reported to the
/// [unhandled rejection handler](crate::config::Config::set_unhandled_rejection_handler).
///
/// # Examples
///
/// ```
/// use promise_core::Deferred;
/// use futures::executor::block_on;
/// use std::thread;
///
/// let (deferred, promise) = Deferred::<u32>::new();
/// let doubled = promise.then(|n| n * 2).unwrap();
///
/// let task = thread::spawn(move || block_on(async { doubled.await }));
/// deferred.resolve(21).unwrap();
/// assert_eq!(task.join().unwrap().unwrap(), 42);
/// ```
#[must_use = "a promise should be awaited, chained or explicitly forgotten"]
pub struct Promise<T: Send + 'static> {
    repr: Option<Repr<T>>,
}

impl<T: Send + 'static> Promise<T> {
    pub fn resolved(value: T) -> Self {
        Self::settled(Outcome::Resolved(value))
    }

    pub fn rejected(reason: impl Into<Reason>) -> Self {
        Self::settled(Outcome::Rejected(reason.into()))
    }

    pub fn canceled() -> Self {
        Self::settled(Outcome::Canceled)
    }

    pub fn settled(outcome: Outcome<T>) -> Self {
        Self {
            repr: Some(Repr::Settled(outcome)),
        }
    }

    pub fn from_raw(raw: RawPromise<T>) -> Self {
        Self {
            repr: Some(Repr::Node(raw)),
        }
    }

    /// Returns the raw node handle, or the outcome if this promise was
    /// created already settled.
    pub fn into_raw(mut self) -> Result<RawPromise<T>, Outcome<T>> {
        match self.take_repr() {
            Repr::Node(raw) => Ok(raw),
            Repr::Settled(outcome) => Err(outcome),
        }
    }

    pub fn state(&self) -> Result<State, Error> {
        match &self.repr {
            Some(Repr::Settled(outcome)) => Ok(outcome.state()),
            Some(Repr::Node(raw)) => raw.state(),
            None => Err(Error::InvalidPromise),
        }
    }

    /// Gives up on the result. A rejection is then reported as unhandled.
    pub fn forget(mut self) -> Result<(), Error> {
        let mut scheduler = ExecutionScheduler::new();
        let res = self.take_repr().forget(&mut scheduler);
        scheduler.execute();
        res
    }

    /// Hands the promise's outcome to `continuation`.
    pub fn attach(self, continuation: Box<dyn Continuation<T>>) -> Result<Attach, Error> {
        let mut scheduler = ExecutionScheduler::new();
        let res = self.attach_with(continuation, &mut scheduler);
        scheduler.execute();
        res
    }

    pub(crate) fn attach_with(
        mut self,
        continuation: Box<dyn Continuation<T>>,
        scheduler: &mut ExecutionScheduler,
    ) -> Result<Attach, Error> {
        match self.take_repr() {
            Repr::Settled(outcome) => {
                continuation::schedule(scheduler, continuation, outcome);
                Ok(Attach::Immediate)
            }
            Repr::Node(raw) => raw.attach(continuation, scheduler),
        }
    }

    /// Unwraps a promise that was created already settled.
    pub(crate) fn into_settled(mut self) -> Result<Outcome<T>, Self> {
        match self.repr.take() {
            Some(Repr::Settled(outcome)) => Ok(outcome),
            repr => {
                self.repr = repr;
                Err(self)
            }
        }
    }

    /// Validates the handle without consuming it.
    pub(crate) fn validate(&self) -> Result<(), Error> {
        self.state().map(drop)
    }

    /// Settles `downstream` with this promise's outcome once it is known.
    pub(crate) fn forward_to(self, downstream: DeferredRef<T>, scheduler: &mut ExecutionScheduler) {
        let forward = Box::new(Forward {
            downstream: downstream.clone(),
        });
        if let Err(error) = self.attach_with(forward, scheduler) {
            tracing::warn!(%error, "adopted an invalid promise");
            settle(&downstream, Outcome::Rejected(error.into()), scheduler);
        }
    }

    /// Runs `f` with the outcome, whatever it is. The returned promise
    /// resolves with `f`'s result.
    pub fn continue_with<U, F>(self, f: F) -> Result<Promise<U>, Error>
    where
        U: Send + 'static,
        F: FnOnce(Outcome<T>) -> U + Send + 'static,
    {
        self.continue_with_on(Target::Synchronous, f)
    }

    pub fn continue_with_on<U, F>(self, target: Target, f: F) -> Result<Promise<U>, Error>
    where
        U: Send + 'static,
        F: FnOnce(Outcome<T>) -> U + Send + 'static,
    {
        self.chain(target, move |outcome| Promise::resolved(f(outcome)))
    }

    /// Maps a resolved value. Rejections and cancelations pass through.
    pub fn then<U, F>(self, f: F) -> Result<Promise<U>, Error>
    where
        U: Send + 'static,
        F: FnOnce(T) -> U + Send + 'static,
    {
        self.then_on(Target::Synchronous, f)
    }

    pub fn then_on<U, F>(self, target: Target, f: F) -> Result<Promise<U>, Error>
    where
        U: Send + 'static,
        F: FnOnce(T) -> U + Send + 'static,
    {
        self.chain(target, move |outcome| match outcome.into_failure() {
            Ok(value) => Promise::resolved(f(value)),
            Err(failure) => Promise::settled(failure),
        })
    }

    /// Recovers from a rejection. Resolutions and cancelations pass through.
    pub fn catch<F>(self, f: F) -> Result<Promise<T>, Error>
    where
        F: FnOnce(Reason) -> T + Send + 'static,
    {
        self.catch_on(Target::Synchronous, f)
    }

    pub fn catch_on<F>(self, target: Target, f: F) -> Result<Promise<T>, Error>
    where
        F: FnOnce(Reason) -> T + Send + 'static,
    {
        self.chain(target, move |outcome| match outcome {
            Outcome::Rejected(reason) => Promise::resolved(f(reason)),
            outcome => Promise::settled(outcome),
        })
    }

    /// Chains another asynchronous step. The returned promise adopts the
    /// outcome of the promise `f` returns.
    pub fn and_then<U, F>(self, f: F) -> Result<Promise<U>, Error>
    where
        U: Send + 'static,
        F: FnOnce(T) -> Promise<U> + Send + 'static,
    {
        self.and_then_on(Target::Synchronous, f)
    }

    pub fn and_then_on<U, F>(self, target: Target, f: F) -> Result<Promise<U>, Error>
    where
        U: Send + 'static,
        F: FnOnce(T) -> Promise<U> + Send + 'static,
    {
        self.chain(target, move |outcome| match outcome.into_failure() {
            Ok(value) => f(value),
            Err(failure) => Promise::settled(failure),
        })
    }

    /// Observes the outcome without producing a new promise. A panic in `f`
    /// is reported as an unhandled rejection.
    pub fn on_settled<F>(self, f: F) -> Result<(), Error>
    where
        F: FnOnce(Outcome<T>) + Send + 'static,
    {
        self.on_settled_on(Target::Synchronous, f)
    }

    pub fn on_settled_on<F>(self, target: Target, f: F) -> Result<(), Error>
    where
        F: FnOnce(Outcome<T>) + Send + 'static,
    {
        self.continue_with_on(target, f)?.forget()
    }

    /// Blocks the current thread until the promise settles.
    pub fn wait(self) -> Result<T, Failure> {
        let signal = Arc::new(Signal {
            outcome: Mutex::new(None),
            ready: Condvar::new(),
        });
        self.attach(Box::new(signal.clone()))?;

        let mut outcome = signal.outcome.lock();
        loop {
            if let Some(outcome) = outcome.take() {
                return outcome.into_result();
            }
            signal.ready.wait(&mut outcome);
        }
    }

    fn chain<U, F>(self, target: Target, callback: F) -> Result<Promise<U>, Error>
    where
        U: Send + 'static,
        F: FnOnce(Outcome<T>) -> Promise<U> + Send + 'static,
    {
        let (downstream, raw) = PromiseNode::<U>::create();
        let chain = Box::new(Chain {
            downstream: downstream.clone(),
            callback,
            target,
        });

        let mut scheduler = ExecutionScheduler::new();
        let res = self.attach_with(chain, &mut scheduler);
        if res.is_err() {
            // tear down the unused node so it returns to the pool
            let _ = downstream.complete(Outcome::Canceled, &mut scheduler);
            let _ = raw.forget(&mut scheduler);
        }
        scheduler.execute();
        res.map(|_| Promise::from_raw(raw))
    }

    fn take_repr(&mut self) -> Repr<T> {
        self.repr
            .take()
            .unwrap_or_else(|| unreachable!("promise consumed twice"))
    }
}

impl<T: Send + 'static> Repr<T> {
    fn forget(self, scheduler: &mut ExecutionScheduler) -> Result<(), Error> {
        match self {
            Repr::Node(raw) => raw.forget(scheduler),
            Repr::Settled(Outcome::Rejected(reason)) => {
                scheduler.report_unhandled(UnhandledRejection::new(reason));
                Ok(())
            }
            Repr::Settled(_) => Ok(()),
        }
    }
}

impl<T: Send + 'static> Drop for Promise<T> {
    fn drop(&mut self) {
        if let Some(repr) = self.repr.take() {
            let mut scheduler = ExecutionScheduler::new();
            if let Err(error) = repr.forget(&mut scheduler) {
                tracing::warn!(%error, "dropped an invalid promise");
            }
            scheduler.execute();
        }
    }
}

impl<T: Send + 'static> fmt::Debug for Promise<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.repr {
            Some(Repr::Settled(outcome)) => f
                .debug_struct("Promise")
                .field("state", &outcome.state())
                .finish(),
            Some(Repr::Node(raw)) => f.debug_struct("Promise").field("raw", raw).finish(),
            None => f.write_str("Promise(<consumed>)"),
        }
    }
}

fn settle<T: Send + 'static>(
    downstream: &DeferredRef<T>,
    outcome: Outcome<T>,
    scheduler: &mut ExecutionScheduler,
) {
    if let Err(error) = downstream.complete(outcome, scheduler) {
        tracing::warn!(%error, "downstream promise was already settled");
    }
}

/// Runs a user callback and settles the next promise in the chain with
/// whatever it produces.
struct Chain<U, F> {
    downstream: DeferredRef<U>,
    callback: F,
    target: Target,
}

impl<T, U, F> Continuation<T> for Chain<U, F>
where
    T: Send + 'static,
    U: Send + 'static,
    F: FnOnce(Outcome<T>) -> Promise<U> + Send + 'static,
{
    fn resume(self: Box<Self>, outcome: Outcome<T>, scheduler: &mut ExecutionScheduler) {
        let Chain {
            downstream,
            callback,
            ..
        } = *self;

        match panic::catch_unwind(AssertUnwindSafe(move || callback(outcome))) {
            Ok(next) => next.forward_to(downstream, scheduler),
            Err(payload) => {
                let panic = Panicked::from_payload(payload);
                tracing::debug!(%panic, "promise callback panicked");
                settle(&downstream, Outcome::Rejected(panic.into()), scheduler);
            }
        }
    }

    fn target(&self) -> Target {
        self.target.clone()
    }
}

struct Forward<T> {
    downstream: DeferredRef<T>,
}

impl<T: Send + 'static> Continuation<T> for Forward<T> {
    fn resume(self: Box<Self>, outcome: Outcome<T>, scheduler: &mut ExecutionScheduler) {
        settle(&self.downstream, outcome, scheduler);
    }
}

struct Signal<T> {
    outcome: Mutex<Option<Outcome<T>>>,
    ready: Condvar,
}

impl<T: Send + 'static> Continuation<T> for Arc<Signal<T>> {
    fn resume(self: Box<Self>, outcome: Outcome<T>, _: &mut ExecutionScheduler) {
        *self.outcome.lock() = Some(outcome);
        self.ready.notify_all();
    }
}

#[derive(Debug)]
enum WakerState {
    Fresh,
    Tainted,
}

struct Shared<T> {
    value: Option<Result<T, Failure>>,
    waker: Result<Waker, WakerState>,
}

/// The future returned by awaiting a [`Promise`].
pub struct PromiseFuture<T> {
    shared: Arc<Mutex<Shared<T>>>,
}

struct WakeOnSettle<T> {
    shared: Arc<Mutex<Shared<T>>>,
}

impl<T: Send + 'static> Continuation<T> for WakeOnSettle<T> {
    fn resume(self: Box<Self>, outcome: Outcome<T>, _: &mut ExecutionScheduler) {
        let mut shared = self.shared.lock();
        shared.value = Some(outcome.into_result());
        if let Ok(waker) = std::mem::replace(&mut shared.waker, Err(WakerState::Tainted)) {
            drop(shared);
            waker.wake()
        }
    }
}

impl<T: Send + 'static> IntoFuture for Promise<T> {
    type Output = Result<T, Failure>;
    type IntoFuture = PromiseFuture<T>;

    fn into_future(self) -> PromiseFuture<T> {
        let shared = Arc::new(Mutex::new(Shared {
            value: None,
            waker: Err(WakerState::Fresh),
        }));
        let continuation = Box::new(WakeOnSettle {
            shared: shared.clone(),
        });
        if let Err(error) = self.attach(continuation) {
            let mut shared = shared.lock();
            shared.value = Some(Err(error.into()));
            shared.waker = Err(WakerState::Tainted);
        }
        PromiseFuture { shared }
    }
}

impl<T> Future for PromiseFuture<T> {
    type Output = Result<T, Failure>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut shared = self.shared.lock();
        match shared.value.take() {
            Some(value) => Poll::Ready(value),
            None => match std::mem::replace(&mut shared.waker, Ok(cx.waker().clone())) {
                // settled and already taken by an earlier poll
                Err(WakerState::Tainted) => {
                    shared.waker = Err(WakerState::Tainted);
                    Poll::Ready(Err(Error::InvalidPromise.into()))
                }
                _ => Poll::Pending,
            },
        }
    }
}

impl<T> fmt::Debug for PromiseFuture<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let shared = self.shared.lock();
        f.debug_struct("PromiseFuture")
            .field("ready", &shared.value.is_some())
            .field("waker", &shared.waker.as_ref().err())
            .finish()
    }
}
