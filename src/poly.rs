//! Multi-consumer promises.
//!
//! [`Promise::preserve`] turns a single-consumer promise into a
//! [`SharedPromise`], which may be cloned freely and hands out any number of
//! independent single-consumer promises through [`SharedPromise::duplicate`].
//! Every duplicate observes a clone of the same outcome.
//!
//! # Examples
//!
//! ```
//! use promise_core::Deferred;
//! use futures::executor::block_on;
//! use std::thread;
//!
//! let (deferred, promise) = Deferred::<String>::new();
//! let shared = promise.preserve().unwrap();
//! let consumer = shared.duplicate();
//! let consumer2 = shared.duplicate();
//!
//! let task1 = thread::spawn(move || block_on(async { consumer.await }));
//! let task2 = thread::spawn(move || block_on(async { consumer2.await }));
//! deferred.resolve("Hi".into()).unwrap();
//! assert_eq!(task1.join().unwrap().unwrap(), "Hi");
//! assert_eq!(task2.join().unwrap().unwrap(), "Hi");
//! ```

use crate::continuation::{self, Continuation};
use crate::fields::{AtomicFields, Fields};
use crate::pair::{DeferredRef, PromiseNode};
use crate::pool::Pool;
use crate::promise::Promise;
use crate::scheduler::ExecutionScheduler;
use crate::{Error, Outcome, State, UnhandledRejection};
use parking_lot::Mutex;
use std::fmt;
use std::mem;
use std::sync::{Arc, Weak};

struct Branches<T> {
    outcome: Option<Outcome<T>>,
    waiters: Vec<Box<dyn Continuation<T>>>,
}

/// A node whose outcome is kept and cloned out to every branch.
///
/// It is retained once by the link to its upstream promise (until that
/// settles) and once per [`SharedPromise`] handle.
pub(crate) struct PreservedNode<T> {
    this: Weak<PreservedNode<T>>,
    fields: AtomicFields,
    branches: Mutex<Branches<T>>,
}

impl<T: Clone + Send + 'static> PreservedNode<T> {
    fn create() -> (Arc<Self>, u16) {
        let node = Pool::<Self>::global().take().unwrap_or_else(|| {
            Arc::new_cyclic(|this| PreservedNode {
                this: this.clone(),
                fields: AtomicFields::new(),
                branches: Mutex::new(Branches {
                    outcome: None,
                    waiters: Vec::new(),
                }),
            })
        });

        // the upstream link and the first handle
        let fields = node.fields.reset(2);
        tracing::trace!(promise_id = fields.promise_id(), "PreservedNode::create");
        (node, fields.promise_id())
    }

    fn settle(&self, outcome: Outcome<T>, scheduler: &mut ExecutionScheduler) {
        {
            let mut branches = self.branches.lock();
            debug_assert!(branches.outcome.is_none(), "preserved node settled twice");
            self.fields.set_state(outcome.state());

            let waiters = mem::take(&mut branches.waiters);
            tracing::trace!(branches = waiters.len(), state = %outcome.state(), "PreservedNode::settle");
            for waiter in waiters {
                continuation::schedule(scheduler, waiter, outcome.clone());
            }
            branches.outcome = Some(outcome);
        }

        self.release(scheduler);
    }

    fn duplicate(&self) -> Promise<T> {
        self.fields.mark_observed();

        let mut branches = self.branches.lock();
        if let Some(outcome) = &branches.outcome {
            return Promise::settled(outcome.clone());
        }

        let (deferred, raw) = PromiseNode::create();
        branches.waiters.push(Box::new(Branch(deferred)));
        drop(branches);

        tracing::trace!(branch = raw.id(), "PreservedNode::duplicate");
        Promise::from_raw(raw)
    }

    fn release(&self, scheduler: &mut ExecutionScheduler) {
        if self.fields.release() {
            self.dispose(scheduler);
        }
    }

    fn dispose(&self, scheduler: &mut ExecutionScheduler) {
        let outcome = {
            let mut branches = self.branches.lock();
            debug_assert!(branches.waiters.is_empty(), "disposing a node with live branches");
            branches.outcome.take()
        };

        let observed = self.fields.load().get(Fields::OBSERVED);
        if let Some(Outcome::Rejected(reason)) = outcome {
            if !observed {
                scheduler.report_unhandled(UnhandledRejection::new(reason));
            }
        }

        if !self.fields.mark_pooled() {
            debug_assert!(false, "preserved node disposed twice");
            tracing::error!("preserved node disposed twice; not returning it to the pool");
            return;
        }

        tracing::trace!("PreservedNode::dispose");
        if let Some(this) = self.this.upgrade() {
            Pool::global().give(this);
        }
    }
}

/// Receives the upstream outcome.
struct Link<T>(Arc<PreservedNode<T>>);

impl<T: Clone + Send + 'static> Continuation<T> for Link<T> {
    fn resume(self: Box<Self>, outcome: Outcome<T>, scheduler: &mut ExecutionScheduler) {
        self.0.settle(outcome, scheduler);
    }
}

/// Hands the preserved outcome to one duplicate.
struct Branch<T>(DeferredRef<T>);

impl<T: Send + 'static> Continuation<T> for Branch<T> {
    fn resume(self: Box<Self>, outcome: Outcome<T>, scheduler: &mut ExecutionScheduler) {
        if let Err(error) = self.0.complete(outcome, scheduler) {
            tracing::warn!(%error, "duplicate was already settled");
        }
    }
}

impl<T: Clone + Send + 'static> Promise<T> {
    /// Converts this promise into one that can be consumed many times.
    pub fn preserve(self) -> Result<SharedPromise<T>, Error> {
        self.validate()?;

        let (node, id) = PreservedNode::create();
        let mut scheduler = ExecutionScheduler::new();
        let res = self.attach_with(Box::new(Link(node.clone())), &mut scheduler);
        scheduler.execute();
        res.map(|_| SharedPromise { node, id })
    }
}

/// A promise that may be consumed any number of times.
///
/// Cloning a shared promise is cheap and keeps the preserved outcome alive.
/// Once the last handle is dropped and the upstream has settled, the
/// outcome is released. A rejection that no duplicate ever observed is then
/// reported as unhandled.
pub struct SharedPromise<T: Clone + Send + 'static> {
    node: Arc<PreservedNode<T>>,
    id: u16,
}

impl<T: Clone + Send + 'static> SharedPromise<T> {
    /// Returns a new single-consumer promise for the preserved outcome.
    pub fn duplicate(&self) -> Promise<T> {
        debug_assert!(self.node.fields.check_promise_id(self.id).is_ok());
        self.node.duplicate()
    }

    pub fn state(&self) -> State {
        self.node.fields.load().state()
    }
}

impl<T: Clone + Send + 'static> Clone for SharedPromise<T> {
    fn clone(&self) -> Self {
        self.node.fields.retain();
        Self {
            node: self.node.clone(),
            id: self.id,
        }
    }
}

impl<T: Clone + Send + 'static> Drop for SharedPromise<T> {
    fn drop(&mut self) {
        let mut scheduler = ExecutionScheduler::new();
        self.node.release(&mut scheduler);
        scheduler.execute();
    }
}

impl<T: Clone + Send + 'static> fmt::Debug for SharedPromise<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedPromise")
            .field("id", &self.id)
            .field("fields", &self.node.fields)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::capture_unhandled;
    use crate::{Deferred, Failure, Reason};
    use futures::executor::block_on;
    use std::thread;

    #[test]
    fn test_promise_resolve() {
        let (op, op_a) = Deferred::<String>::new();
        let shared = op_a.preserve().unwrap();
        let op_b = shared.duplicate();
        let op_c = shared.duplicate();
        let task1 = thread::spawn(move || block_on(async { op_b.await.unwrap() }));
        let task2 = thread::spawn(move || block_on(async { op_c.await.unwrap() }));
        op.resolve(String::from("🍓")).unwrap();
        assert_eq!(task1.join().expect("The task1 thread has panicked"), "🍓");
        assert_eq!(task2.join().expect("The task2 thread has panicked"), "🍓");
    }

    #[test]
    fn late_duplicates_see_the_kept_outcome() {
        let (deferred, promise) = Deferred::<u32>::new();
        let shared = promise.preserve().unwrap();
        assert_eq!(shared.state(), State::Pending);
        deferred.resolve(9).unwrap();
        assert_eq!(shared.state(), State::Resolved);

        let late = shared.duplicate();
        assert_eq!(late.state().unwrap(), State::Resolved);
        assert_eq!(late.wait().unwrap(), 9);
        assert_eq!(shared.clone().duplicate().wait().unwrap(), 9);
    }

    #[test]
    fn clones_keep_the_outcome_alive() {
        let shared = Promise::resolved(String::from("kept")).preserve().unwrap();
        let clone = shared.clone();
        drop(shared);
        assert_eq!(clone.duplicate().wait().unwrap(), "kept");
    }

    #[test]
    fn observed_rejections_are_not_reported_by_the_preserved_node() {
        let capture = capture_unhandled();
        let (deferred, promise) = Deferred::<u8>::new();
        let shared = promise.preserve().unwrap();
        let dup = shared.duplicate();
        drop(shared);
        deferred.reject(Reason::msg("seen")).unwrap();
        assert!(matches!(dup.wait(), Err(Failure::Rejected(_))));
        assert!(capture.messages().is_empty());
    }

    #[test]
    fn unobserved_rejection_is_reported_once() {
        let capture = capture_unhandled();
        let (deferred, promise) = Deferred::<u8>::new();
        let shared = promise.preserve().unwrap();
        let clone = shared.clone();
        deferred.reject(Reason::msg("lost")).unwrap();
        drop(shared);
        assert!(capture.messages().is_empty());
        drop(clone);
        assert_eq!(capture.messages(), vec!["lost".to_owned()]);
    }

    #[test]
    fn preserving_a_consumed_handle_fails() {
        let (_deferred, promise) = Deferred::<u8>::new();
        let raw = promise.into_raw().unwrap();
        Promise::from_raw(raw.clone()).forget().unwrap();
        assert_eq!(
            Promise::from_raw(raw).preserve().unwrap_err(),
            Error::InvalidPromise
        );
    }
}
