//! Cooperative cancelation.
//!
//! A [`CancelationSource`] owns the right to cancel; any number of
//! [`CancelationToken`]s observe it. Registering a callback on a token is the
//! only primitive: callbacks run in registration order when the source is
//! canceled, and are disposed (never run) when the source is disposed first.
//!
//! ```
//! use promise_core::CancelationSource;
//! use std::sync::{Arc, Mutex};
//!
//! let source = CancelationSource::new();
//! let token = source.token();
//! let log = Arc::new(Mutex::new(Vec::new()));
//!
//! for i in 1..=3 {
//!     let log = log.clone();
//!     token.register(move || log.lock().unwrap().push(i));
//! }
//! source.cancel().unwrap();
//!
//! assert!(token.is_cancelation_requested());
//! assert_eq!(*log.lock().unwrap(), vec![1, 2, 3]);
//! ```

mod node;

pub(crate) use self::node::CancelCallback;
use self::node::{CancelationRef, USER_ONE};
use crate::scheduler::ExecutionScheduler;
use crate::Panicked;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// Panics raised by cancelation callbacks during one
/// [`CancelationSource::cancel`] call. Every callback still ran.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{} cancelation callback(s) panicked", .panics.len())]
pub struct CallbackPanics {
    panics: Vec<Panicked>,
}

impl CallbackPanics {
    fn new(panics: Vec<Panicked>) -> Self {
        Self { panics }
    }

    pub fn panics(&self) -> &[Panicked] {
        &self.panics
    }

    pub fn into_panics(self) -> Vec<Panicked> {
        self.panics
    }
}

/// The owner of a cancelation.
///
/// Dropping a source disposes it. Tokens of a disposed source that was never
/// canceled can no longer be canceled.
pub struct CancelationSource {
    node: Arc<CancelationRef>,
    id: u32,
}

impl CancelationSource {
    pub fn new() -> Self {
        let (node, id) = CancelationRef::create();
        Self { node, id }
    }

    /// Creates a source that is also canceled when any of `parents` is.
    pub fn new_linked(parents: &[CancelationToken]) -> Self {
        let source = Self::new();
        let mut scheduler = ExecutionScheduler::new();

        for parent in parents {
            let link = Box::new(Linked {
                node: source.node.clone(),
                id: source.id,
            });
            let registration = parent.register_callback(link, &mut scheduler);
            if source.is_cancelation_requested() {
                break;
            }
            if registration.is_registered() {
                source.node.add_link(source.id, registration);
            }
        }

        tracing::debug!(parents = parents.len(), "CancelationSource::new_linked");
        scheduler.execute();
        source
    }

    pub fn token(&self) -> CancelationToken {
        CancelationToken {
            repr: TokenRepr::Ref {
                node: self.node.clone(),
                id: self.id,
            },
        }
    }

    pub fn is_cancelation_requested(&self) -> bool {
        self.node.is_canceled(self.id)
    }

    /// Cancels the source. Callbacks run on this thread, in registration
    /// order, before this returns. Canceling twice is a no-op.
    ///
    /// Panicking callbacks do not stop the remaining ones; their panics are
    /// collected and returned once all have run.
    pub fn cancel(&self) -> Result<(), CallbackPanics> {
        let mut scheduler = ExecutionScheduler::new();
        let res = self.node.cancel(self.id, &mut scheduler);
        scheduler.execute();
        res
    }

    pub fn dispose(self) {}
}

impl Default for CancelationSource {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for CancelationSource {
    fn drop(&mut self) {
        self.node.dispose(self.id);
    }
}

impl fmt::Debug for CancelationSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancelationSource")
            .field("id", &self.id)
            .field("canceled", &self.is_cancelation_requested())
            .finish()
    }
}

/// Propagates a parent's cancelation to a linked source.
struct Linked {
    node: Arc<CancelationRef>,
    id: u32,
}

impl CancelCallback for Linked {
    fn on_cancel(self: Box<Self>, scheduler: &mut ExecutionScheduler) {
        if let Err(panics) = self.node.cancel(self.id, scheduler) {
            // surfaced to the parent's `cancel` call
            std::panic::resume_unwind(Box::new(panics));
        }
    }
}

struct FnCallback<F>(F);

impl<F: FnOnce() + Send + 'static> CancelCallback for FnCallback<F> {
    fn on_cancel(self: Box<Self>, _: &mut ExecutionScheduler) {
        (self.0)()
    }
}

#[derive(Clone, Default)]
enum TokenRepr {
    #[default]
    None,
    Canceled,
    Ref {
        node: Arc<CancelationRef>,
        id: u32,
    },
}

/// Observes a [`CancelationSource`].
///
/// A token whose source is gone is inert: it reports not canceled and
/// ignores registrations.
#[derive(Clone, Default)]
pub struct CancelationToken {
    repr: TokenRepr,
}

impl CancelationToken {
    /// A token that is never canceled.
    pub fn none() -> Self {
        Self::default()
    }

    /// A token that is already canceled.
    pub fn canceled() -> Self {
        Self {
            repr: TokenRepr::Canceled,
        }
    }

    pub fn can_be_canceled(&self) -> bool {
        match &self.repr {
            TokenRepr::None => false,
            TokenRepr::Canceled => true,
            TokenRepr::Ref { node, id } => node.can_be_canceled(*id),
        }
    }

    pub fn is_cancelation_requested(&self) -> bool {
        match &self.repr {
            TokenRepr::None => false,
            TokenRepr::Canceled => true,
            TokenRepr::Ref { node, id } => node.is_canceled(*id),
        }
    }

    /// Runs `f` when the token is canceled. If it already is, `f` runs
    /// before this returns.
    pub fn register<F>(&self, f: F) -> CancelationRegistration
    where
        F: FnOnce() + Send + 'static,
    {
        let mut scheduler = ExecutionScheduler::new();
        let registration = self.register_callback(Box::new(FnCallback(f)), &mut scheduler);
        scheduler.execute();
        registration
    }

    pub(crate) fn register_callback(
        &self,
        callback: Box<dyn CancelCallback>,
        scheduler: &mut ExecutionScheduler,
    ) -> CancelationRegistration {
        match &self.repr {
            TokenRepr::None => CancelationRegistration::default(),
            TokenRepr::Canceled => {
                callback.on_cancel(scheduler);
                CancelationRegistration::default()
            }
            TokenRepr::Ref { node, id } => CancelationRegistration {
                inner: node
                    .register(*id, callback, scheduler)
                    .map(|seq| (node.clone(), *id, seq)),
            },
        }
    }

    /// Keeps the token's source state readable after the source itself is
    /// disposed. Returns `None` for stale tokens.
    pub fn try_retain(&self) -> Option<RetainedToken> {
        match &self.repr {
            TokenRepr::Ref { node, id } if node.try_retain(*id) => Some(RetainedToken {
                token: self.clone(),
            }),
            TokenRepr::Ref { .. } => None,
            _ => Some(RetainedToken {
                token: self.clone(),
            }),
        }
    }
}

impl fmt::Debug for CancelationToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.repr {
            TokenRepr::None => f.write_str("CancelationToken(None)"),
            TokenRepr::Canceled => f.write_str("CancelationToken(Canceled)"),
            TokenRepr::Ref { id, .. } => f
                .debug_struct("CancelationToken")
                .field("id", id)
                .field("canceled", &self.is_cancelation_requested())
                .finish(),
        }
    }
}

/// A token that holds its cancelation state alive until dropped.
pub struct RetainedToken {
    token: CancelationToken,
}

impl RetainedToken {
    pub fn token(&self) -> &CancelationToken {
        &self.token
    }
}

impl Drop for RetainedToken {
    fn drop(&mut self) {
        if let TokenRepr::Ref { node, .. } = &self.token.repr {
            node.release(USER_ONE);
        }
    }
}

impl fmt::Debug for RetainedToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("RetainedToken").field(&self.token).finish()
    }
}

/// A handle to a registered cancelation callback.
///
/// Dropping the handle leaves the callback registered.
#[derive(Default)]
pub struct CancelationRegistration {
    inner: Option<(Arc<CancelationRef>, u32, u64)>,
}

impl CancelationRegistration {
    /// Removes the callback. Returns `false` if it already ran or is running
    /// on another thread, or if it was never registered.
    pub fn unregister(&self) -> bool {
        match &self.inner {
            Some((node, id, seq)) => node.unregister(*id, *seq),
            None => false,
        }
    }

    pub fn is_registered(&self) -> bool {
        match &self.inner {
            Some((node, id, seq)) => node.is_registered(*id, *seq),
            None => false,
        }
    }
}

impl fmt::Debug for CancelationRegistration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancelationRegistration")
            .field("registered", &self.is_registered())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::thread;

    #[test]
    fn cancel_is_one_shot() {
        let source = CancelationSource::new();
        let count = Arc::new(Mutex::new(0));
        let count2 = count.clone();
        source.token().register(move || *count2.lock() += 1);

        source.cancel().unwrap();
        source.cancel().unwrap();
        assert_eq!(*count.lock(), 1);
    }

    #[test]
    fn registering_on_a_canceled_token_runs_immediately() {
        let ran = Arc::new(Mutex::new(false));
        let ran2 = ran.clone();
        let registration = CancelationToken::canceled().register(move || *ran2.lock() = true);
        assert!(*ran.lock());
        assert!(!registration.is_registered());
    }

    #[test]
    fn unregistered_callbacks_do_not_run() {
        let source = CancelationSource::new();
        let ran = Arc::new(Mutex::new(false));
        let ran2 = ran.clone();
        let registration = source.token().register(move || *ran2.lock() = true);
        assert!(registration.is_registered());
        assert!(registration.unregister());
        assert!(!registration.unregister());

        source.cancel().unwrap();
        assert!(!*ran.lock());
    }

    #[test]
    fn disposed_tokens_are_inert() {
        let source = CancelationSource::new();
        let token = source.token();
        assert!(token.can_be_canceled());
        source.dispose();

        assert!(!token.can_be_canceled());
        assert!(!token.is_cancelation_requested());
        let registration = token.register(|| unreachable!());
        assert!(!registration.is_registered());
        assert!(token.try_retain().is_none());
    }

    #[test]
    fn retained_tokens_outlive_their_source() {
        let source = CancelationSource::new();
        let token = source.token();
        let retained = token.try_retain().unwrap();
        source.cancel().unwrap();
        drop(source);

        assert!(retained.token().is_cancelation_requested());
        drop(retained);
        assert!(!token.is_cancelation_requested());
    }

    #[test]
    fn panics_are_aggregated() {
        let source = CancelationSource::new();
        let ran = Arc::new(Mutex::new(0));
        source.token().register(|| panic!("first"));
        let ran2 = ran.clone();
        source.token().register(move || *ran2.lock() += 1);
        source.token().register(|| panic!("second"));

        let err = source.cancel().unwrap_err();
        let messages: Vec<_> = err.panics().iter().map(|p| p.message().to_owned()).collect();
        assert_eq!(messages, vec!["first", "second"]);
        assert_eq!(*ran.lock(), 1);
    }

    #[test]
    fn linked_sources_follow_any_parent() {
        let a = CancelationSource::new();
        let b = CancelationSource::new();
        let linked = CancelationSource::new_linked(&[a.token(), b.token()]);
        let token = linked.token();

        b.cancel().unwrap();
        assert!(token.is_cancelation_requested());
        assert!(!a.token().is_cancelation_requested());

        // canceling the other parent later finds no link left
        a.cancel().unwrap();
    }

    #[test]
    fn linked_panics_reach_the_parent() {
        let parent = CancelationSource::new();
        let child = CancelationSource::new_linked(&[parent.token()]);
        child.token().register(|| panic!("child callback"));

        let err = parent.cancel().unwrap_err();
        assert_eq!(err.panics().len(), 1);
        assert_eq!(err.panics()[0].message(), "child callback");
        assert!(child.is_cancelation_requested());
    }

    #[test]
    fn linking_to_a_canceled_parent_cancels_immediately() {
        let linked = CancelationSource::new_linked(&[CancelationToken::canceled()]);
        assert!(linked.is_cancelation_requested());
    }

    #[test]
    fn disposing_a_linked_source_unlinks_it() {
        let parent = CancelationSource::new();
        let child = CancelationSource::new_linked(&[parent.token()]);
        let token = child.token();
        child.dispose();

        parent.cancel().unwrap();
        assert!(!token.is_cancelation_requested());
    }

    #[test]
    fn registration_racing_cancel_keeps_order() {
        for _ in 0..200 {
            let source = CancelationSource::new();
            let token = source.token();
            let log = Arc::new(Mutex::new(Vec::new()));

            let log2 = log.clone();
            let registrar = thread::spawn(move || {
                for i in 0..3 {
                    let log = log2.clone();
                    token.register(move || log.lock().push(i));
                }
            });
            source.cancel().unwrap();
            registrar.join().unwrap();

            let log = log.lock();
            assert_eq!(*log, (0..log.len()).collect::<Vec<_>>());
            assert_eq!(log.len(), 3);
        }
    }
}
