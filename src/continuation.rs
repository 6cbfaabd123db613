//! Continuations and the single-waiter slot every node hands them through.

use crate::loom::atomic::{AtomicPtr, Ordering};
use crate::scheduler::{ExecutionScheduler, Target};
use crate::Outcome;
use std::fmt;
use std::ptr;

/// Something to run once a promise settles.
///
/// This is the seam integration shims plug into: a continuation receives
/// the settled [`Outcome`] exactly once, on the thread draining the
/// scheduler it was handed to (or on the context its [`target`] names).
///
/// [`target`]: Continuation::target
pub trait Continuation<T>: Send + 'static {
    fn resume(self: Box<Self>, outcome: Outcome<T>, scheduler: &mut ExecutionScheduler);

    fn target(&self) -> Target {
        Target::Synchronous
    }
}

/// Wraps a closure as a [`Continuation`].
pub fn from_fn<T, F>(f: F) -> Box<dyn Continuation<T>>
where
    T: 'static,
    F: FnOnce(Outcome<T>, &mut ExecutionScheduler) + Send + 'static,
{
    Box::new(FromFn(f))
}

struct FromFn<F>(F);

impl<T, F> Continuation<T> for FromFn<F>
where
    F: FnOnce(Outcome<T>, &mut ExecutionScheduler) + Send + 'static,
{
    fn resume(self: Box<Self>, outcome: Outcome<T>, scheduler: &mut ExecutionScheduler) {
        (self.0)(outcome, scheduler)
    }
}

/// Hands `continuation` to the scheduler with its outcome.
pub(crate) fn schedule<T: Send + 'static>(
    scheduler: &mut ExecutionScheduler,
    continuation: Box<dyn Continuation<T>>,
    outcome: Outcome<T>,
) {
    let target = continuation.target();
    scheduler.schedule(
        target,
        Box::new(move |scheduler| continuation.resume(outcome, scheduler)),
    );
}

// The slot stores a thin pointer to a heap cell holding the (fat) boxed
// continuation. The two sentinels can never collide with a real allocation
// because `Waiter` is pointer-aligned.
struct Waiter<T>(Box<dyn Continuation<T>>);

const EMPTY: usize = 0;
const COMPLETED: usize = 1;
const INVALID: usize = 2;

/// What a slot held before a swap.
pub(crate) enum Previous<T> {
    /// Nothing was attached yet.
    Empty,
    /// The node had already completed.
    Completed,
    /// The consumer gave up on the node.
    Invalid,
    Waiter(Box<dyn Continuation<T>>),
}

/// Why [`WaiterSlot::try_link`] refused a continuation. The continuation is
/// handed back.
pub(crate) enum LinkError<T> {
    /// The node completed first; the caller must run the continuation.
    Completed(Box<dyn Continuation<T>>),
    /// Something else is already linked, or the slot was invalidated.
    Occupied(Box<dyn Continuation<T>>),
}

/// The single outstanding waiter of a node.
///
/// All hand-offs go through one atomic word, so exactly one of the attaching
/// and the completing side observes the other and takes responsibility for
/// running the continuation.
pub(crate) struct WaiterSlot<T> {
    ptr: AtomicPtr<Waiter<T>>,
}

// Safety: the slot owns at most one `Waiter<T>`, which is `Send`, and only
// ever moves it out through atomic swaps.
unsafe impl<T> Send for WaiterSlot<T> {}
// Safety: see above; shared access only performs atomic operations.
unsafe impl<T> Sync for WaiterSlot<T> {}

fn sentinel<T>(tag: usize) -> *mut Waiter<T> {
    ptr::without_provenance_mut(tag)
}

impl<T> WaiterSlot<T> {
    pub(crate) fn new() -> Self {
        Self {
            ptr: AtomicPtr::new(ptr::null_mut()),
        }
    }

    /// Empties the slot for a new lifecycle. The caller must own the node
    /// exclusively.
    pub(crate) fn reset(&self) {
        let prev = self.ptr.swap(ptr::null_mut(), Ordering::AcqRel);
        debug_assert!(
            matches!(prev as usize, EMPTY | COMPLETED | INVALID),
            "resetting a slot that still holds a waiter"
        );
        // Safety: not a sentinel, so it came from `Box::into_raw`
        if !matches!(prev as usize, EMPTY | COMPLETED | INVALID) {
            drop(unsafe { Box::from_raw(prev) });
        }
    }

    /// Tries to link `continuation`, succeeding only if the slot is empty.
    pub(crate) fn try_link(&self, continuation: Box<dyn Continuation<T>>) -> Result<(), LinkError<T>> {
        let waiter = Box::into_raw(Box::new(Waiter(continuation)));
        match self.ptr.compare_exchange(
            ptr::null_mut(),
            waiter,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => Ok(()),
            Err(actual) => {
                // Safety: the CAS failed, so we still own `waiter`
                let Waiter(continuation) = *unsafe { Box::from_raw(waiter) };
                if actual as usize == COMPLETED {
                    Err(LinkError::Completed(continuation))
                } else {
                    Err(LinkError::Occupied(continuation))
                }
            }
        }
    }

    /// Marks the node completed and takes whatever was linked.
    pub(crate) fn complete(&self) -> Previous<T> {
        let prev = self.take(sentinel(COMPLETED));
        debug_assert!(
            !matches!(prev, Previous::Completed),
            "node completed twice"
        );
        prev
    }

    /// Permanently refuses further links and takes whatever was there.
    pub(crate) fn invalidate(&self) -> Previous<T> {
        self.take(sentinel(INVALID))
    }

    pub(crate) fn is_drained(&self) -> bool {
        matches!(self.ptr.load(Ordering::Acquire) as usize, COMPLETED | INVALID)
    }

    fn take(&self, replacement: *mut Waiter<T>) -> Previous<T> {
        let prev = self.ptr.swap(replacement, Ordering::AcqRel);
        match prev as usize {
            EMPTY => Previous::Empty,
            COMPLETED => Previous::Completed,
            INVALID => Previous::Invalid,
            _ => {
                // Safety: not a sentinel, so it came from `Box::into_raw` in
                // `try_link`, and the swap transferred ownership to us
                let Waiter(continuation) = *unsafe { Box::from_raw(prev) };
                Previous::Waiter(continuation)
            }
        }
    }
}

impl<T> Drop for WaiterSlot<T> {
    fn drop(&mut self) {
        let prev = self.ptr.load(Ordering::Acquire);
        if !matches!(prev as usize, EMPTY | COMPLETED | INVALID) {
            // Safety: we have exclusive access and the pointer is a live box
            drop(unsafe { Box::from_raw(prev) });
        }
    }
}

impl<T> fmt::Debug for WaiterSlot<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match self.ptr.load(Ordering::Relaxed) as usize {
            EMPTY => "empty",
            COMPLETED => "completed",
            INVALID => "invalid",
            _ => "waiting",
        };
        f.debug_tuple("WaiterSlot").field(&state).finish()
    }
}
