//! The packed per-node state word ("small fields").
//!
//! Every node keeps its identity, lifecycle state, flags and retain count in a
//! single atomic `u64` so that the structural operations (await, forget,
//! complete, dispose) can validate *and* mutate the node with one
//! compare-and-swap:
//!
//! ```text
//! | 63     37 | 36         36 | 35     35 | 34   33 | 32        17 | 16       0 |
//! |  retains  | rejection seen |  pooled  |  state  | deferred id  | promise id |
//! ```
//!
//! The ids are 16-bit wrapping generation counters. A handle presents the id
//! it was given; any mismatch means the handle is stale and the operation is
//! refused before anything else is touched.

use crate::loom::atomic::{self, AtomicU64, Ordering};
use crate::{Error, State};
use std::fmt;

mycelium_bitfield::bitfield! {
    /// A snapshot of a node's packed state.
    #[derive(PartialEq, Eq)]
    pub(crate) struct Fields<u64> {
        /// Generation of the consumer side. Bumped when the promise is awaited
        /// or forgotten, and again when the node is repooled.
        pub(crate) const PROMISE_ID = 16;
        /// Generation of the producer side. Bumped when the node completes.
        pub(crate) const DEFERRED_ID = 16;
        /// Lifecycle state; terminal states are written exactly once.
        pub(crate) const STATE: State;
        /// Set while the node sits in its pool.
        pub(crate) const POOLED: bool;
        /// Set once some consumer has observed (or explicitly suppressed) the
        /// payload, so a rejection is not reported as unhandled.
        pub(crate) const OBSERVED: bool;
        /// Outstanding holds on the node. It may be repooled only at zero.
        pub(crate) const RETAINS = ..;
    }
}

const RETAIN_ONE: u64 = Fields::RETAINS.first_bit();
const RETAIN_MAX: u64 = Fields::RETAINS.raw_mask();

/// Advances a 16-bit generation counter.
#[inline]
pub(crate) fn next_id(id: u16) -> u16 {
    id.wrapping_add(1)
}

impl Fields {
    pub(crate) fn promise_id(&self) -> u16 {
        self.get(Fields::PROMISE_ID) as u16
    }

    pub(crate) fn deferred_id(&self) -> u16 {
        self.get(Fields::DEFERRED_ID) as u16
    }

    pub(crate) fn state(&self) -> State {
        self.get(Fields::STATE)
    }

    pub(crate) fn retains(&self) -> u64 {
        Fields::RETAINS.unpack(self.0)
    }

    fn with_promise_id(self, id: u16) -> Self {
        self.with(Fields::PROMISE_ID, u64::from(id))
    }

    fn with_deferred_id(self, id: u16) -> Self {
        self.with(Fields::DEFERRED_ID, u64::from(id))
    }
}

impl mycelium_bitfield::FromBits<u64> for State {
    type Error = core::convert::Infallible;

    const BITS: u32 = 2;

    #[inline]
    fn try_from_bits(bits: u64) -> Result<Self, Self::Error> {
        match bits {
            b if b == State::Pending as u64 => Ok(State::Pending),
            b if b == State::Resolved as u64 => Ok(State::Resolved),
            b if b == State::Rejected as u64 => Ok(State::Rejected),
            b if b == State::Canceled as u64 => Ok(State::Canceled),
            _ => unreachable!("invalid promise state {bits:#b}"),
        }
    }

    #[inline]
    fn into_bits(self) -> u64 {
        self as u8 as u64
    }
}

/// The atomic cell holding a node's [`Fields`].
pub(crate) struct AtomicFields {
    val: AtomicU64,
}

impl AtomicFields {
    pub(crate) fn new() -> Self {
        Self {
            val: AtomicU64::new(Fields::new().0),
        }
    }

    pub(crate) fn load(&self) -> Fields {
        Fields(self.val.load(Ordering::Acquire))
    }

    /// Prepares a node taken from the pool (or freshly allocated) for a new
    /// lifecycle. Ids are carried over from the previous occupant so that
    /// stale handles stay stale.
    ///
    /// The caller must own the node exclusively.
    pub(crate) fn reset(&self, retains: u64) -> Fields {
        self.transition(|f| {
            *f = Fields::new()
                .with_promise_id(f.promise_id())
                .with_deferred_id(f.deferred_id())
                .with(Fields::STATE, State::Pending)
                .with(Fields::RETAINS, retains);
            *f
        })
    }

    /// Validates `id` against the consumer generation and consumes it, so the
    /// same id can never be used for a second await or forget.
    pub(crate) fn consume_promise_id(&self, id: u16) -> Result<Fields, Error> {
        self.transition(|f| {
            if f.get(Fields::POOLED) || f.promise_id() != id {
                return Err(Error::InvalidPromise);
            }
            *f = f.with_promise_id(next_id(id));
            Ok(*f)
        })
    }

    /// Validates `id` without consuming it.
    pub(crate) fn check_promise_id(&self, id: u16) -> Result<Fields, Error> {
        let f = self.load();
        if f.get(Fields::POOLED) || f.promise_id() != id {
            return Err(Error::InvalidPromise);
        }
        Ok(f)
    }

    /// Claims the right to complete the node. Exactly one caller presenting
    /// the current deferred id wins; the id is consumed by the win.
    pub(crate) fn claim_completion(&self, deferred_id: u16, state: State) -> Result<(), Error> {
        debug_assert!(state.is_terminal());
        self.transition(|f| {
            if f.get(Fields::POOLED) || f.deferred_id() != deferred_id || f.state().is_terminal() {
                return Err(Error::InvalidDeferred);
            }
            *f = f
                .with_deferred_id(next_id(deferred_id))
                .with(Fields::STATE, state);
            Ok(())
        })
    }

    /// Publishes a terminal state on nodes that have no producer-side id.
    pub(crate) fn set_state(&self, state: State) {
        self.transition(|f| {
            debug_assert!(f.state().is_pending(), "state already published: {f}");
            f.set(Fields::STATE, state);
        });
    }

    pub(crate) fn is_deferred_pending(&self, deferred_id: u16) -> bool {
        let f = self.load();
        !f.get(Fields::POOLED) && f.deferred_id() == deferred_id && f.state().is_pending()
    }

    pub(crate) fn mark_observed(&self) {
        self.val.fetch_or(Fields::OBSERVED.raw_mask(), Ordering::AcqRel);
    }

    /// Moves the node into the pooled state, invalidating every outstanding
    /// consumer handle. Returns `false` if the node was already pooled, which
    /// means some path tried to dispose it twice.
    pub(crate) fn mark_pooled(&self) -> bool {
        self.transition(|f| {
            if f.get(Fields::POOLED) {
                return false;
            }
            debug_assert!(f.state().is_terminal(), "repooling a pending node: {f}");
            debug_assert_eq!(f.retains(), 0, "repooling a retained node: {f}");
            *f = f
                .with_promise_id(next_id(f.promise_id()))
                .with(Fields::POOLED, true);
            true
        })
    }

    pub(crate) fn retain(&self) {
        // Taking a new hold can only happen through an existing one, which
        // already provides the synchronization.
        let old = self.val.fetch_add(RETAIN_ONE, Ordering::Relaxed);
        assert!(old < RETAIN_MAX, "node retain count overflow");
    }

    /// Drops one hold. Returns `true` if it was the last one, in which case
    /// the caller is responsible for disposing the node.
    pub(crate) fn release(&self) -> bool {
        let old = self.val.fetch_sub(RETAIN_ONE, Ordering::Release);
        let old = Fields::RETAINS.unpack(old);
        debug_assert!(old > 0, "released a node with no retains");

        if old > 1 {
            return false;
        }

        atomic::fence(Ordering::Acquire);
        true
    }

    fn transition<T>(&self, mut transition: impl FnMut(&mut Fields) -> T) -> T {
        let mut current = self.load();
        loop {
            let mut next = current;
            let res = transition(&mut next);

            if current.0 == next.0 {
                return res;
            }

            tracing::trace!("Fields::transition; next:\n{}", next);
            match self.val.compare_exchange_weak(
                current.0,
                next.0,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return res,
                Err(actual) => current = Fields(actual),
            }
        }
    }
}

impl fmt::Debug for AtomicFields {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.load().fmt(f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn consuming_an_id_invalidates_it() {
        let fields = AtomicFields::new();
        fields.reset(1);
        let id = fields.load().promise_id();

        assert!(fields.consume_promise_id(id).is_ok());
        assert_eq!(fields.consume_promise_id(id), Err(Error::InvalidPromise));
        assert_eq!(fields.load().promise_id(), next_id(id));
    }

    #[test]
    fn completion_is_claimed_once() {
        let fields = AtomicFields::new();
        fields.reset(1);
        let id = fields.load().deferred_id();

        assert!(fields.claim_completion(id, State::Resolved).is_ok());
        assert_eq!(
            fields.claim_completion(id, State::Rejected),
            Err(Error::InvalidDeferred)
        );
        assert_eq!(fields.load().state(), State::Resolved);
    }

    #[test]
    fn pooling_bumps_the_promise_id() {
        let fields = AtomicFields::new();
        fields.reset(1);
        let id = fields.load().promise_id();
        fields.claim_completion(fields.load().deferred_id(), State::Canceled).unwrap();
        assert!(fields.release());

        assert!(fields.mark_pooled());
        assert_eq!(fields.check_promise_id(id), Err(Error::InvalidPromise));

        let f = fields.reset(2);
        assert_eq!(f.state(), State::Pending);
        assert_eq!(f.retains(), 2);
        assert_eq!(f.promise_id(), next_id(id));
    }

    #[test]
    fn ids_wrap() {
        assert_eq!(next_id(u16::MAX), 0);
    }
}
