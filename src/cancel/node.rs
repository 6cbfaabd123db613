use super::{CallbackPanics, CancelationRegistration};
use crate::loom::atomic::{self, AtomicU32, AtomicU64, Ordering};
use crate::pool::Pool;
use crate::scheduler::ExecutionScheduler;
use crate::Panicked;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::fmt;
use std::mem;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Weak};

/// Something to notify when a token is canceled.
pub(crate) trait CancelCallback: Send + 'static {
    fn on_cancel(self: Box<Self>, scheduler: &mut ExecutionScheduler);

    /// Called instead of [`on_cancel`](Self::on_cancel) if the source is
    /// disposed without ever being canceled.
    fn on_dispose(self: Box<Self>) {}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub(crate) enum Phase {
    Unset = 0b00,
    /// Canceled; the registered callbacks are still being invoked.
    Canceling = 0b01,
    Canceled = 0b10,
    Disposed = 0b11,
}

impl mycelium_bitfield::FromBits<u64> for Phase {
    type Error = core::convert::Infallible;

    const BITS: u32 = 2;

    fn try_from_bits(bits: u64) -> Result<Self, Self::Error> {
        Ok(match bits {
            0b00 => Phase::Unset,
            0b01 => Phase::Canceling,
            0b10 => Phase::Canceled,
            _ => Phase::Disposed,
        })
    }

    fn into_bits(self) -> u64 {
        self as u8 as u64
    }
}

mycelium_bitfield::bitfield! {
    /// Generation and phase of a cancelation ref, read together so a stale
    /// token can never observe the phase of a later generation.
    #[derive(PartialEq, Eq)]
    struct Word<u64> {
        const TOKEN_ID = 32;
        const PHASE: Phase;
    }
}

impl Word {
    fn token_id(&self) -> u32 {
        self.get(Word::TOKEN_ID) as u32
    }

    fn phase(&self) -> Phase {
        self.get(Word::PHASE)
    }
}

/// The source holds one internal retain; so does a `cancel` while it is
/// invoking callbacks.
pub(crate) const INTERNAL_ONE: u32 = 1;
/// Retained tokens count in the upper half.
pub(crate) const USER_ONE: u32 = 1 << 16;

struct Registrations {
    next_seq: u64,
    entries: VecDeque<(u64, Box<dyn CancelCallback>)>,
    /// Registrations this ref holds on its parents when it is linked.
    links: Vec<CancelationRegistration>,
}

/// The pooled state shared by a source and its tokens.
pub(crate) struct CancelationRef {
    this: Weak<CancelationRef>,
    word: AtomicU64,
    retains: AtomicU32,
    registrations: Mutex<Registrations>,
}

impl CancelationRef {
    /// Returns a fresh ref and its token id, holding the source's retain.
    pub(crate) fn create() -> (Arc<Self>, u32) {
        let node = Pool::<Self>::global().take().unwrap_or_else(|| {
            Arc::new_cyclic(|this| CancelationRef {
                this: this.clone(),
                word: AtomicU64::new(Word::new().0),
                retains: AtomicU32::new(0),
                registrations: Mutex::new(Registrations {
                    next_seq: 0,
                    entries: VecDeque::new(),
                    links: Vec::new(),
                }),
            })
        });

        let prev = node.retains.swap(INTERNAL_ONE, Ordering::AcqRel);
        debug_assert_eq!(prev, 0, "reused a retained cancelation ref");
        let id = node.load().token_id();
        tracing::trace!(token_id = id, "CancelationRef::create");
        (node, id)
    }

    fn load(&self) -> Word {
        Word(self.word.load(Ordering::Acquire))
    }

    /// Moves from `Unset` to `next` if `id` is current. Callers hold the
    /// registration lock.
    fn claim(&self, id: u32, next: Phase) -> bool {
        let current = Word::new()
            .with(Word::TOKEN_ID, u64::from(id))
            .with(Word::PHASE, Phase::Unset);
        let next = current.with(Word::PHASE, next);
        self.word
            .compare_exchange(current.0, next.0, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub(crate) fn is_canceled(&self, id: u32) -> bool {
        let word = self.load();
        word.token_id() == id && matches!(word.phase(), Phase::Canceling | Phase::Canceled)
    }

    pub(crate) fn can_be_canceled(&self, id: u32) -> bool {
        let word = self.load();
        word.token_id() == id && word.phase() != Phase::Disposed
    }

    /// Registers `callback`, or runs (or disposes) it right away if the token
    /// is already canceled (or disposed). Returns the registration sequence
    /// number if the callback was stored.
    ///
    /// A stale `id` drops the callback without running it.
    pub(crate) fn register(
        &self,
        id: u32,
        callback: Box<dyn CancelCallback>,
        scheduler: &mut ExecutionScheduler,
    ) -> Option<u64> {
        let mut regs = self.registrations.lock();
        let word = self.load();
        if word.token_id() != id {
            tracing::trace!(token_id = id, "register on a stale token");
            return None;
        }

        match word.phase() {
            // Callbacks registered during the fan-out join the queue so they
            // still run after everything registered before them.
            Phase::Unset | Phase::Canceling => {
                let seq = regs.next_seq;
                regs.next_seq += 1;
                regs.entries.push_back((seq, callback));
                tracing::trace!(token_id = id, seq, "CancelationRef::register");
                Some(seq)
            }
            Phase::Canceled => {
                drop(regs);
                callback.on_cancel(scheduler);
                None
            }
            Phase::Disposed => {
                drop(regs);
                callback.on_dispose();
                None
            }
        }
    }

    /// Removes a not yet invoked callback. Returns `false` if it already ran,
    /// is running, or was disposed.
    pub(crate) fn unregister(&self, id: u32, seq: u64) -> bool {
        let removed = {
            let mut regs = self.registrations.lock();
            if self.load().token_id() != id {
                return false;
            }
            match regs.entries.binary_search_by_key(&seq, |(s, _)| *s) {
                Ok(index) => regs.entries.remove(index),
                Err(_) => None,
            }
        };
        tracing::trace!(token_id = id, seq, removed = removed.is_some(), "CancelationRef::unregister");
        // dropped outside the lock
        removed.is_some()
    }

    pub(crate) fn is_registered(&self, id: u32, seq: u64) -> bool {
        let regs = self.registrations.lock();
        self.load().token_id() == id
            && regs.entries.binary_search_by_key(&seq, |(s, _)| *s).is_ok()
    }

    pub(crate) fn add_link(&self, id: u32, link: CancelationRegistration) {
        let mut regs = self.registrations.lock();
        if self.load().token_id() == id && self.load().phase() == Phase::Unset {
            regs.links.push(link);
            return;
        }
        drop(regs);
        link.unregister();
    }

    /// Cancels the ref and invokes every registered callback in registration
    /// order. Only the first call for a generation does anything.
    pub(crate) fn cancel(
        &self,
        id: u32,
        scheduler: &mut ExecutionScheduler,
    ) -> Result<(), CallbackPanics> {
        let links = {
            let mut regs = self.registrations.lock();
            if !self.claim(id, Phase::Canceling) {
                return Ok(());
            }
            // keep the ref alive while callbacks run, even if the source is
            // disposed concurrently
            self.retains.fetch_add(INTERNAL_ONE, Ordering::Relaxed);
            mem::take(&mut regs.links)
        };
        tracing::trace!(token_id = id, "CancelationRef::cancel");

        for link in links {
            link.unregister();
        }

        let mut panics = Vec::new();
        loop {
            let next = {
                let mut regs = self.registrations.lock();
                let next = regs.entries.pop_front();
                if next.is_none() {
                    let word = self.load().with(Word::PHASE, Phase::Canceled);
                    self.word.store(word.0, Ordering::Release);
                }
                next
            };
            let Some((seq, callback)) = next else {
                break;
            };

            tracing::trace!(token_id = id, seq, "invoking cancelation callback");
            if let Err(payload) =
                panic::catch_unwind(AssertUnwindSafe(|| callback.on_cancel(scheduler)))
            {
                match payload.downcast::<CallbackPanics>() {
                    // a linked source reporting its own callbacks
                    Ok(nested) => panics.extend(nested.into_panics()),
                    Err(payload) => panics.push(Panicked::from_payload(payload)),
                }
            }
        }

        self.release(INTERNAL_ONE);

        if panics.is_empty() {
            Ok(())
        } else {
            tracing::warn!(count = panics.len(), "cancelation callbacks panicked");
            Err(CallbackPanics::new(panics))
        }
    }

    /// Gives up the source's hold. Unless already canceled, the ref becomes
    /// disposed and every registered callback is disposed without running.
    pub(crate) fn dispose(&self, id: u32) {
        let (entries, links) = {
            let mut regs = self.registrations.lock();
            if self.load().token_id() != id {
                debug_assert!(false, "disposed a cancelation source twice");
                return;
            }
            let entries = if self.claim(id, Phase::Disposed) {
                mem::take(&mut regs.entries)
            } else {
                VecDeque::new()
            };
            (entries, mem::take(&mut regs.links))
        };
        tracing::trace!(token_id = id, disposed = entries.len(), "CancelationRef::dispose");

        for link in links {
            link.unregister();
        }
        for (_, callback) in entries {
            callback.on_dispose();
        }

        self.release(INTERNAL_ONE);
    }

    /// Takes a user retain if `id` is still current.
    pub(crate) fn try_retain(&self, id: u32) -> bool {
        let mut current = self.retains.load(Ordering::Relaxed);
        loop {
            // a ref with no holders is being reset
            if current == 0 {
                return false;
            }
            match self.retains.compare_exchange_weak(
                current,
                current + USER_ONE,
                Ordering::Acquire,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(actual) => current = actual,
            }
        }

        if self.load().token_id() == id {
            return true;
        }
        // raced with a reset and retained the next generation
        self.release(USER_ONE);
        false
    }

    pub(crate) fn release(&self, amount: u32) {
        let old = self.retains.fetch_sub(amount, Ordering::Release);
        debug_assert!(old >= amount, "released an unretained cancelation ref");
        if old != amount {
            return;
        }
        atomic::fence(Ordering::Acquire);
        self.reset();
    }

    fn reset(&self) {
        {
            let mut regs = self.registrations.lock();
            debug_assert!(regs.entries.is_empty(), "resetting a ref with live callbacks");
            regs.entries.clear();
            regs.links.clear();
            regs.next_seq = 0;

            let word = self.load();
            let next = Word::new()
                .with(Word::TOKEN_ID, u64::from(word.token_id().wrapping_add(1)))
                .with(Word::PHASE, Phase::Unset);
            self.word.store(next.0, Ordering::Release);
            tracing::trace!(token_id = word.token_id(), "CancelationRef::reset");
        }

        if let Some(this) = self.this.upgrade() {
            Pool::global().give(this);
        }
    }
}

impl fmt::Debug for CancelationRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let word = self.load();
        f.debug_struct("CancelationRef")
            .field("token_id", &word.token_id())
            .field("phase", &word.phase())
            .field("retains", &self.retains.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Record(Arc<Mutex<Vec<&'static str>>>, &'static str);

    impl CancelCallback for Record {
        fn on_cancel(self: Box<Self>, _: &mut ExecutionScheduler) {
            self.0.lock().push(self.1);
        }

        fn on_dispose(self: Box<Self>) {
            self.0.lock().push("disposed");
        }
    }

    #[test]
    fn phases_round_trip_through_the_word() {
        let word = Word::new()
            .with(Word::TOKEN_ID, 7)
            .with(Word::PHASE, Phase::Canceling);
        assert_eq!(word.token_id(), 7);
        assert_eq!(word.phase(), Phase::Canceling);
    }

    #[test]
    fn reset_bumps_the_token_id() {
        let (node, id) = CancelationRef::create();
        node.dispose(id);
        assert!(!node.can_be_canceled(id));
        assert!(!node.is_canceled(id));
        assert!(!node.try_retain(id));
    }

    #[test]
    fn callbacks_registered_during_fan_out_run_last() {
        struct Reentrant(Arc<CancelationRef>, u32, Arc<Mutex<Vec<&'static str>>>);

        impl CancelCallback for Reentrant {
            fn on_cancel(self: Box<Self>, scheduler: &mut ExecutionScheduler) {
                self.2.lock().push("first");
                let late = Box::new(Record(self.2.clone(), "late"));
                assert!(self.0.register(self.1, late, scheduler).is_some());
            }
        }

        let log = Arc::new(Mutex::new(Vec::new()));
        let (node, id) = CancelationRef::create();
        let mut scheduler = ExecutionScheduler::new();
        node.register(id, Box::new(Reentrant(node.clone(), id, log.clone())), &mut scheduler);
        node.register(id, Box::new(Record(log.clone(), "second")), &mut scheduler);

        node.cancel(id, &mut scheduler).unwrap();
        scheduler.execute();
        assert_eq!(*log.lock(), vec!["first", "second", "late"]);
        node.dispose(id);
    }

    #[test]
    fn dispose_disposes_callbacks() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let (node, id) = CancelationRef::create();
        let mut scheduler = ExecutionScheduler::new();
        node.register(id, Box::new(Record(log.clone(), "never")), &mut scheduler);
        node.dispose(id);
        scheduler.execute();
        assert_eq!(*log.lock(), vec!["disposed"]);
    }
}
