use crate::continuation::Continuation;
use crate::loom::atomic::{AtomicBool, AtomicUsize, Ordering};
use crate::pair::{DeferredRef, PromiseNode};
use crate::pool::Pool;
use crate::promise::Promise;
use crate::scheduler::ExecutionScheduler;
use crate::{Error, Outcome};
use parking_lot::Mutex;
use std::any::type_name;
use std::marker::PhantomData;
use std::sync::{Arc, Weak};

/// The part every combinator node shares: how many inputs are still
/// outstanding, and the once-only publication of the combined outcome.
pub(crate) struct FanIn<Out> {
    pending: AtomicUsize,
    published: AtomicBool,
    output: Mutex<Option<DeferredRef<Out>>>,
}

impl<Out: Send + 'static> FanIn<Out> {
    pub(crate) fn new() -> Self {
        Self {
            pending: AtomicUsize::new(0),
            published: AtomicBool::new(false),
            output: Mutex::new(None),
        }
    }

    fn reset(&self, pending: usize, output: DeferredRef<Out>) {
        self.pending.store(pending, Ordering::Relaxed);
        self.published.store(false, Ordering::Relaxed);
        *self.output.lock() = Some(output);
    }

    pub(crate) fn is_published(&self) -> bool {
        self.published.load(Ordering::Acquire)
    }

    /// Settles the combined promise. Only the first call wins; later
    /// outcomes are dropped without being reported.
    pub(crate) fn publish(&self, outcome: Outcome<Out>, scheduler: &mut ExecutionScheduler) -> bool {
        if self
            .published
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            tracing::trace!(state = %outcome.state(), "combinator already settled; dropping outcome");
            return false;
        }

        let output = self.output.lock().take();
        match output {
            Some(output) => {
                if let Err(error) = output.complete(outcome, scheduler) {
                    tracing::warn!(%error, "combined promise was already settled");
                }
            }
            None => unreachable!("combinator published without an output"),
        }
        true
    }

    /// Accounts for one input. Returns `true` for the last one, after which
    /// the node may be repooled.
    pub(crate) fn arrive(&self) -> bool {
        let prev = self.pending.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0, "combinator input accounted twice");
        prev == 1
    }
}

/// A pooled node combining several inputs into one promise.
pub(crate) trait FanInNode<T>: Send + Sync + Sized + 'static {
    type Output: Send + 'static;

    fn new_node(this: &Weak<Self>) -> Self;

    fn fan_in(&self) -> &FanIn<Self::Output>;

    /// Resets per-input storage for `inputs` inputs.
    fn prepare(&self, _inputs: usize) {}

    /// Receives the outcome of input `index`. Called exactly once per input.
    fn handle(&self, index: usize, outcome: Outcome<T>, scheduler: &mut ExecutionScheduler);
}

/// Returns a node to its pool once its last input has been accounted for.
pub(crate) fn repool<N: Send + Sync + 'static>(this: &Weak<N>) {
    tracing::trace!(node = type_name::<N>(), "combinator drained");
    if let Some(this) = this.upgrade() {
        Pool::global().give(this);
    }
}

/// Binds one input to one slot of a combinator node.
struct PassThrough<T, N> {
    node: Arc<N>,
    index: usize,
    _input: PhantomData<fn(T)>,
}

impl<T, N> Continuation<T> for PassThrough<T, N>
where
    T: Send + 'static,
    N: FanInNode<T>,
{
    fn resume(self: Box<Self>, outcome: Outcome<T>, scheduler: &mut ExecutionScheduler) {
        self.node.handle(self.index, outcome, scheduler);
    }
}

/// Wires `inputs` into a fresh `N` and returns the combined promise.
///
/// Every input is validated before anything is attached. Inputs that are
/// already settled skip the pass-through and are handled while wiring.
pub(crate) fn fan_in<T, N>(inputs: Vec<Promise<T>>) -> Result<Promise<N::Output>, Error>
where
    T: Send + 'static,
    N: FanInNode<T>,
{
    debug_assert!(!inputs.is_empty());
    for input in &inputs {
        input.validate()?;
    }

    let node = Pool::<N>::global()
        .take()
        .unwrap_or_else(|| Arc::new_cyclic(N::new_node));
    let (output, raw) = PromiseNode::create();
    node.prepare(inputs.len());
    node.fan_in().reset(inputs.len(), output);
    tracing::debug!(inputs = inputs.len(), node = type_name::<N>(), "wiring combinator");

    let mut scheduler = ExecutionScheduler::new();
    for (index, input) in inputs.into_iter().enumerate() {
        let input = match input.into_settled() {
            Ok(outcome) => {
                node.handle(index, outcome, &mut scheduler);
                continue;
            }
            Err(input) => input,
        };

        let pass = Box::new(PassThrough {
            node: node.clone(),
            index,
            _input: PhantomData,
        });
        if let Err(error) = input.attach_with(pass, &mut scheduler) {
            // validated above, so only a concurrent misuse of a raw handle
            // gets here
            tracing::warn!(index, %error, "combinator input became invalid");
            node.handle(index, Outcome::Rejected(error.into()), &mut scheduler);
        }
    }
    scheduler.execute();

    Ok(Promise::from_raw(raw))
}
