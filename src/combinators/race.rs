use super::pass_through::{repool, FanIn, FanInNode};
use super::Winner;
use crate::scheduler::ExecutionScheduler;
use crate::Outcome;
use std::marker::PhantomData;
use std::sync::Weak;

/// Settles with whichever input settles first, however it settles.
pub(crate) struct RaceNode<T, W: Winner<T>> {
    this: Weak<RaceNode<T, W>>,
    fan: FanIn<W::Output>,
    _winner: PhantomData<fn(T) -> W>,
}

impl<T, W> FanInNode<T> for RaceNode<T, W>
where
    T: Send + 'static,
    W: Winner<T>,
{
    type Output = W::Output;

    fn new_node(this: &Weak<Self>) -> Self {
        Self {
            this: this.clone(),
            fan: FanIn::new(),
            _winner: PhantomData,
        }
    }

    fn fan_in(&self) -> &FanIn<W::Output> {
        &self.fan
    }

    fn handle(&self, index: usize, outcome: Outcome<T>, scheduler: &mut ExecutionScheduler) {
        let outcome = outcome.map(|value| W::output(index, value));
        if self.fan.publish(outcome, scheduler) {
            tracing::debug!(index, "race won");
        }

        if self.fan.arrive() {
            repool(&self.this);
        }
    }
}
