use super::pass_through::{repool, FanIn, FanInNode};
use super::Winner;
use crate::scheduler::ExecutionScheduler;
use crate::Outcome;
use std::marker::PhantomData;
use std::sync::Weak;

/// Resolves with the first input that resolves. Rejections and cancelations
/// are absorbed until the last input, whose outcome is surfaced if nothing
/// resolved.
pub(crate) struct FirstNode<T, W: Winner<T>> {
    this: Weak<FirstNode<T, W>>,
    fan: FanIn<W::Output>,
    _winner: PhantomData<fn(T) -> W>,
}

impl<T, W> FanInNode<T> for FirstNode<T, W>
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
        let last = match outcome.into_failure() {
            Ok(value) => {
                // resolutions publish before they are counted, so a failure
                // arriving last can only surface if nothing resolved
                if self.fan.publish(Outcome::Resolved(W::output(index, value)), scheduler) {
                    tracing::debug!(index, "first resolution won");
                }
                self.fan.arrive()
            }
            Err(failure) => {
                let last = self.fan.arrive();
                if last && self.fan.publish(failure, scheduler) {
                    tracing::debug!(index, "no input resolved");
                }
                last
            }
        };

        if last {
            repool(&self.this);
        }
    }
}
