use super::pass_through::{repool, FanIn, FanInNode};
use crate::scheduler::ExecutionScheduler;
use crate::Outcome;
use parking_lot::Mutex;
use std::mem;
use std::sync::Weak;

/// Resolves with every input's value once all resolve; settles early with
/// the first input that does not.
pub(crate) struct MergeNode<T> {
    this: Weak<MergeNode<T>>,
    fan: FanIn<Vec<T>>,
    values: Mutex<Vec<Option<T>>>,
}

impl<T: Send + 'static> FanInNode<T> for MergeNode<T> {
    type Output = Vec<T>;

    fn new_node(this: &Weak<Self>) -> Self {
        Self {
            this: this.clone(),
            fan: FanIn::new(),
            values: Mutex::new(Vec::new()),
        }
    }

    fn fan_in(&self) -> &FanIn<Vec<T>> {
        &self.fan
    }

    fn prepare(&self, inputs: usize) {
        let mut values = self.values.lock();
        values.clear();
        values.resize_with(inputs, || None);
    }

    fn handle(&self, index: usize, outcome: Outcome<T>, scheduler: &mut ExecutionScheduler) {
        match outcome.into_failure() {
            Ok(value) => {
                if !self.fan.is_published() {
                    self.values.lock()[index] = Some(value);
                }
            }
            Err(failure) => {
                if self.fan.publish(failure, scheduler) {
                    tracing::debug!(index, "merge settled early");
                }
            }
        }

        if !self.fan.arrive() {
            return;
        }

        let values = mem::take(&mut *self.values.lock());
        // any gap means an input failed and the merge is already settled
        if let Some(values) = values.into_iter().collect::<Option<Vec<T>>>() {
            self.fan.publish(Outcome::Resolved(values), scheduler);
        }
        repool(&self.this);
    }
}

/// Resolves with every input's outcome once all have settled.
pub(crate) struct MergeSettledNode<T> {
    this: Weak<MergeSettledNode<T>>,
    fan: FanIn<Vec<Outcome<T>>>,
    outcomes: Mutex<Vec<Option<Outcome<T>>>>,
}

impl<T: Send + 'static> FanInNode<T> for MergeSettledNode<T> {
    type Output = Vec<Outcome<T>>;

    fn new_node(this: &Weak<Self>) -> Self {
        Self {
            this: this.clone(),
            fan: FanIn::new(),
            outcomes: Mutex::new(Vec::new()),
        }
    }

    fn fan_in(&self) -> &FanIn<Vec<Outcome<T>>> {
        &self.fan
    }

    fn prepare(&self, inputs: usize) {
        let mut outcomes = self.outcomes.lock();
        outcomes.clear();
        outcomes.resize_with(inputs, || None);
    }

    fn handle(&self, index: usize, outcome: Outcome<T>, scheduler: &mut ExecutionScheduler) {
        self.outcomes.lock()[index] = Some(outcome);

        if !self.fan.arrive() {
            return;
        }

        let outcomes = mem::take(&mut *self.outcomes.lock())
            .into_iter()
            .map(|outcome| outcome.unwrap_or_else(|| unreachable!("a merged input never arrived")))
            .collect();
        self.fan.publish(Outcome::Resolved(outcomes), scheduler);
        repool(&self.this);
    }
}
