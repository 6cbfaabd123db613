//! Promises that combine several inputs.
//!
//! Every combinator consumes its inputs and returns a single promise. Each
//! input is attached through a pass-through bound to its index, and the
//! combined promise is settled exactly once no matter how the inputs race.
//! The combinator node is only reused after every input has been accounted
//! for, so inputs that settle after the combined promise has are still
//! drained.
//!
//! Outcomes that arrive after the combined promise has settled are dropped
//! and not reported as unhandled.

mod first;
mod merge;
mod pass_through;
mod race;

use self::first::FirstNode;
use self::merge::{MergeNode, MergeSettledNode};
use self::pass_through::fan_in;
use self::race::RaceNode;
use crate::{Error, Outcome, Promise};

/// Shapes the value of the winning input.
pub(crate) trait Winner<T>: Send + Sync + 'static {
    type Output: Send + 'static;

    fn output(index: usize, value: T) -> Self::Output;
}

pub(crate) enum ValueOnly {}

impl<T: Send + 'static> Winner<T> for ValueOnly {
    type Output = T;

    fn output(_: usize, value: T) -> T {
        value
    }
}

pub(crate) enum WithIndex {}

impl<T: Send + 'static> Winner<T> for WithIndex {
    type Output = (usize, T);

    fn output(index: usize, value: T) -> (usize, T) {
        (index, value)
    }
}

/// Resolves with all values, in input order, once every input resolves.
///
/// The first input to be rejected or canceled settles the result right
/// away; the remaining inputs are still drained. With no inputs the result
/// is an empty vector.
///
/// ```
/// use promise_core::{merge, Promise, Reason, Failure};
///
/// let ok = merge(vec![Promise::resolved(1), Promise::resolved(2)]).unwrap();
/// assert_eq!(ok.wait().unwrap(), vec![1, 2]);
///
/// let failed = merge(vec![Promise::resolved(1), Promise::rejected(Reason::msg("nope"))]).unwrap();
/// assert!(matches!(failed.wait(), Err(Failure::Rejected(_))));
/// ```
pub fn merge<T: Send + 'static>(inputs: Vec<Promise<T>>) -> Result<Promise<Vec<T>>, Error> {
    if inputs.is_empty() {
        return Ok(Promise::resolved(Vec::new()));
    }
    fan_in::<T, MergeNode<T>>(inputs)
}

/// Resolves with every input's outcome, in input order, once all have
/// settled. Never rejects.
pub fn merge_settled<T: Send + 'static>(
    inputs: Vec<Promise<T>>,
) -> Result<Promise<Vec<Outcome<T>>>, Error> {
    if inputs.is_empty() {
        return Ok(Promise::resolved(Vec::new()));
    }
    fan_in::<T, MergeSettledNode<T>>(inputs)
}

/// Settles like whichever input settles first. With no inputs the result
/// is canceled.
pub fn race<T: Send + 'static>(inputs: Vec<Promise<T>>) -> Result<Promise<T>, Error> {
    if inputs.is_empty() {
        return Ok(Promise::canceled());
    }
    fan_in::<T, RaceNode<T, ValueOnly>>(inputs)
}

/// Like [`race`], also returning the index of the winning input.
pub fn race_with_index<T: Send + 'static>(
    inputs: Vec<Promise<T>>,
) -> Result<Promise<(usize, T)>, Error> {
    if inputs.is_empty() {
        return Ok(Promise::canceled());
    }
    fan_in::<T, RaceNode<T, WithIndex>>(inputs)
}

/// Resolves with the first input to resolve. If none does, the result
/// settles like the input that settled last. With no inputs the result is
/// canceled.
///
/// ```
/// use promise_core::{first, Promise, Reason};
///
/// let winner = first(vec![
///     Promise::rejected(Reason::msg("down")),
///     Promise::canceled(),
///     Promise::resolved("mirror"),
/// ])
/// .unwrap();
/// assert_eq!(winner.wait().unwrap(), "mirror");
/// ```
pub fn first<T: Send + 'static>(inputs: Vec<Promise<T>>) -> Result<Promise<T>, Error> {
    if inputs.is_empty() {
        return Ok(Promise::canceled());
    }
    fan_in::<T, FirstNode<T, ValueOnly>>(inputs)
}

/// Like [`first`], also returning the index of the winning input.
pub fn first_with_index<T: Send + 'static>(
    inputs: Vec<Promise<T>>,
) -> Result<Promise<(usize, T)>, Error> {
    if inputs.is_empty() {
        return Ok(Promise::canceled());
    }
    fan_in::<T, FirstNode<T, WithIndex>>(inputs)
}
