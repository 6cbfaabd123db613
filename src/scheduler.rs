//! Batching of ready continuations.
//!
//! An [`ExecutionScheduler`] is created by every outer API call that can make
//! continuations runnable (completing a deferred, attaching to a settled
//! promise, cancelling a source, ...). Nodes never invoke a waiter directly;
//! they hand it to the scheduler, and the scheduler is drained before the
//! outer call returns. This turns what would be a recursive
//! complete → continue → complete chain into a loop, so arbitrarily long
//! chains unwind without growing the stack.
//!
//! Continuations that must run on a captured [`ExecutionContext`] are grouped
//! per context and flushed with a single [`ExecutionContext::post`] each.

use crate::{config, UnhandledRejection};
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;

/// A unit of ready work. It receives the scheduler that is draining it so
/// that anything it makes runnable joins the same batch.
pub type Runnable = Box<dyn FnOnce(&mut ExecutionScheduler) + Send>;

/// Somewhere continuations can be sent to run later, e.g. a UI thread or a
/// worker pool.
pub trait ExecutionContext: Send + Sync + 'static {
    fn post(&self, work: Box<dyn FnOnce() + Send>);
}

/// Runs every posted batch on its own newly spawned thread.
#[derive(Debug, Default, Clone, Copy)]
pub struct NewThreadContext;

impl ExecutionContext for NewThreadContext {
    fn post(&self, work: Box<dyn FnOnce() + Send>) {
        std::thread::spawn(work);
    }
}

/// Where a continuation wants to run.
#[derive(Clone, Default)]
pub enum Target {
    /// On whichever thread makes it ready, before that thread's outer call
    /// returns.
    #[default]
    Synchronous,
    /// On the configured foreground context.
    Foreground,
    /// On the configured background context.
    Background,
    Context(Arc<dyn ExecutionContext>),
}

impl fmt::Debug for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Target::Synchronous => f.write_str("Synchronous"),
            Target::Foreground => f.write_str("Foreground"),
            Target::Background => f.write_str("Background"),
            Target::Context(ctx) => write!(f, "Context({:p})", Arc::as_ptr(ctx)),
        }
    }
}

struct ContextBatch {
    context: Arc<dyn ExecutionContext>,
    work: Vec<Runnable>,
}

#[must_use = "an execution scheduler must be drained with `execute`"]
#[derive(Default)]
pub struct ExecutionScheduler {
    local: VecDeque<Runnable>,
    batches: Vec<ContextBatch>,
    unhandled: Vec<UnhandledRejection>,
}

impl ExecutionScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues `work` for `target`. Nothing runs until the scheduler is
    /// drained, so callers may schedule while holding their own locks.
    pub fn schedule(&mut self, target: Target, work: Runnable) {
        let context = match target {
            Target::Synchronous => None,
            Target::Foreground => config::foreground_context(),
            Target::Background => Some(config::background_context()),
            Target::Context(context) => Some(context),
        };

        match context {
            None => self.local.push_back(work),
            Some(context) => {
                let batch = self
                    .batches
                    .iter_mut()
                    .find(|batch| same_context(&batch.context, &context));
                match batch {
                    Some(batch) => batch.work.push(work),
                    None => self.batches.push(ContextBatch {
                        context,
                        work: vec![work],
                    }),
                }
            }
        }
    }

    pub(crate) fn report_unhandled(&mut self, rejection: UnhandledRejection) {
        self.unhandled.push(rejection);
    }

    pub fn is_empty(&self) -> bool {
        self.local.is_empty() && self.batches.is_empty() && self.unhandled.is_empty()
    }

    /// Runs all synchronous work (including work it schedules in turn),
    /// flushes the per-context batches and finally reports unhandled
    /// rejections.
    pub fn execute(mut self) {
        self.drain();
    }

    fn drain(&mut self) {
        loop {
            while let Some(work) = self.local.pop_front() {
                work(self);
            }

            if self.batches.is_empty() {
                break;
            }

            for ContextBatch { context, work } in self.batches.drain(..) {
                tracing::debug!(len = work.len(), "posting continuation batch to context");
                context.post(Box::new(move || {
                    let mut scheduler = ExecutionScheduler::new();
                    for runnable in work {
                        runnable(&mut scheduler);
                    }
                    scheduler.execute();
                }));
            }
        }

        for rejection in self.unhandled.drain(..) {
            config::report_unhandled(rejection);
        }
    }
}

impl Drop for ExecutionScheduler {
    fn drop(&mut self) {
        if !self.is_empty() {
            self.drain();
        }
    }
}

impl fmt::Debug for ExecutionScheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutionScheduler")
            .field("local", &self.local.len())
            .field("batches", &self.batches.len())
            .field("unhandled", &self.unhandled.len())
            .finish()
    }
}

fn same_context(a: &Arc<dyn ExecutionContext>, b: &Arc<dyn ExecutionContext>) -> bool {
    std::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b))
}
