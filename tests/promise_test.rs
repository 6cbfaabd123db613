mod common;

#[cfg(test)]
mod tests {
    use super::common::{config_lock, trace_init, Unhandled};
    use futures::executor::block_on;
    use parking_lot::Mutex;
    use promise_core::continuation::from_fn;
    use promise_core::scheduler::ExecutionContext;
    use promise_core::{
        config, pool, Attach, Deferred, Error, ExecutionScheduler, Failure, Outcome, Promise,
        Reason, State, Target,
    };
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::{thread, time::Duration};

    #[test]
    fn test_deferred_await() {
        let _trace = trace_init();
        let (deferred, promise) = Deferred::<i32>::new();

        thread::spawn(move || {
            thread::sleep(Duration::from_millis(100));
            deferred.resolve(42).unwrap();
        });

        let result = block_on(async { promise.await }).unwrap();
        assert_eq!(result, 42);
    }

    #[test]
    fn second_attach_is_refused() {
        let (deferred, promise) = Deferred::<u32>::new();
        let raw = promise.into_raw().unwrap();
        let runs = Arc::new(AtomicUsize::new(0));

        let mut scheduler = ExecutionScheduler::new();
        let counter = runs.clone();
        let first = from_fn(move |_: Outcome<u32>, _: &mut ExecutionScheduler| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(raw.attach(first, &mut scheduler), Ok(Attach::Pending));

        let counter = runs.clone();
        let second = from_fn(move |_: Outcome<u32>, _: &mut ExecutionScheduler| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(raw.attach(second, &mut scheduler), Err(Error::InvalidPromise));
        scheduler.execute();

        deferred.resolve(1).unwrap();
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn stale_handles_never_see_the_next_occupant() {
        // a payload type no other test uses, so the pool slot is ours
        #[derive(Debug, PartialEq)]
        struct Slot(u32);

        let _config = config_lock();
        let (deferred, promise) = Deferred::<Slot>::new();
        let stale = promise.into_raw().unwrap();
        deferred.resolve(Slot(1)).unwrap();
        assert_eq!(Promise::from_raw(stale.clone()).wait().unwrap(), Slot(1));

        let (next, promise) = Deferred::<Slot>::new();
        let fresh = promise.into_raw().unwrap();
        assert_ne!(fresh.id(), stale.id());

        assert_eq!(stale.state(), Err(Error::InvalidPromise));
        let mut scheduler = ExecutionScheduler::new();
        assert_eq!(stale.forget(&mut scheduler), Err(Error::InvalidPromise));
        scheduler.execute();

        next.resolve(Slot(2)).unwrap();
        assert_eq!(fresh.state(), Ok(State::Resolved));
        assert_eq!(Promise::from_raw(fresh).wait().unwrap(), Slot(2));
    }

    #[test]
    fn pooling_can_be_disabled() {
        let _config = config_lock();
        config::update(|cfg| {
            cfg.set_object_pooling(false);
        });
        pool::clear();

        let (deferred, promise) = Deferred::<String>::new();
        deferred.resolve("unpooled".into()).unwrap();
        assert_eq!(promise.wait().unwrap(), "unpooled");

        config::update(|cfg| {
            cfg.set_object_pooling(true);
        });
        assert!(config::snapshot().object_pooling());
    }

    #[test]
    fn dropped_producer_rejects() {
        let (deferred, promise) = Deferred::<u8>::new();
        drop(deferred);
        match promise.wait() {
            Err(Failure::Rejected(reason)) => {
                assert_eq!(reason.downcast_ref::<Error>(), Some(&Error::ProducerDropped))
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn unobserved_rejection_reaches_the_sink() {
        let unhandled = Unhandled::capture();
        let (deferred, promise) = Deferred::<u8>::new();
        let chained = promise.then(|n| n + 1).unwrap();
        deferred.reject(Reason::msg("boom")).unwrap();
        assert!(unhandled.messages().is_empty());

        drop(chained);
        assert_eq!(unhandled.messages(), vec!["boom".to_owned()]);
    }

    #[derive(Default)]
    struct QueueContext {
        queue: Mutex<Vec<Box<dyn FnOnce() + Send>>>,
    }

    impl QueueContext {
        fn run_all(&self) -> usize {
            let work = std::mem::take(&mut *self.queue.lock());
            let count = work.len();
            for work in work {
                work();
            }
            count
        }
    }

    impl ExecutionContext for QueueContext {
        fn post(&self, work: Box<dyn FnOnce() + Send>) {
            self.queue.lock().push(work);
        }
    }

    #[test]
    fn continuations_can_target_a_context() {
        let context = Arc::new(QueueContext::default());
        let (deferred, promise) = Deferred::<u32>::new();
        let seen = Arc::new(Mutex::new(None));

        let seen2 = seen.clone();
        promise
            .on_settled_on(Target::Context(context.clone()), move |outcome| {
                *seen2.lock() = Some(outcome)
            })
            .unwrap();
        deferred.resolve(5).unwrap();

        assert!(seen.lock().is_none());
        assert_eq!(context.run_all(), 1);
        assert_eq!(*seen.lock(), Some(Outcome::Resolved(5)));
    }

    #[test]
    fn foreground_target_uses_the_configured_context() {
        let _config = config_lock();
        let context = Arc::new(QueueContext::default());
        config::update(|cfg| {
            cfg.set_foreground_context(context.clone());
        });

        let doubled = Promise::resolved(4u32)
            .then_on(Target::Foreground, |n| n * 2)
            .unwrap();
        assert_eq!(doubled.state().unwrap(), State::Pending);
        assert_eq!(context.run_all(), 1);
        assert_eq!(doubled.wait().unwrap(), 8);

        config::update(|cfg| *cfg = config::Config::default());
    }

    #[test]
    fn background_target_runs_off_thread() {
        let caller = thread::current().id();
        let ran_on = Promise::resolved(())
            .then_on(Target::Background, |()| thread::current().id())
            .unwrap()
            .wait()
            .unwrap();
        assert_ne!(ran_on, caller);
    }

    #[test]
    fn shared_promises_fan_out() {
        let (deferred, promise) = Deferred::<String>::new();
        let shared = promise.preserve().unwrap();
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let dup = shared.duplicate();
                thread::spawn(move || block_on(async { dup.await }))
            })
            .collect();

        deferred.resolve("all of them".into()).unwrap();
        for handle in handles {
            assert_eq!(handle.join().unwrap().unwrap(), "all of them");
        }
    }
}
