mod common;

#[cfg(test)]
mod tests {
    use super::common::trace_init;
    use parking_lot::Mutex;
    use promise_core::{CancelationSource, CancelationToken, Deferred, Failure};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Barrier};
    use std::thread;

    fn recorder() -> (Arc<Mutex<Vec<u32>>>, impl Fn(u32) -> Box<dyn FnOnce() + Send>) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let sink = log.clone();
        let record = move |n: u32| -> Box<dyn FnOnce() + Send> {
            let sink = sink.clone();
            Box::new(move || sink.lock().push(n))
        };
        (log, record)
    }

    #[test]
    fn callbacks_run_in_registration_order() {
        let _trace = trace_init();
        let source = CancelationSource::new();
        let token = source.token();
        let (log, record) = recorder();

        for n in 1..=3 {
            let _ = token.register(record(n));
        }
        source.cancel().unwrap();
        assert_eq!(*log.lock(), vec![1, 2, 3]);

        // a second cancel is a no-op
        source.cancel().unwrap();
        assert_eq!(*log.lock(), vec![1, 2, 3]);
    }

    #[test]
    fn registration_racing_cancel_runs_exactly_once() {
        for _ in 0..1_000 {
            let source = CancelationSource::new();
            let token = source.token();
            let runs = Arc::new(AtomicUsize::new(0));
            let barrier = Arc::new(Barrier::new(2));

            let registrar = {
                let token = token.clone();
                let runs = runs.clone();
                let barrier = barrier.clone();
                thread::spawn(move || {
                    barrier.wait();
                    let _ = token.register(move || {
                        runs.fetch_add(1, Ordering::SeqCst);
                    });
                })
            };
            barrier.wait();
            source.cancel().unwrap();
            registrar.join().unwrap();

            assert_eq!(runs.load(Ordering::SeqCst), 1);
        }
    }

    #[test]
    fn disposed_sources_drop_their_callbacks() {
        let source = CancelationSource::new();
        let token = source.token();
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = runs.clone();
        let registration = token.register(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        source.dispose();
        assert!(!registration.is_registered());
        assert!(!token.can_be_canceled());
        assert!(!token.is_cancelation_requested());
        assert_eq!(runs.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn linked_sources_follow_any_parent() {
        let first = CancelationSource::new();
        let second = CancelationSource::new();
        let child = CancelationSource::new_linked(&[first.token(), second.token()]);
        let (log, record) = recorder();
        let _ = child.token().register(record(7));

        second.cancel().unwrap();
        assert!(child.is_cancelation_requested());
        assert!(!first.is_cancelation_requested());
        assert_eq!(*log.lock(), vec![7]);
    }

    #[test]
    fn none_and_canceled_tokens() {
        let none = CancelationToken::none();
        assert!(!none.can_be_canceled());
        let registration = none.register(|| unreachable!());
        assert!(!registration.is_registered());

        let ran = Arc::new(AtomicUsize::new(0));
        let counter = ran.clone();
        let _ = CancelationToken::canceled().register(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn canceling_a_cancelable_deferred() {
        let source = CancelationSource::new();
        let (deferred, promise) = Deferred::<u32>::new_cancelable(&source.token());

        let waiter = thread::spawn(move || promise.wait());
        source.cancel().unwrap();

        assert!(matches!(waiter.join().unwrap(), Err(Failure::Canceled)));
        assert!(!deferred.is_pending());
        assert!(!deferred.try_resolve(1));
    }

    #[test]
    fn settled_deferreds_ignore_later_cancelation() {
        let source = CancelationSource::new();
        let (deferred, promise) = Deferred::<u32>::new_cancelable(&source.token());
        deferred.resolve(3).unwrap();
        source.cancel().unwrap();
        assert_eq!(promise.wait().unwrap(), 3);
    }

    #[test]
    fn panicking_callbacks_do_not_stop_the_rest() {
        let source = CancelationSource::new();
        let token = source.token();
        let (log, record) = recorder();

        let _ = token.register(record(1));
        let _ = token.register(|| panic!("first"));
        let _ = token.register(record(2));
        let _ = token.register(|| panic!("second"));

        let panics = source.cancel().unwrap_err();
        let messages: Vec<_> = panics.panics().iter().map(|p| p.message().to_owned()).collect();
        assert_eq!(messages, vec!["first", "second"]);
        assert_eq!(*log.lock(), vec![1, 2]);
    }
}
