#![allow(dead_code)]

use parking_lot::{Mutex, MutexGuard};
use promise_core::config;
use std::sync::Arc;
use std::thread::{self, ThreadId};

static CONFIG_LOCK: Mutex<()> = parking_lot::const_mutex(());

pub fn trace_init() -> tracing::subscriber::DefaultGuard {
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .finish();
    tracing::subscriber::set_default(subscriber)
}

pub fn config_lock() -> MutexGuard<'static, ()> {
    CONFIG_LOCK.lock()
}

/// Collects unhandled rejections reported on the creating thread.
pub struct Unhandled {
    thread: ThreadId,
    seen: Arc<Mutex<Vec<(ThreadId, String)>>>,
    _lock: MutexGuard<'static, ()>,
}

impl Unhandled {
    pub fn capture() -> Self {
        let lock = config_lock();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        config::update(move |cfg| {
            cfg.set_unhandled_rejection_handler(move |rejection| {
                sink.lock()
                    .push((thread::current().id(), rejection.reason().to_string()));
            });
        });
        Self {
            thread: thread::current().id(),
            seen,
            _lock: lock,
        }
    }

    pub fn messages(&self) -> Vec<String> {
        self.seen
            .lock()
            .iter()
            .filter(|(thread, _)| *thread == self.thread)
            .map(|(_, message)| message.clone())
            .collect()
    }
}

impl Drop for Unhandled {
    fn drop(&mut self) {
        config::update(|cfg| {
            cfg.clear_unhandled_rejection_handler();
        });
    }
}
