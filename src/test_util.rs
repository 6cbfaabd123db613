use crate::config;
use parking_lot::{Mutex, MutexGuard};
use std::sync::Arc;
use std::thread::{self, ThreadId};
use tracing_subscriber::EnvFilter;

// Serializes tests that touch the process-wide configuration.
static CONFIG_LOCK: Mutex<()> = parking_lot::const_mutex(());

pub(crate) fn trace_init() -> tracing::subscriber::DefaultGuard {
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .finish();
    tracing::subscriber::set_default(subscriber)
}

pub(crate) fn config_lock() -> MutexGuard<'static, ()> {
    CONFIG_LOCK.lock()
}

/// Records unhandled rejections reported on the current thread until
/// dropped.
pub(crate) struct CaptureUnhandled {
    thread: ThreadId,
    seen: Arc<Mutex<Vec<(ThreadId, String)>>>,
    _lock: MutexGuard<'static, ()>,
}

pub(crate) fn capture_unhandled() -> CaptureUnhandled {
    let lock = config_lock();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    config::update(move |cfg| {
        cfg.set_unhandled_rejection_handler(move |rejection| {
            sink.lock()
                .push((thread::current().id(), rejection.reason().to_string()));
        });
    });

    CaptureUnhandled {
        thread: thread::current().id(),
        seen,
        _lock: lock,
    }
}

impl CaptureUnhandled {
    pub(crate) fn messages(&self) -> Vec<String> {
        self.seen
            .lock()
            .iter()
            .filter(|(thread, _)| *thread == self.thread)
            .map(|(_, message)| message.clone())
            .collect()
    }
}

impl Drop for CaptureUnhandled {
    fn drop(&mut self) {
        config::update(|cfg| {
            cfg.clear_unhandled_rejection_handler();
        });
    }
}
