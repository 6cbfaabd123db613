//! Process-wide settings.
//!
//! ```
//! use promise_core::config;
//!
//! config::update(|cfg| {
//!     cfg.set_max_pooled_per_type(64)
//!         .set_unhandled_rejection_handler(|rejection| eprintln!("{rejection}"));
//! });
//! assert_eq!(config::snapshot().max_pooled_per_type(), 64);
//! ```

use crate::scheduler::{ExecutionContext, NewThreadContext};
use crate::UnhandledRejection;
use parking_lot::RwLock;
use std::fmt;
use std::sync::Arc;

type RejectionHandler = Arc<dyn Fn(UnhandledRejection) + Send + Sync>;

static CONFIG: RwLock<Config> = parking_lot::const_rwlock(Config::DEFAULT);

#[derive(Clone)]
pub struct Config {
    object_pooling: bool,
    max_pooled_per_type: usize,
    unhandled_rejection_handler: Option<RejectionHandler>,
    foreground_context: Option<Arc<dyn ExecutionContext>>,
    background_context: Option<Arc<dyn ExecutionContext>>,
}

impl Config {
    const DEFAULT: Config = Config {
        object_pooling: true,
        max_pooled_per_type: 256,
        unhandled_rejection_handler: None,
        foreground_context: None,
        background_context: None,
    };

    pub fn object_pooling(&self) -> bool {
        self.object_pooling
    }

    /// Enables or disables reuse of promise nodes, cancelation refs and
    /// combinator nodes. Already pooled objects stay pooled until
    /// [`pool::clear`](crate::pool::clear) is called.
    pub fn set_object_pooling(&mut self, enabled: bool) -> &mut Self {
        self.object_pooling = enabled;
        self
    }

    pub fn max_pooled_per_type(&self) -> usize {
        self.max_pooled_per_type
    }

    pub fn set_max_pooled_per_type(&mut self, max: usize) -> &mut Self {
        self.max_pooled_per_type = max;
        self
    }

    /// Sets the sink for rejections that were disposed without any consumer
    /// observing them. The default logs them at `error` level.
    pub fn set_unhandled_rejection_handler<F>(&mut self, handler: F) -> &mut Self
    where
        F: Fn(UnhandledRejection) + Send + Sync + 'static,
    {
        self.unhandled_rejection_handler = Some(Arc::new(handler));
        self
    }

    pub fn clear_unhandled_rejection_handler(&mut self) -> &mut Self {
        self.unhandled_rejection_handler = None;
        self
    }

    /// The context continuations targeting
    /// [`Target::Foreground`](crate::Target::Foreground) are posted to. When
    /// unset they run synchronously.
    pub fn set_foreground_context(&mut self, context: Arc<dyn ExecutionContext>) -> &mut Self {
        self.foreground_context = Some(context);
        self
    }

    /// The context continuations targeting
    /// [`Target::Background`](crate::Target::Background) are posted to. When
    /// unset every flushed batch runs on a new thread.
    pub fn set_background_context(&mut self, context: Arc<dyn ExecutionContext>) -> &mut Self {
        self.background_context = Some(context);
        self
    }
}

impl Default for Config {
    fn default() -> Self {
        Config::DEFAULT
    }
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("object_pooling", &self.object_pooling)
            .field("max_pooled_per_type", &self.max_pooled_per_type)
            .field(
                "unhandled_rejection_handler",
                &self.unhandled_rejection_handler.is_some(),
            )
            .field("foreground_context", &self.foreground_context.is_some())
            .field("background_context", &self.background_context.is_some())
            .finish()
    }
}

pub fn update(f: impl FnOnce(&mut Config)) {
    let mut config = CONFIG.write();
    f(&mut config);
    tracing::debug!(config = ?*config, "configuration updated");
}

pub fn snapshot() -> Config {
    CONFIG.read().clone()
}

/// Returns the pool capacity per node type, or `None` if pooling is off.
pub(crate) fn pool_capacity() -> Option<usize> {
    let config = CONFIG.read();
    config.object_pooling.then_some(config.max_pooled_per_type)
}

pub(crate) fn foreground_context() -> Option<Arc<dyn ExecutionContext>> {
    CONFIG.read().foreground_context.clone()
}

pub(crate) fn background_context() -> Arc<dyn ExecutionContext> {
    CONFIG
        .read()
        .background_context
        .clone()
        .unwrap_or_else(|| Arc::new(NewThreadContext))
}

pub(crate) fn report_unhandled(rejection: UnhandledRejection) {
    // never call out while holding the lock
    let handler = CONFIG.read().unhandled_rejection_handler.clone();
    match handler {
        Some(handler) => handler(rejection),
        None => tracing::error!(reason = %rejection.reason(), "unhandled promise rejection"),
    }
}
