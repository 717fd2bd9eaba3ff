use core::fmt;

use tracing_core::Level;
use tracing_subscriber::{
    EnvFilter, Layer, filter::filter_fn, layer::SubscriberExt, registry, util::SubscriberInitExt,
};

/// Sink for items reported while a transfer runs.
pub trait Logger<T>: Send {
    /// Log an item.
    fn log(&mut self, item: T);
}

/// Objective value observed at one outer iteration.
#[derive(new, Debug, Clone, Copy, PartialEq)]
pub struct LossReport {
    /// 1-based outer iteration.
    pub iteration: usize,
    /// Objective value after the iteration.
    pub loss: f64,
}

impl fmt::Display for LossReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Iteration: {}, loss: {:.6}", self.iteration, self.loss)
    }
}

/// In memory logger.
#[derive(Debug)]
pub struct InMemoryLogger<T> {
    pub values: Vec<T>,
}

impl<T> Default for InMemoryLogger<T> {
    fn default() -> Self {
        Self { values: Vec::new() }
    }
}

impl<T: Send> Logger<T> for InMemoryLogger<T> {
    fn log(&mut self, item: T) {
        self.values.push(item);
    }
}

/// Forwards every item to the `info` log level.
#[derive(Debug, Default, Clone, Copy)]
pub struct ConsoleLogger;

impl<T: fmt::Display> Logger<T> for ConsoleLogger {
    fn log(&mut self, item: T) {
        log::info!("{item}");
    }
}

/// Install a stderr subscriber honoring `RUST_LOG`, defaulting to `info`.
///
/// Records emitted through the `log` macros are forwarded as well.
pub fn install_logging() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let layer = tracing_subscriber::fmt::layer()
        .with_filter(env_filter)
        .with_filter(filter_fn(|m| {
            if let Some(path) = m.module_path() {
                // The wgpu crate is logging too much, so we skip `info` level.
                if path.starts_with("wgpu") && *m.level() >= Level::INFO {
                    return false;
                }
            }
            true
        }));

    // Installing twice in one process fails, the first subscriber stays.
    let _ = registry().with(layer).try_init();
}
