//! Logging setup and the data-loop debug toggle.
//!
//! Cycle-granular prints are too hot to leave behind an `EnvFilter` lookup,
//! so the data loop gates them on one relaxed atomic instead. Flip it at
//! runtime with [`set_graph_debug`] or at startup through the
//! `MEDIAFLOW_DEBUG` environment variable.

use std::sync::atomic::{AtomicBool, Ordering};

use tracing_subscriber::EnvFilter;

/// Process-wide switch for the data loop's per-cycle debug prints.
pub static GRAPH_DEBUG_ENABLED: AtomicBool = AtomicBool::new(false);

/// Enable or disable the per-cycle debug prints.
pub fn set_graph_debug(enabled: bool) {
    GRAPH_DEBUG_ENABLED.store(enabled, Ordering::Relaxed);
    tracing::info!("graph debug prints {}", if enabled { "on" } else { "off" });
}

pub fn is_graph_debug_enabled() -> bool {
    GRAPH_DEBUG_ENABLED.load(Ordering::Relaxed)
}

/// Per-cycle debug print, gated on [`is_graph_debug_enabled`].
///
/// The check is a single relaxed load, cheap enough for the scheduling path.
#[macro_export]
macro_rules! graph_debug {
    ($($arg:tt)*) => {
        if $crate::log::is_graph_debug_enabled() {
            println!($($arg)*);
        }
    };
}

/// Install a tracing subscriber for binaries and tests.
///
/// Respects `RUST_LOG` (defaulting to `info` for this crate) and turns the
/// cycle debug prints on when `MEDIAFLOW_DEBUG` is set. Safe to call more
/// than once - later calls are ignored.
pub fn init_tracing() {
    if std::env::var_os("MEDIAFLOW_DEBUG").is_some() {
        GRAPH_DEBUG_ENABLED.store(true, Ordering::Relaxed);
    }
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("mediaflow=info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn debug_toggle_round_trips() {
        set_graph_debug(true);
        assert!(is_graph_debug_enabled());
        set_graph_debug(false);
        assert!(!is_graph_debug_enabled());
    }
}
