//! Structured logging for foreman.
//!
//! Everything goes through `tracing`. `init` installs a fmt subscriber that
//! writes to `~/.foreman/foreman.log`, truncated at startup, or to stderr
//! when no home directory is available.
//!
//! Filter precedence: `RUST_LOG` if set, else `debug` when `--debug` or
//! `FOREMAN_DEBUG=1`, else `info`.

use std::fs::File;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, OnceLock};

use tracing_subscriber::EnvFilter;

static DEBUG_ENABLED: AtomicBool = AtomicBool::new(false);
static LOG_PATH: OnceLock<PathBuf> = OnceLock::new();

fn env_debug() -> bool {
    std::env::var("FOREMAN_DEBUG")
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(false)
}

fn default_directive(debug: bool) -> &'static str {
    if debug {
        "debug"
    } else {
        "info"
    }
}

fn filter(debug: bool) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directive(debug)))
}

fn open_log_file() -> Option<(PathBuf, File)> {
    let dir = dirs::home_dir()?.join(".foreman");
    std::fs::create_dir_all(&dir).ok()?;
    let path = dir.join("foreman.log");
    let file = File::create(&path).ok()?;
    Some((path, file))
}

/// Install the global subscriber. Later calls are no-ops.
pub fn init(debug: bool) {
    let debug_enabled = debug || env_debug();
    DEBUG_ENABLED.store(debug_enabled, Ordering::SeqCst);

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter(debug_enabled))
        .with_target(true)
        .with_ansi(false);

    let installed = match open_log_file() {
        Some((path, file)) => {
            let result = builder.with_writer(Mutex::new(file)).try_init();
            if result.is_ok() {
                let _ = LOG_PATH.set(path);
            }
            result.is_ok()
        }
        None => builder.with_writer(std::io::stderr).try_init().is_ok(),
    };

    if installed {
        tracing::info!(
            debug = debug_enabled,
            log_file = ?LOG_PATH.get(),
            "Logging initialized"
        );
    }
}

pub fn is_debug() -> bool {
    DEBUG_ENABLED.load(Ordering::Relaxed)
}

/// File the subscriber writes to, if any.
pub fn log_path() -> Option<&'static PathBuf> {
    LOG_PATH.get()
}
