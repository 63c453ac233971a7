//! Stdout log backend for hosts that do not bring their own.

use std::sync::atomic::{AtomicBool, Ordering};
use log::LevelFilter;

static INITIALIZED: AtomicBool = AtomicBool::new(false);

/// Install a `fern` logger writing to stdout.
///
/// Returns false if this or another logger was already installed.
pub fn init(level: LevelFilter) -> bool {
    if INITIALIZED.swap(true, Ordering::SeqCst) {
        return false;
    }

    let result = fern::Dispatch::new()
        .format(|out, message, record| {
            out.finish(format_args!(
                "[{} {} {}] {}",
                chrono::Local::now().format("%H:%M:%S%.3f"),
                record.level(),
                record.target(),
                message
            ))
        })
        .level(level)
        .chain(std::io::stdout())
        .apply();

    match result {
        Ok(()) => {
            log::info!("Logger initialized with level: {}", level);
            true
        }
        Err(_) => false,
    }
}
