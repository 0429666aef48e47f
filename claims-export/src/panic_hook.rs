//! Crash reporting for the worker daemon.
//!
//! A panic on a consumer task takes the whole process down
//! (`panic = "abort"` in release), and the non-blocking log writer may
//! never get to flush. The hook therefore records the panic twice: once
//! through `tracing` for the normal pipeline, and once synchronously into
//! today's log file so the record survives the abort.

use std::backtrace::Backtrace;
use std::io::Write;
use std::panic;
use std::path::{Path, PathBuf};

use chrono::Local;

pub fn install(log_dir: impl AsRef<Path>) {
    let log_dir = log_dir.as_ref().to_path_buf();
    let default_hook = panic::take_hook();

    panic::set_hook(Box::new(move |info| {
        let message = info
            .payload()
            .downcast_ref::<&str>()
            .map(|s| (*s).to_string())
            .or_else(|| info.payload().downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "<opaque panic payload>".to_string());

        let location = info
            .location()
            .map(|l| l.to_string())
            .unwrap_or_else(|| "<unknown>".to_string());

        let thread = std::thread::current()
            .name()
            .unwrap_or("<unnamed>")
            .to_string();

        tracing::error!(
            target: "claims_export::panic",
            location = %location,
            thread = %thread,
            version = env!("CARGO_PKG_VERSION"),
            "Worker panicked: {message}"
        );

        if cfg!(panic = "abort") {
            let backtrace = Backtrace::force_capture();
            let _ = mirror_to_log_file(&log_dir, &thread, &location, &message, &backtrace);
        }

        default_hook(info);
    }));
}

/// Append a compact record plus backtrace to today's log file, bypassing
/// the background writer.
fn mirror_to_log_file(
    log_dir: &Path,
    thread: &str,
    location: &str,
    message: &str,
    backtrace: &Backtrace,
) -> std::io::Result<()> {
    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(daily_log_path(log_dir))?;

    writeln!(
        file,
        "{} PANIC claims-export v{} thread={thread} at {location}: {message}",
        Local::now().format("%Y-%m-%dT%H:%M:%S%.3f%:z"),
        env!("CARGO_PKG_VERSION"),
    )?;
    writeln!(file, "{backtrace}")?;
    file.flush()
}

/// Today's file under the `tracing_appender::rolling::daily` naming scheme.
fn daily_log_path(log_dir: &Path) -> PathBuf {
    log_dir.join(format!(
        "claims-export.log.{}",
        Local::now().format("%Y-%m-%d")
    ))
}
