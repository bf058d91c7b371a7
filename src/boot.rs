use chrono::Local;
use log::LevelFilter;
use std::io::{self, Write};

use env_logger::{Builder, Target};

/// Environment variable naming a log file, used when `--log-file` is absent.
pub const LOG_FILE_ENV: &str = "BUSPROBE_LOG_FILE";

/// Initialize logging. Records go to `log_file` (or `$BUSPROBE_LOG_FILE`)
/// when given, to stderr otherwise; `RUST_LOG` overrides the default level.
pub fn init_logger(log_file: Option<&str>) {
    let path = log_file
        .map(str::to_string)
        .or_else(|| std::env::var(LOG_FILE_ENV).ok());

    if let Some(path) = path {
        if let Err(err) = init_file_logger(&path) {
            eprintln!("Failed to initialize file logger at '{path}': {err}");
            init_stderr_logger();
        }
    } else {
        init_stderr_logger();
    }
}

fn init_stderr_logger() {
    let mut builder = Builder::new();
    builder
        .format(|buf, record| {
            writeln!(
                buf,
                "{} [{}] {}",
                Local::now().format("%Y-%m-%d %H:%M:%S"),
                record.level(),
                record.args()
            )
        })
        .target(Target::Stderr)
        .filter_level(LevelFilter::Info)
        .parse_default_env();
    let _ = builder.try_init();
}

fn init_file_logger(path: &str) -> io::Result<()> {
    let file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)?;

    let mut builder = Builder::new();
    builder
        .format(|buf, record| {
            writeln!(
                buf,
                "{}:{} {} [{}] - {}",
                record.file().unwrap_or("unknown"),
                record.line().unwrap_or(0),
                Local::now().format("%Y-%m-%dT%H:%M:%S%.3f"),
                record.level(),
                record.args()
            )
        })
        .target(Target::Pipe(Box::new(file)))
        .filter_level(LevelFilter::Debug)
        .parse_default_env();
    if builder.try_init().is_err() {
        return Err(io::Error::new(
            io::ErrorKind::AlreadyExists,
            "a logger is already installed",
        ));
    }

    log::info!("File logger initialized at {path}");

    Ok(())
}
