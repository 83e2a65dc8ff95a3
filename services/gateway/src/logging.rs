//! Logging initialization.
//!
//! JSON events go to stdout. With file logging enabled they are also
//! appended to `<log_dir>/mazarin.log`.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::Path;
use std::sync::{Mutex, PoisonError};

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::LoggingSettings;

const LOG_FILE_NAME: &str = "mazarin.log";

/// Thread-safe log file handle.
struct SharedWriter(Mutex<File>);

impl Write for &SharedWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.0
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .flush()
    }
}

impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for &'static SharedWriter {
    type Writer = &'static SharedWriter;

    fn make_writer(&'a self) -> Self::Writer {
        *self
    }
}

fn open_log_file(dir: &Path) -> io::Result<File> {
    fs::create_dir_all(dir)?;
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(dir.join(LOG_FILE_NAME))
}

/// Install the global subscriber.
///
/// `RUST_LOG` wins over `level` when set.
pub fn init(level: &str, logging: Option<&LoggingSettings>) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let file_layer = match logging.filter(|settings| settings.enable_logging) {
        Some(settings) => {
            let file = open_log_file(&settings.log_dir)?;
            // Lives for the rest of the process.
            let shared: &'static SharedWriter = Box::leak(Box::new(SharedWriter(Mutex::new(file))));
            Some(tracing_subscriber::fmt::layer().json().with_writer(shared))
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().json())
        .with(file_layer)
        .try_init()?;

    Ok(())
}
