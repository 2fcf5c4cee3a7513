//! Gate logging: structured events to stdout, mirrored into one log file per
//! UTC day under `log_dir` (`tally-gate.YYYY-MM-DD.log`).

use chrono::{NaiveDate, Utc};
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::EnvFilter;

use crate::config::Config;

const LOG_FILE_STEM: &str = "tally-gate";

/// Holds the file sink for the life of the process.
pub struct LogGuard {
    sink: Option<Arc<DailyFile>>,
}

impl LogGuard {
    pub fn current_path(&self) -> Option<PathBuf> {
        self.sink.as_ref().and_then(|sink| sink.current_path())
    }
}

pub fn init_logging(config: &Config) -> Option<LogGuard> {
    let level = match (config.debug, std::env::var("TALLY_LOG_LEVEL")) {
        (true, _) => "debug".to_string(),
        (false, Ok(level)) if !level.trim().is_empty() => level,
        _ => "info".to_string(),
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let sink = match DailyFile::open(&config.log_dir) {
        Ok(sink) => sink.map(Arc::new),
        Err(err) => {
            eprintln!("event=log_file_error dir={} error={err}", config.log_dir);
            None
        }
    };
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(GateWriter { sink: sink.clone() })
        .finish();
    tracing::subscriber::set_global_default(subscriber).ok()?;
    Some(LogGuard { sink })
}

/// A log file that rolls over when the UTC date changes.
struct DailyFile {
    dir: PathBuf,
    current: Mutex<Option<(NaiveDate, File)>>,
}

impl DailyFile {
    /// `Ok(None)` when no directory is configured.
    fn open(log_dir: &str) -> io::Result<Option<Self>> {
        let log_dir = log_dir.trim();
        if log_dir.is_empty() {
            return Ok(None);
        }
        let dir = PathBuf::from(log_dir);
        std::fs::create_dir_all(&dir)?;
        let sink = Self {
            dir,
            current: Mutex::new(None),
        };
        // Fail at startup rather than on the first event.
        sink.write_on(Utc::now().date_naive(), b"")?;
        Ok(Some(sink))
    }

    fn write_on(&self, day: NaiveDate, buf: &[u8]) -> io::Result<()> {
        let mut current = self
            .current
            .lock()
            .map_err(|_| io::Error::new(io::ErrorKind::Other, "log file lock poisoned"))?;
        let stale = !matches!(&*current, Some((open_day, _)) if *open_day == day);
        if stale {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(file_path(&self.dir, day))?;
            *current = Some((day, file));
        }
        match current.as_mut() {
            Some((_, file)) => file.write_all(buf),
            None => Ok(()),
        }
    }

    fn flush(&self) -> io::Result<()> {
        if let Ok(mut current) = self.current.lock() {
            if let Some((_, file)) = current.as_mut() {
                return file.flush();
            }
        }
        Ok(())
    }

    fn current_path(&self) -> Option<PathBuf> {
        let current = self.current.lock().ok()?;
        current.as_ref().map(|(day, _)| file_path(&self.dir, *day))
    }
}

fn file_path(dir: &Path, day: NaiveDate) -> PathBuf {
    dir.join(format!("{LOG_FILE_STEM}.{}.log", day.format("%Y-%m-%d")))
}

#[derive(Clone)]
struct GateWriter {
    sink: Option<Arc<DailyFile>>,
}

impl<'a> MakeWriter<'a> for GateWriter {
    type Writer = GateWriter;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

impl Write for GateWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let _ = io::stdout().write_all(buf);
        if let Some(sink) = &self.sink {
            // A full disk must not take the gate down with it.
            let _ = sink.write_on(Utc::now().date_naive(), buf);
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        let _ = io::stdout().flush();
        if let Some(sink) = &self.sink {
            let _ = sink.flush();
        }
        Ok(())
    }
}
