use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use flate2::Compression;
use flate2::write::GzEncoder;
use parking_lot::Mutex;
use serde::Deserialize;
use time::format_description::BorrowedFormatItem;
use time::format_description::well_known::Rfc3339;
use time::macros::format_description;
use time::{Duration, OffsetDateTime, PrimitiveDateTime};

use crate::sink::Sink;

const MEGABYTE: u64 = 1024 * 1024;

// Timestamp embedded in backup names, e.g. `exchange-2024-05-29T18-51-00.123.log`.
const BACKUP_TIME_FORMAT: &[BorrowedFormatItem<'static>] = format_description!(
    "[year]-[month]-[day]T[hour]-[minute]-[second].[subsecond digits:3]"
);

/// Settings of a [`RotatingFileSink`].
///
/// Deserializable, so it can live in the application's own config file:
///
/// ```toml
/// filename = "logs/exchange.log"
/// max_size = 50      # megabytes
/// max_backups = 10
/// max_age = 14       # days
/// compress = true
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SinkConfig {
    /// Active log file. Rotated files are written next to it.
    pub filename: PathBuf,
    /// Size in megabytes that triggers a rotation.
    pub max_size: u64,
    /// Rotated files to keep, `0` keeps all of them.
    pub max_backups: usize,
    /// Days to keep rotated files, `0` disables the age cutoff.
    pub max_age: u32,
    /// Gzip rotated files.
    pub compress: bool,
}

impl Default for SinkConfig {
    fn default() -> Self {
        SinkConfig {
            filename: PathBuf::from("logs/exchange.log"),
            max_size: 100,
            max_backups: 0,
            max_age: 0,
            compress: false,
        }
    }
}

impl SinkConfig {
    /// Parse and validate a TOML document. Missing keys take their defaults.
    pub fn from_toml(source: &str) -> Result<Self, SinkError> {
        let config: SinkConfig = toml::from_str(source)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), SinkError> {
        if self.filename.as_os_str().is_empty() || self.filename.file_name().is_none() {
            return Err(SinkError::InvalidConfig("filename must name a file"));
        }
        if self.max_size == 0 {
            return Err(SinkError::InvalidConfig("max_size must be at least 1 megabyte"));
        }
        Ok(())
    }

    fn max_bytes(&self) -> u64 {
        self.max_size.saturating_mul(MEGABYTE)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    #[error("log file I/O failed: {0}")]
    Io(#[from] io::Error),
    #[error("malformed sink config: {0}")]
    Config(#[from] toml::de::Error),
    #[error("invalid sink config: {0}")]
    InvalidConfig(&'static str),
}

/// [`Sink`] writing every line to a size-rotated file and to the console.
///
/// Each line is `<RFC3339 UTC timestamp> <LEVEL> <message>`. Both destinations
/// receive identical bytes, written while holding one lock.
pub struct RotatingFileSink {
    config: SinkConfig,
    state: Mutex<FileState>,
}

struct FileState {
    file: Option<BufWriter<File>>,
    size: u64,
    console: Box<dyn Write + Send>,
}

impl RotatingFileSink {
    pub fn new(config: SinkConfig) -> Result<Self, SinkError> {
        Self::with_console(config, Box::new(io::stdout()))
    }

    /// Same as [`new`](Self::new) but mirrors lines into `console` instead of stdout.
    pub fn with_console(
        config: SinkConfig,
        console: Box<dyn Write + Send>,
    ) -> Result<Self, SinkError> {
        config.validate()?;

        let sink = RotatingFileSink {
            config,
            state: Mutex::new(FileState {
                file: None,
                size: 0,
                console,
            }),
        };
        sink.open(&mut sink.state.lock())?;

        Ok(sink)
    }

    pub fn config(&self) -> &SinkConfig {
        &self.config
    }

    fn open(&self, state: &mut FileState) -> Result<(), SinkError> {
        if let Some(dir) = self.config.filename.parent() {
            if !dir.as_os_str().is_empty() {
                fs::create_dir_all(dir)?;
            }
        }

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.config.filename)?;
        state.size = file.metadata()?.len();
        state.file = Some(BufWriter::new(file));

        Ok(())
    }

    fn write_file(&self, state: &mut FileState, line: &[u8]) -> Result<(), SinkError> {
        if state.file.is_none() {
            self.open(state)?;
        }

        let len = line.len() as u64;
        if state.size > 0 && state.size + len > self.config.max_bytes() {
            self.rotate(state)?;
        }

        if let Some(file) = state.file.as_mut() {
            file.write_all(line)?;
            file.flush()?;
            state.size += len;
        }

        Ok(())
    }

    fn rotate(&self, state: &mut FileState) -> Result<(), SinkError> {
        if let Some(mut file) = state.file.take() {
            file.flush()?;
        }

        let backup = free_backup_path(&self.config.filename, OffsetDateTime::now_utc());
        fs::rename(&self.config.filename, &backup)?;

        if self.config.compress {
            compress(&backup)?;
        }

        self.open(state)?;
        self.prune()
    }

    fn prune(&self) -> Result<(), SinkError> {
        let Some((dir, prefix, ext)) = name_parts(&self.config.filename) else {
            return Ok(());
        };

        let mut backups: Vec<(PrimitiveDateTime, PathBuf)> = fs::read_dir(dir)?
            .filter_map(|entry| entry.ok())
            .filter_map(|entry| {
                let name = entry.file_name().into_string().ok()?;
                let stamp = backup_time(&name, &prefix, &ext)?;
                Some((stamp, entry.path()))
            })
            .collect();

        // newest first
        backups.sort_by(|a, b| b.0.cmp(&a.0));

        let cutoff = (self.config.max_age > 0).then(|| {
            let now = OffsetDateTime::now_utc();
            let cutoff = now - Duration::days(i64::from(self.config.max_age));
            PrimitiveDateTime::new(cutoff.date(), cutoff.time())
        });

        for (index, (stamp, path)) in backups.into_iter().enumerate() {
            let too_many = self.config.max_backups > 0 && index >= self.config.max_backups;
            let too_old = cutoff.is_some_and(|cutoff| stamp < cutoff);
            if too_many || too_old {
                if let Err(err) = fs::remove_file(&path) {
                    eprintln!("exchange log: cannot remove {}: {err}", path.display());
                }
            }
        }

        Ok(())
    }
}

impl Sink for RotatingFileSink {
    fn emit(&self, level: log::Level, message: &str) {
        let line = format_line(OffsetDateTime::now_utc(), level, message);
        let mut state = self.state.lock();

        if let Err(err) = self.write_file(&mut state, line.as_bytes()) {
            eprintln!(
                "exchange log: cannot write to {}: {err}",
                self.config.filename.display()
            );
        }

        if state.console.write_all(line.as_bytes()).is_ok() {
            let _ = state.console.flush();
        }
    }

    fn flush(&self) {
        let mut state = self.state.lock();

        if let Some(file) = state.file.as_mut() {
            if let Err(err) = file.flush() {
                eprintln!(
                    "exchange log: cannot flush {}: {err}",
                    self.config.filename.display()
                );
            }
        }
        let _ = state.console.flush();
    }
}

fn format_line(now: OffsetDateTime, level: log::Level, message: &str) -> String {
    let stamp = now.format(&Rfc3339).unwrap_or_else(|_| now.unix_timestamp().to_string());
    format!("{stamp} {level} {message}\n")
}

// `logs/exchange.log` -> (`logs`, `exchange-`, `.log`)
fn name_parts(filename: &Path) -> Option<(&Path, String, String)> {
    let dir = match filename.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir,
        _ => Path::new("."),
    };
    let stem = filename.file_stem()?.to_str()?;
    let ext = filename
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| format!(".{ext}"))
        .unwrap_or_default();

    Some((dir, format!("{stem}-"), ext))
}

fn backup_path(filename: &Path, now: OffsetDateTime) -> PathBuf {
    let stamp = now
        .format(BACKUP_TIME_FORMAT)
        .unwrap_or_else(|_| now.unix_timestamp().to_string());

    match name_parts(filename) {
        Some((dir, prefix, ext)) => dir.join(format!("{prefix}{stamp}{ext}")),
        None => filename.with_extension(stamp),
    }
}

// Two rotations within one millisecond would share a name. Move the stamp
// forward until neither the plain nor the gzipped backup exists.
fn free_backup_path(filename: &Path, mut now: OffsetDateTime) -> PathBuf {
    loop {
        let path = backup_path(filename, now);
        let mut gz_name = path.as_os_str().to_owned();
        gz_name.push(".gz");
        if !path.exists() && !Path::new(&gz_name).exists() {
            return path;
        }
        now += Duration::milliseconds(1);
    }
}

fn backup_time(name: &str, prefix: &str, ext: &str) -> Option<PrimitiveDateTime> {
    let name = name.strip_suffix(".gz").unwrap_or(name);
    let stamp = name.strip_prefix(prefix)?.strip_suffix(ext)?;
    PrimitiveDateTime::parse(stamp, BACKUP_TIME_FORMAT).ok()
}

fn compress(path: &Path) -> Result<(), SinkError> {
    let mut gz_name = path.as_os_str().to_owned();
    gz_name.push(".gz");
    let gz_path = PathBuf::from(gz_name);

    let mut input = BufReader::new(File::open(path)?);
    let mut encoder = GzEncoder::new(File::create(&gz_path)?, Compression::default());
    io::copy(&mut input, &mut encoder)?;
    encoder.finish()?;

    fs::remove_file(path)?;
    Ok(())
}
