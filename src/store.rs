//! Append-only temperature store.
//!
//! Records are kept in a single file that is only ever replaced whole: the
//! new content is written to a temporary file in the same directory, synced,
//! and renamed over the old one. Readers see either the old or the new file.

use std::fmt;
use std::fs::{self, File};
#[cfg(not(unix))]
use std::fs::OpenOptions;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::str::FromStr;

use fs2::FileExt;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, info_span, warn, Span};
use uuid::Uuid;

use crate::validator::{format_temperature, parse_timestamp, round_temperature};

/// Header line of a CSV store
pub const CSV_HEADER: &str = "timestamp,temperature";

const UTF8_BOM: &[u8] = b"\xEF\xBB\xBF";

/// One persisted reading.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TemperatureRecord {
    /// ISO 8601 timestamp with offset; unique within a store
    pub timestamp: String,

    /// Temperature in Celsius, one decimal digit
    pub temperature: f64,
}

impl TemperatureRecord {
    /// Create a record, rounding the temperature to one decimal digit.
    pub fn new(timestamp: impl Into<String>, temperature: f64) -> Self {
        Self {
            timestamp: timestamp.into(),
            temperature: round_temperature(temperature),
        }
    }

    /// Whether both records name the same instant.
    ///
    /// Equal strings always match; otherwise both must parse to the same
    /// point in time.
    pub fn same_timestamp(&self, other: &str) -> bool {
        if self.timestamp == other {
            return true;
        }
        match (parse_timestamp(&self.timestamp), parse_timestamp(other)) {
            (Ok(a), Ok(b)) => a == b,
            _ => false,
        }
    }

    fn to_csv_row(&self) -> String {
        format!("{},{}", self.timestamp, format_temperature(self.temperature))
    }
}

/// Errors that can occur while reading or writing the store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// A record with this timestamp is already stored
    #[error("Duplicate timestamp: {0}")]
    DuplicateTimestamp(String),

    /// The store exists but does not carry the expected schema
    #[error("Unexpected store schema: expected '{}', found '{found}'", CSV_HEADER)]
    SchemaMismatch { found: String },

    #[error("Store file starts with a UTF-8 byte-order mark")]
    ByteOrderMark,

    #[error("Corrupt store at line {line}: {message}")]
    Corrupt { line: usize, message: String },

    #[error("I/O error on {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Failed to lock {}: {source}", .path.display())]
    Lock {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl StoreError {
    fn io(path: &Path, source: io::Error) -> Self {
        StoreError::Io {
            path: path.to_path_buf(),
            source,
        }
    }

    /// Name of the failure class, for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            StoreError::DuplicateTimestamp(_) => "DuplicateTimestamp",
            StoreError::SchemaMismatch { .. } | StoreError::ByteOrderMark => "StoreSchemaMismatch",
            StoreError::Corrupt { .. } => "StoreCorrupt",
            StoreError::Io { .. } | StoreError::Lock { .. } => "StorageIOFailure",
        }
    }
}

/// On-disk representation of the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StoreFormat {
    /// `timestamp,temperature` header followed by one row per record
    #[default]
    Csv,

    /// Pretty-printed JSON array of records
    Json,
}

impl StoreFormat {
    /// File name used inside the output directory.
    pub fn file_name(&self) -> &'static str {
        match self {
            StoreFormat::Csv => "temperature.csv",
            StoreFormat::Json => "temperature.json",
        }
    }

    /// Parse stored content. Empty content is an empty store.
    pub fn decode(&self, bytes: &[u8]) -> Result<Vec<TemperatureRecord>, StoreError> {
        if bytes.starts_with(UTF8_BOM) {
            return Err(StoreError::ByteOrderMark);
        }
        let text = std::str::from_utf8(bytes).map_err(|e| StoreError::Corrupt {
            line: 0,
            message: format!("not valid UTF-8: {}", e),
        })?;
        if text.trim().is_empty() {
            return Ok(Vec::new());
        }

        match self {
            StoreFormat::Csv => decode_csv(text),
            StoreFormat::Json => decode_json(text),
        }
    }

    /// Build the full new content from the current content plus one record.
    ///
    /// CSV keeps the existing bytes untouched and appends one row, using the
    /// line ending of the existing header; JSON is re-serialized from the
    /// decoded records.
    pub fn encode_appended(
        &self,
        existing: &[u8],
        records: &[TemperatureRecord],
        record: &TemperatureRecord,
    ) -> Result<Vec<u8>, StoreError> {
        match self {
            StoreFormat::Csv => {
                let mut out = Vec::with_capacity(existing.len() + 64);
                let newline = line_ending(existing);
                if existing.iter().all(|b| b.is_ascii_whitespace()) {
                    out.extend_from_slice(CSV_HEADER.as_bytes());
                    out.extend_from_slice(newline);
                } else {
                    out.extend_from_slice(existing);
                    if !existing.ends_with(b"\n") {
                        out.extend_from_slice(newline);
                    }
                }
                out.extend_from_slice(record.to_csv_row().as_bytes());
                out.extend_from_slice(newline);
                Ok(out)
            }
            StoreFormat::Json => {
                let mut all = records.to_vec();
                all.push(record.clone());
                let mut out = serde_json::to_vec_pretty(&all).map_err(|e| StoreError::Corrupt {
                    line: 0,
                    message: e.to_string(),
                })?;
                out.push(b'\n');
                Ok(out)
            }
        }
    }
}

impl FromStr for StoreFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "csv" => Ok(StoreFormat::Csv),
            "json" => Ok(StoreFormat::Json),
            other => Err(format!("'{}' is not a supported format (csv, json)", other)),
        }
    }
}

impl fmt::Display for StoreFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreFormat::Csv => write!(f, "csv"),
            StoreFormat::Json => write!(f, "json"),
        }
    }
}

/// Line ending of the first line; `\n` when there is none yet.
fn line_ending(existing: &[u8]) -> &'static [u8] {
    match existing.iter().position(|&b| b == b'\n') {
        Some(i) if i > 0 && existing[i - 1] == b'\r' => b"\r\n",
        _ => b"\n",
    }
}

fn decode_csv(text: &str) -> Result<Vec<TemperatureRecord>, StoreError> {
    let mut lines = text.lines().enumerate();

    let header = lines
        .by_ref()
        .find(|(_, line)| !line.trim().is_empty())
        .map(|(_, line)| line.trim_end_matches('\r'))
        .unwrap_or_default();
    if header != CSV_HEADER {
        return Err(StoreError::SchemaMismatch {
            found: header.to_string(),
        });
    }

    let mut records = Vec::new();
    for (index, line) in lines {
        let line = line.trim_end_matches('\r');
        if line.trim().is_empty() {
            continue;
        }
        let corrupt = |message: String| StoreError::Corrupt {
            line: index + 1,
            message,
        };

        let (timestamp, temperature) = line
            .split_once(',')
            .ok_or_else(|| corrupt(format!("expected two fields in '{}'", line)))?;
        let temperature: f64 = temperature
            .trim()
            .parse()
            .map_err(|_| corrupt(format!("'{}' is not a temperature", temperature)))?;

        records.push(TemperatureRecord {
            timestamp: timestamp.trim().to_string(),
            temperature,
        });
    }

    Ok(records)
}

fn decode_json(text: &str) -> Result<Vec<TemperatureRecord>, StoreError> {
    serde_json::from_str(text).map_err(|e| StoreError::SchemaMismatch {
        found: format!("JSON document that is not a record array ({})", e),
    })
}

/// Durable, duplicate-rejecting, append-only record log.
pub struct AppendStore {
    path: PathBuf,
    format: StoreFormat,
    lock: bool,
    span: Span,
}

impl AppendStore {
    /// Create a store handle; nothing is touched on disk until [`append`](Self::append).
    pub fn new(path: impl Into<PathBuf>, format: StoreFormat) -> Self {
        let path = path.into();
        let span = info_span!("store", component = "store", path = %path.display());
        Self {
            path,
            format,
            lock: false,
            span,
        }
    }

    /// Hold an exclusive advisory lock during appends.
    ///
    /// On Unix the store's directory itself is locked, so no lock file is
    /// left next to the data. Elsewhere `<path>.lock` is used.
    pub fn with_lock(mut self, lock: bool) -> Self {
        self.lock = lock;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn format(&self) -> StoreFormat {
        self.format
    }

    /// Load the stored records in order.
    ///
    /// A missing or empty file is an empty store. A file whose header or
    /// structure does not match the schema is rejected.
    pub fn load_existing(&self) -> Result<Vec<TemperatureRecord>, StoreError> {
        let bytes = self.read_bytes()?;
        self.format.decode(&bytes)
    }

    /// Append one record.
    ///
    /// # Errors
    ///
    /// - `StoreError::DuplicateTimestamp` if the timestamp is already stored;
    ///   the store is left untouched
    /// - `StoreError::SchemaMismatch`/`ByteOrderMark`/`Corrupt` if the
    ///   existing file cannot be trusted
    /// - `StoreError::Io`/`Lock` on filesystem failure; the previous file is
    ///   left as it was
    pub fn append(&self, record: &TemperatureRecord) -> Result<(), StoreError> {
        let _entered = self.span.enter();

        self.ensure_parent_dir()?;
        let guard = if self.lock { Some(self.acquire_lock()?) } else { None };
        if guard.is_some() {
            // Nobody else can be mid-write, so any temporary file is from a killed run
            remove_stale_temp_files(&self.path);
        }

        let existing = self.read_bytes()?;
        let records = self.format.decode(&existing)?;
        debug!(records = records.len(), "Loaded existing records");

        if records.iter().any(|r| r.same_timestamp(&record.timestamp)) {
            return Err(StoreError::DuplicateTimestamp(record.timestamp.clone()));
        }

        let content = self.format.encode_appended(&existing, &records, record)?;
        write_and_replace(&self.path, |file| file.write_all(&content))?;

        info!(
            timestamp = %record.timestamp,
            temperature = %format_temperature(record.temperature),
            records = records.len() + 1,
            "Appended record"
        );
        Ok(())
    }

    fn read_bytes(&self) -> Result<Vec<u8>, StoreError> {
        match fs::read(&self.path) {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(StoreError::io(&self.path, e)),
        }
    }

    fn ensure_parent_dir(&self) -> Result<(), StoreError> {
        match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => {
                fs::create_dir_all(parent).map_err(|e| StoreError::io(parent, e))
            }
            _ => Ok(()),
        }
    }

    #[cfg(unix)]
    fn lock_target(&self) -> PathBuf {
        store_dir(&self.path).to_path_buf()
    }

    #[cfg(not(unix))]
    fn lock_target(&self) -> PathBuf {
        let mut name = self.path.as_os_str().to_owned();
        name.push(".lock");
        PathBuf::from(name)
    }

    /// The lock is released when the returned file is dropped.
    fn acquire_lock(&self) -> Result<File, StoreError> {
        let path = self.lock_target();
        let file = open_lock_target(&path).map_err(|e| StoreError::Lock {
            path: path.clone(),
            source: e,
        })?;
        file.lock_exclusive()
            .map_err(|e| StoreError::Lock { path: path.clone(), source: e })?;
        debug!(lock = %path.display(), "Acquired store lock");
        Ok(file)
    }
}

/// Write new content for `path` through a sibling temporary file and rename
/// it into place. On any failure the temporary file is removed and `path` is
/// left untouched.
fn write_and_replace<F>(path: &Path, write: F) -> Result<(), StoreError>
where
    F: FnOnce(&mut File) -> io::Result<()>,
{
    let tmp_path = temp_path_for(path);

    let result = (|| {
        let mut file = File::create(&tmp_path)?;
        write(&mut file)?;
        file.sync_all()?;
        drop(file);
        fs::rename(&tmp_path, path)
    })();

    if let Err(e) = result {
        if let Err(cleanup) = fs::remove_file(&tmp_path) {
            if cleanup.kind() != io::ErrorKind::NotFound {
                debug!(tmp = %tmp_path.display(), error = %cleanup, "Failed to remove temporary file");
            }
        }
        return Err(StoreError::io(path, e));
    }

    sync_parent_dir(path);
    Ok(())
}

#[cfg(unix)]
fn open_lock_target(path: &Path) -> io::Result<File> {
    File::open(path)
}

#[cfg(not(unix))]
fn open_lock_target(path: &Path) -> io::Result<File> {
    OpenOptions::new().create(true).truncate(false).write(true).open(path)
}

fn store_dir(path: &Path) -> &Path {
    match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    }
}

fn temp_prefix(path: &Path) -> String {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "store".to_string());
    format!(".{}.", name)
}

fn temp_path_for(path: &Path) -> PathBuf {
    path.with_file_name(format!("{}{}.tmp", temp_prefix(path), Uuid::new_v4().simple()))
}

/// Delete temporary files a killed run left next to `path`. Best effort.
fn remove_stale_temp_files(path: &Path) {
    let dir = store_dir(path);
    let prefix = temp_prefix(path);
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) => {
            debug!(dir = %dir.display(), error = %e, "Failed to scan for stale temporary files");
            return;
        }
    };

    for entry in entries.flatten() {
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if !(name.starts_with(&prefix) && name.ends_with(".tmp")) {
            continue;
        }
        match fs::remove_file(entry.path()) {
            Ok(()) => warn!(tmp = %name, "Removed stale temporary file"),
            Err(e) => debug!(tmp = %name, error = %e, "Failed to remove stale temporary file"),
        }
    }
}

/// Persist the rename itself. Best effort: not all platforms can open a directory.
#[cfg(unix)]
fn sync_parent_dir(path: &Path) {
    let parent = store_dir(path);
    if let Err(e) = File::open(parent).and_then(|dir| dir.sync_all()) {
        debug!(dir = %parent.display(), error = %e, "Failed to sync store directory");
    }
}

#[cfg(not(unix))]
fn sync_parent_dir(_path: &Path) {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;
    use tempfile::TempDir;

    fn csv_store(dir: &TempDir) -> AppendStore {
        AppendStore::new(dir.path().join("data").join("temperature.csv"), StoreFormat::Csv)
    }

    fn dir_entries(dir: &Path) -> Vec<String> {
        let mut names: Vec<String> = fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        names
    }

    #[test]
    fn test_first_append_writes_header_and_row() {
        let dir = TempDir::new().unwrap();
        let store = csv_store(&dir);

        store
            .append(&TemperatureRecord::new("2024-01-01T00:00:00+09:00", 25.5))
            .unwrap();

        let content = fs::read_to_string(store.path()).unwrap();
        assert_eq!(content, "timestamp,temperature\n2024-01-01T00:00:00+09:00,25.5\n");

        store
            .append(&TemperatureRecord::new("2024-01-01T00:10:00+09:00", 25.3))
            .unwrap();

        let content = fs::read_to_string(store.path()).unwrap();
        assert_eq!(
            content,
            "timestamp,temperature\n\
             2024-01-01T00:00:00+09:00,25.5\n\
             2024-01-01T00:10:00+09:00,25.3\n"
        );
    }

    #[test]
    fn test_missing_store_loads_empty() {
        let dir = TempDir::new().unwrap();
        let store = csv_store(&dir);
        assert!(store.load_existing().unwrap().is_empty());

        fs::create_dir_all(store.path().parent().unwrap()).unwrap();
        fs::write(store.path(), "").unwrap();
        assert!(store.load_existing().unwrap().is_empty());
    }

    #[test]
    fn test_empty_file_gets_header() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("temperature.csv");
        fs::write(&path, "").unwrap();
        let store = AppendStore::new(&path, StoreFormat::Csv);

        store.append(&TemperatureRecord::new("2024-01-01T00:00:00Z", 20.0)).unwrap();

        assert_eq!(
            fs::read_to_string(&path).unwrap(),
            "timestamp,temperature\n2024-01-01T00:00:00Z,20.0\n"
        );
    }

    #[test]
    fn test_duplicate_timestamp_leaves_store_untouched() {
        let dir = TempDir::new().unwrap();
        let store = csv_store(&dir);
        let record = TemperatureRecord::new("2024-01-01T00:00:00+09:00", 25.5);

        store.append(&record).unwrap();
        let before = fs::read(store.path()).unwrap();

        let err = store.append(&record).unwrap_err();
        assert!(matches!(err, StoreError::DuplicateTimestamp(ref ts) if ts == "2024-01-01T00:00:00+09:00"));
        assert_eq!(fs::read(store.path()).unwrap(), before);
        assert_eq!(store.load_existing().unwrap().len(), 1);
    }

    #[test]
    fn test_duplicate_detected_by_instant() {
        let dir = TempDir::new().unwrap();
        let store = csv_store(&dir);

        store
            .append(&TemperatureRecord::new("2024-01-01T00:00:00+09:00", 25.5))
            .unwrap();
        let err = store
            .append(&TemperatureRecord::new("2023-12-31T15:00:00Z", 25.5))
            .unwrap_err();
        assert!(matches!(err, StoreError::DuplicateTimestamp(_)));
    }

    #[test]
    fn test_append_preserves_existing_rows_byte_for_byte() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("temperature.csv");
        // Hand-edited rows and a missing final newline
        let original = "timestamp,temperature\n\
                        2024-01-01T00:00:00+09:00,25.50\n\
                        2024-01-01T00:10:00+09:00,25.3";
        fs::write(&path, original).unwrap();
        let store = AppendStore::new(&path, StoreFormat::Csv);

        store
            .append(&TemperatureRecord::new("2024-01-01T00:20:00+09:00", 25.26))
            .unwrap();

        let content = fs::read_to_string(&path).unwrap();
        assert!(content.starts_with(original));
        assert!(content.ends_with("25.3\n2024-01-01T00:20:00+09:00,25.3\n"));

        let records = store.load_existing().unwrap();
        assert_eq!(records.len(), 3);
        assert_eq!(records[0].timestamp, "2024-01-01T00:00:00+09:00");
        assert_eq!(records[0].temperature, 25.5);
        assert_eq!(records[2].timestamp, "2024-01-01T00:20:00+09:00");
    }

    #[test]
    fn test_out_of_range_value_is_stored() {
        let dir = TempDir::new().unwrap();
        let store = csv_store(&dir);

        store.append(&TemperatureRecord::new("2024-01-01T00:00:00Z", 100.0)).unwrap();

        let content = fs::read_to_string(store.path()).unwrap();
        assert!(content.ends_with("2024-01-01T00:00:00Z,100.0\n"));
    }

    #[test]
    fn test_wrong_header_is_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("temperature.csv");
        let original = "time,temp\n2024-01-01T00:00:00Z,20.0\n";
        fs::write(&path, original).unwrap();
        let store = AppendStore::new(&path, StoreFormat::Csv);

        assert!(matches!(
            store.load_existing().unwrap_err(),
            StoreError::SchemaMismatch { .. }
        ));
        let err = store
            .append(&TemperatureRecord::new("2024-01-02T00:00:00Z", 21.0))
            .unwrap_err();
        assert!(matches!(err, StoreError::SchemaMismatch { ref found } if found == "time,temp"));
        assert_eq!(fs::read_to_string(&path).unwrap(), original);
    }

    #[test]
    fn test_byte_order_mark_is_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("temperature.csv");
        let mut bytes = UTF8_BOM.to_vec();
        bytes.extend_from_slice(b"timestamp,temperature\n");
        fs::write(&path, &bytes).unwrap();
        let store = AppendStore::new(&path, StoreFormat::Csv);

        assert!(matches!(store.load_existing().unwrap_err(), StoreError::ByteOrderMark));
        assert!(store
            .append(&TemperatureRecord::new("2024-01-02T00:00:00Z", 21.0))
            .is_err());
        assert_eq!(fs::read(&path).unwrap(), bytes);
    }

    #[test]
    fn test_malformed_row_is_corrupt() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("temperature.csv");
        fs::write(&path, "timestamp,temperature\n2024-01-01T00:00:00Z,warm\n").unwrap();
        let store = AppendStore::new(&path, StoreFormat::Csv);

        match store.load_existing().unwrap_err() {
            StoreError::Corrupt { line, .. } => assert_eq!(line, 2),
            other => panic!("expected Corrupt, got {:?}", other),
        }
    }

    #[test]
    fn test_interrupted_write_leaves_original_intact() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("temperature.csv");
        let original = "timestamp,temperature\n2024-01-01T00:00:00+09:00,25.5\n";
        fs::write(&path, original).unwrap();

        let err = write_and_replace(&path, |file| {
            file.write_all(b"timestamp,temperature\n2024-01-01T00:00:00+09:00,2")?;
            Err(io::Error::new(io::ErrorKind::Other, "disk unplugged"))
        })
        .unwrap_err();

        assert!(matches!(err, StoreError::Io { .. }));
        assert_eq!(fs::read_to_string(&path).unwrap(), original);
        assert_eq!(dir_entries(dir.path()), vec!["temperature.csv".to_string()]);
    }

    #[test]
    fn test_no_temporary_files_left_after_append() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("temperature.csv");
        let store = AppendStore::new(&path, StoreFormat::Csv).with_lock(true);

        store.append(&TemperatureRecord::new("2024-01-01T00:00:00Z", 20.0)).unwrap();
        store.append(&TemperatureRecord::new("2024-01-01T00:10:00Z", 20.1)).unwrap();

        let mut expected = vec!["temperature.csv".to_string()];
        if cfg!(not(unix)) {
            expected.push("temperature.csv.lock".to_string());
        }
        assert_eq!(dir_entries(dir.path()), expected);
        assert_eq!(store.load_existing().unwrap().len(), 2);
    }

    #[test]
    fn test_stale_temporary_files_are_removed_under_lock() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("temperature.csv");
        fs::write(&path, "timestamp,temperature\n2024-01-01T00:00:00Z,20.0\n").unwrap();
        fs::write(dir.path().join(".temperature.csv.0123abcd.tmp"), "timestamp,temp").unwrap();
        fs::write(dir.path().join("notes.tmp"), "keep").unwrap();
        let store = AppendStore::new(&path, StoreFormat::Csv).with_lock(true);

        store.append(&TemperatureRecord::new("2024-01-01T00:10:00Z", 20.1)).unwrap();

        let entries = dir_entries(dir.path());
        assert!(!entries.iter().any(|n| n.starts_with(".temperature.csv.")));
        assert!(entries.contains(&"notes.tmp".to_string()));
        assert_eq!(store.load_existing().unwrap().len(), 2);
    }

    #[test]
    fn test_append_waits_for_store_lock() {
        let dir = TempDir::new().unwrap();
        let store = csv_store(&dir);
        fs::create_dir_all(store.path().parent().unwrap()).unwrap();

        let holder = open_lock_target(&store.lock_target()).unwrap();
        holder.lock_exclusive().unwrap();

        let path = store.path().to_path_buf();
        let writer = thread::spawn(move || {
            store
                .with_lock(true)
                .append(&TemperatureRecord::new("2024-01-01T00:00:00Z", 20.0))
        });

        thread::sleep(Duration::from_millis(200));
        assert!(!writer.is_finished());
        assert!(!path.exists());

        FileExt::unlock(&holder).unwrap();
        writer.join().unwrap().unwrap();
        assert_eq!(
            fs::read_to_string(&path).unwrap(),
            "timestamp,temperature\n2024-01-01T00:00:00Z,20.0\n"
        );
    }

    #[test]
    fn test_crlf_store_keeps_crlf_line_endings() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("temperature.csv");
        fs::write(&path, "timestamp,temperature\r\n2024-01-01T00:00:00Z,1.0\r\n").unwrap();
        let store = AppendStore::new(&path, StoreFormat::Csv);

        store.append(&TemperatureRecord::new("2024-01-01T00:10:00Z", 2.0)).unwrap();

        assert_eq!(
            fs::read_to_string(&path).unwrap(),
            "timestamp,temperature\r\n2024-01-01T00:00:00Z,1.0\r\n2024-01-01T00:10:00Z,2.0\r\n"
        );

        // Missing final newline on a CRLF file
        fs::write(&path, "timestamp,temperature\r\n2024-01-01T00:00:00Z,1.0").unwrap();
        store.append(&TemperatureRecord::new("2024-01-01T00:10:00Z", 2.0)).unwrap();
        assert_eq!(
            fs::read_to_string(&path).unwrap(),
            "timestamp,temperature\r\n2024-01-01T00:00:00Z,1.0\r\n2024-01-01T00:10:00Z,2.0\r\n"
        );
    }

    #[test]
    fn test_json_store_round_trip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("temperature.json");
        let store = AppendStore::new(&path, StoreFormat::Json);

        store
            .append(&TemperatureRecord::new("2024-01-01T00:00:00+09:00", 25.54))
            .unwrap();
        store
            .append(&TemperatureRecord::new("2024-01-01T00:10:00+09:00", 25.3))
            .unwrap();

        let records = store.load_existing().unwrap();
        assert_eq!(
            records,
            vec![
                TemperatureRecord::new("2024-01-01T00:00:00+09:00", 25.5),
                TemperatureRecord::new("2024-01-01T00:10:00+09:00", 25.3),
            ]
        );

        let content = fs::read_to_string(&path).unwrap();
        assert!(content.contains("\"temperature\": 25.5"));
        assert!(matches!(
            store.append(&records[1]).unwrap_err(),
            StoreError::DuplicateTimestamp(_)
        ));
    }

    #[test]
    fn test_json_store_rejects_foreign_document() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("temperature.json");
        fs::write(&path, r#"{"readings": []}"#).unwrap();
        let store = AppendStore::new(&path, StoreFormat::Json);

        assert!(matches!(
            store.load_existing().unwrap_err(),
            StoreError::SchemaMismatch { .. }
        ));
    }

    #[test]
    fn test_store_format_parsing() {
        assert_eq!("csv".parse::<StoreFormat>().unwrap(), StoreFormat::Csv);
        assert_eq!(" JSON ".parse::<StoreFormat>().unwrap(), StoreFormat::Json);
        assert!("parquet".parse::<StoreFormat>().is_err());
        assert_eq!(StoreFormat::Json.to_string(), "json");
    }

    use proptest::prelude::*;

    fn arb_temperatures() -> impl Strategy<Value = Vec<f64>> {
        proptest::collection::vec(-60.0f64..60.0, 0..12)
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn append_keeps_earlier_records_unchanged(
            temperatures in arb_temperatures(),
            next in -60.0f64..60.0,
        ) {
            let dir = TempDir::new().unwrap();
            let store = csv_store(&dir);
            for (minute, t) in temperatures.iter().enumerate() {
                let ts = format!("2024-01-01T00:{:02}:00Z", minute);
                store.append(&TemperatureRecord::new(ts, *t)).unwrap();
            }
            let before_bytes = fs::read(store.path()).unwrap_or_default();
            let before = store.load_existing().unwrap();
            prop_assert_eq!(before.len(), temperatures.len());

            let ts = format!("2024-01-01T01:{:02}:00Z", temperatures.len());
            store.append(&TemperatureRecord::new(ts, next)).unwrap();

            let after = store.load_existing().unwrap();
            prop_assert_eq!(after.len(), before.len() + 1);
            prop_assert_eq!(&after[..before.len()], &before[..]);
            prop_assert_eq!(after[before.len()].temperature, round_temperature(next));
            prop_assert!(fs::read(store.path()).unwrap().starts_with(&before_bytes));

            // A repeated timestamp changes nothing
            let bytes = fs::read(store.path()).unwrap();
            let repeat = after.last().unwrap().clone();
            prop_assert!(store.append(&repeat).is_err());
            prop_assert_eq!(fs::read(store.path()).unwrap(), bytes);
        }
    }
}
