//! Durable bracket file storage + HTTP session utilities.

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, Local};
use freight_core::{BracketSpec, ListingRecord};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::debug;
use uuid::Uuid;

pub const CRATE_NAME: &str = "freight-storage";

pub const UTF8_BOM: &[u8] = b"\xEF\xBB\xBF";

/// Column order of every bracket file.
pub const BRACKET_COLUMNS: [&str; 11] = [
    "itemId",
    "itemSn",
    "name",
    "qualityName",
    "quality",
    "price",
    "realPrice",
    "mouldId",
    "mouldName",
    "weight",
    "result",
];

#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("i/o on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("csv encoding for {path}: {source}")]
    Csv {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },
}

impl PersistenceError {
    fn io(path: &Path, source: std::io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }

    fn csv(path: &Path, source: csv::Error) -> Self {
        Self::Csv {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Create `<root>/<YYYYMMDDHHMMSS>` for one run.
pub async fn create_run_dir(root: &Path, started_at: DateTime<Local>) -> anyhow::Result<PathBuf> {
    let dir = root.join(started_at.format("%Y%m%d%H%M%S").to_string());
    fs::create_dir_all(&dir)
        .await
        .with_context(|| format!("creating run directory {}", dir.display()))?;
    Ok(dir)
}

/// Open a CSV source for reading, skipping a leading UTF-8 byte-order mark.
pub fn open_csv_source(path: &Path) -> std::io::Result<BufReader<File>> {
    let mut reader = BufReader::new(File::open(path)?);
    if reader.fill_buf()?.starts_with(UTF8_BOM) {
        reader.consume(UTF8_BOM.len());
    }
    Ok(reader)
}

fn encode_rows(path: &Path, records: &[ListingRecord], with_header: bool) -> Result<Vec<u8>, PersistenceError> {
    let mut writer = csv::WriterBuilder::new()
        .has_headers(false)
        .from_writer(Vec::new());
    if with_header {
        writer
            .write_record(BRACKET_COLUMNS)
            .map_err(|e| PersistenceError::csv(path, e))?;
    }
    for record in records {
        writer
            .serialize(record)
            .map_err(|e| PersistenceError::csv(path, e))?;
    }
    writer
        .into_inner()
        .map_err(|e| PersistenceError::io(path, e.into_error()))
}

async fn append_bytes(path: &Path, bytes: &[u8]) -> Result<(), PersistenceError> {
    let mut file = fs::OpenOptions::new()
        .append(true)
        .open(path)
        .await
        .map_err(|e| PersistenceError::io(path, e))?;
    file.write_all(bytes)
        .await
        .map_err(|e| PersistenceError::io(path, e))?;
    file.flush().await.map_err(|e| PersistenceError::io(path, e))
}

async fn create_with_header(path: &Path, create_new: bool) -> Result<(), PersistenceError> {
    let mut header = UTF8_BOM.to_vec();
    header.extend(encode_rows(path, &[], true)?);

    let mut options = fs::OpenOptions::new();
    options.write(true);
    if create_new {
        options.create_new(true);
    } else {
        options.create(true).truncate(true);
    }
    let mut file = options
        .open(path)
        .await
        .map_err(|e| PersistenceError::io(path, e))?;
    file.write_all(&header)
        .await
        .map_err(|e| PersistenceError::io(path, e))?;
    file.flush().await.map_err(|e| PersistenceError::io(path, e))
}

/// A bracket's CSV artifact, appended page by page during retrieval.
#[derive(Debug)]
pub struct BracketFile {
    path: PathBuf,
    rows: usize,
}

impl BracketFile {
    pub fn path_for(run_dir: &Path, bracket: &BracketSpec) -> PathBuf {
        run_dir.join(bracket.file_name())
    }

    /// Create (or truncate) the file and write the header row.
    pub async fn create(run_dir: &Path, bracket: &BracketSpec) -> Result<Self, PersistenceError> {
        let path = Self::path_for(run_dir, bracket);
        create_with_header(&path, false).await?;
        Ok(Self { path, rows: 0 })
    }

    /// Append one page of records and flush before returning.
    pub async fn append(&mut self, records: &[ListingRecord]) -> Result<(), PersistenceError> {
        if records.is_empty() {
            return Ok(());
        }
        let bytes = encode_rows(&self.path, records, false)?;
        append_bytes(&self.path, &bytes).await?;
        self.rows += records.len();
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn rows(&self) -> usize {
        self.rows
    }
}

type RecordIter = csv::DeserializeRecordsIntoIter<BufReader<File>, ListingRecord>;

/// Streams a bracket file back in fixed-size chunks. Reads run on the
/// blocking pool.
pub struct ChunkReader {
    path: PathBuf,
    records: Option<RecordIter>,
    chunk_size: usize,
}

impl ChunkReader {
    pub async fn open(path: &Path, chunk_size: usize) -> Result<Self, PersistenceError> {
        let source_path = path.to_path_buf();
        let records = tokio::task::spawn_blocking(move || {
            open_csv_source(&source_path).map(|source| {
                csv::ReaderBuilder::new()
                    .has_headers(true)
                    .from_reader(source)
                    .into_deserialize()
            })
        })
        .await
        .map_err(|e| PersistenceError::io(path, std::io::Error::other(e)))?
        .map_err(|e| PersistenceError::io(path, e))?;
        Ok(Self {
            path: path.to_path_buf(),
            records: Some(records),
            chunk_size: chunk_size.max(1),
        })
    }

    /// Next chunk of at most `chunk_size` rows; `None` once the file is consumed.
    pub async fn next_chunk(&mut self) -> Result<Option<Vec<ListingRecord>>, PersistenceError> {
        let Some(mut records) = self.records.take() else {
            return Ok(None);
        };
        let chunk_size = self.chunk_size;
        let (records, chunk) = tokio::task::spawn_blocking(move || {
            let chunk = read_chunk(&mut records, chunk_size);
            (records, chunk)
        })
        .await
        .map_err(|e| PersistenceError::io(&self.path, std::io::Error::other(e)))?;

        let chunk = chunk.map_err(|e| PersistenceError::csv(&self.path, e))?;
        if chunk.is_empty() {
            return Ok(None);
        }
        self.records = Some(records);
        Ok(Some(chunk))
    }
}

fn read_chunk(records: &mut RecordIter, chunk_size: usize) -> Result<Vec<ListingRecord>, csv::Error> {
    let mut chunk = Vec::with_capacity(chunk_size.min(1024));
    while chunk.len() < chunk_size {
        match records.next() {
            Some(record) => chunk.push(record?),
            None => break,
        }
    }
    Ok(chunk)
}

/// Sibling temp file that replaces a bracket file atomically on commit.
#[derive(Debug)]
pub struct BracketRewrite {
    temp_path: PathBuf,
    final_path: PathBuf,
    rows: usize,
}

impl BracketRewrite {
    pub async fn begin(final_path: &Path) -> Result<Self, PersistenceError> {
        let parent = final_path.parent().unwrap_or_else(|| Path::new("."));
        let file_name = final_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let temp_path = parent.join(format!(".{file_name}.{}.tmp", Uuid::new_v4()));
        create_with_header(&temp_path, true).await?;
        Ok(Self {
            temp_path,
            final_path: final_path.to_path_buf(),
            rows: 0,
        })
    }

    pub async fn write_chunk(&mut self, records: &[ListingRecord]) -> Result<(), PersistenceError> {
        let bytes = encode_rows(&self.temp_path, records, false)?;
        append_bytes(&self.temp_path, &bytes).await?;
        self.rows += records.len();
        Ok(())
    }

    pub fn temp_path(&self) -> &Path {
        &self.temp_path
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    /// Replace the original file with the rewritten one.
    pub async fn commit(self) -> Result<(), PersistenceError> {
        match fs::rename(&self.temp_path, &self.final_path).await {
            Ok(()) => {
                debug!(path = %self.final_path.display(), rows = self.rows, "bracket file replaced");
                Ok(())
            }
            Err(err) => {
                let _ = fs::remove_file(&self.temp_path).await;
                Err(PersistenceError::io(&self.final_path, err))
            }
        }
    }

    /// Drop the temp file, leaving the original untouched.
    pub async fn discard(self) {
        if let Err(err) = fs::remove_file(&self.temp_path).await {
            debug!(path = %self.temp_path.display(), %err, "temp file already gone");
        }
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub accept_language: Option<String>,
}

/// Build a client with its own empty cookie store.
pub fn build_session_client(config: &HttpClientConfig) -> anyhow::Result<reqwest::Client> {
    let mut headers = reqwest::header::HeaderMap::new();
    headers.insert(
        reqwest::header::ACCEPT,
        reqwest::header::HeaderValue::from_static("application/json, text/plain, */*"),
    );
    if let Some(language) = &config.accept_language {
        headers.insert(
            reqwest::header::ACCEPT_LANGUAGE,
            reqwest::header::HeaderValue::from_str(language).context("invalid Accept-Language")?,
        );
    }

    let mut builder = reqwest::Client::builder()
        .gzip(true)
        .brotli(true)
        .cookie_store(true)
        .default_headers(headers)
        .timeout(config.timeout);

    if let Some(user_agent) = &config.user_agent {
        builder = builder.user_agent(user_agent.clone());
    }

    builder.build().context("building reqwest client")
}
