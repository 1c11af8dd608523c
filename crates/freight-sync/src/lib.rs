//! Batch run orchestration: template validation, session login, profile
//! resolution, paginated retrieval, chunked mutation and run summaries.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::Local;
use freight_adapters::{
    BulkChangeOutcome, CatalogClient, KfzSettings, SessionAuthenticator, DEFAULT_API_BASE,
    DEFAULT_LOGIN_URL, DEFAULT_SESSION_COOKIE, DEFAULT_USER_AGENT,
};
use freight_core::{
    BracketSpec, BracketSummary, ListingRecord, ProfileCatalog, ProgressLevel, RunPhase,
    RunSummary, RESULT_FAILURE, RESULT_SUCCESS,
};
use freight_storage::{
    create_run_dir, open_csv_source, BracketFile, BracketRewrite, ChunkReader, PersistenceError,
};
use serde::Deserialize;
use thiserror::Error;
use tokio::fs;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};

pub const CRATE_NAME: &str = "freight-sync";

pub const COLUMN_PRICE_MIN: &str = "价格下限";
pub const COLUMN_PRICE_MAX: &str = "价格上限";
pub const COLUMN_PROFILE_NAME: &str = "运费模板名字";

pub const SUMMARY_TEXT_FILE: &str = "summary.txt";
pub const SUMMARY_JSON_FILE: &str = "summary.json";

const INVALID_ITEM_ID: &str = "invalid itemId";

#[derive(Debug, Clone)]
pub struct RunConfig {
    pub output_root: PathBuf,
    pub login_url: String,
    pub api_base: String,
    pub user_agent: String,
    pub read_timeout_secs: u64,
    pub write_timeout_secs: u64,
    pub page_size: u32,
    pub chunk_size: usize,
    pub page_delay: Duration,
    pub chunk_delay: Duration,
    /// Sent as `itemUnit` with every bulk change; per-item weights are not forwarded.
    pub unit_weight: String,
    pub session_cookie: String,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            output_root: PathBuf::from("."),
            login_url: DEFAULT_LOGIN_URL.to_string(),
            api_base: DEFAULT_API_BASE.to_string(),
            user_agent: DEFAULT_USER_AGENT.to_string(),
            read_timeout_secs: 15,
            write_timeout_secs: 30,
            page_size: 200,
            chunk_size: 200,
            page_delay: Duration::from_millis(500),
            chunk_delay: Duration::from_millis(1000),
            unit_weight: "0.5".to_string(),
            session_cookie: DEFAULT_SESSION_COOKIE.to_string(),
        }
    }
}

fn env_or<T: FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

impl RunConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            output_root: std::env::var("FREIGHT_OUTPUT_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.output_root),
            login_url: std::env::var("FREIGHT_LOGIN_URL").unwrap_or(defaults.login_url),
            api_base: std::env::var("FREIGHT_API_BASE").unwrap_or(defaults.api_base),
            user_agent: std::env::var("FREIGHT_USER_AGENT").unwrap_or(defaults.user_agent),
            read_timeout_secs: env_or("FREIGHT_READ_TIMEOUT_SECS", defaults.read_timeout_secs),
            write_timeout_secs: env_or("FREIGHT_WRITE_TIMEOUT_SECS", defaults.write_timeout_secs),
            page_size: env_or("FREIGHT_PAGE_SIZE", defaults.page_size).max(1),
            chunk_size: env_or("FREIGHT_CHUNK_SIZE", defaults.chunk_size).max(1),
            page_delay: Duration::from_millis(env_or("FREIGHT_PAGE_DELAY_MS", 500)),
            chunk_delay: Duration::from_millis(env_or("FREIGHT_CHUNK_DELAY_MS", 1000)),
            unit_weight: std::env::var("FREIGHT_UNIT_WEIGHT").unwrap_or(defaults.unit_weight),
            session_cookie: std::env::var("FREIGHT_SESSION_COOKIE")
                .unwrap_or(defaults.session_cookie),
        }
    }

    pub fn kfz_settings(&self) -> KfzSettings {
        KfzSettings {
            login_url: self.login_url.clone(),
            api_base: self.api_base.clone(),
            user_agent: self.user_agent.clone(),
            read_timeout: Duration::from_secs(self.read_timeout_secs),
            write_timeout: Duration::from_secs(self.write_timeout_secs),
            session_cookie: self.session_cookie.clone(),
        }
    }
}

/// Receives human-readable status lines from a run.
pub trait ProgressSink: Send + Sync {
    fn emit(&self, level: ProgressLevel, message: &str);
}

#[derive(Default)]
pub struct NoopProgressSink;

impl ProgressSink for NoopProgressSink {
    fn emit(&self, _level: ProgressLevel, _message: &str) {}
}

/// Forwards progress lines to `tracing` under the `freight::progress` target.
#[derive(Default)]
pub struct TracingProgressSink;

impl ProgressSink for TracingProgressSink {
    fn emit(&self, level: ProgressLevel, message: &str) {
        match level {
            ProgressLevel::Info => info!(target: "freight::progress", "{message}"),
            ProgressLevel::Warning => warn!(target: "freight::progress", "{message}"),
            ProgressLevel::Error => error!(target: "freight::progress", "{message}"),
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("missing column: {0}")]
    MissingColumn(String),
    #[error("template has no data rows")]
    Empty,
    #[error("cannot read template: {0}")]
    Unreadable(String),
}

#[derive(Debug, Deserialize)]
struct TemplateRow {
    #[serde(rename = "价格下限")]
    price_min: String,
    #[serde(rename = "价格上限")]
    price_max: String,
    #[serde(rename = "运费模板名字")]
    profile_name: String,
}

/// Parse the operator's bracket template. Extra columns are ignored.
pub fn load_template(path: &Path) -> Result<Vec<BracketSpec>, ValidationError> {
    let source = open_csv_source(path)
        .map_err(|e| ValidationError::Unreadable(format!("{}: {e}", path.display())))?;
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .trim(csv::Trim::All)
        .from_reader(source);

    let headers = reader
        .headers()
        .map_err(|e| ValidationError::Unreadable(e.to_string()))?
        .clone();
    for required in [COLUMN_PRICE_MIN, COLUMN_PRICE_MAX, COLUMN_PROFILE_NAME] {
        if !headers.iter().any(|h| h == required) {
            return Err(ValidationError::MissingColumn(required.to_string()));
        }
    }

    let brackets = reader
        .deserialize::<TemplateRow>()
        .map(|row| {
            row.map(|r| BracketSpec::new(r.price_min, r.price_max, r.profile_name))
                .map_err(|e| ValidationError::Unreadable(e.to_string()))
        })
        .collect::<Result<Vec<_>, _>>()?;

    if brackets.is_empty() {
        return Err(ValidationError::Empty);
    }
    Ok(brackets)
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProfileResolutionError {
    #[error("shipping profile '{0}' does not exist in the shop configuration")]
    Unknown(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedBracket {
    pub spec: BracketSpec,
    pub profile_id: String,
}

/// Every bracket must resolve before any listing is fetched.
pub fn resolve_profiles(
    brackets: &[BracketSpec],
    catalog: &ProfileCatalog,
) -> Result<Vec<ResolvedBracket>, ProfileResolutionError> {
    brackets
        .iter()
        .map(|spec| {
            catalog
                .resolve(&spec.profile_name)
                .map(|id| ResolvedBracket {
                    spec: spec.clone(),
                    profile_id: id.to_string(),
                })
                .ok_or_else(|| ProfileResolutionError::Unknown(spec.profile_name.clone()))
        })
        .collect()
}

#[derive(Clone)]
pub struct RunRequest {
    pub template_path: PathBuf,
    pub username: String,
    pub password: String,
}

impl fmt::Debug for RunRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunRequest")
            .field("template_path", &self.template_path)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// What a finished run leaves behind. `summary` is `None` when the run
/// aborted before retrieval started.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub phase: RunPhase,
    pub run_dir: Option<PathBuf>,
    pub summary: Option<RunSummary>,
}

#[derive(Debug)]
struct RunState {
    phase: RunPhase,
    stop_requested: bool,
}

impl RunState {
    fn new() -> Self {
        Self {
            phase: RunPhase::Idle,
            stop_requested: false,
        }
    }

    fn advance(&mut self, next: RunPhase) {
        debug!(from = %self.phase, to = %next, "phase transition");
        self.phase = next;
    }

    /// Latch a stop request; only honored while retrieving or mutating.
    fn poll_stop(&mut self, cancel: &CancellationToken) -> bool {
        if !self.stop_requested && self.phase.is_interruptible() && cancel.is_cancelled() {
            self.stop_requested = true;
        }
        self.stop_requested
    }

    fn aborted(mut self) -> RunOutcome {
        self.advance(RunPhase::Done);
        RunOutcome {
            phase: self.phase,
            run_dir: None,
            summary: None,
        }
    }
}

#[derive(Debug)]
struct ProducedFile {
    bracket_index: usize,
    path: PathBuf,
    profile_id: String,
    rows: usize,
}

/// A bracket whose file could not be written; `rows` were already on disk.
#[derive(Debug)]
struct RetrievalError {
    rows: usize,
    source: PersistenceError,
}

#[derive(Debug, Clone, Copy)]
enum MutationEnd {
    Completed,
    Stopped,
}

pub struct BatchOrchestrator {
    config: RunConfig,
    authenticator: Arc<dyn SessionAuthenticator>,
    progress: Arc<dyn ProgressSink>,
}

impl BatchOrchestrator {
    pub fn new(
        config: RunConfig,
        authenticator: Arc<dyn SessionAuthenticator>,
        progress: Arc<dyn ProgressSink>,
    ) -> Self {
        Self {
            config,
            authenticator,
            progress,
        }
    }

    /// Run on a dedicated task so the caller never blocks.
    pub fn spawn(
        self: Arc<Self>,
        request: RunRequest,
        cancel: CancellationToken,
    ) -> JoinHandle<RunOutcome> {
        tokio::spawn(async move { self.run(&request, &cancel).await })
    }

    /// Drive one run to a terminal phase. Never fails outward; every failure
    /// is reported through the progress sink.
    pub async fn run(&self, request: &RunRequest, cancel: &CancellationToken) -> RunOutcome {
        let span = info_span!("run", account = %request.username);
        self.run_inner(request, cancel).instrument(span).await
    }

    fn report(&self, level: ProgressLevel, message: impl AsRef<str>) {
        self.progress.emit(level, message.as_ref());
    }

    async fn run_inner(&self, request: &RunRequest, cancel: &CancellationToken) -> RunOutcome {
        let mut state = RunState::new();
        let started_at = Local::now();

        state.advance(RunPhase::Validating);
        let template_path = request.template_path.clone();
        let loaded = tokio::task::spawn_blocking(move || load_template(&template_path))
            .await
            .unwrap_or_else(|e| Err(ValidationError::Unreadable(e.to_string())));
        let brackets = match loaded {
            Ok(brackets) => brackets,
            Err(err) => {
                self.report(ProgressLevel::Error, format!("template validation failed: {err}"));
                return state.aborted();
            }
        };
        self.report(
            ProgressLevel::Info,
            format!("template loaded: {} price brackets", brackets.len()),
        );

        state.advance(RunPhase::Authenticating);
        self.report(ProgressLevel::Info, format!("logging in as {}", request.username));
        let client = match self
            .authenticator
            .login(&request.username, &request.password)
            .await
        {
            Ok(client) => client,
            Err(err) => {
                self.report(ProgressLevel::Error, format!("login failed: {err}"));
                return state.aborted();
            }
        };

        state.advance(RunPhase::ResolvingProfiles);
        self.report(ProgressLevel::Info, "fetching shipping profile configuration");
        let catalog = match client.fetch_profile_catalog().await {
            Ok(catalog) => catalog,
            Err(err) => {
                self.report(
                    ProgressLevel::Error,
                    format!("fetching shipping profiles failed: {err}"),
                );
                return state.aborted();
            }
        };
        if catalog.is_empty() {
            self.report(ProgressLevel::Warning, "the shop has no shipping profiles configured");
        } else {
            self.report(
                ProgressLevel::Info,
                format!("{} shipping profiles available", catalog.len()),
            );
        }
        let resolved = match resolve_profiles(&brackets, &catalog) {
            Ok(resolved) => resolved,
            Err(err) => {
                self.report(ProgressLevel::Error, format!("error: {err}"));
                let known = catalog.names().collect::<Vec<_>>().join(", ");
                self.report(ProgressLevel::Info, format!("known profiles: {known}"));
                return state.aborted();
            }
        };

        let run_dir = match create_run_dir(&self.config.output_root, started_at).await {
            Ok(dir) => dir,
            Err(err) => {
                self.report(ProgressLevel::Error, format!("{err:#}"));
                return state.aborted();
            }
        };
        self.report(
            ProgressLevel::Info,
            format!("run started, output directory: {}", run_dir.display()),
        );

        let mut summary = RunSummary::start(request.username.clone(), started_at);

        state.advance(RunPhase::Retrieving);
        let mut produced = Vec::new();
        for (index, bracket) in resolved.iter().enumerate() {
            if state.poll_stop(cancel) {
                break;
            }
            summary.brackets.push(BracketSummary::for_bracket(&bracket.spec));
            let span = info_span!("retrieve", range = %bracket.spec.range_label());
            match self
                .retrieve_bracket(client.as_ref(), &run_dir, bracket, cancel, &mut state)
                .instrument(span)
                .await
            {
                Ok(file) => {
                    summary.brackets[index].item_count = file.rows();
                    produced.push(ProducedFile {
                        bracket_index: index,
                        path: file.path().to_path_buf(),
                        profile_id: bracket.profile_id.clone(),
                        rows: file.rows(),
                    });
                }
                Err(err) => {
                    summary.brackets[index].item_count = err.rows;
                    self.report(
                        ProgressLevel::Error,
                        format!(
                            "saving listings for {} failed after {} rows: {}",
                            bracket.spec.range_label(),
                            err.rows,
                            err.source
                        ),
                    );
                }
            }
        }

        if !state.poll_stop(cancel) {
            state.advance(RunPhase::Mutating);
            self.report(ProgressLevel::Info, "starting bulk profile changes");
            for file in &produced {
                if state.poll_stop(cancel) {
                    break;
                }
                let name = file
                    .path
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_default();
                let span = info_span!("mutate", file = %name);
                match self
                    .mutate_bracket(client.as_ref(), file, cancel, &mut state, &mut summary)
                    .instrument(span)
                    .await
                {
                    Ok(MutationEnd::Completed) => {}
                    Ok(MutationEnd::Stopped) => {
                        self.report(
                            ProgressLevel::Warning,
                            format!("stopped while processing {name}; file left unchanged"),
                        );
                        break;
                    }
                    Err(err) => self.report(
                        ProgressLevel::Error,
                        format!("rewriting {name} failed: {err}"),
                    ),
                }
            }
        }

        let stopped = state.stop_requested;
        if stopped {
            self.report(ProgressLevel::Warning, "run stopped on request");
        }

        state.advance(RunPhase::Summarizing);
        summary.finish(Local::now(), stopped);
        if let Err(err) = write_summary(&run_dir, &summary).await {
            self.report(ProgressLevel::Error, format!("writing summary failed: {err:#}"));
        }
        for line in render_summary_text(&summary, &run_dir).lines() {
            self.report(ProgressLevel::Info, line);
        }

        state.advance(if stopped {
            RunPhase::Stopped
        } else {
            RunPhase::Done
        });
        RunOutcome {
            phase: state.phase,
            run_dir: Some(run_dir),
            summary: Some(summary),
        }
    }

    /// Page through one bracket, appending each page to disk as it arrives.
    /// A failed page ends the bracket but keeps what was already written.
    async fn retrieve_bracket(
        &self,
        client: &dyn CatalogClient,
        run_dir: &Path,
        bracket: &ResolvedBracket,
        cancel: &CancellationToken,
        state: &mut RunState,
    ) -> Result<BracketFile, RetrievalError> {
        let spec = &bracket.spec;
        self.report(
            ProgressLevel::Info,
            format!("fetching listings priced {} - {}", spec.price_min, spec.price_max),
        );
        let mut file = BracketFile::create(run_dir, spec)
            .await
            .map_err(|source| RetrievalError { rows: 0, source })?;

        let mut page = 1u32;
        while !state.poll_stop(cancel) {
            let listing_page = match client
                .fetch_listings_page(&spec.price_min, &spec.price_max, page, self.config.page_size)
                .await
            {
                Ok(listing_page) => listing_page,
                Err(err) => {
                    self.report(
                        ProgressLevel::Warning,
                        format!("fetching listings failed (page {page}): {err}"),
                    );
                    break;
                }
            };

            let received = listing_page.items.len();
            if let Err(source) = file.append(&listing_page.items).await {
                return Err(RetrievalError {
                    rows: file.rows(),
                    source,
                });
            }
            self.report(
                ProgressLevel::Info,
                format!(
                    "  page {}/{}: {received} listings, {} so far",
                    page,
                    listing_page.total_pages,
                    file.rows()
                ),
            );

            // the echoed currentPage may lag the requested page
            if page.max(listing_page.current_page) >= listing_page.total_pages || received == 0 {
                break;
            }
            page += 1;
            tokio::time::sleep(self.config.page_delay).await;
        }

        if file.rows() == 0 {
            self.report(ProgressLevel::Info, "  no listings in this price bracket");
        } else {
            self.report(
                ProgressLevel::Info,
                format!("  saved {} ({} listings)", spec.file_name(), file.rows()),
            );
        }
        Ok(file)
    }

    /// Submit one bracket file chunk by chunk, writing reconciled rows to a
    /// temp file that replaces the original only once every chunk is done.
    async fn mutate_bracket(
        &self,
        client: &dyn CatalogClient,
        file: &ProducedFile,
        cancel: &CancellationToken,
        state: &mut RunState,
        summary: &mut RunSummary,
    ) -> Result<MutationEnd, PersistenceError> {
        self.report(
            ProgressLevel::Info,
            format!(
                "processing {} -> profile id {}",
                file.path.display(),
                file.profile_id
            ),
        );
        if file.rows == 0 {
            return Ok(MutationEnd::Completed);
        }

        let mut reader = ChunkReader::open(&file.path, self.config.chunk_size).await?;
        let mut rewrite = BracketRewrite::begin(&file.path).await?;
        let mut chunk_no = 0usize;

        let end = loop {
            let chunk = match reader.next_chunk().await {
                Ok(Some(chunk)) => chunk,
                Ok(None) => break MutationEnd::Completed,
                Err(err) => {
                    rewrite.discard().await;
                    return Err(err);
                }
            };
            if state.poll_stop(cancel) {
                break MutationEnd::Stopped;
            }
            chunk_no += 1;

            let (reconciled, succeeded, failed) =
                self.apply_chunk(client, chunk_no, &file.profile_id, chunk).await;
            summary.record_outcomes(file.bracket_index, succeeded, failed);

            if let Err(err) = rewrite.write_chunk(&reconciled).await {
                rewrite.discard().await;
                return Err(err);
            }
            tokio::time::sleep(self.config.chunk_delay).await;
        };

        match end {
            MutationEnd::Completed => rewrite.commit().await?,
            MutationEnd::Stopped => rewrite.discard().await,
        }
        Ok(end)
    }

    /// Submit one chunk and stamp every row with its outcome.
    async fn apply_chunk(
        &self,
        client: &dyn CatalogClient,
        chunk_no: usize,
        profile_id: &str,
        mut rows: Vec<ListingRecord>,
    ) -> (Vec<ListingRecord>, usize, usize) {
        let mut failed = 0usize;
        let mut item_ids = Vec::with_capacity(rows.len());
        for row in &mut rows {
            match row.numeric_item_id() {
                Some(id) => item_ids.push(id),
                None => {
                    row.result = INVALID_ITEM_ID.to_string();
                    failed += 1;
                }
            }
        }
        if item_ids.is_empty() {
            self.report(
                ProgressLevel::Warning,
                format!("  chunk {chunk_no}: no valid item ids"),
            );
            return (rows, 0, failed);
        }

        let submitted = client
            .submit_bulk_profile_change(&item_ids, profile_id, &self.config.unit_weight)
            .await;
        let submittable = rows.iter_mut().filter(|r| r.numeric_item_id().is_some());
        match submitted {
            Ok(outcome) => {
                let succeeded = stamp_outcome(submittable, &outcome);
                failed += item_ids.len() - succeeded;
                self.report(
                    ProgressLevel::Info,
                    format!(
                        "  chunk {chunk_no}: {} ({succeeded} succeeded, {} failed)",
                        outcome.message.as_deref().unwrap_or("ok"),
                        item_ids.len() - succeeded
                    ),
                );
                (rows, succeeded, failed)
            }
            Err(err) => {
                let message = format!("request failed: {err}");
                for row in submittable {
                    row.result = message.clone();
                }
                failed += item_ids.len();
                self.report(ProgressLevel::Warning, format!("  chunk {chunk_no}: {message}"));
                (rows, 0, failed)
            }
        }
    }
}

fn stamp_outcome<'a>(
    rows: impl Iterator<Item = &'a mut ListingRecord>,
    outcome: &BulkChangeOutcome,
) -> usize {
    let mut succeeded = 0;
    for row in rows {
        if outcome.succeeded(&row.item_id) {
            row.result = RESULT_SUCCESS.to_string();
            succeeded += 1;
        } else {
            row.result = RESULT_FAILURE.to_string();
        }
    }
    succeeded
}

pub fn render_summary_text(summary: &RunSummary, run_dir: &Path) -> String {
    let banner = "=".repeat(48);
    let finished = summary
        .finished_at
        .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| "-".to_string());
    let mut lines = vec![
        banner.clone(),
        " Freight profile batch run summary".to_string(),
        banner,
        format!("Account:   {}", summary.account),
        format!(
            "Status:    {}",
            if summary.stopped { "stopped" } else { "completed" }
        ),
        format!(
            "Started:   {}",
            summary.started_at.format("%Y-%m-%d %H:%M:%S")
        ),
        format!("Finished:  {finished}"),
        format!("Elapsed:   {}s", summary.elapsed_secs()),
        format!("Succeeded: {}", summary.success_count),
        format!("Failed:    {}", summary.fail_count),
        format!("Output:    {}", run_dir.display()),
        String::new(),
        "Brackets:".to_string(),
    ];
    for bracket in &summary.brackets {
        lines.push(format!(
            "  {} > {}: {} items ({} succeeded, {} failed)",
            bracket.range,
            bracket.profile_name,
            bracket.item_count,
            bracket.success_count,
            bracket.fail_count
        ));
    }
    lines.join("\n") + "\n"
}

/// Persist `summary.txt` and `summary.json` into the run directory.
pub async fn write_summary(run_dir: &Path, summary: &RunSummary) -> anyhow::Result<()> {
    let text_path = run_dir.join(SUMMARY_TEXT_FILE);
    fs::write(&text_path, render_summary_text(summary, run_dir))
        .await
        .with_context(|| format!("writing {}", text_path.display()))?;

    let json_path = run_dir.join(SUMMARY_JSON_FILE);
    let bytes = serde_json::to_vec_pretty(summary).context("serializing run summary")?;
    fs::write(&json_path, bytes)
        .await
        .with_context(|| format!("writing {}", json_path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tempfile::tempdir;

    fn write_template(dir: &Path, contents: &str) -> PathBuf {
        let path = dir.join("template.csv");
        std::fs::write(&path, contents).expect("write template");
        path
    }

    #[test]
    fn template_parses_rows_in_order_and_ignores_extra_columns() {
        let dir = tempdir().expect("tempdir");
        let path = write_template(
            dir.path(),
            "\u{feff}备注,价格下限,价格上限,运费模板名字\nx,0,50,标准 \ny,50,100,重货\n",
        );
        let brackets = load_template(&path).expect("valid");
        assert_eq!(
            brackets,
            vec![
                BracketSpec::new("0", "50", "标准"),
                BracketSpec::new("50", "100", "重货"),
            ]
        );
        assert_eq!(load_template(&path).expect("again"), brackets);
    }

    #[test]
    fn template_missing_column_is_reported_by_name() {
        let dir = tempdir().expect("tempdir");
        let path = write_template(dir.path(), "价格下限,运费模板名字\n0,A\n");
        assert_eq!(
            load_template(&path),
            Err(ValidationError::MissingColumn(COLUMN_PRICE_MAX.to_string()))
        );
    }

    #[test]
    fn template_without_rows_is_empty() {
        let dir = tempdir().expect("tempdir");
        let path = write_template(dir.path(), "价格下限,价格上限,运费模板名字\n");
        assert_eq!(load_template(&path), Err(ValidationError::Empty));
    }

    #[test]
    fn unreadable_template_is_reported() {
        let dir = tempdir().expect("tempdir");
        let missing = load_template(&dir.path().join("nope.csv"));
        assert!(matches!(missing, Err(ValidationError::Unreadable(_))));

        let path = dir.path().join("binary.csv");
        std::fs::write(&path, b"\xff\xfe\x00,\x01\n").expect("write");
        assert!(matches!(load_template(&path), Err(ValidationError::Unreadable(_))));
    }

    #[test]
    fn profile_resolution_fails_on_first_unknown_name() {
        let catalog = ProfileCatalog::from_pairs([("A", "1"), ("B", "2")]);
        let ok = resolve_profiles(
            &[BracketSpec::new("0", "1", "A"), BracketSpec::new("1", "2", "B")],
            &catalog,
        )
        .expect("resolves");
        assert_eq!(ok[1].profile_id, "2");

        let err = resolve_profiles(
            &[BracketSpec::new("0", "1", "A"), BracketSpec::new("1", "2", "C")],
            &catalog,
        )
        .unwrap_err();
        assert_eq!(err, ProfileResolutionError::Unknown("C".to_string()));
    }

    #[test]
    fn stop_is_latched_only_in_interruptible_phases() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let mut state = RunState::new();
        state.advance(RunPhase::ResolvingProfiles);
        assert!(!state.poll_stop(&cancel));
        state.advance(RunPhase::Retrieving);
        assert!(state.poll_stop(&cancel));
        state.advance(RunPhase::Summarizing);
        assert!(state.poll_stop(&cancel));
    }

    #[test]
    fn summary_text_has_fixed_sections() {
        let start = Local.with_ymd_and_hms(2026, 2, 24, 12, 0, 0).single().unwrap();
        let mut summary = RunSummary::start("shop", start);
        summary.brackets.push(BracketSummary {
            range: "0-50".into(),
            profile_name: "A".into(),
            item_count: 2,
            success_count: 0,
            fail_count: 0,
        });
        summary.record_outcomes(0, 2, 0);
        summary.finish(start + chrono::Duration::seconds(61), false);

        let text = render_summary_text(&summary, Path::new("out/20260224120000"));
        assert!(text.starts_with(&"=".repeat(48)));
        assert!(text.contains("Account:   shop"));
        assert!(text.contains("Status:    completed"));
        assert!(text.contains("Started:   2026-02-24 12:00:00"));
        assert!(text.contains("Finished:  2026-02-24 12:01:01"));
        assert!(text.contains("Elapsed:   61s"));
        assert!(text.contains("Succeeded: 2"));
        assert!(text.contains("Failed:    0"));
        assert!(text.contains("  0-50 > A: 2 items (2 succeeded, 0 failed)"));
    }
}
