//! Sync pipeline orchestration: source registry, raw loading, common-format
//! transformation, watermarks and run reports.

use std::collections::BTreeMap;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use arrow_array::{RecordBatch, StringArray, UInt32Array};
use arrow_schema::{DataType, Field as ArrowField, Schema};
use chrono::{DateTime, NaiveDate, Utc};
use flowlog_adapters::{
    adapter_for_source, test_connection, transform_raw_to_common, validate_settings,
    AdapterContext, SourceAdapter, SourceKind, SourceSettings, ValidationReport,
};
use flowlog_core::{parse_source_timestamp, CommonRecord, HistoryRow};
use flowlog_storage::{
    BackoffPolicy, HttpClientConfig, HttpFetcher, JsonRecordStore, JsonTransport, RecordSink,
};
use parquet::arrow::ArrowWriter;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use sha2::{Digest, Sha256};
use tokio::fs;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "flowlog-sync";
pub const SOURCES_FILE: &str = "sources.yaml";
pub const WATERMARKS_FILE: &str = "watermarks.json";
pub const RUN_SUMMARY_FILE: &str = "run_summary.json";
pub const DEFAULT_SINCE: &str = "1970-01-01";
pub const DEFAULT_SYNC_CRON: &str = "0 0 6 * * *";

#[derive(Debug, Clone, Deserialize)]
pub struct SourceRegistry {
    pub sources: Vec<SourceConfig>,
}

impl SourceRegistry {
    pub fn from_yaml(text: &str) -> Result<Self> {
        serde_yaml::from_str(text).context("parsing source registry")
    }

    pub async fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn enabled(&self) -> impl Iterator<Item = &SourceConfig> {
        self.sources.iter().filter(|source| source.enabled)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SourceConfig {
    pub source_id: String,
    pub display_name: String,
    pub enabled: bool,
    pub kind: SourceKind,
    #[serde(flatten)]
    pub settings: SourceSettings,
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub workspace_root: PathBuf,
    pub data_dir: PathBuf,
    pub raw_location: String,
    pub common_location: String,
    pub default_since: DateTime<Utc>,
    pub http_timeout_secs: u64,
    pub http_max_retries: usize,
    pub user_agent: String,
    pub scheduler_enabled: bool,
    pub sync_cron: String,
}

impl SyncConfig {
    pub fn from_env() -> Self {
        let workspace_root = std::env::var("FLOWLOG_WORKSPACE_ROOT")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("."));
        Self {
            data_dir: std::env::var("FLOWLOG_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| workspace_root.join("data")),
            raw_location: std::env::var("FLOWLOG_RAW_LOCATION")
                .unwrap_or_else(|_| "raw".to_string()),
            common_location: std::env::var("FLOWLOG_COMMON_LOCATION")
                .unwrap_or_else(|_| "common".to_string()),
            default_since: std::env::var("FLOWLOG_DEFAULT_SINCE")
                .ok()
                .and_then(|v| parse_since(&v))
                .or_else(|| parse_since(DEFAULT_SINCE))
                .unwrap_or_default(),
            http_timeout_secs: std::env::var("FLOWLOG_HTTP_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(20),
            http_max_retries: std::env::var("FLOWLOG_HTTP_MAX_RETRIES")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(0),
            user_agent: std::env::var("FLOWLOG_USER_AGENT")
                .unwrap_or_else(|_| format!("flowlog/{}", env!("CARGO_PKG_VERSION"))),
            scheduler_enabled: std::env::var("FLOWLOG_SCHEDULER_ENABLED")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(false),
            sync_cron: std::env::var("FLOWLOG_SYNC_CRON")
                .unwrap_or_else(|_| DEFAULT_SYNC_CRON.to_string()),
            workspace_root,
        }
    }

    pub fn sources_path(&self) -> PathBuf {
        self.workspace_root.join(SOURCES_FILE)
    }

    pub fn reports_root(&self) -> PathBuf {
        self.workspace_root.join("reports")
    }

    pub fn watermarks_path(&self) -> PathBuf {
        self.data_dir.join(WATERMARKS_FILE)
    }

    pub fn processing_for(&self, source_id: &str) -> ProcessingInfo {
        ProcessingInfo {
            destination: source_id.to_string(),
            raw_location: self.raw_location.clone(),
            common_location: self.common_location.clone(),
        }
    }

    fn http_client_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            timeout: Duration::from_secs(self.http_timeout_secs),
            user_agent: Some(self.user_agent.clone()),
            backoff: BackoffPolicy {
                max_retries: self.http_max_retries,
                ..Default::default()
            },
        }
    }
}

/// Accepts a bare date (midnight UTC) or any tracker timestamp format.
pub fn parse_since(value: &str) -> Option<DateTime<Utc>> {
    let value = value.trim();
    if let Ok(date) = NaiveDate::parse_from_str(value, "%Y-%m-%d") {
        return date.and_hms_opt(0, 0, 0).map(|naive| naive.and_utc());
    }
    parse_source_timestamp(value)
}

/// Where a source's records land in the sink.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessingInfo {
    pub destination: String,
    pub raw_location: String,
    pub common_location: String,
}

/// Fetches everything updated since `since`, shapes it and stores it at the
/// raw location. Nothing fetched means nothing stored and an empty result.
pub async fn load_raw_data(
    adapter: &dyn SourceAdapter,
    transport: &dyn JsonTransport,
    sink: &dyn RecordSink,
    processing: &ProcessingInfo,
    ctx: &AdapterContext,
    since: DateTime<Utc>,
) -> Result<Vec<JsonValue>> {
    let raw = adapter
        .fetch_all(transport, ctx, since)
        .await
        .with_context(|| format!("fetching raw data for {}", ctx.source_id))?;
    if raw.is_empty() {
        info!(source_id = %ctx.source_id, "no raw items updated since watermark");
        return Ok(Vec::new());
    }

    let shaped: Vec<JsonValue> = raw.into_iter().map(|item| adapter.shape(item)).collect();
    info!(
        source_id = %ctx.source_id,
        count = shaped.len(),
        location = %processing.raw_location,
        "storing shaped raw records"
    );
    sink.store(&processing.destination, &processing.raw_location, shaped)
        .await
        .with_context(|| format!("storing raw records for {}", ctx.source_id))
}

pub async fn store_common_records(
    sink: &dyn RecordSink,
    processing: &ProcessingInfo,
    records: &[CommonRecord],
) -> Result<Vec<JsonValue>> {
    if records.is_empty() {
        return Ok(Vec::new());
    }
    let values = records
        .iter()
        .map(serde_json::to_value)
        .collect::<Result<Vec<_>, _>>()
        .context("serializing common records")?;
    sink.store(&processing.destination, &processing.common_location, values)
        .await
        .with_context(|| format!("storing common records for {}", processing.destination))
}

/// Refuses records whose history has a hole or a closed tail.
pub fn ensure_contiguous(records: &[CommonRecord]) -> Result<()> {
    for record in records {
        record
            .check_continuity()
            .with_context(|| format!("history of {} is not contiguous", record.id()))?;
    }
    Ok(())
}

/// Last successful sync time per source, persisted as one JSON object.
#[derive(Debug, Clone)]
pub struct WatermarkStore {
    path: PathBuf,
    entries: BTreeMap<String, DateTime<Utc>>,
}

impl WatermarkStore {
    pub async fn load(path: PathBuf) -> Result<Self> {
        let entries = match fs::read_to_string(&path).await {
            Ok(text) => serde_json::from_str(&text)
                .with_context(|| format!("parsing {}", path.display()))?,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(err) => {
                return Err(err).with_context(|| format!("reading {}", path.display()));
            }
        };
        Ok(Self { path, entries })
    }

    pub fn get(&self, source_id: &str) -> Option<DateTime<Utc>> {
        self.entries.get(source_id).copied()
    }

    pub fn advance(&mut self, source_id: &str, at: DateTime<Utc>) {
        self.entries.insert(source_id.to_string(), at);
    }

    pub async fn save(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .await
                .with_context(|| format!("creating {}", parent.display()))?;
        }
        let bytes = serde_json::to_vec_pretty(&self.entries).context("serializing watermarks")?;
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, bytes)
            .await
            .with_context(|| format!("writing {}", tmp.display()))?;
        fs::rename(&tmp, &self.path)
            .await
            .with_context(|| format!("replacing {}", self.path.display()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceRunSummary {
    pub source_id: String,
    pub kind: SourceKind,
    pub since: DateTime<Utc>,
    pub raw_items: usize,
    pub common_records: usize,
    pub history_rows: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncRunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub enabled_sources: usize,
    pub raw_items: usize,
    pub common_records: usize,
    pub history_rows: usize,
    pub sources: Vec<SourceRunSummary>,
    pub reports_dir: String,
    pub parquet_manifest: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParquetManifest {
    pub schema_version: u32,
    pub run_id: Uuid,
    pub files: Vec<ParquetManifestFile>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParquetManifestFile {
    pub name: String,
    pub path: String,
    pub sha256: String,
    pub bytes: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SourceValidation {
    pub source_id: String,
    pub kind: SourceKind,
    #[serde(flatten)]
    pub report: ValidationReport,
}

/// History row tagged with the source it came from.
type SourceHistoryRow = (String, HistoryRow);

pub struct SyncPipeline {
    config: SyncConfig,
    transport: Arc<dyn JsonTransport>,
    sink: Arc<dyn RecordSink>,
}

impl SyncPipeline {
    pub fn new(config: SyncConfig) -> Result<Self> {
        let http = HttpFetcher::new(config.http_client_config()).context("building HTTP client")?;
        let store = JsonRecordStore::new(config.data_dir.clone());
        Ok(Self {
            config,
            transport: Arc::new(http),
            sink: Arc::new(store),
        })
    }

    pub fn with_transport(mut self, transport: Arc<dyn JsonTransport>) -> Self {
        self.transport = transport;
        self
    }

    pub fn with_sink(mut self, sink: Arc<dyn RecordSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub async fn run_once(&self) -> Result<SyncRunSummary> {
        let started_at = Utc::now();
        let run_id = Uuid::new_v4();
        let registry = SourceRegistry::load(&self.config.sources_path()).await?;
        let enabled_sources: Vec<&SourceConfig> = registry.enabled().collect();
        let mut watermarks = WatermarkStore::load(self.config.watermarks_path()).await?;
        info!(%run_id, sources = enabled_sources.len(), "sync run started");

        let mut source_summaries = Vec::with_capacity(enabled_sources.len());
        let mut rows: Vec<SourceHistoryRow> = Vec::new();

        for source in &enabled_sources {
            let ctx = AdapterContext {
                run_id,
                source_id: source.source_id.clone(),
                fetched_at: started_at,
            };
            let since = watermarks
                .get(&source.source_id)
                .unwrap_or(self.config.default_since);
            let span = info_span!(
                "sync_source",
                run_id = %run_id,
                source_id = %source.source_id,
                kind = source.kind.as_key()
            );

            let (summary, source_rows) = self
                .sync_source(source, &ctx, since)
                .instrument(span)
                .await
                .with_context(|| format!("syncing source {}", source.source_id))?;

            watermarks.advance(&source.source_id, started_at);
            watermarks.save().await?;
            rows.extend(source_rows);
            source_summaries.push(summary);
        }

        let reports_dir = self.config.reports_root().join(run_id.to_string());
        fs::create_dir_all(&reports_dir)
            .await
            .with_context(|| format!("creating {}", reports_dir.display()))?;
        let manifest_path = export_history_snapshot(&reports_dir, run_id, &rows).await?;

        let summary = SyncRunSummary {
            run_id,
            started_at,
            finished_at: Utc::now(),
            enabled_sources: enabled_sources.len(),
            raw_items: source_summaries.iter().map(|s| s.raw_items).sum(),
            common_records: source_summaries.iter().map(|s| s.common_records).sum(),
            history_rows: rows.len(),
            sources: source_summaries,
            reports_dir: reports_dir.display().to_string(),
            parquet_manifest: manifest_path.display().to_string(),
        };
        let bytes = serde_json::to_vec_pretty(&summary).context("serializing run summary")?;
        fs::write(reports_dir.join(RUN_SUMMARY_FILE), bytes)
            .await
            .with_context(|| format!("writing {RUN_SUMMARY_FILE}"))?;

        info!(
            %run_id,
            raw_items = summary.raw_items,
            common_records = summary.common_records,
            "sync run finished"
        );
        Ok(summary)
    }

    async fn sync_source(
        &self,
        source: &SourceConfig,
        ctx: &AdapterContext,
        since: DateTime<Utc>,
    ) -> Result<(SourceRunSummary, Vec<SourceHistoryRow>)> {
        validate_settings(source.kind, &source.settings)?;
        let adapter = adapter_for_source(source.kind, source.settings.clone())?;
        let processing = self.config.processing_for(&source.source_id);

        let raw = load_raw_data(
            adapter.as_ref(),
            self.transport.as_ref(),
            self.sink.as_ref(),
            &processing,
            ctx,
            since,
        )
        .await?;
        let common = transform_raw_to_common(adapter.as_ref(), &raw)
            .context("reconstructing history")?;
        info!(source_id = %ctx.source_id, count = common.len(), "history reconstructed");
        ensure_contiguous(&common)?;
        store_common_records(self.sink.as_ref(), &processing, &common).await?;

        let rows: Vec<SourceHistoryRow> = common
            .iter()
            .flat_map(CommonRecord::history_rows)
            .map(|row| (source.source_id.clone(), row))
            .collect();
        let summary = SourceRunSummary {
            source_id: source.source_id.clone(),
            kind: source.kind,
            since,
            raw_items: raw.len(),
            common_records: common.len(),
            history_rows: rows.len(),
        };
        Ok((summary, rows))
    }

    /// Connectivity test for every enabled source; failures are reported per source.
    pub async fn validate_sources(&self) -> Result<Vec<SourceValidation>> {
        let registry = SourceRegistry::load(&self.config.sources_path()).await?;
        let mut results = Vec::new();
        for source in registry.enabled() {
            let ctx = AdapterContext::new(source.source_id.clone());
            let report = test_connection(
                source.kind,
                &source.settings,
                self.transport.as_ref(),
                &ctx,
            )
            .await;
            if report.is_ok() {
                info!(source_id = %source.source_id, "source reachable");
            } else {
                warn!(
                    source_id = %source.source_id,
                    message = report.message.as_deref().unwrap_or_default(),
                    "source validation failed"
                );
            }
            results.push(SourceValidation {
                source_id: source.source_id.clone(),
                kind: source.kind,
                report,
            });
        }
        Ok(results)
    }

    pub async fn maybe_build_scheduler(self: &Arc<Self>) -> Result<Option<JobScheduler>> {
        if !self.config.scheduler_enabled {
            return Ok(None);
        }

        let sched = JobScheduler::new().await.context("creating scheduler")?;
        let cron = &self.config.sync_cron;
        let pipeline = Arc::clone(self);
        let job = Job::new_async(cron, move |_uuid, _l| {
            let pipeline = Arc::clone(&pipeline);
            Box::pin(async move {
                match pipeline.run_once().await {
                    Ok(summary) => info!(run_id = %summary.run_id, "scheduled sync finished"),
                    Err(err) => error!(error = %format!("{err:#}"), "scheduled sync failed"),
                }
            })
        })
        .with_context(|| format!("creating scheduler job for cron {cron}"))?;
        sched.add(job).await.context("adding scheduler job")?;
        Ok(Some(sched))
    }
}

/// Markdown digest of the most recent `runs` run summaries, newest first.
pub fn report_daily_markdown(runs: usize, workspace_root: Option<PathBuf>) -> Result<String> {
    let root = workspace_root.unwrap_or_else(|| PathBuf::from("."));
    let reports_root = root.join("reports");
    let mut lines = vec!["# Flow History Report".to_string(), String::new()];
    if !reports_root.exists() {
        lines.push("_No runs recorded._".to_string());
        return Ok(lines.join("\n"));
    }

    let mut summaries = Vec::new();
    for entry in std::fs::read_dir(&reports_root)
        .with_context(|| format!("reading {}", reports_root.display()))?
    {
        let entry = entry.with_context(|| format!("listing {}", reports_root.display()))?;
        let summary_path = entry.path().join(RUN_SUMMARY_FILE);
        if !summary_path.is_file() {
            continue;
        }
        let text = std::fs::read_to_string(&summary_path)
            .with_context(|| format!("reading {}", summary_path.display()))?;
        let summary: SyncRunSummary = serde_json::from_str(&text)
            .with_context(|| format!("parsing {}", summary_path.display()))?;
        summaries.push(summary);
    }
    summaries.sort_by(|a, b| b.started_at.cmp(&a.started_at));

    for summary in summaries.iter().take(runs.max(1)) {
        lines.push(format!("## Run `{}`", summary.run_id));
        lines.push(format!("- started: {}", summary.started_at.to_rfc3339()));
        lines.push(format!("- finished: {}", summary.finished_at.to_rfc3339()));
        lines.push(format!("- enabled sources: {}", summary.enabled_sources));
        lines.push(format!("- raw items: {}", summary.raw_items));
        lines.push(format!("- common records: {}", summary.common_records));
        lines.push(format!("- history rows: {}", summary.history_rows));
        lines.push(format!("- parquet manifest: `{}`", summary.parquet_manifest));
        for source in &summary.sources {
            lines.push(format!(
                "  - `{}` ({}): raw={} common={} since={}",
                source.source_id,
                source.kind.as_key(),
                source.raw_items,
                source.common_records,
                source.since.to_rfc3339()
            ));
        }
        lines.push(String::new());
    }
    if summaries.is_empty() {
        lines.push("_No runs recorded._".to_string());
    }

    Ok(lines.join("\n"))
}

async fn export_history_snapshot(
    reports_dir: &Path,
    run_id: Uuid,
    rows: &[SourceHistoryRow],
) -> Result<PathBuf> {
    let history_path = reports_dir.join("history.parquet");
    write_history_parquet(&history_path, rows)?;

    let manifest = ParquetManifest {
        schema_version: 1,
        run_id,
        files: vec![manifest_entry("history", reports_dir, &history_path)?],
    };
    let manifest_path = reports_dir.join("manifest.json");
    let bytes = serde_json::to_vec_pretty(&manifest).context("serializing parquet manifest")?;
    fs::write(&manifest_path, bytes)
        .await
        .with_context(|| format!("writing {}", manifest_path.display()))?;
    Ok(manifest_path)
}

fn write_history_parquet(path: &Path, rows: &[SourceHistoryRow]) -> Result<()> {
    let schema = Arc::new(Schema::new(vec![
        ArrowField::new("source_id", DataType::Utf8, false),
        ArrowField::new("item_id", DataType::Utf8, false),
        ArrowField::new("seq", DataType::UInt32, false),
        ArrowField::new("status_value", DataType::Utf8, false),
        ArrowField::new("priority_value", DataType::Utf8, true),
        ArrowField::new("start_date", DataType::Utf8, false),
        ArrowField::new("change_date", DataType::Utf8, true),
    ]));

    let source_ids = StringArray::from(
        rows.iter()
            .map(|(source_id, _)| Some(source_id.as_str()))
            .collect::<Vec<_>>(),
    );
    let item_ids = StringArray::from(
        rows.iter()
            .map(|(_, row)| Some(row.item_id.as_str()))
            .collect::<Vec<_>>(),
    );
    let seqs = UInt32Array::from(rows.iter().map(|(_, row)| row.seq).collect::<Vec<_>>());
    let statuses = StringArray::from(
        rows.iter()
            .map(|(_, row)| Some(row.status_value.as_str()))
            .collect::<Vec<_>>(),
    );
    let priorities = StringArray::from(
        rows.iter()
            .map(|(_, row)| row.priority_value.as_deref())
            .collect::<Vec<_>>(),
    );
    let start_dates = StringArray::from(
        rows.iter()
            .map(|(_, row)| Some(row.start_date.to_rfc3339()))
            .collect::<Vec<_>>(),
    );
    let change_dates = StringArray::from(
        rows.iter()
            .map(|(_, row)| row.change_date.map(|at| at.to_rfc3339()))
            .collect::<Vec<_>>(),
    );

    let batch = RecordBatch::try_new(
        schema,
        vec![
            Arc::new(source_ids),
            Arc::new(item_ids),
            Arc::new(seqs),
            Arc::new(statuses),
            Arc::new(priorities),
            Arc::new(start_dates),
            Arc::new(change_dates),
        ],
    )
    .context("building history record batch")?;

    let file = File::create(path).with_context(|| format!("creating {}", path.display()))?;
    let mut writer = ArrowWriter::try_new(file, batch.schema(), None)
        .with_context(|| format!("opening parquet writer {}", path.display()))?;
    writer
        .write(&batch)
        .with_context(|| format!("writing record batch {}", path.display()))?;
    writer
        .close()
        .with_context(|| format!("closing parquet writer {}", path.display()))?;
    Ok(())
}

fn manifest_entry(name: &str, reports_dir: &Path, path: &Path) -> Result<ParquetManifestFile> {
    let bytes = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    let sha256 = hex::encode(hasher.finalize());
    let rel = path
        .strip_prefix(reports_dir)
        .unwrap_or(path)
        .display()
        .to_string();
    Ok(ParquetManifestFile {
        name: name.to_string(),
        path: rel,
        sha256,
        bytes: bytes.len() as u64,
    })
}
