//! Tracker source adapters: query construction, paginated retrieval, raw
//! record shaping and per-source history reconstruction.

use std::future::Future;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::format::{Item, StrftimeItems};
use chrono::{DateTime, Utc};
use flowlog_core::CommonRecord;
use flowlog_storage::{FetchError, JsonTransport, RequestHeaders, Url};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{debug, info, info_span, Instrument};
use uuid::Uuid;

mod jira;
mod trello;

pub use jira::{
    build_jql, reconstruct_defect_history, reconstruct_jira_demand_history, shape_jira_issue,
    JiraDefectAdapter, JiraDemandAdapter, DEFAULT_DEFECT_STATUS, DEFAULT_DEFECT_TYPE,
    DEFAULT_DEMAND_TYPE, JIRA_EXPAND, JIRA_FIELDS,
};
pub use trello::{
    card_creation_date, cards_url, reconstruct_trello_demand_history, shape_trello_card,
    TrelloDemandAdapter,
};

pub const CRATE_NAME: &str = "flowlog-adapters";

/// Date format used to render the watermark inside search queries.
pub const DEFAULT_DATE_FORMAT: &str = "%Y-%m-%d";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SourceKind {
    JiraDefect,
    JiraDemand,
    TrelloDemand,
}

impl SourceKind {
    pub fn as_key(&self) -> &'static str {
        match self {
            Self::JiraDefect => "jira-defect",
            Self::JiraDemand => "jira-demand",
            Self::TrelloDemand => "trello-demand",
        }
    }

    pub fn is_defect(&self) -> bool {
        matches!(self, Self::JiraDefect)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlowState {
    pub name: String,
}

/// Connection and mapping settings for one tracker source.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceSettings {
    pub url: String,
    #[serde(default)]
    pub project: String,
    #[serde(default)]
    pub auth_policy: String,
    #[serde(default)]
    pub user_data: String,
    #[serde(default)]
    pub work_item_type: Option<String>,
    #[serde(default)]
    pub initial_status: Option<String>,
    #[serde(default)]
    pub severity: Vec<String>,
    #[serde(default)]
    pub flow: Vec<FlowState>,
    #[serde(default)]
    pub date_format: Option<String>,
}

impl SourceSettings {
    pub fn date_format(&self) -> &str {
        self.date_format.as_deref().unwrap_or(DEFAULT_DATE_FORMAT)
    }
}

/// Per-run context threaded through every adapter call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdapterContext {
    pub run_id: Uuid,
    pub source_id: String,
    pub fetched_at: DateTime<Utc>,
}

impl AdapterContext {
    pub fn new(source_id: impl Into<String>) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            source_id: source_id.into(),
            fetched_at: Utc::now(),
        }
    }
}

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),
    #[error("invalid source URL [{0}]")]
    InvalidSourceUrl(String),
    #[error("{message} (status {status})")]
    Upstream { status: u16, message: String },
    #[error("transport failure: {0}")]
    Transport(#[source] FetchError),
    #[error("malformed response: {0}")]
    MalformedResponse(String),
    #[error("malformed record {id}: {reason}")]
    MalformedRecord { id: String, reason: String },
}

impl AdapterError {
    /// HTTP-style status for callers that surface errors as responses.
    pub fn status_code(&self) -> Option<u16> {
        match self {
            Self::InvalidConfiguration(_) | Self::InvalidSourceUrl(_) => Some(400),
            Self::Upstream { status, .. } => Some(*status),
            Self::Transport(_) | Self::MalformedResponse(_) | Self::MalformedRecord { .. } => None,
        }
    }

    pub(crate) fn from_fetch(err: FetchError, message: &str) -> Self {
        match err {
            FetchError::HttpStatus { status, .. } => Self::Upstream {
                status,
                message: message.to_string(),
            },
            other => match other.status_code() {
                Some(status) => Self::Upstream {
                    status,
                    message: message.to_string(),
                },
                None => Self::Transport(other),
            },
        }
    }

    pub(crate) fn malformed(record: &JsonValue, reason: impl ToString) -> Self {
        Self::MalformedRecord {
            id: record_id(record),
            reason: reason.to_string(),
        }
    }
}

fn record_id(record: &JsonValue) -> String {
    match record.get("id") {
        Some(JsonValue::String(s)) => s.clone(),
        Some(JsonValue::Number(n)) => n.to_string(),
        _ => "<unknown>".to_string(),
    }
}

/// Turns one shaped raw record into a common entry.
pub trait HistoryReconstructor: Send + Sync {
    fn reconstruct(&self, shaped: &JsonValue) -> Result<CommonRecord, AdapterError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionRequest {
    pub url: String,
    pub headers: RequestHeaders,
}

#[async_trait]
pub trait SourceAdapter: HistoryReconstructor {
    /// Retrieves every raw item updated since `since`.
    async fn fetch_all(
        &self,
        transport: &dyn JsonTransport,
        ctx: &AdapterContext,
        since: DateTime<Utc>,
    ) -> Result<Vec<JsonValue>, AdapterError>;

    /// Structural pre-normalization; never reorders or drops change events.
    fn shape(&self, raw: JsonValue) -> JsonValue;

    /// Cheapest request that proves the configured credentials work.
    fn connection_request(
        &self,
        ctx: &AdapterContext,
    ) -> Result<ConnectionRequest, AdapterError>;
}

/// Builds the adapter for `kind`. Demand sources on issue-tracker-A need a flow.
pub fn adapter_for_source(
    kind: SourceKind,
    settings: SourceSettings,
) -> Result<Box<dyn SourceAdapter>, AdapterError> {
    match kind {
        SourceKind::JiraDefect => Ok(Box::new(JiraDefectAdapter::new(settings))),
        SourceKind::JiraDemand => Ok(Box::new(JiraDemandAdapter::new(settings)?)),
        SourceKind::TrelloDemand => Ok(Box::new(TrelloDemandAdapter::new(settings))),
    }
}

pub fn validate_source_url(url: &str) -> Result<Url, AdapterError> {
    Url::parse(url).map_err(|_| AdapterError::InvalidSourceUrl(url.to_string()))
}

/// Synchronous pre-flight checks, in the order operators see them reported.
pub fn validate_settings(kind: SourceKind, settings: &SourceSettings) -> Result<(), AdapterError> {
    validate_source_url(&settings.url)?;
    if settings.project.trim().is_empty() {
        return Err(AdapterError::InvalidConfiguration(
            "[Project] must be a valid project name".to_string(),
        ));
    }
    if settings.auth_policy.trim().is_empty() {
        return Err(AdapterError::InvalidConfiguration(
            "[Auth Policy] must be filled out".to_string(),
        ));
    }
    if settings.user_data.trim().is_empty() {
        return Err(AdapterError::InvalidConfiguration(
            "[User Data] must be filled out".to_string(),
        ));
    }
    if kind.is_defect() {
        if settings.severity.is_empty() {
            return Err(AdapterError::InvalidConfiguration(
                "Missing [Severity] information".to_string(),
            ));
        }
    } else if settings.flow.is_empty() {
        return Err(AdapterError::InvalidConfiguration(
            "Missing [Flow] information".to_string(),
        ));
    }
    check_date_format(settings.date_format())
}

pub fn check_date_format(format: &str) -> Result<(), AdapterError> {
    if StrftimeItems::new(format).any(|item| matches!(item, Item::Error)) {
        return Err(AdapterError::InvalidConfiguration(format!(
            "[Date Format] `{format}` is not a valid date format"
        )));
    }
    Ok(())
}

pub(crate) fn render_date(at: DateTime<Utc>, format: &str) -> Result<String, AdapterError> {
    check_date_format(format)?;
    Ok(at.format(format).to_string())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValidationStatus {
    Ok,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationReport {
    pub status: ValidationStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl ValidationReport {
    pub fn ok() -> Self {
        Self {
            status: ValidationStatus::Ok,
            message: None,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            status: ValidationStatus::Error,
            message: Some(message.into()),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status == ValidationStatus::Ok
    }
}

/// Connectivity check for a configured source. Failures are reported, never raised.
pub async fn test_connection(
    kind: SourceKind,
    settings: &SourceSettings,
    transport: &dyn JsonTransport,
    ctx: &AdapterContext,
) -> ValidationReport {
    if let Err(err) = validate_settings(kind, settings) {
        return ValidationReport::error(err.to_string());
    }
    let adapter = match adapter_for_source(kind, settings.clone()) {
        Ok(adapter) => adapter,
        Err(err) => return ValidationReport::error(err.to_string()),
    };
    let request = match adapter.connection_request(ctx) {
        Ok(request) => request,
        Err(err) => return ValidationReport::error(err.to_string()),
    };

    let span = info_span!("test_connection", source_id = %ctx.source_id, kind = kind.as_key());
    match transport
        .get_json(&request.url, &request.headers)
        .instrument(span)
        .await
    {
        Ok(_) => ValidationReport::ok(),
        Err(err) => {
            info!(source_id = %ctx.source_id, error = %err, "connectivity test failed");
            ValidationReport::error(err.to_string())
        }
    }
}

/// One page of a total-count paginated search.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchPage {
    #[serde(default)]
    pub start_at: u64,
    #[serde(default)]
    pub total: u64,
    #[serde(default, alias = "issues")]
    pub items: Vec<JsonValue>,
}

/// Requests pages one at a time starting at offset 0, concatenating items until
/// the accumulated count reaches the reported total. An empty page always ends
/// the run so a total that is never reached cannot loop forever.
pub async fn fetch_all_pages<F, Fut>(mut fetch_page: F) -> Result<Vec<JsonValue>, AdapterError>
where
    F: FnMut(usize) -> Fut,
    Fut: Future<Output = Result<SearchPage, AdapterError>>,
{
    let mut items: Vec<JsonValue> = Vec::new();
    loop {
        let page = fetch_page(items.len()).await?;
        let count = page.items.len();
        info!(
            start_at = page.start_at,
            count,
            total = page.total,
            "page received"
        );
        items.extend(page.items);
        if count == 0 || items.len() as u64 >= page.total {
            break;
        }
    }
    debug!(total_items = items.len(), "pagination finished");
    Ok(items)
}

/// `Authorization: Basic ...` header built from opaque `user:secret` material.
pub fn basic_auth_headers(user_data: &str) -> RequestHeaders {
    let mut headers = RequestHeaders::new();
    headers.insert(
        "Authorization".to_string(),
        format!("Basic {}", BASE64.encode(user_data.as_bytes())),
    );
    headers
}

/// Appends `<k1>=<v1>&<k2>=<v2>` pairing the `:`-separated names in
/// `auth_policy` with the `:`-separated values in `user_data`.
pub fn append_query_auth(url: &str, auth_policy: &str, user_data: &str) -> Result<String, AdapterError> {
    let (key_name, token_name) = auth_policy.split_once(':').ok_or_else(|| {
        AdapterError::InvalidConfiguration("[Auth Policy] must have the form name:name".to_string())
    })?;
    let (key, token) = user_data.split_once(':').ok_or_else(|| {
        AdapterError::InvalidConfiguration("[User Data] must have the form value:value".to_string())
    })?;
    let divider = if url.contains('?') { '&' } else { '?' };
    Ok(format!("{url}{divider}{key_name}={key}&{token_name}={token}"))
}

/// Reconstructs every shaped record, preserving input order.
pub fn transform_raw_to_common<R>(
    reconstructor: &R,
    items: &[JsonValue],
) -> Result<Vec<CommonRecord>, AdapterError>
where
    R: HistoryReconstructor + ?Sized,
{
    info!(count = items.len(), "transforming raw records into common format");
    items
        .iter()
        .map(|item| reconstructor.reconstruct(item))
        .collect()
}

pub(crate) fn deserialize_timestamp<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    flowlog_core::parse_source_timestamp(&raw)
        .ok_or_else(|| serde::de::Error::custom(format!("unrecognized timestamp `{raw}`")))
}


#[cfg(test)]
mod tests {
    use super::test_support::ScriptedTransport;
    use super::*;
    use serde_json::json;

    fn page(start_at: u64, total: u64, ids: &[&str]) -> SearchPage {
        SearchPage {
            start_at,
            total,
            items: ids.iter().map(|id| json!({ "id": id })).collect(),
        }
    }

    fn ids(items: &[JsonValue]) -> Vec<String> {
        items.iter().map(record_id).collect()
    }

    #[tokio::test]
    async fn pagination_concatenates_pages_in_order_until_total() {
        let mut pages = vec![
            page(0, 5, &["a", "b"]),
            page(2, 5, &["c", "d"]),
            page(4, 5, &["e"]),
        ]
        .into_iter();
        let mut offsets = Vec::new();

        let items = fetch_all_pages(|offset| {
            offsets.push(offset);
            let next = pages.next().expect("page requested past total");
            async move { Ok(next) }
        })
        .await
        .unwrap();

        assert_eq!(ids(&items), vec!["a", "b", "c", "d", "e"]);
        assert_eq!(offsets, vec![0, 2, 4]);
    }

    #[tokio::test]
    async fn pagination_with_zero_total_is_empty() {
        let mut calls = 0;
        let items = fetch_all_pages(|_| {
            calls += 1;
            async { Ok(page(0, 0, &[])) }
        })
        .await
        .unwrap();
        assert!(items.is_empty());
        assert_eq!(calls, 1);
    }

    #[tokio::test]
    async fn empty_page_terminates_even_when_total_is_never_reached() {
        let mut pages = vec![page(0, 100, &["a", "b"]), page(2, 100, &[])].into_iter();
        let items = fetch_all_pages(|_| {
            let next = pages.next().expect("requested after empty page");
            async move { Ok(next) }
        })
        .await
        .unwrap();
        assert_eq!(ids(&items), vec!["a", "b"]);
    }

    #[tokio::test]
    async fn pagination_propagates_page_failures() {
        let mut calls = 0;
        let err = fetch_all_pages(|_| {
            calls += 1;
            let current = calls;
            async move {
                if current == 1 {
                    Ok(page(0, 4, &["a", "b"]))
                } else {
                    Err(AdapterError::Upstream {
                        status: 503,
                        message: "unavailable".into(),
                    })
                }
            }
        })
        .await
        .unwrap_err();
        assert_eq!(err.status_code(), Some(503));
    }

    #[test]
    fn basic_auth_header_encodes_user_data() {
        let headers = basic_auth_headers("jane:s3cret");
        assert_eq!(
            headers.get("Authorization").map(String::as_str),
            Some("Basic amFuZTpzM2NyZXQ=")
        );
    }

    #[test]
    fn query_auth_picks_divider_and_pairs_names_with_values() {
        assert_eq!(
            append_query_auth("https://t.test/cards?fields=id", "key:token", "k1:t1").unwrap(),
            "https://t.test/cards?fields=id&key=k1&token=t1"
        );
        assert_eq!(
            append_query_auth("https://t.test/cards", "key:token", "k1:t1").unwrap(),
            "https://t.test/cards?key=k1&token=t1"
        );
        assert!(matches!(
            append_query_auth("https://t.test", "key", "k1:t1"),
            Err(AdapterError::InvalidConfiguration(_))
        ));
    }

    fn demand_settings() -> SourceSettings {
        SourceSettings {
            url: "https://tracker.example.test/rest/api/2/".into(),
            project: "ACME".into(),
            auth_policy: "basic".into(),
            user_data: "jane:secret".into(),
            flow: vec![FlowState { name: "Backlog".into() }],
            ..Default::default()
        }
    }

    #[test]
    fn settings_validation_reports_first_problem() {
        let mut settings = demand_settings();
        assert!(validate_settings(SourceKind::JiraDemand, &settings).is_ok());

        settings.url = "not a url".into();
        assert!(matches!(
            validate_settings(SourceKind::JiraDemand, &settings),
            Err(AdapterError::InvalidSourceUrl(_))
        ));

        let mut settings = demand_settings();
        settings.user_data = "  ".into();
        let err = validate_settings(SourceKind::JiraDemand, &settings).unwrap_err();
        assert_eq!(err.to_string(), "invalid configuration: [User Data] must be filled out");
        assert_eq!(err.status_code(), Some(400));

        let settings = demand_settings();
        let err = validate_settings(SourceKind::JiraDefect, &settings).unwrap_err();
        assert!(err.to_string().contains("Missing [Severity] information"));

        let mut settings = demand_settings();
        settings.flow.clear();
        let err = validate_settings(SourceKind::TrelloDemand, &settings).unwrap_err();
        assert!(err.to_string().contains("Missing [Flow] information"));
    }

    #[test]
    fn unusable_date_format_is_a_configuration_error() {
        let mut settings = demand_settings();
        settings.date_format = Some("%Y-%m-%d %Q".into());
        let err = validate_settings(SourceKind::JiraDemand, &settings).unwrap_err();
        assert!(matches!(err, AdapterError::InvalidConfiguration(_)));
        assert!(err.to_string().contains("[Date Format]"));

        settings.date_format = Some("%Y/%m/%d".into());
        assert!(validate_settings(SourceKind::JiraDemand, &settings).is_ok());
        assert!(check_date_format(DEFAULT_DATE_FORMAT).is_ok());
    }

    #[tokio::test]
    async fn connection_test_reports_unusable_date_format() {
        let transport = ScriptedTransport::new(vec![]);
        let ctx = AdapterContext::new("acme-demand");
        let mut settings = demand_settings();
        settings.date_format = Some("%Q".into());
        let report = test_connection(SourceKind::JiraDemand, &settings, &transport, &ctx).await;
        assert_eq!(report.status, ValidationStatus::Error);
        assert!(report.message.unwrap().contains("[Date Format]"));
        assert!(transport.urls().is_empty());
    }

    #[tokio::test]
    async fn connection_test_reports_upstream_failure_without_raising() {
        let transport = ScriptedTransport::new(vec![Err(FetchError::HttpStatus {
            status: 401,
            url: "https://tracker.example.test/rest/api/2/search".into(),
        })]);
        let ctx = AdapterContext::new("acme-demand");
        let report =
            test_connection(SourceKind::JiraDemand, &demand_settings(), &transport, &ctx).await;
        assert_eq!(report.status, ValidationStatus::Error);
        assert!(report.message.unwrap().contains("401"));
        assert_eq!(transport.urls().len(), 1);
    }

    #[tokio::test]
    async fn connection_test_skips_network_for_invalid_settings() {
        let transport = ScriptedTransport::new(vec![]);
        let ctx = AdapterContext::new("acme-demand");
        let mut settings = demand_settings();
        settings.project.clear();
        let report = test_connection(SourceKind::JiraDemand, &settings, &transport, &ctx).await;
        assert!(!report.is_ok());
        assert!(transport.urls().is_empty());
    }

    #[tokio::test]
    async fn connection_test_succeeds_on_any_json_response() {
        let transport = ScriptedTransport::new(vec![Ok(json!([{ "id": "5a1b2c3d0000000000000000" }]))]);
        let mut settings = demand_settings();
        settings.url = "https://board.example.test/1/boards/b1".into();
        settings.auth_policy = "key:token".into();
        settings.user_data = "k1:t1".into();
        let ctx = AdapterContext::new("board");
        let report = test_connection(SourceKind::TrelloDemand, &settings, &transport, &ctx).await;
        assert!(report.is_ok());
        assert_eq!(
            transport.urls(),
            vec!["https://board.example.test/1/boards/b1/cards?fields=id&limit=1&key=k1&token=t1"]
        );
    }

    #[test]
    fn fetch_errors_map_to_upstream_or_transport() {
        let err = AdapterError::from_fetch(
            FetchError::HttpStatus {
                status: 404,
                url: "u".into(),
            },
            "Error retrieving issues",
        );
        assert!(matches!(err, AdapterError::Upstream { status: 404, .. }));

        let err = AdapterError::from_fetch(
            FetchError::Decode {
                url: "u".into(),
                reason: "eof".into(),
            },
            "Error retrieving issues",
        );
        assert!(matches!(err, AdapterError::Transport(_)));
        assert_eq!(err.status_code(), None);
    }

    #[test]
    fn source_kinds_round_trip_through_config_keys() {
        let kind: SourceKind = serde_json::from_value(json!("trello-demand")).unwrap();
        assert_eq!(kind, SourceKind::TrelloDemand);
        assert_eq!(SourceKind::JiraDefect.as_key(), "jira-defect");
    }
}
