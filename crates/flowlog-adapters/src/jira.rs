//! Issue-tracker-A sources: changelog-based defects and demand.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use flowlog_core::{
    CommonDefectEntry, CommonDemandEntry, CommonEntry, CommonRecord, DefectHistoryEntry,
    DemandHistoryEntry, RELEASE_MARKER_FIELD, UNKNOWN_PRIORITY,
};
use flowlog_storage::JsonTransport;
use serde::Deserialize;
use serde_json::Value as JsonValue;
use tracing::{debug, info, info_span, Instrument};

use crate::{
    basic_auth_headers, deserialize_timestamp, fetch_all_pages, render_date, validate_source_url,
    AdapterContext, AdapterError, ConnectionRequest, HistoryReconstructor, SearchPage,
    SourceAdapter, SourceSettings,
};

pub const JIRA_EXPAND: [&str; 3] = ["changelog", "history", "items"];
pub const JIRA_FIELDS: [&str; 6] = ["issuetype", "created", "updated", "status", "key", "summary"];
pub const DEFAULT_DEFECT_TYPE: &str = "Bug";
pub const DEFAULT_DEMAND_TYPE: &str = "Story";
pub const DEFAULT_DEFECT_STATUS: &str = "CREATED";

const FETCH_ERROR_MESSAGE: &str = "Error retrieving issues from issue tracker";

/// Search query relative to the configured base URL. The parameter order is
/// part of the contract with the upstream API.
pub fn build_jql(project: &str, work_item_type: &str, since: &str, start_at: usize) -> String {
    let query = format!(
        "search?jql=project={project} AND issueType={work_item_type} AND updated>={since}&startAt={start_at}&expand={}&fields={}",
        JIRA_EXPAND.join(","),
        JIRA_FIELDS.join(",")
    );
    debug!(query = %query, "built search query");
    query
}

/// Copies `id` into `_id` and collapses each single-element changelog
/// `items` array into the element itself.
pub fn shape_jira_issue(mut raw: JsonValue) -> JsonValue {
    let Some(issue) = raw.as_object_mut() else {
        return raw;
    };
    if let Some(id) = issue.get("id").cloned() {
        issue.insert("_id".to_string(), id);
    }
    let histories = issue
        .get_mut("changelog")
        .and_then(|changelog| changelog.get_mut("histories"))
        .and_then(JsonValue::as_array_mut);
    if let Some(histories) = histories {
        for history in histories {
            if let Some(items) = history.get_mut("items") {
                collapse_singleton(items);
            }
        }
    }
    raw
}

fn collapse_singleton(value: &mut JsonValue) {
    let single = match value {
        JsonValue::Array(items) if items.len() == 1 => items.pop(),
        _ => None,
    };
    if let Some(only) = single {
        *value = only;
    }
}

#[derive(Debug, Clone, Deserialize)]
struct JiraIssue {
    id: String,
    #[serde(rename = "self", default)]
    self_url: Option<String>,
    fields: JiraFields,
    #[serde(default)]
    changelog: JiraChangelog,
}

#[derive(Debug, Clone, Deserialize)]
struct JiraFields {
    #[serde(deserialize_with = "deserialize_timestamp")]
    created: DateTime<Utc>,
    #[serde(default)]
    priority: Option<JiraNamed>,
}

#[derive(Debug, Clone, Deserialize)]
struct JiraNamed {
    name: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct JiraChangelog {
    #[serde(default)]
    histories: Vec<JiraHistory>,
}

#[derive(Debug, Clone, Deserialize)]
struct JiraHistory {
    #[serde(deserialize_with = "deserialize_timestamp")]
    created: DateTime<Utc>,
    #[serde(default)]
    items: ChangeItems,
}

/// Shaped histories carry one item; unshaped or multi-field ones keep the array.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum ChangeItems {
    One(ChangeItem),
    Many(Vec<ChangeItem>),
}

impl Default for ChangeItems {
    fn default() -> Self {
        Self::Many(Vec::new())
    }
}

impl ChangeItems {
    fn as_slice(&self) -> &[ChangeItem] {
        match self {
            Self::One(item) => std::slice::from_ref(item),
            Self::Many(items) => items,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
struct ChangeItem {
    field: String,
    #[serde(rename = "fromString", default)]
    from_value: Option<String>,
    #[serde(rename = "toString", default)]
    to_value: Option<String>,
}

impl JiraIssue {
    fn parse(shaped: &JsonValue) -> Result<Self, AdapterError> {
        Self::deserialize(shaped).map_err(|err| AdapterError::malformed(shaped, err))
    }

    /// Change items in changelog order, each paired with its history timestamp.
    fn changes(&self) -> impl Iterator<Item = (DateTime<Utc>, &ChangeItem)> + '_ {
        self.changelog.histories.iter().flat_map(|history| {
            history
                .items
                .as_slice()
                .iter()
                .map(move |item| (history.created, item))
        })
    }

    /// The tracker never records the originally assigned priority, only
    /// transitions away from it, so the first priority change's `fromString`
    /// wins over the current value.
    fn initial_priority(&self) -> String {
        self.changes()
            .filter(|(_, item)| item.field == "priority")
            .find_map(|(_, item)| item.from_value.clone())
            .or_else(|| self.fields.priority.as_ref().map(|p| p.name.clone()))
            .unwrap_or_else(|| UNKNOWN_PRIORITY.to_string())
    }
}

pub fn reconstruct_defect_history(
    shaped: &JsonValue,
    default_status: &str,
) -> Result<CommonDefectEntry, AdapterError> {
    let issue = JiraIssue::parse(shaped)?;
    let mut entry = CommonEntry::new(issue.id.clone());
    entry.uri = issue.self_url.clone();

    let mut current_priority = issue.initial_priority();
    let mut open = DefectHistoryEntry::new(
        current_priority.clone(),
        default_status,
        issue.fields.created,
    );

    for (at, item) in issue.changes() {
        match item.field.as_str() {
            "status" => {
                let status = item
                    .to_value
                    .clone()
                    .unwrap_or_else(|| open.status_value.clone());
                let next = DefectHistoryEntry::new(current_priority.clone(), status, at);
                entry.push_closed(std::mem::replace(&mut open, next), at);
            }
            "priority" => {
                if let Some(priority) = &item.to_value {
                    current_priority = priority.clone();
                }
                let next = DefectHistoryEntry::new(
                    current_priority.clone(),
                    open.status_value.clone(),
                    at,
                );
                entry.push_closed(std::mem::replace(&mut open, next), at);
            }
            _ => {}
        }
    }
    entry.push_open(open);
    Ok(entry)
}

pub fn reconstruct_jira_demand_history(
    shaped: &JsonValue,
    initial_flow_state: &str,
) -> Result<CommonDemandEntry, AdapterError> {
    let issue = JiraIssue::parse(shaped)?;
    let mut entry = CommonEntry::new(issue.id.clone());
    entry.uri = issue.self_url.clone();

    let mut open = DemandHistoryEntry::new(initial_flow_state, issue.fields.created);

    for (at, item) in issue.changes() {
        match item.field.as_str() {
            "status" | "resolution" => {
                entry.push_closed(open, at);
                let state = match &item.to_value {
                    Some(state) => state.clone(),
                    None => state_before_cleared_resolution(&entry.history, initial_flow_state),
                };
                open = DemandHistoryEntry::new(state, at);
            }
            RELEASE_MARKER_FIELD => {
                entry.push_closed(open, at);
                open = DemandHistoryEntry::release_marker(
                    item.to_value.as_deref().unwrap_or_default(),
                    at,
                );
            }
            _ => {}
        }
    }
    entry.push_open(open);
    Ok(entry)
}

/// A resolution-clearing event names no destination, so the item is assumed
/// to return to the state held two entries back (the first entry's state
/// while history is shorter than two).
fn state_before_cleared_resolution(history: &[DemandHistoryEntry], fallback: &str) -> String {
    let index = history.len().saturating_sub(2);
    history
        .get(index)
        .map(|h| h.status_value.clone())
        .unwrap_or_else(|| fallback.to_string())
}

/// Paged changelog search shared by defect and demand sources.
#[derive(Debug, Clone)]
struct JiraSearch {
    settings: SourceSettings,
    work_item_type: String,
}

impl JiraSearch {
    fn new(settings: SourceSettings, default_type: &str) -> Self {
        let work_item_type = settings
            .work_item_type
            .clone()
            .filter(|t| !t.trim().is_empty())
            .unwrap_or_else(|| default_type.to_string());
        Self {
            settings,
            work_item_type,
        }
    }

    fn page_url(&self, since: &str, start_at: usize) -> String {
        format!(
            "{}{}",
            self.settings.url,
            build_jql(&self.settings.project, &self.work_item_type, since, start_at)
        )
    }

    async fn fetch_all(
        &self,
        transport: &dyn JsonTransport,
        ctx: &AdapterContext,
        since: DateTime<Utc>,
    ) -> Result<Vec<JsonValue>, AdapterError> {
        validate_source_url(&self.settings.url)?;
        let since = render_date(since, self.settings.date_format())?;
        let headers = basic_auth_headers(&self.settings.user_data);
        let span = info_span!(
            "jira_fetch",
            run_id = %ctx.run_id,
            source_id = %ctx.source_id,
            project = %self.settings.project
        );
        info!(parent: &span, since = %since, "loading issues updated since watermark");

        let headers = &headers;
        let since = &since;
        fetch_all_pages(|start_at| {
            let url = self.page_url(since, start_at);
            async move {
                let body = transport
                    .get_json(&url, headers)
                    .await
                    .map_err(|err| AdapterError::from_fetch(err, FETCH_ERROR_MESSAGE))?;
                serde_json::from_value::<SearchPage>(body)
                    .map_err(|err| AdapterError::MalformedResponse(err.to_string()))
            }
        })
        .instrument(span)
        .await
    }

    fn connection_request(
        &self,
        ctx: &AdapterContext,
    ) -> Result<ConnectionRequest, AdapterError> {
        validate_source_url(&self.settings.url)?;
        let today = render_date(ctx.fetched_at, self.settings.date_format())?;
        Ok(ConnectionRequest {
            url: self.page_url(&today, 0),
            headers: basic_auth_headers(&self.settings.user_data),
        })
    }
}

#[derive(Debug, Clone)]
pub struct JiraDefectAdapter {
    search: JiraSearch,
    default_status: String,
}

impl JiraDefectAdapter {
    pub fn new(settings: SourceSettings) -> Self {
        let default_status = settings
            .initial_status
            .clone()
            .unwrap_or_else(|| DEFAULT_DEFECT_STATUS.to_string());
        Self {
            search: JiraSearch::new(settings, DEFAULT_DEFECT_TYPE),
            default_status,
        }
    }
}

impl HistoryReconstructor for JiraDefectAdapter {
    fn reconstruct(&self, shaped: &JsonValue) -> Result<CommonRecord, AdapterError> {
        reconstruct_defect_history(shaped, &self.default_status).map(CommonRecord::Defect)
    }
}

#[async_trait]
impl SourceAdapter for JiraDefectAdapter {
    async fn fetch_all(
        &self,
        transport: &dyn JsonTransport,
        ctx: &AdapterContext,
        since: DateTime<Utc>,
    ) -> Result<Vec<JsonValue>, AdapterError> {
        self.search.fetch_all(transport, ctx, since).await
    }

    fn shape(&self, raw: JsonValue) -> JsonValue {
        shape_jira_issue(raw)
    }

    fn connection_request(
        &self,
        ctx: &AdapterContext,
    ) -> Result<ConnectionRequest, AdapterError> {
        self.search.connection_request(ctx)
    }
}

#[derive(Debug, Clone)]
pub struct JiraDemandAdapter {
    search: JiraSearch,
    initial_flow_state: String,
}

impl JiraDemandAdapter {
    pub fn new(settings: SourceSettings) -> Result<Self, AdapterError> {
        let initial_flow_state = settings
            .flow
            .first()
            .map(|state| state.name.clone())
            .ok_or_else(|| {
                AdapterError::InvalidConfiguration("Missing [Flow] information".to_string())
            })?;
        Ok(Self {
            search: JiraSearch::new(settings, DEFAULT_DEMAND_TYPE),
            initial_flow_state,
        })
    }
}

impl HistoryReconstructor for JiraDemandAdapter {
    fn reconstruct(&self, shaped: &JsonValue) -> Result<CommonRecord, AdapterError> {
        reconstruct_jira_demand_history(shaped, &self.initial_flow_state).map(CommonRecord::Demand)
    }
}

#[async_trait]
impl SourceAdapter for JiraDemandAdapter {
    async fn fetch_all(
        &self,
        transport: &dyn JsonTransport,
        ctx: &AdapterContext,
        since: DateTime<Utc>,
    ) -> Result<Vec<JsonValue>, AdapterError> {
        self.search.fetch_all(transport, ctx, since).await
    }

    fn shape(&self, raw: JsonValue) -> JsonValue {
        shape_jira_issue(raw)
    }

    fn connection_request(
        &self,
        ctx: &AdapterContext,
    ) -> Result<ConnectionRequest, AdapterError> {
        self.search.connection_request(ctx)
    }
}
