//! Board-tracker-B demand source: cards whose history is a newest-first list
//! of actions carrying `listBefore`/`listAfter` snapshots.

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use flowlog_core::{CommonDemandEntry, CommonEntry, CommonRecord, DemandHistoryEntry};
use flowlog_storage::JsonTransport;
use serde::Deserialize;
use serde_json::Value as JsonValue;
use tracing::{info, info_span, warn, Instrument};

use crate::{
    append_query_auth, deserialize_timestamp, validate_source_url, AdapterContext, AdapterError,
    ConnectionRequest, HistoryReconstructor, SourceAdapter, SourceSettings,
};

const CARD_QUERY: &str = "fields=id,labels,dateLastActivity,shortUrl&actions=updateCard,createCard";
const CONNECTION_QUERY: &str = "fields=id&limit=1";
const FETCH_ERROR_MESSAGE: &str = "Error retrieving cards from board tracker";

pub fn cards_url(base: &str, query: &str) -> String {
    format!("{base}/cards?{query}")
}

/// Card ids start with the creation Unix time as 8 hex digits.
pub fn card_creation_date(card_id: &str) -> Option<DateTime<Utc>> {
    let prefix = card_id.get(..8)?;
    if !prefix.chars().all(|c| c.is_ascii_hexdigit()) {
        return None;
    }
    let seconds = i64::from_str_radix(prefix, 16).ok()?;
    DateTime::from_timestamp(seconds, 0)
}

/// Adds `_id` and the id-derived `creationDate` to a raw card.
pub fn shape_trello_card(mut raw: JsonValue) -> JsonValue {
    let Some(card) = raw.as_object_mut() else {
        return raw;
    };
    let Some(id) = card.get("id").and_then(JsonValue::as_str).map(str::to_string) else {
        return raw;
    };
    if let Some(created) = card_creation_date(&id) {
        card.insert(
            "creationDate".to_string(),
            JsonValue::String(created.to_rfc3339_opts(SecondsFormat::Millis, true)),
        );
    }
    card.insert("_id".to_string(), JsonValue::String(id));
    raw
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TrelloCard {
    id: String,
    #[serde(default)]
    short_url: Option<String>,
    #[serde(default)]
    actions: Vec<TrelloAction>,
}

#[derive(Debug, Clone, Deserialize)]
struct TrelloAction {
    #[serde(deserialize_with = "deserialize_timestamp")]
    date: DateTime<Utc>,
    #[serde(default)]
    data: TrelloActionData,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TrelloActionData {
    #[serde(default)]
    list_before: Option<TrelloList>,
    #[serde(default)]
    list_after: Option<TrelloList>,
    #[serde(default)]
    list: Option<TrelloList>,
}

#[derive(Debug, Clone, Deserialize)]
struct TrelloList {
    name: String,
}

struct ListMove<'a> {
    at: DateTime<Utc>,
    before: &'a str,
    after: &'a str,
}

pub fn reconstruct_trello_demand_history(shaped: &JsonValue) -> Result<CommonDemandEntry, AdapterError> {
    let card = TrelloCard::deserialize(shaped).map_err(|err| AdapterError::malformed(shaped, err))?;
    let created = card_creation_date(&card.id)
        .ok_or_else(|| AdapterError::malformed(shaped, "id does not start with a hex timestamp"))?;

    let mut entry = CommonEntry::new(card.id.clone());
    entry.uri = card.short_url.clone();

    // Actions arrive newest-first.
    let chronological: Vec<&TrelloAction> = card.actions.iter().rev().collect();
    let mut moves = Vec::new();
    for action in &chronological {
        let Some(before) = &action.data.list_before else {
            continue;
        };
        let after = action
            .data
            .list_after
            .as_ref()
            .ok_or_else(|| AdapterError::malformed(shaped, "list move without listAfter"))?;
        moves.push(ListMove {
            at: action.date,
            before: &before.name,
            after: &after.name,
        });
    }

    let Some(first) = moves.first() else {
        let current = chronological
            .iter()
            .find_map(|action| action.data.list.as_ref())
            .ok_or_else(|| AdapterError::malformed(shaped, "card has no action naming its list"))?;
        entry.push_open(DemandHistoryEntry::new(current.name.clone(), created));
        return Ok(entry);
    };

    let mut open = DemandHistoryEntry::new(first.before, created);
    for list_move in &moves {
        entry.push_closed(open, list_move.at);
        open = DemandHistoryEntry::new(list_move.after, list_move.at);
    }
    entry.push_open(open);
    Ok(entry)
}

#[derive(Debug, Clone)]
pub struct TrelloDemandAdapter {
    settings: SourceSettings,
}

impl TrelloDemandAdapter {
    pub fn new(settings: SourceSettings) -> Self {
        Self { settings }
    }

    fn authed_url(&self, query: &str) -> Result<String, AdapterError> {
        append_query_auth(
            &cards_url(&self.settings.url, query),
            &self.settings.auth_policy,
            &self.settings.user_data,
        )
    }
}

/// Cards without actions, or untouched since the watermark, are skipped.
fn is_active_since(card: &JsonValue, since: DateTime<Utc>) -> bool {
    let has_actions = card
        .get("actions")
        .and_then(JsonValue::as_array)
        .is_some_and(|actions| !actions.is_empty());
    if !has_actions {
        return false;
    }
    match card.get("dateLastActivity").and_then(JsonValue::as_str) {
        Some(raw) => match flowlog_core::parse_source_timestamp(raw) {
            Some(last_activity) => since <= last_activity,
            None => {
                warn!(card = %card.get("id").unwrap_or(&JsonValue::Null), value = raw, "unparseable dateLastActivity; keeping card");
                true
            }
        },
        None => true,
    }
}

impl HistoryReconstructor for TrelloDemandAdapter {
    fn reconstruct(&self, shaped: &JsonValue) -> Result<CommonRecord, AdapterError> {
        reconstruct_trello_demand_history(shaped).map(CommonRecord::Demand)
    }
}

#[async_trait]
impl SourceAdapter for TrelloDemandAdapter {
    /// The cards endpoint is not paged: one request returns every card.
    async fn fetch_all(
        &self,
        transport: &dyn JsonTransport,
        ctx: &AdapterContext,
        since: DateTime<Utc>,
    ) -> Result<Vec<JsonValue>, AdapterError> {
        validate_source_url(&self.settings.url)?;
        let url = self.authed_url(CARD_QUERY)?;
        let span = info_span!("trello_fetch", run_id = %ctx.run_id, source_id = %ctx.source_id);

        let body = transport
            .get_json(&url, &Default::default())
            .instrument(span)
            .await
            .map_err(|err| AdapterError::from_fetch(err, FETCH_ERROR_MESSAGE))?;
        let JsonValue::Array(cards) = body else {
            return Err(AdapterError::MalformedResponse(
                "expected a JSON array of cards".to_string(),
            ));
        };

        let read = cards.len();
        let cards: Vec<JsonValue> = cards
            .into_iter()
            .filter(|card| is_active_since(card, since))
            .collect();
        info!(source_id = %ctx.source_id, read, kept = cards.len(), "cards read");
        Ok(cards)
    }

    fn shape(&self, raw: JsonValue) -> JsonValue {
        shape_trello_card(raw)
    }

    fn connection_request(
        &self,
        _ctx: &AdapterContext,
    ) -> Result<ConnectionRequest, AdapterError> {
        validate_source_url(&self.settings.url)?;
        Ok(ConnectionRequest {
            url: self.authed_url(CONNECTION_QUERY)?,
            headers: Default::default(),
        })
    }
}
