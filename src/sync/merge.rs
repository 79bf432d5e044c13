//! Merge resolution for incoming records
//!
//! Turns one proposed record plus the current stored state into the record to
//! persist. Whole-record replace is correct for fields a human edits on one device
//! at a time; map-valued merge fields accumulate facts from several devices and
//! must combine at sub-key granularity, or syncing device A after device B would
//! erase B's unrelated entries.

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};

use super::registry::EntityTypeDef;
use crate::db::StoredEntity;
use crate::error::AppError;

/// One proposed mutation, parsed out of a change batch.
///
/// Server-managed keys are stripped from the payload here: any client-supplied
/// `ownerId` is discarded, and the client's `updatedAt` is kept only for singleton
/// batch collapse, never for ordering.
#[derive(Debug, Clone)]
pub struct IncomingRecord {
    pub id: Option<String>,
    pub is_deleted: bool,
    pub client_updated_at: Option<DateTime<Utc>>,
    pub fields: Map<String, Value>,
}

impl IncomingRecord {
    pub fn parse(value: &Value) -> Result<Self, AppError> {
        let Value::Object(obj) = value else {
            return Err(AppError::Validation("record must be a JSON object".to_string()));
        };

        let mut fields = obj.clone();

        let id = match fields.remove("id") {
            Some(Value::String(id)) if !id.is_empty() => Some(id),
            Some(Value::Null) | None => None,
            Some(_) => {
                return Err(AppError::Validation("record id must be a string".to_string()));
            }
        };

        fields.remove("ownerId");

        let is_deleted = matches!(fields.remove("isDeleted"), Some(Value::Bool(true)));

        let client_updated_at = fields
            .remove("updatedAt")
            .as_ref()
            .and_then(Value::as_str)
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|dt| dt.with_timezone(&Utc));

        Ok(Self {
            id,
            is_deleted,
            client_updated_at,
            fields,
        })
    }
}

/// Resolve one incoming record against the stored state.
///
/// The identity and `updatedAt` stamp are decided by the caller: `now` is the
/// instant captured for the whole exchange, so every write in it carries the same
/// timestamp.
pub fn resolve(
    def: &EntityTypeDef,
    id: String,
    owner_id: &str,
    now: DateTime<Utc>,
    incoming: &IncomingRecord,
    existing: Option<&StoredEntity>,
) -> StoredEntity {
    let mut fields = incoming.fields.clone();

    for &field in def.merge_fields() {
        let stored_value = existing.and_then(|e| e.fields.get(field));
        if let Some(merged) = merge_map_field(stored_value, fields.get(field)) {
            fields.insert(field.to_string(), merged);
        }
    }

    StoredEntity {
        id,
        owner_id: owner_id.to_string(),
        fields,
        is_deleted: incoming.is_deleted,
        updated_at: now,
    }
}

/// Reduce a singleton batch to the one winning record.
///
/// The latest client-reported timestamp wins; a missing timestamp sorts as epoch,
/// and ties keep the earlier record in batch order.
pub fn collapse(batch: Vec<IncomingRecord>) -> Option<IncomingRecord> {
    let mut winner: Option<IncomingRecord> = None;

    for candidate in batch {
        let candidate_ts = candidate.client_updated_at.unwrap_or(DateTime::<Utc>::UNIX_EPOCH);
        match &winner {
            Some(current)
                if candidate_ts
                    <= current.client_updated_at.unwrap_or(DateTime::<Utc>::UNIX_EPOCH) => {}
            _ => winner = Some(candidate),
        }
    }

    winner
}

/// Sub-key union of a merge field. Returns the merged value when both sides are
/// mappings, or the stored mapping when the incoming record omits the field;
/// `None` means the field falls through to whole-record replacement.
fn merge_map_field(stored: Option<&Value>, incoming: Option<&Value>) -> Option<Value> {
    match (stored, incoming) {
        (Some(Value::Object(stored_map)), Some(Value::Object(incoming_map))) => {
            let mut merged = stored_map.clone();
            // Incoming wins per sub-key, not per record
            for (key, value) in incoming_map {
                merged.insert(key.clone(), value.clone());
            }
            Some(Value::Object(merged))
        }
        // An omitted merge field must not erase accumulated sub-keys
        (Some(Value::Object(stored_map)), None) => Some(Value::Object(stored_map.clone())),
        _ => None,
    }
}
