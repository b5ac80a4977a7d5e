//! Record validation for the status collection.
//!
//! The ingestion engine only depends on the ok/rejected contract of
//! [`RecordValidator`], so another record type can plug in its own rules.

use serde_json::Value;
use unicode_segmentation::UnicodeSegmentation;

use crate::constants::{
    DISPLAY_NAME_MAX_GRAPHEMES, DISPLAY_NAME_MAX_LENGTH, PROFILE_COLLECTION, STATUS_COLLECTION,
    STATUS_MAX_GRAPHEMES, STATUS_MAX_LENGTH,
};
use crate::models::{ProfileFields, StatusFields};

/// Why a payload was not accepted
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Rejection {
    #[error("record is not an object")]
    NotAnObject,
    #[error("record type {found} does not match collection {expected}")]
    WrongType { expected: String, found: String },
    #[error("missing required field {0}")]
    MissingField(&'static str),
    #[error("field {0} must be a string")]
    NotAString(&'static str),
    #[error("field {field} violates constraint: {reason}")]
    Constraint { field: &'static str, reason: String },
}

pub trait RecordValidator: Send + Sync {
    fn validate(&self, payload: &Value, expected_collection: &str)
        -> Result<StatusFields, Rejection>;
}

/// Validator for `xyz.statusphere.status`
#[derive(Debug, Clone, Copy, Default)]
pub struct StatusValidator;

impl StatusValidator {
    pub fn new() -> Self {
        Self
    }
}

impl RecordValidator for StatusValidator {
    fn validate(
        &self,
        payload: &Value,
        expected_collection: &str,
    ) -> Result<StatusFields, Rejection> {
        let object = payload.as_object().ok_or(Rejection::NotAnObject)?;

        let found = match object.get("$type") {
            None | Some(Value::Null) => return Err(Rejection::MissingField("$type")),
            Some(record_type) => record_type.as_str().ok_or(Rejection::NotAString("$type"))?,
        };
        if found != expected_collection {
            return Err(Rejection::WrongType {
                expected: expected_collection.to_string(),
                found: found.to_string(),
            });
        }
        if expected_collection != STATUS_COLLECTION {
            return Err(Rejection::WrongType {
                expected: STATUS_COLLECTION.to_string(),
                found: expected_collection.to_string(),
            });
        }

        let status = required_str(payload, "status")?;
        check_status(status)?;

        let created_at = required_str(payload, "createdAt")?;
        if chrono::DateTime::parse_from_rfc3339(created_at).is_err() {
            return Err(Rejection::Constraint {
                field: "createdAt",
                reason: format!("{created_at:?} is not a datetime"),
            });
        }

        Ok(StatusFields {
            status: status.to_string(),
            created_at: created_at.to_string(),
        })
    }
}

/// Validate an `app.bsky.actor.profile` record. Every field is optional, but
/// the ones present must be well formed.
pub fn validate_profile(payload: &Value) -> Result<ProfileFields, Rejection> {
    let object = payload.as_object().ok_or(Rejection::NotAnObject)?;
    let found = required_str(payload, "$type")?;
    if found != PROFILE_COLLECTION {
        return Err(Rejection::WrongType {
            expected: PROFILE_COLLECTION.to_string(),
            found: found.to_string(),
        });
    }

    let display_name = optional_str(payload, "displayName")?;
    if let Some(name) = display_name {
        if name.len() > DISPLAY_NAME_MAX_LENGTH
            || name.graphemes(true).count() > DISPLAY_NAME_MAX_GRAPHEMES
        {
            return Err(Rejection::Constraint {
                field: "displayName",
                reason: format!("at most {DISPLAY_NAME_MAX_GRAPHEMES} graphemes allowed"),
            });
        }
    }

    let avatar_cid = match object.get("avatar") {
        None | Some(Value::Null) => None,
        Some(blob) => Some(blob_cid(blob, "avatar")?),
    };

    let created_at = optional_str(payload, "createdAt")?;
    if let Some(created_at) = created_at {
        if chrono::DateTime::parse_from_rfc3339(created_at).is_err() {
            return Err(Rejection::Constraint {
                field: "createdAt",
                reason: format!("{created_at:?} is not a datetime"),
            });
        }
    }

    Ok(ProfileFields {
        display_name: display_name.map(str::to_string),
        avatar_cid,
        created_at: created_at.map(str::to_string),
    })
}

/// CID of an image blob reference (`{"ref": {"$link": cid}, "mimeType": "image/…"}`)
fn blob_cid(blob: &Value, field: &'static str) -> Result<String, Rejection> {
    let mime = blob.get("mimeType").and_then(Value::as_str).unwrap_or_default();
    if !mime.starts_with("image/") {
        return Err(Rejection::Constraint {
            field,
            reason: format!("blob type {mime:?} is not an image"),
        });
    }
    blob.get("ref")
        .and_then(|r| r.get("$link"))
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| Rejection::Constraint {
            field,
            reason: "blob has no ref".to_string(),
        })
}

fn optional_str<'a>(payload: &'a Value, field: &'static str) -> Result<Option<&'a str>, Rejection> {
    match payload.get(field) {
        None | Some(Value::Null) => Ok(None),
        Some(value) => value.as_str().map(Some).ok_or(Rejection::NotAString(field)),
    }
}

fn required_str<'a>(payload: &'a Value, field: &'static str) -> Result<&'a str, Rejection> {
    match payload.get(field) {
        None | Some(Value::Null) => Err(Rejection::MissingField(field)),
        Some(value) => value.as_str().ok_or(Rejection::NotAString(field)),
    }
}

fn check_status(status: &str) -> Result<(), Rejection> {
    if status.is_empty() {
        return Err(Rejection::Constraint {
            field: "status",
            reason: "must not be empty".to_string(),
        });
    }
    if status.len() > STATUS_MAX_LENGTH {
        return Err(Rejection::Constraint {
            field: "status",
            reason: format!("longer than {STATUS_MAX_LENGTH} bytes"),
        });
    }
    let graphemes = status.graphemes(true).count();
    if graphemes > STATUS_MAX_GRAPHEMES {
        return Err(Rejection::Constraint {
            field: "status",
            reason: format!("{graphemes} graphemes, at most {STATUS_MAX_GRAPHEMES} allowed"),
        });
    }
    Ok(())
}
