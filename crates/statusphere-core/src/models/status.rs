use serde::{Deserialize, Serialize};

/// Row of the materialized `status` table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusRecord {
    pub uri: String,
    pub author_did: String,
    pub status: String,
    pub created_at: String,
    pub indexed_at: String,
}

/// Content fields of a validated `xyz.statusphere.status` record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusFields {
    pub status: String,
    pub created_at: String,
}

/// Normalized insert-or-overwrite for one record.
///
/// `sequence` is the stream position of the commit that produced it, and is
/// `None` for optimistic writes made by the write path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Upsert {
    pub uri: String,
    pub author_did: String,
    pub fields: StatusFields,
    pub indexed_at: String,
    pub sequence: Option<i64>,
}

/// A single change handed to the materializer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Change {
    Upsert(Upsert),
    Delete { uri: String, sequence: Option<i64> },
}

impl Change {
    pub fn uri(&self) -> &str {
        match self {
            Change::Upsert(upsert) => &upsert.uri,
            Change::Delete { uri, .. } => uri,
        }
    }

    pub fn sequence(&self) -> Option<i64> {
        match self {
            Change::Upsert(upsert) => upsert.sequence,
            Change::Delete { sequence, .. } => *sequence,
        }
    }
}

/// Author identity attached to a status, optionally with profile details
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProfileView {
    pub did: String,
    pub handle: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    /// Image URL for the profile's avatar blob
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<String>,
}

impl ProfileView {
    pub fn new(did: impl Into<String>, handle: impl Into<String>) -> Self {
        Self {
            did: did.into(),
            handle: handle.into(),
            ..Self::default()
        }
    }
}

/// Content of a validated `app.bsky.actor.profile` record
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProfileFields {
    pub display_name: Option<String>,
    /// CID of the avatar blob
    pub avatar_cid: Option<String>,
    pub created_at: Option<String>,
}

/// Signed-in account with its profile and latest cached status
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UserInfo {
    pub did: String,
    pub profile: ProfileView,
    pub status: Option<StatusView>,
}

/// Status hydrated with its author's handle, as returned to readers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusView {
    pub uri: String,
    pub status: String,
    pub created_at: String,
    pub profile: ProfileView,
}

impl StatusView {
    pub fn from_record(record: &StatusRecord, handle: String) -> Self {
        Self {
            uri: record.uri.clone(),
            status: record.status.clone(),
            created_at: record.created_at.clone(),
            profile: ProfileView::new(record.author_did.clone(), handle),
        }
    }
}

/// Current time in the cache's timestamp format (RFC 3339, UTC, millis).
pub fn now_timestamp() -> String {
    format_timestamp(chrono::Utc::now())
}

pub fn format_timestamp(at: chrono::DateTime<chrono::Utc>) -> String {
    at.to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_timestamps_sort_lexically() {
        let earlier = format_timestamp(chrono::Utc.with_ymd_and_hms(2024, 9, 1, 8, 0, 0).unwrap());
        let later = format_timestamp(chrono::Utc.with_ymd_and_hms(2024, 10, 1, 7, 59, 59).unwrap());
        assert_eq!(earlier, "2024-09-01T08:00:00.000Z");
        assert!(earlier < later);
    }

    #[test]
    fn test_change_accessors() {
        let delete = Change::Delete {
            uri: "at://did:example:1/xyz.statusphere.status/r1".to_string(),
            sequence: Some(42),
        };
        assert_eq!(delete.uri(), "at://did:example:1/xyz.statusphere.status/r1");
        assert_eq!(delete.sequence(), Some(42));
    }
}
