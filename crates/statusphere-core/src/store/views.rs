use rusqlite::{params, OptionalExtension, Row};
use serde_json::json;
use tracing::instrument;

use super::db::{Database, StoreError};
use crate::constants::STATUS_COLLECTION;
use crate::identity::IdResolver;
use crate::lexicon::{RecordValidator, StatusValidator};
use crate::models::{StatusRecord, StatusView};

const SELECT_STATUS: &str =
    "SELECT uri, author_did, status, created_at, indexed_at FROM status";

fn row_to_record(row: &Row<'_>) -> rusqlite::Result<StatusRecord> {
    Ok(StatusRecord {
        uri: row.get(0)?,
        author_did: row.get(1)?,
        status: row.get(2)?,
        created_at: row.get(3)?,
        indexed_at: row.get(4)?,
    })
}

pub fn get_status(db: &Database, uri: &str) -> Result<Option<StatusRecord>, StoreError> {
    let conn = db.connection();
    let conn = conn.lock();
    let record = conn
        .query_row(&format!("{SELECT_STATUS} WHERE uri = ?1"), [uri], row_to_record)
        .optional()?;
    Ok(record)
}

/// SQLite reads a negative LIMIT as unbounded, so clamp instead of wrapping.
fn sql_limit(limit: usize) -> i64 {
    i64::try_from(limit).unwrap_or(i64::MAX)
}

/// Most recently indexed statuses, newest first. Rows that no longer pass
/// validation are left out.
#[instrument(skip(db))]
pub fn recent_statuses(db: &Database, limit: usize) -> Result<Vec<StatusRecord>, StoreError> {
    let conn = db.connection();
    let conn = conn.lock();
    let mut stmt = conn.prepare(&format!("{SELECT_STATUS} ORDER BY indexed_at DESC LIMIT ?1"))?;
    let records = stmt
        .query_map([sql_limit(limit)], row_to_record)?
        .collect::<Result<Vec<_>, _>>()?;

    let validator = StatusValidator::new();
    Ok(records
        .into_iter()
        .filter(|record| is_valid(&validator, record))
        .collect())
}

pub fn latest_status_for(db: &Database, did: &str) -> Result<Option<StatusRecord>, StoreError> {
    let conn = db.connection();
    let conn = conn.lock();
    let record = conn
        .query_row(
            &format!("{SELECT_STATUS} WHERE author_did = ?1 ORDER BY indexed_at DESC LIMIT 1"),
            [did],
            row_to_record,
        )
        .optional()?;
    Ok(record)
}

pub fn statuses_by_author(db: &Database, did: &str) -> Result<Vec<StatusRecord>, StoreError> {
    let conn = db.connection();
    let conn = conn.lock();
    let mut stmt =
        conn.prepare(&format!("{SELECT_STATUS} WHERE author_did = ?1 ORDER BY indexed_at DESC"))?;
    let records = stmt
        .query_map(params![did], row_to_record)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(records)
}

pub fn count_statuses(db: &Database) -> Result<u64, StoreError> {
    let conn = db.connection();
    let conn = conn.lock();
    let count: i64 = conn.query_row("SELECT COUNT(*) FROM status", [], |row| row.get(0))?;
    Ok(count as u64)
}

fn is_valid(validator: &StatusValidator, record: &StatusRecord) -> bool {
    let payload = json!({
        "$type": STATUS_COLLECTION,
        "status": record.status,
        "createdAt": record.created_at,
    });
    validator.validate(&payload, STATUS_COLLECTION).is_ok()
}

/// Attach author handles to cached rows. Unresolvable authors get the
/// placeholder handle.
pub async fn hydrate(records: &[StatusRecord], resolver: &IdResolver) -> Vec<StatusView> {
    let dids: Vec<String> = records.iter().map(|r| r.author_did.clone()).collect();
    let handles = resolver.resolve_dids_to_handles(&dids).await;

    records
        .iter()
        .map(|record| {
            let handle = handles
                .get(&record.author_did)
                .cloned()
                .unwrap_or_else(|| crate::constants::INVALID_HANDLE.to_string());
            StatusView::from_record(record, handle)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Change, StatusFields, Upsert};
    use crate::store::Materializer;

    fn seed(materializer: &Materializer, rkey: &str, did: &str, status: &str, indexed_at: &str) {
        materializer
            .apply(&Change::Upsert(Upsert {
                uri: format!("at://{did}/xyz.statusphere.status/{rkey}"),
                author_did: did.to_string(),
                fields: StatusFields {
                    status: status.to_string(),
                    created_at: "2024-10-01T12:00:00.000Z".to_string(),
                },
                indexed_at: indexed_at.to_string(),
                sequence: None,
            }))
            .unwrap();
    }

    #[test]
    fn test_recent_statuses_newest_first_with_limit() {
        let db = Database::in_memory().unwrap();
        let materializer = Materializer::new(&db);
        seed(&materializer, "a", "did:example:1", "🙂", "2024-10-01T12:00:01.000Z");
        seed(&materializer, "b", "did:example:2", "🔥", "2024-10-01T12:00:03.000Z");
        seed(&materializer, "c", "did:example:1", "😴", "2024-10-01T12:00:02.000Z");

        let recent = recent_statuses(&db, 2).unwrap();
        let statuses: Vec<&str> = recent.iter().map(|r| r.status.as_str()).collect();
        assert_eq!(statuses, vec!["🔥", "😴"]);
        assert_eq!(count_statuses(&db).unwrap(), 3);

        assert!(recent_statuses(&db, 0).unwrap().is_empty());
        assert_eq!(recent_statuses(&db, usize::MAX).unwrap().len(), 3);
    }

    #[test]
    fn test_sql_limit_never_goes_negative() {
        assert_eq!(sql_limit(30), 30);
        assert_eq!(sql_limit(usize::MAX), i64::MAX);
    }

    #[test]
    fn test_recent_statuses_filters_invalid_rows() {
        let db = Database::in_memory().unwrap();
        let materializer = Materializer::new(&db);
        seed(&materializer, "a", "did:example:1", "not an emoji", "2024-10-01T12:00:01.000Z");
        seed(&materializer, "b", "did:example:1", "🙂", "2024-10-01T12:00:02.000Z");

        let recent = recent_statuses(&db, 30).unwrap();
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].status, "🙂");
    }

    #[test]
    fn test_latest_status_for_author() {
        let db = Database::in_memory().unwrap();
        let materializer = Materializer::new(&db);
        seed(&materializer, "a", "did:example:1", "🙂", "2024-10-01T12:00:01.000Z");
        seed(&materializer, "b", "did:example:1", "🎉", "2024-10-01T12:00:09.000Z");
        seed(&materializer, "c", "did:example:2", "🔥", "2024-10-01T12:00:10.000Z");

        let latest = latest_status_for(&db, "did:example:1").unwrap().unwrap();
        assert_eq!(latest.status, "🎉");
        assert_eq!(latest_status_for(&db, "did:example:3").unwrap(), None);
        assert_eq!(statuses_by_author(&db, "did:example:1").unwrap().len(), 2);
    }
}
