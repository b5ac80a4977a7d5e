//! Status read and write operations on top of the cache.

use std::sync::Arc;

use serde_json::json;
use tracing::{debug, info, instrument, warn};

use crate::constants::{
    AVATAR_IMAGE_URL, BACKFILL_RECORD_LIMIT, PROFILE_COLLECTION, PROFILE_RKEY, STATUS_COLLECTION,
};
use crate::identity::{IdResolver, ResolveError};
use crate::lexicon::{validate_profile, Rejection, RecordValidator};
use crate::models::{
    now_timestamp, AtUri, Change, ProfileFields, ProfileView, StatusRecord, StatusView, Upsert,
    UserInfo,
};
use crate::repo::{RepoError, RepositoryClient};
use crate::store::{self, Database, Materializer, StoreError};
use crate::tid::Tid;

#[derive(Debug, thiserror::Error)]
pub enum SendStatusError {
    #[error("invalid status: {0}")]
    InvalidStatus(#[from] Rejection),
    #[error("could not find the repository for {did}")]
    UnknownRepository {
        did: String,
        #[source]
        source: ResolveError,
    },
    #[error("failed to write status record")]
    WriteFailed(#[source] RepoError),
}

#[derive(Debug, thiserror::Error)]
pub enum UserStatusesError {
    #[error("handle {0} does not resolve")]
    UnknownHandle(String),
    #[error(transparent)]
    Identity(ResolveError),
    #[error("no PDS listed for {0}")]
    MissingPds(String),
    #[error("failed to list records")]
    ListFailed(#[source] RepoError),
    #[error("{0} has no xyz.statusphere.status records")]
    NoRecords(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Result of a successful status write
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendStatusOutcome {
    pub uri: String,
    pub status: StatusView,
    /// Set when the record was written but the local cache was not updated
    pub warning: Option<String>,
}

/// Entry point for everything outside the ingestion loop that reads or
/// writes statuses.
#[derive(Clone)]
pub struct StatusService {
    db: Database,
    materializer: Materializer,
    resolver: Arc<IdResolver>,
    repo: Arc<dyn RepositoryClient>,
    validator: Arc<dyn RecordValidator>,
}

impl StatusService {
    pub fn new(
        db: Database,
        resolver: Arc<IdResolver>,
        repo: Arc<dyn RepositoryClient>,
        validator: Arc<dyn RecordValidator>,
    ) -> Self {
        let materializer = Materializer::new(&db);
        Self {
            db,
            materializer,
            resolver,
            repo,
            validator,
        }
    }

    /// Write a new status record to the owner's repository, then apply it to
    /// the cache without waiting for the stream to deliver it.
    #[instrument(skip(self))]
    pub async fn send_status(
        &self,
        owner_did: &str,
        status: &str,
    ) -> Result<SendStatusOutcome, SendStatusError> {
        let created_at = now_timestamp();
        let record = json!({
            "$type": STATUS_COLLECTION,
            "status": status,
            "createdAt": created_at,
        });
        let fields = self.validator.validate(&record, STATUS_COLLECTION)?;

        let document = self
            .resolver
            .resolve_did_to_document(owner_did)
            .await
            .map_err(|source| SendStatusError::UnknownRepository {
                did: owner_did.to_string(),
                source,
            })?;
        let pds = document
            .pds_endpoint()
            .ok_or_else(|| SendStatusError::UnknownRepository {
                did: owner_did.to_string(),
                source: ResolveError::NotFound(format!("PDS for {owner_did}")),
            })?;

        let rkey = Tid::next();
        let written = self
            .repo
            .put_record(pds, owner_did, STATUS_COLLECTION, rkey.as_str(), &record)
            .await
            .map_err(SendStatusError::WriteFailed)?;
        info!(uri = %written.uri, "Status record written");

        let cached = StatusRecord {
            uri: written.uri.clone(),
            author_did: owner_did.to_string(),
            status: fields.status.clone(),
            created_at: fields.created_at.clone(),
            indexed_at: now_timestamp(),
        };
        let change = Change::Upsert(Upsert {
            uri: cached.uri.clone(),
            author_did: cached.author_did.clone(),
            fields,
            indexed_at: cached.indexed_at.clone(),
            sequence: None,
        });
        let warning = match self.materializer.apply(&change) {
            Ok(_) => None,
            Err(e) => {
                warn!(uri = %cached.uri, error = %e, "Optimistic cache update failed");
                Some("Database not updated".to_string())
            }
        };

        let handle = self.resolver.resolve_did_to_handle(owner_did).await;
        Ok(SendStatusOutcome {
            uri: written.uri,
            status: StatusView::from_record(&cached, handle),
            warning,
        })
    }

    /// Newest cached statuses with author handles.
    pub async fn recent(&self, limit: usize) -> Result<Vec<StatusView>, StoreError> {
        let records = store::recent_statuses(&self.db, limit)?;
        Ok(store::hydrate(&records, &self.resolver).await)
    }

    /// Latest cached status of one author.
    pub async fn user_status(&self, did: &str) -> Result<Option<StatusView>, StoreError> {
        let Some(record) = store::latest_status_for(&self.db, did)? else {
            return Ok(None);
        };
        let handle = self.resolver.resolve_did_to_handle(did).await;
        Ok(Some(StatusView::from_record(&record, handle)))
    }

    /// Profile and latest cached status of one account. A profile that is
    /// missing, unreachable or invalid leaves only the DID and handle.
    #[instrument(skip(self))]
    pub async fn user_info(&self, did: &str) -> Result<UserInfo, StoreError> {
        let fields = self.fetch_profile(did).await.unwrap_or_default();
        let handle = self.resolver.resolve_did_to_handle(did).await;
        let profile = ProfileView {
            avatar: fields
                .avatar_cid
                .map(|cid| format!("{AVATAR_IMAGE_URL}/{did}/{cid}")),
            display_name: fields.display_name,
            created_at: fields.created_at,
            ..ProfileView::new(did, handle)
        };
        let status = self.user_status(did).await?;
        Ok(UserInfo {
            did: did.to_string(),
            profile,
            status,
        })
    }

    async fn fetch_profile(&self, did: &str) -> Option<ProfileFields> {
        let document = match self.resolver.resolve_did_to_document(did).await {
            Ok(document) => document,
            Err(e) => {
                debug!(did, error = %e, "No DID document for profile lookup");
                return None;
            }
        };
        let pds = document.pds_endpoint()?;
        let record = match self
            .repo
            .get_record(pds, did, PROFILE_COLLECTION, PROFILE_RKEY)
            .await
        {
            Ok(record) => record?,
            Err(e) => {
                debug!(did, error = %e, "Failed to fetch profile");
                return None;
            }
        };
        match validate_profile(&record.value) {
            Ok(fields) => Some(fields),
            Err(rejection) => {
                warn!(did, reason = %rejection, "Failed to validate user profile");
                None
            }
        }
    }

    /// Pull an author's most recent records straight from their PDS into the
    /// cache and return everything cached for them.
    #[instrument(skip(self))]
    pub async fn statuses_by_handle(
        &self,
        handle: &str,
    ) -> Result<Vec<StatusView>, UserStatusesError> {
        let did = match self.resolver.resolve_handle_to_did(handle).await {
            Ok(did) => did,
            Err(ResolveError::NotFound(_)) => {
                return Err(UserStatusesError::UnknownHandle(handle.to_string()))
            }
            Err(e) => return Err(UserStatusesError::Identity(e)),
        };
        let document = self
            .resolver
            .resolve_did_to_document(&did)
            .await
            .map_err(UserStatusesError::Identity)?;
        let pds = document
            .pds_endpoint()
            .ok_or_else(|| UserStatusesError::MissingPds(did.clone()))?;

        let listed = self
            .repo
            .list_records(pds, &did, STATUS_COLLECTION, BACKFILL_RECORD_LIMIT)
            .await
            .map_err(UserStatusesError::ListFailed)?;
        if listed.is_empty() {
            return Err(UserStatusesError::NoRecords(handle.to_string()));
        }

        for record in &listed {
            let owned_by_author = AtUri::parse(&record.uri).is_some_and(|uri| uri.did == did);
            if !owned_by_author {
                debug!(uri = %record.uri, "Skipping record outside the author's repository");
                continue;
            }
            let fields = match self.validator.validate(&record.value, STATUS_COLLECTION) {
                Ok(fields) => fields,
                Err(rejection) => {
                    debug!(uri = %record.uri, reason = %rejection, "Skipping invalid record");
                    continue;
                }
            };
            let change = Change::Upsert(Upsert {
                uri: record.uri.clone(),
                author_did: did.clone(),
                fields,
                indexed_at: now_timestamp(),
                sequence: None,
            });
            if let Err(e) = self.materializer.apply(&change) {
                warn!(uri = %record.uri, error = %e, "Failed to cache listed record");
            }
        }

        let records = store::statuses_by_author(&self.db, &did)?;
        Ok(store::hydrate(&records, &self.resolver).await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::resolver::tests::FakeIdentity;
    use crate::lexicon::StatusValidator;
    use crate::repo::{ListedRecord, PutRecordOutput};
    use crate::BoxedFuture;
    use parking_lot::Mutex;
    use serde_json::Value;
    use std::collections::HashMap;

    #[derive(Default)]
    struct FakeRepo {
        records: HashMap<String, Vec<ListedRecord>>,
        profiles: HashMap<String, Value>,
        writes: Mutex<Vec<(String, String, Value)>>,
        fail_writes: bool,
    }

    impl RepositoryClient for FakeRepo {
        fn put_record<'a>(
            &'a self,
            pds: &'a str,
            repo: &'a str,
            collection: &'a str,
            rkey: &'a str,
            record: &'a Value,
        ) -> BoxedFuture<'a, Result<PutRecordOutput, RepoError>> {
            Box::pin(async move {
                if self.fail_writes {
                    return Err(RepoError::Rejected {
                        status: 500,
                        message: "boom".to_string(),
                    });
                }
                self.writes
                    .lock()
                    .push((pds.to_string(), rkey.to_string(), record.clone()));
                Ok(PutRecordOutput {
                    uri: AtUri::new(repo, collection, rkey).to_string(),
                    cid: None,
                })
            })
        }

        fn list_records<'a>(
            &'a self,
            _pds: &'a str,
            repo: &'a str,
            _collection: &'a str,
            limit: usize,
        ) -> BoxedFuture<'a, Result<Vec<ListedRecord>, RepoError>> {
            Box::pin(async move {
                let mut records = self.records.get(repo).cloned().unwrap_or_default();
                records.truncate(limit);
                Ok(records)
            })
        }

        fn get_record<'a>(
            &'a self,
            _pds: &'a str,
            repo: &'a str,
            collection: &'a str,
            rkey: &'a str,
        ) -> BoxedFuture<'a, Result<Option<ListedRecord>, RepoError>> {
            Box::pin(async move {
                if collection != PROFILE_COLLECTION {
                    return Ok(None);
                }
                Ok(self.profiles.get(repo).map(|value| ListedRecord {
                    uri: AtUri::new(repo, collection, rkey).to_string(),
                    cid: None,
                    value: value.clone(),
                }))
            })
        }
    }

    const DID: &str = "did:plc:alice";
    const PDS: &str = "https://pds.test";

    fn service(repo: FakeRepo) -> (Database, Arc<FakeRepo>, StatusService) {
        let db = Database::in_memory().unwrap();
        let identity = FakeIdentity::default().with_account(DID, "alice.test", PDS);
        let resolver = Arc::new(IdResolver::new(Arc::new(identity)));
        let repo = Arc::new(repo);
        let service = StatusService::new(
            db.clone(),
            resolver,
            repo.clone(),
            Arc::new(StatusValidator::new()),
        );
        (db, repo, service)
    }

    fn listed(rkey: &str, status: &str) -> ListedRecord {
        ListedRecord {
            uri: format!("at://{DID}/{STATUS_COLLECTION}/{rkey}"),
            cid: None,
            value: json!({
                "$type": STATUS_COLLECTION,
                "status": status,
                "createdAt": "2024-10-01T12:00:00.000Z",
            }),
        }
    }

    #[tokio::test]
    async fn test_send_status_writes_and_caches() {
        let (db, repo, service) = service(FakeRepo::default());

        let outcome = service.send_status(DID, "🦀").await.unwrap();

        assert!(outcome.warning.is_none());
        assert_eq!(outcome.status.status, "🦀");
        assert_eq!(outcome.status.profile.handle, "alice.test");
        let writes = repo.writes.lock();
        assert_eq!(writes.len(), 1);
        assert_eq!(writes[0].0, PDS);
        assert!(Tid::parse(&writes[0].1).is_some());
        assert_eq!(writes[0].2["$type"], STATUS_COLLECTION);

        let cached = store::get_status(&db, &outcome.uri).unwrap().unwrap();
        assert_eq!(cached.status, "🦀");
    }

    #[tokio::test]
    async fn test_send_status_rejects_invalid_before_writing() {
        let (db, repo, service) = service(FakeRepo::default());

        let err = service.send_status(DID, "not one emoji").await.unwrap_err();

        assert!(matches!(err, SendStatusError::InvalidStatus(_)));
        assert!(repo.writes.lock().is_empty());
        assert_eq!(store::count_statuses(&db).unwrap(), 0);
    }

    #[tokio::test]
    async fn test_send_status_write_failure_leaves_cache_alone() {
        let (db, _repo, service) = service(FakeRepo {
            fail_writes: true,
            ..FakeRepo::default()
        });

        let err = service.send_status(DID, "🦀").await.unwrap_err();

        assert!(matches!(err, SendStatusError::WriteFailed(_)));
        assert_eq!(store::count_statuses(&db).unwrap(), 0);
    }

    #[tokio::test]
    async fn test_send_status_cache_failure_is_a_warning() {
        let (db, repo, service) = service(FakeRepo::default());
        db.connection().lock().execute("DROP TABLE status", []).unwrap();

        let outcome = service.send_status(DID, "🦀").await.unwrap();

        assert_eq!(outcome.warning.as_deref(), Some("Database not updated"));
        assert_eq!(repo.writes.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_statuses_by_handle_backfills_valid_records() {
        let mut repo = FakeRepo::default();
        repo.records.insert(
            DID.to_string(),
            vec![listed("3kaaa", "👍"), listed("3kbbb", "too long to be a status")],
        );
        let (db, _repo, service) = service(repo);

        let views = service.statuses_by_handle("@Alice.test").await.unwrap();

        assert_eq!(views.len(), 1);
        assert_eq!(views[0].status, "👍");
        assert_eq!(views[0].profile.handle, "alice.test");
        assert_eq!(store::count_statuses(&db).unwrap(), 1);
    }

    #[tokio::test]
    async fn test_statuses_by_handle_errors() {
        let (_db, _repo, service) = service(FakeRepo::default());

        assert!(matches!(
            service.statuses_by_handle("nobody.test").await,
            Err(UserStatusesError::UnknownHandle(_))
        ));
        assert!(matches!(
            service.statuses_by_handle("alice.test").await,
            Err(UserStatusesError::NoRecords(_))
        ));
    }

    #[tokio::test]
    async fn test_recent_and_user_status_read_the_cache() {
        let (_db, _repo, service) = service(FakeRepo::default());
        service.send_status(DID, "👍").await.unwrap();
        // indexed_at has millisecond resolution
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        service.send_status(DID, "🦀").await.unwrap();

        let recent = service.recent(10).await.unwrap();
        assert_eq!(recent.len(), 2);
        let latest = service.user_status(DID).await.unwrap().unwrap();
        assert_eq!(latest.status, "🦀");
        assert!(service.user_status("did:plc:nobody").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_user_info_combines_profile_and_latest_status() {
        let mut repo = FakeRepo::default();
        repo.profiles.insert(
            DID.to_string(),
            json!({
                "$type": PROFILE_COLLECTION,
                "displayName": "Alice",
                "avatar": {
                    "$type": "blob",
                    "ref": {"$link": "bafkreiavatar"},
                    "mimeType": "image/png",
                    "size": 42
                },
                "createdAt": "2024-01-01T00:00:00.000Z"
            }),
        );
        let (_db, _repo, service) = service(repo);
        service.send_status(DID, "🦀").await.unwrap();

        let info = service.user_info(DID).await.unwrap();

        assert_eq!(info.did, DID);
        assert_eq!(info.profile.handle, "alice.test");
        assert_eq!(info.profile.display_name.as_deref(), Some("Alice"));
        assert_eq!(
            info.profile.avatar.as_deref(),
            Some("https://atproto.pictures/img/did:plc:alice/bafkreiavatar")
        );
        assert_eq!(info.profile.created_at.as_deref(), Some("2024-01-01T00:00:00.000Z"));
        assert_eq!(info.status.unwrap().status, "🦀");
    }

    #[tokio::test]
    async fn test_user_info_without_usable_profile() {
        let mut repo = FakeRepo::default();
        repo.profiles.insert(
            DID.to_string(),
            json!({"$type": PROFILE_COLLECTION, "displayName": 12}),
        );
        let (_db, _repo, service) = service(repo);

        let info = service.user_info(DID).await.unwrap();
        assert_eq!(info.profile, ProfileView::new(DID, "alice.test"));
        assert!(info.status.is_none());

        let unknown = service.user_info("did:plc:nobody").await.unwrap();
        assert_eq!(unknown.profile, ProfileView::new("did:plc:nobody", "invalid.handle"));
    }
}
