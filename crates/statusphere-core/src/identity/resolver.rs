use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use futures::future::{join_all, BoxFuture, Shared};
use futures::FutureExt;
use parking_lot::Mutex;
use tracing::debug;

use super::document::DidDocument;
use super::service::{IdentityService, ResolveError};
use crate::constants::INVALID_HANDLE;

type SharedLookup<T> = Shared<BoxFuture<'static, Result<T, ResolveError>>>;

/// In-flight lookups keyed by identifier; concurrent callers await the same
/// future instead of issuing their own request.
struct PendingLookups<T: Clone> {
    inflight: Mutex<HashMap<String, SharedLookup<T>>>,
}

impl<T> PendingLookups<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn new() -> Self {
        Self {
            inflight: Mutex::new(HashMap::new()),
        }
    }

    /// Value from `cached`, or the result of the shared lookup for `key`.
    /// `cached` is checked and `store` is called under the in-flight lock, so
    /// a caller either sees the cached value or joins the pending lookup.
    async fn run(
        &self,
        key: &str,
        cached: impl FnOnce() -> Option<T>,
        start: impl FnOnce() -> BoxFuture<'static, Result<T, ResolveError>>,
        store: impl FnOnce(&T),
    ) -> Result<T, ResolveError> {
        let lookup = {
            let mut inflight = self.inflight.lock();
            if let Some(value) = cached() {
                return Ok(value);
            }
            inflight
                .entry(key.to_string())
                .or_insert_with(|| start().shared())
                .clone()
        };

        let result = lookup.clone().await;

        let mut inflight = self.inflight.lock();
        if let Ok(value) = &result {
            store(value);
        }
        if inflight.get(key).is_some_and(|current| current.ptr_eq(&lookup)) {
            inflight.remove(key);
        }
        result
    }
}

/// Cached, bidirectional handle ⇄ DID resolution.
///
/// Successful lookups are cached without expiry; failures are not cached.
pub struct IdResolver {
    service: Arc<dyn IdentityService>,
    handle_to_did: Mutex<HashMap<String, String>>,
    did_to_document: Mutex<HashMap<String, DidDocument>>,
    pending_handles: PendingLookups<Option<String>>,
    pending_documents: PendingLookups<DidDocument>,
}

impl IdResolver {
    pub fn new(service: Arc<dyn IdentityService>) -> Self {
        Self {
            service,
            handle_to_did: Mutex::new(HashMap::new()),
            did_to_document: Mutex::new(HashMap::new()),
            pending_handles: PendingLookups::new(),
            pending_documents: PendingLookups::new(),
        }
    }

    pub async fn resolve_handle_to_did(&self, handle: &str) -> Result<String, ResolveError> {
        let handle = normalize_handle(handle);
        if let Some(did) = self.handle_to_did.lock().get(&handle) {
            return Ok(did.clone());
        }

        let service = self.service.clone();
        let key = handle.clone();
        let resolved = self
            .pending_handles
            .run(
                &handle,
                || self.handle_to_did.lock().get(&handle).cloned().map(Some),
                move || async move { service.resolve_handle(&key).await }.boxed(),
                |resolved| {
                    if let Some(did) = resolved {
                        self.handle_to_did.lock().insert(handle.clone(), did.clone());
                    }
                },
            )
            .await?;

        resolved.ok_or(ResolveError::NotFound(handle))
    }

    pub async fn resolve_did_to_document(&self, did: &str) -> Result<DidDocument, ResolveError> {
        if let Some(document) = self.did_to_document.lock().get(did) {
            return Ok(document.clone());
        }

        let service = self.service.clone();
        let key = did.to_string();
        self.pending_documents
            .run(
                did,
                || self.did_to_document.lock().get(did).cloned(),
                move || async move { service.resolve_did(&key).await }.boxed(),
                |document| {
                    self.did_to_document
                        .lock()
                        .insert(did.to_string(), document.clone());
                },
            )
            .await
    }

    /// Verified handle for `did`, or the placeholder handle when the document
    /// cannot be fetched or its handle does not point back at `did`.
    pub async fn resolve_did_to_handle(&self, did: &str) -> String {
        match self.verified_handle(did).await {
            Ok(handle) => handle,
            Err(e) => {
                debug!(did, error = %e, "Falling back to placeholder handle");
                INVALID_HANDLE.to_string()
            }
        }
    }

    pub async fn resolve_dids_to_handles(&self, dids: &[String]) -> HashMap<String, String> {
        let unique: HashSet<&String> = dids.iter().collect();
        let lookups = unique.into_iter().map(|did| async move {
            let handle = self.resolve_did_to_handle(did).await;
            (did.clone(), handle)
        });
        join_all(lookups).await.into_iter().collect()
    }

    async fn verified_handle(&self, did: &str) -> Result<String, ResolveError> {
        let document = self.resolve_did_to_document(did).await?;
        let handle = document
            .handle()
            .map(normalize_handle)
            .ok_or_else(|| ResolveError::NotFound(format!("handle for {did}")))?;

        let resolved = self.resolve_handle_to_did(&handle).await?;
        if resolved != did {
            return Err(ResolveError::InvalidDocument {
                did: did.to_string(),
                message: format!("{handle} resolves to {resolved}"),
            });
        }
        Ok(handle)
    }
}

fn normalize_handle(handle: &str) -> String {
    handle.trim().trim_start_matches('@').to_ascii_lowercase()
}
