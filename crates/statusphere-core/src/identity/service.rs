use std::time::Duration;

use anyhow::Result;
use serde::Deserialize;
use tracing::debug;

use super::document::DidDocument;
use crate::BoxedFuture;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ResolveError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("unsupported DID method: {0}")]
    UnsupportedDid(String),
    #[error("invalid DID document for {did}: {message}")]
    InvalidDocument { did: String, message: String },
    #[error("lookup timed out: {0}")]
    Timeout(String),
    #[error("http error: {0}")]
    Http(String),
}

impl From<reqwest::Error> for ResolveError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            ResolveError::Timeout(e.to_string())
        } else {
            ResolveError::Http(e.to_string())
        }
    }
}

/// External identity lookups (handle resolution and DID documents).
pub trait IdentityService: Send + Sync {
    /// `Ok(None)` when the handle is not registered.
    fn resolve_handle<'a>(
        &'a self,
        handle: &'a str,
    ) -> BoxedFuture<'a, Result<Option<String>, ResolveError>>;

    fn resolve_did<'a>(&'a self, did: &'a str) -> BoxedFuture<'a, Result<DidDocument, ResolveError>>;
}

/// Identity lookups over HTTP: XRPC `resolveHandle` for handles, the PLC
/// directory for `did:plc`, and `/.well-known/did.json` for `did:web`.
#[derive(Debug, Clone)]
pub struct HttpIdentityService {
    http: reqwest::Client,
    handle_resolver_url: String,
    plc_directory_url: String,
}

#[derive(Deserialize)]
struct ResolveHandleOutput {
    did: String,
}

impl HttpIdentityService {
    pub fn new(handle_resolver_url: &str, plc_directory_url: &str, timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            http,
            handle_resolver_url: handle_resolver_url.trim_end_matches('/').to_string(),
            plc_directory_url: plc_directory_url.trim_end_matches('/').to_string(),
        })
    }

    fn document_url(&self, did: &str) -> Result<String, ResolveError> {
        if did.starts_with("did:plc:") {
            Ok(format!("{}/{}", self.plc_directory_url, did))
        } else if let Some(host) = did.strip_prefix("did:web:") {
            Ok(format!("https://{}/.well-known/did.json", host.replace("%3A", ":")))
        } else {
            Err(ResolveError::UnsupportedDid(did.to_string()))
        }
    }

    async fn fetch_handle(&self, handle: &str) -> Result<Option<String>, ResolveError> {
        let url = format!(
            "{}/xrpc/com.atproto.identity.resolveHandle",
            self.handle_resolver_url
        );
        let response = self.http.get(&url).query(&[("handle", handle)]).send().await?;

        // resolveHandle answers 400 for handles it does not know
        if response.status() == reqwest::StatusCode::BAD_REQUEST
            || response.status() == reqwest::StatusCode::NOT_FOUND
        {
            debug!(handle, "Handle not found");
            return Ok(None);
        }
        let output: ResolveHandleOutput = response.error_for_status()?.json().await?;
        Ok(Some(output.did))
    }

    async fn fetch_document(&self, did: &str) -> Result<DidDocument, ResolveError> {
        let url = self.document_url(did)?;
        let response = self.http.get(&url).send().await?;
        if response.status() == reqwest::StatusCode::NOT_FOUND
            || response.status() == reqwest::StatusCode::GONE
        {
            return Err(ResolveError::NotFound(did.to_string()));
        }
        let document: DidDocument =
            response
                .error_for_status()?
                .json()
                .await
                .map_err(|e| ResolveError::InvalidDocument {
                    did: did.to_string(),
                    message: e.to_string(),
                })?;
        if document.id != did {
            return Err(ResolveError::InvalidDocument {
                did: did.to_string(),
                message: format!("document is for {}", document.id),
            });
        }
        Ok(document)
    }
}

impl IdentityService for HttpIdentityService {
    fn resolve_handle<'a>(
        &'a self,
        handle: &'a str,
    ) -> BoxedFuture<'a, Result<Option<String>, ResolveError>> {
        Box::pin(self.fetch_handle(handle))
    }

    fn resolve_did<'a>(&'a self, did: &'a str) -> BoxedFuture<'a, Result<DidDocument, ResolveError>> {
        Box::pin(self.fetch_document(did))
    }
}
