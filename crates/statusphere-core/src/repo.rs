//! Access to records stored in a user's repository on their PDS.

use std::time::Duration;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::debug;

use crate::BoxedFuture;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RepoError {
    #[error("http error: {0}")]
    Http(String),
    #[error("repository answered {status}: {message}")]
    Rejected { status: u16, message: String },
    #[error("not authorized to write to {0}")]
    Unauthorized(String),
    #[error("invalid response: {0}")]
    Decode(String),
}

impl From<reqwest::Error> for RepoError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_decode() {
            RepoError::Decode(e.to_string())
        } else {
            RepoError::Http(e.to_string())
        }
    }
}

/// Record as returned by `listRecords` and `getRecord`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ListedRecord {
    pub uri: String,
    #[serde(default)]
    pub cid: Option<String>,
    pub value: Value,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct PutRecordOutput {
    pub uri: String,
    #[serde(default)]
    pub cid: Option<String>,
}

/// Record reads and writes against a PDS.
pub trait RepositoryClient: Send + Sync {
    fn put_record<'a>(
        &'a self,
        pds: &'a str,
        repo: &'a str,
        collection: &'a str,
        rkey: &'a str,
        record: &'a Value,
    ) -> BoxedFuture<'a, Result<PutRecordOutput, RepoError>>;

    fn list_records<'a>(
        &'a self,
        pds: &'a str,
        repo: &'a str,
        collection: &'a str,
        limit: usize,
    ) -> BoxedFuture<'a, Result<Vec<ListedRecord>, RepoError>>;

    /// One record by key; `None` when the repository has no such record.
    fn get_record<'a>(
        &'a self,
        pds: &'a str,
        repo: &'a str,
        collection: &'a str,
        rkey: &'a str,
    ) -> BoxedFuture<'a, Result<Option<ListedRecord>, RepoError>>;
}

#[derive(Deserialize)]
struct ListRecordsOutput {
    records: Vec<ListedRecord>,
}

#[derive(Debug, Deserialize)]
struct XrpcErrorBody {
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

/// `com.atproto.repo.*` over XRPC. Reads are public; writes need an access
/// token for the repository owner.
#[derive(Debug, Clone)]
pub struct XrpcRepoClient {
    http: reqwest::Client,
    access_token: Option<String>,
}

impl XrpcRepoClient {
    pub fn new(timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            http,
            access_token: None,
        })
    }

    pub fn with_access_token(mut self, token: impl Into<String>) -> Self {
        self.access_token = Some(token.into());
        self
    }

    fn endpoint(pds: &str, method: &str) -> String {
        format!("{}/xrpc/{}", pds.trim_end_matches('/'), method)
    }

    async fn rejected(response: reqwest::Response) -> RepoError {
        let status = response.status().as_u16();
        let body = response.json::<XrpcErrorBody>().await.ok();
        Self::rejection(status, body)
    }

    fn rejection(status: u16, body: Option<XrpcErrorBody>) -> RepoError {
        let message = body
            .and_then(|body| body.message.or(body.error))
            .unwrap_or_else(|| "no details".to_string());
        RepoError::Rejected { status, message }
    }

    /// PDSes answer a missing record with 400 `RecordNotFound`, some with 404.
    fn is_not_found(status: reqwest::StatusCode, body: Option<&XrpcErrorBody>) -> bool {
        status == reqwest::StatusCode::NOT_FOUND
            || body.and_then(|b| b.error.as_deref()) == Some("RecordNotFound")
    }

    async fn send_put(
        &self,
        pds: &str,
        repo: &str,
        collection: &str,
        rkey: &str,
        record: &Value,
    ) -> Result<PutRecordOutput, RepoError> {
        let token = self
            .access_token
            .as_deref()
            .ok_or_else(|| RepoError::Unauthorized(repo.to_string()))?;
        let body = json!({
            "repo": repo,
            "collection": collection,
            "rkey": rkey,
            "record": record,
            "validate": false,
        });

        let response = self
            .http
            .post(Self::endpoint(pds, "com.atproto.repo.putRecord"))
            .bearer_auth(token)
            .json(&body)
            .send()
            .await?;
        if response.status() == reqwest::StatusCode::UNAUTHORIZED {
            return Err(RepoError::Unauthorized(repo.to_string()));
        }
        if !response.status().is_success() {
            return Err(Self::rejected(response).await);
        }
        let output: PutRecordOutput = response.json().await?;
        debug!(uri = %output.uri, "Record written");
        Ok(output)
    }

    async fn fetch_list(
        &self,
        pds: &str,
        repo: &str,
        collection: &str,
        limit: usize,
    ) -> Result<Vec<ListedRecord>, RepoError> {
        let limit = limit.to_string();
        let response = self
            .http
            .get(Self::endpoint(pds, "com.atproto.repo.listRecords"))
            .query(&[("repo", repo), ("collection", collection), ("limit", &limit)])
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(Self::rejected(response).await);
        }
        let output: ListRecordsOutput = response.json().await?;
        Ok(output.records)
    }

    async fn fetch_record(
        &self,
        pds: &str,
        repo: &str,
        collection: &str,
        rkey: &str,
    ) -> Result<Option<ListedRecord>, RepoError> {
        let response = self
            .http
            .get(Self::endpoint(pds, "com.atproto.repo.getRecord"))
            .query(&[("repo", repo), ("collection", collection), ("rkey", rkey)])
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.json::<XrpcErrorBody>().await.ok();
            if Self::is_not_found(status, body.as_ref()) {
                debug!(repo, collection, rkey, "Record not found");
                return Ok(None);
            }
            return Err(Self::rejection(status.as_u16(), body));
        }
        Ok(Some(response.json().await?))
    }
}

impl RepositoryClient for XrpcRepoClient {
    fn put_record<'a>(
        &'a self,
        pds: &'a str,
        repo: &'a str,
        collection: &'a str,
        rkey: &'a str,
        record: &'a Value,
    ) -> BoxedFuture<'a, Result<PutRecordOutput, RepoError>> {
        Box::pin(self.send_put(pds, repo, collection, rkey, record))
    }

    fn list_records<'a>(
        &'a self,
        pds: &'a str,
        repo: &'a str,
        collection: &'a str,
        limit: usize,
    ) -> BoxedFuture<'a, Result<Vec<ListedRecord>, RepoError>> {
        Box::pin(self.fetch_list(pds, repo, collection, limit))
    }

    fn get_record<'a>(
        &'a self,
        pds: &'a str,
        repo: &'a str,
        collection: &'a str,
        rkey: &'a str,
    ) -> BoxedFuture<'a, Result<Option<ListedRecord>, RepoError>> {
        Box::pin(self.fetch_record(pds, repo, collection, rkey))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_joins_without_double_slash() {
        assert_eq!(
            XrpcRepoClient::endpoint("https://pds.example.com/", "com.atproto.repo.listRecords"),
            "https://pds.example.com/xrpc/com.atproto.repo.listRecords"
        );
    }

    #[tokio::test]
    async fn test_put_without_token_is_unauthorized() {
        let client = XrpcRepoClient::new(Duration::from_secs(1)).unwrap();
        let err = client
            .put_record(
                "https://pds.invalid",
                "did:plc:alice",
                "xyz.statusphere.status",
                "3kabc",
                &json!({}),
            )
            .await
            .unwrap_err();
        assert_eq!(err, RepoError::Unauthorized("did:plc:alice".to_string()));
    }

    #[test]
    fn test_list_output_decodes() {
        let body = r#"{"records":[{"uri":"at://did:plc:alice/xyz.statusphere.status/3kabc",
            "cid":"bafyrei","value":{"status":"👍","createdAt":"2024-10-01T12:00:00.000Z"}}],
            "cursor":"3kabc"}"#;
        let output: ListRecordsOutput = serde_json::from_str(body).unwrap();
        assert_eq!(output.records.len(), 1);
        assert_eq!(output.records[0].value["status"], "👍");
    }

    #[test]
    fn test_missing_record_detection() {
        let body: XrpcErrorBody =
            serde_json::from_str(r#"{"error":"RecordNotFound","message":"Could not locate record"}"#)
                .unwrap();
        assert!(XrpcRepoClient::is_not_found(reqwest::StatusCode::BAD_REQUEST, Some(&body)));
        assert!(XrpcRepoClient::is_not_found(reqwest::StatusCode::NOT_FOUND, None));
        assert!(!XrpcRepoClient::is_not_found(reqwest::StatusCode::BAD_REQUEST, None));

        let other: XrpcErrorBody = serde_json::from_str(r#"{"error":"InvalidRequest"}"#).unwrap();
        assert_eq!(
            XrpcRepoClient::rejection(400, Some(other)),
            RepoError::Rejected {
                status: 400,
                message: "InvalidRequest".to_string()
            }
        );
    }
}
