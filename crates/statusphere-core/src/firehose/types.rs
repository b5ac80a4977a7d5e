use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::models::AtUri;

/// Frame as sent by Jetstream
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JetstreamFrame {
    pub did: String,
    /// Stream position; also the resume cursor
    pub time_us: i64,
    #[serde(flatten)]
    pub body: FrameBody,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum FrameBody {
    Commit {
        commit: CommitPayload,
    },
    Identity {
        #[serde(default)]
        identity: Value,
    },
    Account {
        #[serde(default)]
        account: Value,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    Create,
    Update,
    Delete,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommitPayload {
    pub operation: Operation,
    pub collection: String,
    pub rkey: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub record: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rev: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cid: Option<String>,
}

/// Decoded stream event
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    Commit(CommitEvent),
    Identity { did: String, sequence: i64 },
    Account { did: String, sequence: i64 },
}

#[derive(Debug, Clone, PartialEq)]
pub struct CommitEvent {
    pub did: String,
    pub sequence: i64,
    pub operation: Operation,
    pub collection: String,
    pub rkey: String,
    pub record: Option<Value>,
}

impl CommitEvent {
    pub fn uri(&self) -> AtUri {
        AtUri::new(&self.did, &self.collection, &self.rkey)
    }
}

impl StreamEvent {
    pub fn sequence(&self) -> i64 {
        match self {
            StreamEvent::Commit(commit) => commit.sequence,
            StreamEvent::Identity { sequence, .. } | StreamEvent::Account { sequence, .. } => {
                *sequence
            }
        }
    }
}

impl From<JetstreamFrame> for StreamEvent {
    fn from(frame: JetstreamFrame) -> Self {
        match frame.body {
            FrameBody::Commit { commit } => StreamEvent::Commit(CommitEvent {
                did: frame.did,
                sequence: frame.time_us,
                operation: commit.operation,
                collection: commit.collection,
                rkey: commit.rkey,
                record: commit.record,
            }),
            FrameBody::Identity { .. } => StreamEvent::Identity {
                did: frame.did,
                sequence: frame.time_us,
            },
            FrameBody::Account { .. } => StreamEvent::Account {
                did: frame.did,
                sequence: frame.time_us,
            },
        }
    }
}

pub fn decode_frame(text: &str) -> Result<StreamEvent, serde_json::Error> {
    let frame: JetstreamFrame = serde_json::from_str(text)?;
    Ok(frame.into())
}
