use futures::stream::BoxStream;
use futures::StreamExt;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info};

use crate::BoxedFuture;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("failed to connect to {url}: {message}")]
    Connect { url: String, message: String },
    #[error("socket error: {0}")]
    Socket(String),
    #[error("connection closed (code {code}): {reason}")]
    Closed { code: u16, reason: String },
}

/// Raw text frames; the stream ends when the connection does.
pub type FrameStream = BoxStream<'static, Result<String, TransportError>>;

/// Connection to a sequenced event stream.
pub trait EventSource: Send + Sync {
    /// Open a subscription starting at `cursor` (or at the source's default
    /// position when absent), limited to `collections`.
    fn connect<'a>(
        &'a self,
        cursor: Option<i64>,
        collections: &'a [String],
    ) -> BoxedFuture<'a, Result<FrameStream, TransportError>>;
}

/// Jetstream websocket subscription
#[derive(Debug, Clone)]
pub struct JetstreamSource {
    endpoint: String,
}

impl JetstreamSource {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
        }
    }

    pub fn subscribe_url(
        &self,
        cursor: Option<i64>,
        collections: &[String],
    ) -> Result<reqwest::Url, TransportError> {
        let mut url = reqwest::Url::parse(&self.endpoint).map_err(|e| TransportError::Connect {
            url: self.endpoint.clone(),
            message: e.to_string(),
        })?;
        {
            let mut query = url.query_pairs_mut();
            for collection in collections {
                query.append_pair("wantedCollections", collection);
            }
            if let Some(cursor) = cursor {
                query.append_pair("cursor", &cursor.to_string());
            }
        }
        Ok(url)
    }

    async fn open(
        &self,
        cursor: Option<i64>,
        collections: &[String],
    ) -> Result<FrameStream, TransportError> {
        let url = self.subscribe_url(cursor, collections)?;
        let (socket, _response) = tokio_tungstenite::connect_async(url.as_str())
            .await
            .map_err(|e| TransportError::Connect {
                url: url.to_string(),
                message: e.to_string(),
            })?;
        info!(url = %url, "Jetstream connection opened");

        let frames = socket.filter_map(|message| async move {
            match message {
                Ok(Message::Text(text)) => Some(Ok(text)),
                Ok(Message::Binary(bytes)) => match String::from_utf8(bytes) {
                    Ok(text) => Some(Ok(text)),
                    Err(_) => {
                        debug!("Dropping non-UTF-8 binary frame");
                        None
                    }
                },
                Ok(Message::Close(frame)) => {
                    let (code, reason) = frame
                        .map(|f| (u16::from(f.code), f.reason.to_string()))
                        .unwrap_or((1005, String::new()));
                    Some(Err(TransportError::Closed { code, reason }))
                }
                Ok(_) => None,
                Err(e) => Some(Err(TransportError::Socket(e.to_string()))),
            }
        });
        Ok(frames.boxed())
    }
}

impl EventSource for JetstreamSource {
    fn connect<'a>(
        &'a self,
        cursor: Option<i64>,
        collections: &'a [String],
    ) -> BoxedFuture<'a, Result<FrameStream, TransportError>> {
        Box::pin(self.open(cursor, collections))
    }
}
