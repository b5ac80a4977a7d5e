//! Event stream ingestion: wire types, the transport, and the consumer loop.

pub mod consumer;
pub mod source;
pub mod types;

pub use consumer::{
    ConsumerConfig, ConsumerError, ConsumerParts, ConsumerStatus, ErrorReporter, StreamConsumer,
};
pub use source::{EventSource, FrameStream, JetstreamSource, TransportError};
pub use types::{decode_frame, CommitEvent, Operation, StreamEvent};
