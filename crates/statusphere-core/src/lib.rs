pub mod config;
pub mod constants;
pub mod firehose;
pub mod identity;
pub mod lexicon;
pub mod models;
pub mod repo;
pub mod runtime;
pub mod service;
pub mod stats;
pub mod store;
pub mod tid;
pub mod tracing_setup;

use std::future::Future;
use std::pin::Pin;

/// Boxed future returned by the object-safe capability traits.
pub type BoxedFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

pub use config::CoreConfig;
pub use runtime::{BackoffConfig, Supervisor, SupervisorState};
pub use service::{SendStatusOutcome, StatusService};
pub use store::{CursorStore, Database, Materializer};
