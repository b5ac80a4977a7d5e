pub mod document;
pub mod resolver;
pub mod service;

pub use document::{DidDocument, DidService};
pub use resolver::IdResolver;
pub use service::{HttpIdentityService, IdentityService, ResolveError};
