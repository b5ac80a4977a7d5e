//! Application-wide constants
//!
//! Centralized location for collection names, service endpoints and the
//! tuning values shared by the ingestion engine and the read paths.

use std::time::Duration;

/// Record collection materialized by this service
pub const STATUS_COLLECTION: &str = "xyz.statusphere.status";

/// Profile collection read for the signed-in account
pub const PROFILE_COLLECTION: &str = "app.bsky.actor.profile";

/// Record key of an account's single profile record
pub const PROFILE_RKEY: &str = "self";

/// Image service that serves avatar blobs as `{base}/{did}/{cid}`
pub const AVATAR_IMAGE_URL: &str = "https://atproto.pictures/img";

/// Default Jetstream subscription endpoint
pub const JETSTREAM_URL: &str = "wss://jetstream2.us-east.bsky.network/subscribe";

/// Default service used to resolve handles to DIDs
pub const HANDLE_RESOLVER_URL: &str = "https://bsky.social";

/// Default PLC directory for `did:plc` documents
pub const PLC_DIRECTORY_URL: &str = "https://plc.directory";

/// Name of the checkpoint row for the Jetstream ingester
pub const DEFAULT_CURSOR_STREAM: &str = "jetstream";

/// Minimum spacing between durable cursor writes for one stream
pub const CURSOR_WRITE_INTERVAL: Duration = Duration::from_secs(30);

/// Display value used when a DID cannot be turned into a verified handle
pub const INVALID_HANDLE: &str = "invalid.handle";

/// Default page size for the recent statuses listing
pub const DEFAULT_STATUS_LIMIT: usize = 30;

/// Records fetched from a PDS when backfilling a single author
pub const BACKFILL_RECORD_LIMIT: usize = 10;

/// Upper bound on any single identity lookup
pub const RESOLVER_TIMEOUT: Duration = Duration::from_secs(3);

/// Attempts made to apply one change before the consumer gives up
pub const APPLY_MAX_ATTEMPTS: u32 = 3;

/// Base delay between apply attempts (multiplied by the attempt number)
pub const APPLY_RETRY_DELAY: Duration = Duration::from_millis(100);

// Status lexicon constraints
pub const STATUS_MAX_LENGTH: usize = 32;
pub const STATUS_MAX_GRAPHEMES: usize = 1;

// Profile lexicon constraints
pub const DISPLAY_NAME_MAX_LENGTH: usize = 640;
pub const DISPLAY_NAME_MAX_GRAPHEMES: usize = 64;
