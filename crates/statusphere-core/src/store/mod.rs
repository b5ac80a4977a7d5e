pub mod cursor;
pub mod db;
pub mod materializer;
pub mod views;

pub use cursor::CursorStore;
pub use db::{Database, StoreError};
pub use materializer::{ApplyOutcome, Materializer};
pub use views::{
    count_statuses, get_status, hydrate, latest_status_for, recent_statuses, statuses_by_author,
};
