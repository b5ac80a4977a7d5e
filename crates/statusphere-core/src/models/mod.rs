pub mod at_uri;
pub mod status;

pub use at_uri::AtUri;
pub use status::{
    format_timestamp, now_timestamp, Change, ProfileFields, ProfileView, StatusFields,
    StatusRecord, StatusView, Upsert, UserInfo,
};
