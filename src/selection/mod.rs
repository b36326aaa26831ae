//! Selection Layer
//!
//! - **selector**: `UserSelector`, eligible users with their settings snapshot
//! - **fetcher**: `SeriesFetcher`, raw samples of the selected users

pub mod fetcher;
pub mod selector;

pub use fetcher::SeriesFetcher;
pub use selector::{AttributeSetting, Selection, SelectionRequest, UserSelector};
