//! Channel membership history: an interval ledger of who was in which
//! channel and when, the export queries built on it, and the retention and
//! orphan cleanup that keep it bounded.

pub mod config;
pub mod db;
pub mod directory;
pub mod error;
pub mod history;
pub mod maintenance;

pub use error::{Error, Result};
