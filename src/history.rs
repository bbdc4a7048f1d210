//! Channel membership history: the interval ledger, the queries answered
//! from it, and the retention and orphan cleanup that shrink it.

mod orphans;
mod query;
mod retention;
pub mod store;

pub use query::PresenceSource;
pub use retention::{DAY_IN_MILLISECONDS, RetentionBatchConfig, RetentionCursor};
pub use store::{HistoryRecord, HistoryStore, MemberInterval};
