//! PostgreSQL persistence for jobscout: entities, caches, the sent-
//! notification ledger, and the run tracker with its live event stream.

pub mod models;
pub mod store;
pub mod tracker;

pub use models::{
    ActivityCounts, BroadcastRow, CachedMatch, Pagination, RunRow, SkillStat, SubscriptionSummary,
    UserSummary,
};
pub use store::Store;
pub use tracker::{CounterField, RunEvent, RunTracker};
