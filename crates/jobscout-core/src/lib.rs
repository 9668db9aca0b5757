//! Core domain types for the jobscout matching service.
//!
//! Everything here is plain data and pure functions: the persisted enums,
//! the entity structs shared across crates, content/resume hashing, and
//! posting normalization + subscription filters. No I/O.

pub mod error;
pub mod hash;
pub mod normalize;
pub mod types;

pub use error::{Error, Result};
pub use types::{
    DatePosted, ExpandedQueries, Job, JobSource, JobType, LocationKind, MatchVerdict,
    NormalizedLocation, RawPosting, RunStatus, Stage, Subscription, TriggerType, User,
};
