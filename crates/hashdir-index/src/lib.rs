//! Hashed-directory object index.
//!
//! Maps an [`ObjectIdentity`](hashdir_types::ObjectIdentity) onto exactly
//! one file inside a directory tree, and keeps that true while objects are
//! created, removed and redistributed between indexes.
//!
//! # Components
//!
//! - [`NameCodec`] -- reversible identity/filename mapping, with a hashed
//!   fallback for names that do not fit
//! - [`Index`] -- create / lookup / unlink / list, plus the directory and
//!   relocation primitives rebalancing uses
//! - [`HashLayout`] -- where an identity lives; [`FlatLayout`] and
//!   [`NibbleLayout`] are provided
//! - [`RebalanceEngine`] -- split and merge between two indexes
//! - [`RetryHarness`] + [`FailureInjector`] -- replay of interrupted
//!   operations under synthetic failures
//!
//! # Rules
//!
//! 1. Identity equality, not filename equality, decides what a file holds.
//! 2. A hashed file is only trusted if its attribute regenerates its name.
//! 3. Objects reach the destination durably before leaving the source.
//! 4. Every mutating step is safe to replay from the beginning.
//! 5. Injected failures never escape the retry harness.

pub mod codec;
pub mod config;
pub mod error;
pub mod index;
pub mod inject;
pub mod layout;
pub mod moves;
pub mod rebalance;
pub mod retry;

pub use codec::{Decoded, MangledName, NameCodec, NameForm};
pub use config::{FailureInjectionConfig, IndexConfig};
pub use error::{IndexError, IndexResult};
pub use index::{
    CreateOutcome, Index, Located, ObjectCursor, ObjectPage, RangeEntry, RangePage, UnlinkOutcome,
};
pub use inject::FailureInjector;
pub use layout::{FlatLayout, HashLayout, NibbleLayout, SubtreeVerdict};
pub use rebalance::{PendingRebalance, RebalanceEngine, RebalanceOp, RebalanceStats};
pub use retry::{Attempt, RetryHarness};
