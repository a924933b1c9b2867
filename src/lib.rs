#![deny(missing_docs)]
//! # streamrec
//!
//! `streamrec` implements incremental recommender algorithms for implicit,
//! positive-only feedback, together with the machinery needed to evaluate
//! them on chronologically ordered interaction logs subject to concept drift.
//!
//! Every model learns one interaction at a time: there is no batch retraining
//! in the evaluation loop. The evaluation protocols either score the model
//! before each training step (prequential, test-then-train) or cut the log
//! into temporal buckets with paired holdouts and score snapshots of the
//! model against every holdout, producing a checkpoint × holdout recall
//! matrix used for forward and backward transfer analysis.
//!
//! ## Example
//!
//! ```rust
//! # extern crate rand;
//! # extern crate rand_xorshift;
//! # extern crate streamrec;
//! use rand::SeedableRng;
//! use rand_xorshift::XorShiftRng;
//!
//! use streamrec::data::InteractionStore;
//! use streamrec::models::{isgd, RecommendParams};
//! use streamrec::IncrementalModel;
//!
//! let store = InteractionStore::new(vec!["alice", "alice", "bob"], vec!["x", "y", "x"]).unwrap();
//!
//! let mut model = isgd::Hyperparameters::new()
//!     .num_factors(8)
//!     .learning_rate(0.05)
//!     .seed(42)
//!     .build(store);
//!
//! // Users and items the model has never seen are fine.
//! model.incr_train("carol", "z");
//! model.incr_train("bob", "y");
//!
//! let mut rng = XorShiftRng::seed_from_u64(42);
//! let recommendations = model.recommend(&"alice", &RecommendParams::top(5), &mut rng);
//!
//! // Alice already knows `x` and `y`, so only `z` is left.
//! assert_eq!(recommendations.len(), 1);
//! assert_eq!(recommendations[0].0, "z");
//! ```
#[macro_use]
extern crate serde_derive;

#[macro_use]
extern crate itertools;

#[macro_use]
extern crate tracing;

#[cfg(feature = "csv")]
extern crate csv;
extern crate chrono;
extern crate ndarray;
extern crate rand;
extern crate rand_distr;
extern crate rand_xorshift;
extern crate rayon;
extern crate serde;
extern crate thiserror;

use std::fmt::Debug;
use std::hash::Hash;

use rand::Rng;

pub mod data;
#[cfg(feature = "csv")]
pub mod datasets;
pub mod evaluation;
pub mod matrix;
pub mod models;
pub mod partition;

use data::InteractionStore;
use models::RecommendParams;

/// Alias for internal (dense, 0-based) user indices.
pub type UserId = usize;
/// Alias for internal (dense, 0-based) item indices.
pub type ItemId = usize;

/// Bound for external user and item identifiers.
///
/// Anything hashable, totally ordered and cheap enough to clone qualifies:
/// integers, `String`s, `&'static str`s.
pub trait ExternalId: Clone + Ord + Hash + Debug + Send + Sync {}

impl<T> ExternalId for T where T: Clone + Ord + Hash + Debug + Send + Sync {}

/// Errors raised when building stores, loading tables or partitioning logs.
#[derive(Debug, thiserror::Error)]
pub enum DataError {
    /// The user and item columns have different lengths.
    #[error("user and item lists differ in length ({users} users, {items} items)")]
    LengthMismatch {
        /// Number of user entries.
        users: usize,
        /// Number of item entries.
        items: usize,
    },
    /// A required column is absent from the input table.
    #[error("missing required column `{0}`")]
    MissingColumn(String),
    /// Unknown interval type code.
    #[error("invalid interval type `{0}`: expected one of W, M, QS or F")]
    InvalidIntervalType(String),
    /// An explicit interval is malformed or out of bounds.
    #[error("invalid interval {start}..{end}: {reason}")]
    InvalidInterval {
        /// Interval start, as given.
        start: String,
        /// Interval end, as given.
        end: String,
        /// What is wrong with it.
        reason: &'static str,
    },
    /// A configuration value is out of range.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    /// A timestamp cell could not be parsed.
    #[error("cannot parse timestamp `{value}` on row {row}")]
    InvalidTimestamp {
        /// Zero-based data row.
        row: usize,
        /// Offending cell.
        value: String,
    },
    /// CSV decoding error.
    #[cfg(feature = "csv")]
    #[error(transparent)]
    Csv(#[from] csv::Error),
    /// I/O error.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Prediction error types.
#[derive(Debug, thiserror::Error)]
pub enum PredictionError {
    /// The internal user id has no storage in the model.
    #[error("unknown internal user id {0}")]
    UnknownUser(UserId),
    /// The internal item id has no storage in the model.
    #[error("unknown internal item id {0}")]
    UnknownItem(ItemId),
    /// Failed prediction due to numerical issues.
    #[error("invalid prediction value: non-finite or not a number")]
    InvalidPredictionValue,
}

/// Errors raised by the evaluation protocols.
#[derive(Debug, thiserror::Error)]
pub enum EvaluationError {
    /// A protocol parameter is out of range for the given stream.
    #[error("invalid evaluation configuration: {0}")]
    InvalidConfig(String),
    /// The cancel flag was raised; `position` interactions were processed.
    #[error("evaluation cancelled after {position} interactions")]
    Cancelled {
        /// Number of stream positions fully processed.
        position: usize,
    },
    /// Underlying data error.
    #[error(transparent)]
    Data(#[from] DataError),
}

/// Trait describing models that learn from one interaction at a time.
///
/// A model owns exactly one [`InteractionStore`] and keeps its parameters in
/// step with the store's id space: every call to `incr_train` records the
/// interaction and grows parameter storage before updating it.
pub trait IncrementalModel {
    /// External user identifier type.
    type User: ExternalId;
    /// External item identifier type.
    type Item: ExternalId;

    /// The interactions the model has been trained on.
    fn data(&self) -> &InteractionStore<Self::User, Self::Item>;

    /// Record `(user, item)` and update the model with it.
    fn incr_train(&mut self, user: Self::User, item: Self::Item);

    /// Retrain from scratch on everything in the store.
    fn batch_train(&mut self);

    /// Model-specific affinity between internal `user_id` and `item_id`.
    fn predict(&self, user_id: UserId, item_id: ItemId) -> Result<f32, PredictionError>;

    /// Rank items for `user`, best first according to the model's own
    /// scoring convention.
    ///
    /// An empty result means the model cannot say anything about the user;
    /// it is not an error.
    fn recommend<R: Rng + ?Sized>(
        &self,
        user: &Self::User,
        params: &RecommendParams,
        rng: &mut R,
    ) -> Vec<(Self::Item, f32)>;

    /// Reinitialize all parameters, keeping the store.
    fn reset_model(&mut self);
}
