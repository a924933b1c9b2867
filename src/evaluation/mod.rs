//! Evaluation of incremental models on chronological streams.
//!
//! Three protocols are provided:
//!
//! - [`prequential`]: test-then-train over a single stream,
//! - [`checkpoint`]: a single pass that diverts a sample of each segment of
//!   the stream into a holdout and snapshots the model at segment ends,
//! - [`buckets`]: training over pre-built temporal buckets, scoring the
//!   model against every holdout after each bucket.
//!
//! The two holdout protocols fill a [`ResultsMatrix`] of Recall@N with one
//! row per model snapshot and one column per holdout.
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use ndarray::Array2;
use rand::{Rng, SeedableRng};
use rand_xorshift::XorShiftRng;
use rayon::prelude::*;
use serde::{Serialize, Serializer};

use crate::data::InteractionStore;
use crate::models::RecommendParams;
use crate::{EvaluationError, IncrementalModel};

pub mod buckets;
pub mod checkpoint;
pub mod prequential;

/// Score a single `(user, item)` test case.
///
/// `None` when the model returns no recommendations at all: the case is
/// excluded from recall rather than counted as a miss.
pub(crate) fn score_point<M, R>(
    model: &M,
    user: &M::User,
    item: &M::Item,
    params: &RecommendParams,
    rng: &mut R,
) -> Option<bool>
where
    M: IncrementalModel,
    R: Rng + ?Sized,
{
    let recommendations = model.recommend(user, params, rng);

    if recommendations.is_empty() {
        return None;
    }

    let top_n = params.n.unwrap_or(recommendations.len());

    Some(
        recommendations
            .iter()
            .take(top_n)
            .any(|(recommended, _)| recommended == item),
    )
}

pub(crate) fn check_cancelled(
    cancel: Option<&AtomicBool>,
    position: usize,
) -> Result<(), EvaluationError> {
    match cancel {
        Some(flag) if flag.load(Ordering::Relaxed) => {
            info!(position, "evaluation cancelled");
            Err(EvaluationError::Cancelled { position })
        }
        _ => Ok(()),
    }
}

/// Outcome of scoring one holdout.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct HoldoutScore {
    /// Test cases whose item was in the top-N.
    pub hits: usize,
    /// Test cases whose item was not in the top-N.
    pub misses: usize,
    /// Test cases for which the model produced no recommendations.
    pub excluded: usize,
}

impl HoldoutScore {
    /// Number of test cases that entered the denominator.
    pub fn scored(&self) -> usize {
        self.hits + self.misses
    }

    /// Recall@N over scored test cases; `None` when nothing was scored.
    pub fn recall(&self) -> Option<f32> {
        if self.scored() == 0 {
            None
        } else {
            Some(self.hits as f32 / self.scored() as f32)
        }
    }

    fn record(&mut self, outcome: Option<bool>) {
        match outcome {
            Some(true) => self.hits += 1,
            Some(false) => self.misses += 1,
            None => self.excluded += 1,
        }
    }
}

/// Score `model` on every interaction of `holdout`.
pub fn score_holdout<M, R>(
    model: &M,
    holdout: &InteractionStore<M::User, M::Item>,
    params: &RecommendParams,
    rng: &mut R,
) -> HoldoutScore
where
    M: IncrementalModel,
    R: Rng + ?Sized,
{
    let mut score = HoldoutScore::default();

    for (user, item) in holdout.iter() {
        score.record(score_point(model, user, item, params, rng));
    }

    score
}

/// Recall@N per (model snapshot, holdout) pair.
///
/// Cells that could not be scored (empty holdout, or every test case
/// excluded) hold no value.
#[derive(Clone, Debug, PartialEq)]
pub struct ResultsMatrix {
    values: Array2<f32>,
}

impl ResultsMatrix {
    /// An empty `rows × cols` matrix.
    pub fn new(rows: usize, cols: usize) -> Self {
        ResultsMatrix {
            values: Array2::from_elem((rows, cols), std::f32::NAN),
        }
    }

    /// Number of model snapshots.
    pub fn rows(&self) -> usize {
        self.values.nrows()
    }

    /// Number of holdouts.
    pub fn cols(&self) -> usize {
        self.values.ncols()
    }

    /// Recall of snapshot `row` on holdout `col`.
    pub fn get(&self, row: usize, col: usize) -> Option<f32> {
        self.values
            .get((row, col))
            .cloned()
            .filter(|value| !value.is_nan())
    }

    pub(crate) fn set(&mut self, row: usize, col: usize, value: Option<f32>) {
        if let Some(cell) = self.values.get_mut((row, col)) {
            *cell = value.unwrap_or(std::f32::NAN);
        }
    }

    /// Row-major copy of the matrix.
    pub fn to_rows(&self) -> Vec<Vec<Option<f32>>> {
        (0..self.rows())
            .map(|row| (0..self.cols()).map(|col| self.get(row, col)).collect())
            .collect()
    }

    /// The underlying array, `NaN` marking unscored cells.
    pub fn as_array(&self) -> &Array2<f32> {
        &self.values
    }
}

impl Serialize for ResultsMatrix {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_rows().serialize(serializer)
    }
}

/// An immutable snapshot of a model taken during a pass.
#[derive(Clone, Debug)]
pub struct Checkpoint<M> {
    position: usize,
    model: M,
}

impl<M: Clone> Checkpoint<M> {
    /// Snapshot `model` after `position` stream interactions.
    pub fn take(model: &M, position: usize) -> Self {
        Checkpoint {
            position,
            model: model.clone(),
        }
    }
}

impl<M> Checkpoint<M> {
    /// Number of stream interactions seen before the snapshot.
    pub fn position(&self) -> usize {
        self.position
    }

    /// The frozen model.
    pub fn model(&self) -> &M {
        &self.model
    }
}

/// Training statistics for one bucket.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct BucketRecord {
    /// Bucket index.
    pub bucket: usize,
    /// Number of interactions trained on.
    pub size: usize,
    /// Total incremental training time, in seconds.
    pub total_train_secs: f64,
    /// Mean time per `incr_train` call, in seconds.
    pub mean_train_secs: f64,
}

impl BucketRecord {
    pub(crate) fn new(bucket: usize, train_secs: &[f64]) -> Self {
        let total_train_secs: f64 = train_secs.iter().sum();

        BucketRecord {
            bucket,
            size: train_secs.len(),
            total_train_secs,
            mean_train_secs: if train_secs.is_empty() {
                0.0
            } else {
                total_train_secs / train_secs.len() as f64
            },
        }
    }
}

/// Scoring statistics for one (snapshot, holdout) cell.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct HoldoutRecord {
    /// Snapshot row.
    pub checkpoint: usize,
    /// Holdout column.
    pub holdout: usize,
    /// Number of interactions in the holdout.
    pub size: usize,
    /// Hit, miss and exclusion counts.
    pub score: HoldoutScore,
    /// Recall@N, if anything was scored.
    pub recall: Option<f32>,
    /// Wall-clock scoring time, in seconds.
    pub elapsed_secs: f64,
}

/// Seed for the scoring rng of one cell; independent of thread scheduling.
fn cell_seed(seed: u64, row: usize, col: usize, cols: usize) -> u64 {
    seed.wrapping_add((row * cols + col) as u64)
}

fn score_cell<M: IncrementalModel>(
    model: &M,
    holdout: &InteractionStore<M::User, M::Item>,
    params: &RecommendParams,
    seed: u64,
    row: usize,
    col: usize,
) -> HoldoutRecord {
    let mut rng = XorShiftRng::seed_from_u64(seed);
    let start = Instant::now();

    let score = score_holdout(model, holdout, params, &mut rng);

    if score.excluded > 0 {
        debug!(
            checkpoint = row,
            holdout = col,
            excluded = score.excluded,
            "no recommendations for some holdout users"
        );
    }

    HoldoutRecord {
        checkpoint: row,
        holdout: col,
        size: holdout.len(),
        score,
        recall: score.recall(),
        elapsed_secs: start.elapsed().as_secs_f64(),
    }
}

/// Score one model snapshot against every holdout, in parallel.
pub(crate) fn score_row<M>(
    model: &M,
    row: usize,
    holdouts: &[InteractionStore<M::User, M::Item>],
    params: &RecommendParams,
    seed: u64,
) -> Vec<HoldoutRecord>
where
    M: IncrementalModel + Sync,
{
    let cols = holdouts.len();

    holdouts
        .par_iter()
        .enumerate()
        .map(|(col, holdout)| {
            score_cell(model, holdout, params, cell_seed(seed, row, col, cols), row, col)
        })
        .collect()
}

/// Score every snapshot against every holdout, in parallel.
pub(crate) fn score_grid<M>(
    models: &[&M],
    holdouts: &[InteractionStore<M::User, M::Item>],
    params: &RecommendParams,
    seed: u64,
) -> (ResultsMatrix, Vec<HoldoutRecord>)
where
    M: IncrementalModel + Sync,
{
    let cols = holdouts.len();
    let cells: Vec<(usize, usize)> = iproduct!(0..models.len(), 0..cols).collect();

    let records: Vec<HoldoutRecord> = cells
        .par_iter()
        .map(|&(row, col)| {
            score_cell(
                models[row],
                &holdouts[col],
                params,
                cell_seed(seed, row, col, cols),
                row,
                col,
            )
        })
        .collect();

    let mut results = ResultsMatrix::new(models.len(), cols);
    for record in &records {
        results.set(record.checkpoint, record.holdout, record.recall);
    }

    (results, records)
}

/// Models with trivially predictable recommendations for protocol tests.
#[cfg(test)]
pub(crate) mod mock {
    use rand::Rng;

    use crate::data::InteractionStore;
    use crate::models::RecommendParams;
    use crate::{IncrementalModel, ItemId, PredictionError, UserId};

    /// Recommends the most recently trained item to everyone.
    #[derive(Clone, Debug, Default)]
    pub(crate) struct LastItemModel {
        pub(crate) data: InteractionStore<u32, u32>,
        pub(crate) last: Option<u32>,
    }

    impl IncrementalModel for LastItemModel {
        type User = u32;
        type Item = u32;

        fn data(&self) -> &InteractionStore<u32, u32> {
            &self.data
        }

        fn incr_train(&mut self, user: u32, item: u32) {
            self.data.add_feedback(user, item);
            self.last = Some(item);
        }

        fn batch_train(&mut self) {}

        fn predict(&self, _user_id: UserId, _item_id: ItemId) -> Result<f32, PredictionError> {
            Ok(0.0)
        }

        fn recommend<R: Rng + ?Sized>(
            &self,
            _user: &u32,
            _params: &RecommendParams,
            _rng: &mut R,
        ) -> Vec<(u32, f32)> {
            self.last.iter().map(|&item| (item, 1.0)).collect()
        }

        fn reset_model(&mut self) {
            self.last = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::models::isgd;

    fn trained_model() -> isgd::ISGDModel<&'static str, &'static str> {
        let mut model = isgd::Hyperparameters::new()
            .num_factors(4)
            .seed(5)
            .build(InteractionStore::empty());

        for &(user, item) in &[("a", "x"), ("b", "y"), ("c", "z"), ("a", "w")] {
            model.incr_train(user, item);
        }

        model
    }

    #[test]
    fn unknown_users_are_excluded_from_recall() {
        let model = trained_model();
        let holdout = InteractionStore::new(
            vec!["a", "b", "c", "d", "e"],
            vec!["y", "x", "w", "x", "y"],
        )
        .unwrap();
        let mut rng = XorShiftRng::seed_from_u64(0);

        let score = score_holdout(&model, &holdout, &RecommendParams::top(20), &mut rng);

        assert_eq!(score.excluded, 2);
        assert_eq!(score.scored(), 3);
        // Every candidate fits in the top 20, so every scored case is a hit.
        assert_eq!(score.hits, 3);
        assert_eq!(score.recall(), Some(1.0));
    }

    #[test]
    fn top_n_cutoff_counts_misses() {
        let model = trained_model();
        // `a` knows `x` and `w`, leaving exactly `y` and `z` as candidates.
        let holdout = InteractionStore::new(vec!["a", "a"], vec!["y", "z"]).unwrap();
        let mut rng = XorShiftRng::seed_from_u64(0);

        let score = score_holdout(&model, &holdout, &RecommendParams::top(1), &mut rng);

        assert_eq!(score.scored(), 2);
        assert_eq!(score.hits, 1);
        assert_eq!(score.recall(), Some(0.5));
    }

    #[test]
    fn empty_holdouts_have_no_recall() {
        let model = trained_model();
        let mut rng = XorShiftRng::seed_from_u64(0);

        let score = score_holdout(
            &model,
            &InteractionStore::empty(),
            &RecommendParams::top(20),
            &mut rng,
        );

        assert_eq!(score, HoldoutScore::default());
        assert_eq!(score.recall(), None);
    }

    #[test]
    fn grid_fills_every_cell() {
        let early = trained_model();
        let mut late = early.clone();
        late.incr_train("d", "x");

        let holdouts = vec![
            InteractionStore::new(vec!["a"], vec!["y"]).unwrap(),
            InteractionStore::new(vec!["d"], vec!["z"]).unwrap(),
            InteractionStore::empty(),
        ];

        let (results, records) = score_grid(&[&early, &late], &holdouts, &RecommendParams::top(20), 0);

        assert_eq!((results.rows(), results.cols()), (2, 3));
        assert_eq!(records.len(), 6);
        assert_eq!(results.get(0, 0), Some(1.0));
        // `d` is unknown to the early snapshot.
        assert_eq!(results.get(0, 1), None);
        assert_eq!(results.get(1, 1), Some(1.0));
        assert_eq!(results.get(1, 2), None);

        let json = serde_json::to_string(&results).unwrap();
        assert_eq!(json, "[[1.0,null,null],[1.0,1.0,null]]");
    }

    #[test]
    fn grid_scoring_is_reproducible() {
        let model = trained_model();
        let holdouts = vec![InteractionStore::new(vec!["q", "r"], vec!["x", "y"]).unwrap()];
        let params = RecommendParams::top(1).default_user(crate::models::DefaultUser::Random);

        let (first, _) = score_grid(&[&model], &holdouts, &params, 9);
        let (second, _) = score_grid(&[&model], &holdouts, &params, 9);

        assert_eq!(first.to_rows(), second.to_rows());
    }

    #[test]
    fn checkpoints_are_frozen() {
        let mut model = trained_model();
        let checkpoint = Checkpoint::take(&model, 4);

        model.incr_train("z", "q");

        assert_eq!(checkpoint.position(), 4);
        assert_eq!(checkpoint.model().data().len(), 4);
        assert_eq!(model.data().len(), 5);
    }

    #[test]
    fn cancellation() {
        let flag = AtomicBool::new(false);
        assert!(check_cancelled(Some(&flag), 3).is_ok());
        assert!(check_cancelled(None, 3).is_ok());

        flag.store(true, Ordering::Relaxed);
        assert!(matches!(
            check_cancelled(Some(&flag), 3),
            Err(EvaluationError::Cancelled { position: 3 })
        ));
    }

    #[test]
    fn bucket_record_means() {
        let record = BucketRecord::new(2, &[0.5, 1.5]);

        assert_eq!(record.size, 2);
        assert_eq!(record.total_train_secs, 2.0);
        assert_eq!(record.mean_train_secs, 1.0);
        assert_eq!(BucketRecord::new(0, &[]).mean_train_secs, 0.0);
    }
}
