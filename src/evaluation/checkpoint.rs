//! Checkpointed segment evaluation.
//!
//! After a warm-up region the stream is divided into `n_holdouts` segments
//! of equal size (the last one takes the remainder). Within a segment each
//! interaction is diverted into the segment's holdout with a fixed
//! probability instead of being trained on, unless the same pair was already
//! diverted in that segment. The model is snapshotted at the end of every
//! segment; afterwards every snapshot is scored against every holdout.
use std::collections::HashSet;
use std::sync::atomic::AtomicBool;

use rand::{Rng, SeedableRng};
use rand_xorshift::XorShiftRng;

use super::prequential::PrequentialResult;
use super::{check_cancelled, score_grid, score_point, Checkpoint, HoldoutRecord, ResultsMatrix};
use crate::data::InteractionStore;
use crate::models::{DefaultUser, RecommendParams};
use crate::{EvaluationError, IncrementalModel};

/// Configuration of a checkpointed pass.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CheckpointConfig {
    n_holdouts: usize,
    top_n: usize,
    start_eval: usize,
    warm_up: usize,
    count: Option<usize>,
    holdout_probability: f64,
    store_only: bool,
    exclude_known_items: bool,
    default_user: DefaultUser,
    seed: u64,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        CheckpointConfig {
            n_holdouts: 20,
            top_n: 20,
            start_eval: 0,
            warm_up: 100,
            count: None,
            holdout_probability: 0.1,
            store_only: true,
            exclude_known_items: true,
            default_user: DefaultUser::None,
            seed: 0,
        }
    }
}

impl CheckpointConfig {
    /// Build a default configuration.
    pub fn new() -> Self {
        CheckpointConfig::default()
    }

    /// Number of segments, and so of snapshots and holdouts.
    pub fn n_holdouts(mut self, n_holdouts: usize) -> Self {
        self.n_holdouts = n_holdouts;
        self
    }

    /// Length of the recommendation lists scored.
    pub fn top_n(mut self, top_n: usize) -> Self {
        self.top_n = top_n;
        self
    }

    /// Segments start at `max(start_eval, warm_up)`.
    pub fn start_eval(mut self, start_eval: usize) -> Self {
        self.start_eval = start_eval;
        self
    }

    /// Number of leading interactions that are only trained on.
    pub fn warm_up(mut self, warm_up: usize) -> Self {
        self.warm_up = warm_up;
        self
    }

    /// Process at most `count` interactions.
    pub fn count(mut self, count: usize) -> Self {
        self.count = Some(count);
        self
    }

    /// Probability of diverting an interaction into the holdout.
    pub fn holdout_probability(mut self, holdout_probability: f64) -> Self {
        self.holdout_probability = holdout_probability;
        self
    }

    /// When false, also run test-then-train scoring during the pass.
    pub fn store_only(mut self, store_only: bool) -> Self {
        self.store_only = store_only;
        self
    }

    /// Drop known items from recommendation lists.
    pub fn exclude_known_items(mut self, exclude_known_items: bool) -> Self {
        self.exclude_known_items = exclude_known_items;
        self
    }

    /// Cold-start policy used when recommending.
    pub fn default_user(mut self, default_user: DefaultUser) -> Self {
        self.default_user = default_user;
        self
    }

    /// Seed of the run's random number generators.
    pub fn seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    fn recommend_params(&self) -> RecommendParams {
        RecommendParams::top(self.top_n)
            .exclude_known_items(self.exclude_known_items)
            .default_user(self.default_user)
    }

    fn segment_size(&self, stream_len: usize) -> Result<usize, EvaluationError> {
        if self.n_holdouts == 0 {
            return Err(EvaluationError::InvalidConfig(
                "n_holdouts must be positive".to_owned(),
            ));
        }
        if self.top_n == 0 {
            return Err(EvaluationError::InvalidConfig(
                "top_n must be positive".to_owned(),
            ));
        }
        if !(0.0..=1.0).contains(&self.holdout_probability) {
            return Err(EvaluationError::InvalidConfig(format!(
                "holdout probability {} is outside [0, 1]",
                self.holdout_probability
            )));
        }

        let start = self.start_eval.max(self.warm_up);
        let segment_size = stream_len.saturating_sub(start) / self.n_holdouts;

        if segment_size == 0 {
            return Err(EvaluationError::InvalidConfig(format!(
                "a stream of {} interactions starting at {} cannot fill {} segments",
                stream_len, start, self.n_holdouts
            )));
        }

        Ok(segment_size)
    }
}

/// Snapshots and holdouts collected by a checkpointed pass.
#[derive(Clone, Debug)]
pub struct CheckpointRun<M: IncrementalModel> {
    /// One snapshot per completed segment, in stream order.
    pub checkpoints: Vec<Checkpoint<M>>,
    /// One holdout per segment.
    pub holdouts: Vec<InteractionStore<M::User, M::Item>>,
    /// Test-then-train results, unless the pass was store-only.
    pub prequential: Option<PrequentialResult>,
}

impl<M: IncrementalModel + Sync> CheckpointRun<M> {
    /// Score every snapshot (rows) against every holdout (columns).
    pub fn evaluate_holdouts(&self, config: &CheckpointConfig) -> (ResultsMatrix, Vec<HoldoutRecord>) {
        let models: Vec<&M> = self.checkpoints.iter().map(|checkpoint| checkpoint.model()).collect();

        let (results, records) = score_grid(&models, &self.holdouts, &config.recommend_params(), config.seed);

        info!(
            checkpoints = results.rows(),
            holdouts = results.cols(),
            "scored checkpoints against holdouts"
        );

        (results, records)
    }
}

/// Run a checkpointed pass of `model` over `stream`.
pub fn evaluate_and_store<M>(
    model: &mut M,
    stream: &InteractionStore<M::User, M::Item>,
    config: &CheckpointConfig,
    cancel: Option<&AtomicBool>,
) -> Result<CheckpointRun<M>, EvaluationError>
where
    M: IncrementalModel + Clone,
{
    let segment_size = config.segment_size(stream.len())?;
    let start = config.start_eval.max(config.warm_up);
    let count = config.count.map_or(stream.len(), |count| count.min(stream.len()));
    let last_segment = config.n_holdouts - 1;

    let params = config.recommend_params();
    let mut rng = XorShiftRng::seed_from_u64(config.seed);

    let mut checkpoints = Vec::with_capacity(config.n_holdouts);
    let mut holdouts: Vec<Vec<(M::User, M::Item)>> = vec![Vec::new(); config.n_holdouts];
    let mut diverted: HashSet<(M::User, M::Item)> = HashSet::new();
    let mut prequential = if config.store_only {
        None
    } else {
        Some(PrequentialResult::default())
    };

    let mut segment = 0;
    let mut in_segment = 0;

    info!(count, segment_size, n_holdouts = config.n_holdouts, "starting checkpointed pass");

    for position in 0..count {
        check_cancelled(cancel, position)?;

        let (user, item) = match stream.tuple(position) {
            Some((user, item)) => (user.clone(), item.clone()),
            None => break,
        };

        if position < start || segment > last_segment {
            model.incr_train(user, item);
            continue;
        }

        if let Some(result) = prequential.as_mut() {
            result.record(position, score_point(model, &user, &item, &params, &mut rng));
        }

        in_segment += 1;

        let pair = (user, item);
        if rng.gen_bool(config.holdout_probability) && !diverted.contains(&pair) {
            diverted.insert(pair.clone());
            holdouts[segment].push(pair);
        } else {
            model.incr_train(pair.0, pair.1);
        }

        // The last segment runs to the end of the pass.
        let segment_done = if segment == last_segment {
            position + 1 == count
        } else {
            in_segment >= segment_size
        };

        if segment_done {
            debug!(
                segment,
                position = position + 1,
                holdout = holdouts[segment].len(),
                "checkpoint"
            );

            checkpoints.push(Checkpoint::take(model, position + 1));
            segment += 1;
            in_segment = 0;
            diverted.clear();
        }
    }

    if in_segment > 0 && segment <= last_segment {
        debug!(segment, position = count, "checkpoint at end of pass");
        checkpoints.push(Checkpoint::take(model, count));
    }

    let holdouts = holdouts
        .into_iter()
        .map(|pairs| {
            let (users, items): (Vec<_>, Vec<_>) = pairs.into_iter().unzip();
            InteractionStore::new(users, items)
        })
        .collect::<Result<Vec<_>, _>>()?;

    info!(
        checkpoints = checkpoints.len(),
        holdout_rows = holdouts.iter().map(|holdout| holdout.len()).sum::<usize>(),
        "finished checkpointed pass"
    );

    Ok(CheckpointRun {
        checkpoints,
        holdouts,
        prequential,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::evaluation::mock::LastItemModel;
    use crate::models::isgd;

    fn constant_stream(len: usize) -> InteractionStore<u32, u32> {
        InteractionStore::new(vec![0; len], vec![0; len]).unwrap()
    }

    #[test]
    fn one_snapshot_per_segment() {
        let mut model = LastItemModel::default();
        let config = CheckpointConfig::new().n_holdouts(4).warm_up(0);

        let run = evaluate_and_store(&mut model, &constant_stream(42), &config, None).unwrap();

        let positions: Vec<usize> = run.checkpoints.iter().map(|c| c.position()).collect();
        // Segments of 10; the last one absorbs the remainder.
        assert_eq!(positions, vec![10, 20, 30, 42]);
        assert_eq!(run.holdouts.len(), 4);
        assert!(run.prequential.is_none());
    }

    #[test]
    fn pairs_are_diverted_once_per_segment() {
        let mut model = LastItemModel::default();
        let config = CheckpointConfig::new()
            .n_holdouts(4)
            .warm_up(0)
            .holdout_probability(1.0);

        let run = evaluate_and_store(&mut model, &constant_stream(40), &config, None).unwrap();

        for holdout in &run.holdouts {
            assert_eq!(holdout.len(), 1);
        }
        assert_eq!(model.data().len(), 36);
        assert_eq!(run.checkpoints[0].model().data().len(), 9);
    }

    #[test]
    fn warm_up_is_train_only() {
        let mut model = LastItemModel::default();
        let config = CheckpointConfig::new()
            .n_holdouts(2)
            .warm_up(20)
            .holdout_probability(1.0);

        let run = evaluate_and_store(&mut model, &constant_stream(30), &config, None).unwrap();

        let positions: Vec<usize> = run.checkpoints.iter().map(|c| c.position()).collect();
        assert_eq!(positions, vec![25, 30]);
        assert_eq!(run.checkpoints[0].model().data().len(), 24);
    }

    #[test]
    fn short_pass_checkpoints_its_last_segment() {
        let mut model = LastItemModel::default();
        let config = CheckpointConfig::new().n_holdouts(4).warm_up(0).count(25);

        let run = evaluate_and_store(&mut model, &constant_stream(40), &config, None).unwrap();

        let positions: Vec<usize> = run.checkpoints.iter().map(|c| c.position()).collect();
        assert_eq!(positions, vec![10, 20, 25]);
        assert!(run.holdouts[3].is_empty());
    }

    fn score_snapshots<M: IncrementalModel + Sync>(
        run: &CheckpointRun<M>,
        config: &CheckpointConfig,
    ) -> (ResultsMatrix, Vec<HoldoutRecord>) {
        run.evaluate_holdouts(config)
    }

    #[test]
    fn exact_final_segment_is_checkpointed_once() {
        let mut model = LastItemModel::default();
        let config = CheckpointConfig::new()
            .n_holdouts(4)
            .warm_up(0)
            .holdout_probability(1.0);

        let run = evaluate_and_store(&mut model, &constant_stream(40), &config, None).unwrap();

        let positions: Vec<usize> = run.checkpoints.iter().map(|c| c.position()).collect();
        assert_eq!(positions, vec![10, 20, 30, 40]);

        // Scoring only needs the snapshots to be shareable across threads.
        let (results, records) = score_snapshots(&run, &config);
        assert_eq!((results.rows(), results.cols()), (4, 4));
        assert_eq!(records.len(), 16);
    }

    #[test]
    fn every_interaction_is_trained_or_held_out() {
        let users: Vec<u32> = (0..300).map(|i| i % 13).collect();
        let items: Vec<u32> = (0..300).map(|i| (i * 7) % 31).collect();
        let stream = InteractionStore::new(users, items).unwrap();

        let mut model = isgd::Hyperparameters::new()
            .num_factors(4)
            .build(InteractionStore::empty());
        let config = CheckpointConfig::new().n_holdouts(5).store_only(false).seed(1);

        let run = evaluate_and_store(&mut model, &stream, &config, None).unwrap();

        let held_out: usize = run.holdouts.iter().map(|holdout| holdout.len()).sum();
        assert_eq!(model.data().len() + held_out, 300);
        assert!(held_out > 0);
        assert_eq!(run.checkpoints.len(), 5);

        let prequential = run.prequential.as_ref().unwrap();
        assert_eq!(prequential.score().scored() + prequential.excluded, 200);

        let (results, records) = run.evaluate_holdouts(&config);
        assert_eq!((results.rows(), results.cols()), (5, 5));
        assert_eq!(records.len(), 25);
    }

    #[test]
    fn stream_too_short() {
        let mut model = LastItemModel::default();
        let config = CheckpointConfig::new().n_holdouts(4);

        assert!(matches!(
            evaluate_and_store(&mut model, &constant_stream(50), &config, None),
            Err(EvaluationError::InvalidConfig(_))
        ));
    }
}
