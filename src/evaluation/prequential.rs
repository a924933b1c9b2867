//! Test-then-train evaluation.
//!
//! Each interaction of the stream is first used as a test case for the
//! current model (when eligible) and only then trained on.
use std::sync::atomic::AtomicBool;
use std::time::Instant;

use rand::{Rng, SeedableRng};
use rand_xorshift::XorShiftRng;

use super::{check_cancelled, score_point, HoldoutScore};
use crate::data::InteractionStore;
use crate::models::{DefaultUser, RecommendParams};
use crate::{EvaluationError, ExternalId, IncrementalModel};

/// Configuration of a prequential pass.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PrequentialConfig {
    top_n: usize,
    start_eval: usize,
    warm_up: usize,
    count: Option<usize>,
    interleaved: usize,
    skip_known_items: bool,
    record_timings: bool,
    exclude_known_items: bool,
    default_user: DefaultUser,
    seed: u64,
}

impl Default for PrequentialConfig {
    fn default() -> Self {
        PrequentialConfig {
            top_n: 20,
            start_eval: 0,
            warm_up: 100,
            count: None,
            interleaved: 1,
            skip_known_items: false,
            record_timings: false,
            exclude_known_items: true,
            default_user: DefaultUser::None,
            seed: 0,
        }
    }
}

impl PrequentialConfig {
    /// Build a default configuration.
    pub fn new() -> Self {
        PrequentialConfig::default()
    }

    /// Length of the recommendation lists scored.
    pub fn top_n(mut self, top_n: usize) -> Self {
        self.top_n = top_n;
        self
    }

    /// First stream position eligible for scoring.
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

    /// Score each eligible interaction with probability `1 / interleaved`.
    pub fn interleaved(mut self, interleaved: usize) -> Self {
        self.interleaved = interleaved;
        self
    }

    /// Do not score interactions whose item the user already knows.
    pub fn skip_known_items(mut self, skip_known_items: bool) -> Self {
        self.skip_known_items = skip_known_items;
        self
    }

    /// Record per-step wall-clock timings.
    pub fn record_timings(mut self, record_timings: bool) -> Self {
        self.record_timings = record_timings;
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

    /// Seed of the run's random number generator.
    pub fn seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    fn validate(&self) -> Result<(), EvaluationError> {
        if self.top_n == 0 {
            return Err(EvaluationError::InvalidConfig(
                "top_n must be positive".to_owned(),
            ));
        }
        if self.interleaved == 0 {
            return Err(EvaluationError::InvalidConfig(
                "interleaved must be positive".to_owned(),
            ));
        }

        Ok(())
    }

    fn recommend_params(&self) -> RecommendParams {
        RecommendParams::top(self.top_n)
            .exclude_known_items(self.exclude_known_items)
            .default_user(self.default_user)
    }
}

/// Wall-clock cost of one stream step.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct StepTiming {
    /// Stream position.
    pub position: usize,
    /// Time spent recommending and scoring, if the step was scored.
    pub recommend_secs: Option<f64>,
    /// Time spent in `incr_train`, if the step was trained on.
    pub update_secs: Option<f64>,
}

/// Outcome of a prequential pass.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct PrequentialResult {
    /// Position and hit flag of every scored interaction.
    pub points: Vec<(usize, bool)>,
    /// Interactions for which the model had no recommendations.
    pub excluded: usize,
    /// Per-step timings, when requested.
    pub timings: Vec<StepTiming>,
}

impl PrequentialResult {
    pub(crate) fn record(&mut self, position: usize, outcome: Option<bool>) {
        match outcome {
            Some(hit) => self.points.push((position, hit)),
            None => self.excluded += 1,
        }
    }

    /// Aggregate hit, miss and exclusion counts.
    pub fn score(&self) -> HoldoutScore {
        let hits = self.points.iter().filter(|&&(_, hit)| hit).count();

        HoldoutScore {
            hits,
            misses: self.points.len() - hits,
            excluded: self.excluded,
        }
    }

    /// Recall@N over scored interactions.
    pub fn recall(&self) -> Option<f32> {
        self.score().recall()
    }
}

/// Whether `user` already interacted with `item` in `data`.
pub(crate) fn knows<U: ExternalId, I: ExternalId>(data: &InteractionStore<U, I>, user: &U, item: &I) -> bool {
    match (data.user_internal_id(user), data.item_internal_id(item)) {
        (Some(user_id), Some(item_id)) => data.user_items(user_id).contains(&item_id),
        _ => false,
    }
}

/// Run the test-then-train protocol over `stream`.
///
/// The model keeps training across calls; the stream is not modified.
pub fn evaluate<M: IncrementalModel>(
    model: &mut M,
    stream: &InteractionStore<M::User, M::Item>,
    config: &PrequentialConfig,
    cancel: Option<&AtomicBool>,
) -> Result<PrequentialResult, EvaluationError> {
    config.validate()?;

    let count = config.count.map_or(stream.len(), |count| count.min(stream.len()));
    let params = config.recommend_params();
    let mut rng = XorShiftRng::seed_from_u64(config.seed);
    let mut result = PrequentialResult::default();

    info!(count, top_n = config.top_n, "starting prequential evaluation");

    for position in 0..count {
        check_cancelled(cancel, position)?;

        let (user, item) = match stream.tuple(position) {
            Some((user, item)) => (user.clone(), item.clone()),
            None => break,
        };

        let eligible = position >= config.start_eval
            && rng.gen::<f32>() <= 1.0 / config.interleaved as f32
            && position >= config.warm_up;

        let mut recommend_secs = None;
        if eligible && !(config.skip_known_items && knows(model.data(), &user, &item)) {
            let start = Instant::now();
            let outcome = score_point(model, &user, &item, &params, &mut rng);
            recommend_secs = Some(start.elapsed().as_secs_f64());

            result.record(position, outcome);
        }

        let start = Instant::now();
        model.incr_train(user, item);

        if config.record_timings {
            result.timings.push(StepTiming {
                position,
                recommend_secs,
                update_secs: Some(start.elapsed().as_secs_f64()),
            });
        }
    }

    info!(
        scored = result.points.len(),
        excluded = result.excluded,
        recall = ?result.recall(),
        "finished prequential evaluation"
    );

    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::evaluation::mock::LastItemModel;

    fn stream(items: &[u32]) -> InteractionStore<u32, u32> {
        InteractionStore::new(vec![0; items.len()], items.to_vec()).unwrap()
    }

    #[test]
    fn scores_before_training() {
        let mut model = LastItemModel::default();
        let config = PrequentialConfig::new().warm_up(0);

        let result = evaluate(&mut model, &stream(&[1, 1, 2, 2]), &config, None).unwrap();

        // Position 0 meets an empty model; training first would make every
        // step a hit.
        assert_eq!(result.excluded, 1);
        assert_eq!(result.points, vec![(1, true), (2, false), (3, true)]);
        assert_eq!(result.recall(), Some(2.0 / 3.0));
        assert_eq!(model.data().len(), 4);
    }

    #[test]
    fn warm_up_and_start_eval() {
        let items: Vec<u32> = (0..10).collect();

        let mut model = LastItemModel::default();
        let config = PrequentialConfig::new().warm_up(3).start_eval(5);
        let result = evaluate(&mut model, &stream(&items), &config, None).unwrap();

        let positions: Vec<usize> = result.points.iter().map(|&(position, _)| position).collect();
        assert_eq!(positions, vec![5, 6, 7, 8, 9]);
        assert_eq!(result.recall(), Some(0.0));
    }

    #[test]
    fn interleaving_thins_scoring() {
        let items: Vec<u32> = (0..2000).map(|i| i % 7).collect();

        let mut model = LastItemModel::default();
        let config = PrequentialConfig::new().warm_up(0).interleaved(10).seed(3);
        let result = evaluate(&mut model, &stream(&items), &config, None).unwrap();

        let scored = result.points.len() + result.excluded;
        assert!(scored > 100 && scored < 300, "scored {}", scored);
        assert_eq!(model.data().len(), 2000);
    }

    #[test]
    fn skip_known_items_and_timings() {
        let mut model = LastItemModel::default();
        let config = PrequentialConfig::new()
            .warm_up(0)
            .skip_known_items(true)
            .record_timings(true);

        let result = evaluate(&mut model, &stream(&[1, 1, 2, 1]), &config, None).unwrap();

        // Positions 1 and 3 repeat an item the user already knows.
        assert_eq!(result.points, vec![(2, false)]);
        assert_eq!(result.excluded, 1);
        assert_eq!(result.timings.len(), 4);
        assert!(result.timings[1].recommend_secs.is_none());
        assert!(result.timings[2].recommend_secs.is_some());
    }

    #[test]
    fn count_bounds_the_pass() {
        let mut model = LastItemModel::default();
        let config = PrequentialConfig::new().warm_up(0).count(2);

        evaluate(&mut model, &stream(&[1, 2, 3]), &config, None).unwrap();

        assert_eq!(model.data().len(), 2);
    }

    #[test]
    fn cancelled_between_interactions() {
        let mut model = LastItemModel::default();
        let flag = AtomicBool::new(true);

        let result = evaluate(
            &mut model,
            &stream(&[1, 2]),
            &PrequentialConfig::new(),
            Some(&flag),
        );

        assert!(matches!(result, Err(EvaluationError::Cancelled { position: 0 })));
        assert!(model.data().is_empty());
    }

    #[test]
    fn rejects_zero_interleaving() {
        let mut model = LastItemModel::default();
        let config = PrequentialConfig::new().interleaved(0);

        assert!(evaluate(&mut model, &stream(&[1]), &config, None).is_err());
    }
}
