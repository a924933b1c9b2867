//! Bucket-based checkpoint evaluation.
//!
//! The model is trained incrementally on each bucket in turn. The leading
//! `buckets.len() - holdouts.len()` buckets are cold-start buckets; after
//! every later bucket the model is scored against every holdout, filling
//! one row of the results matrix.
use std::sync::atomic::AtomicBool;
use std::time::Instant;

use super::{check_cancelled, score_row, BucketRecord, HoldoutRecord, ResultsMatrix};
use crate::data::InteractionStore;
use crate::models::{DefaultUser, RecommendParams};
use crate::{EvaluationError, IncrementalModel};

/// Configuration of a bucket pass.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct BucketConfig {
    top_n: usize,
    exclude_known_items: bool,
    default_user: DefaultUser,
    seed: u64,
}

impl Default for BucketConfig {
    fn default() -> Self {
        BucketConfig {
            top_n: 20,
            exclude_known_items: true,
            default_user: DefaultUser::None,
            seed: 0,
        }
    }
}

impl BucketConfig {
    /// Build a default configuration.
    pub fn new() -> Self {
        BucketConfig::default()
    }

    /// Length of the recommendation lists scored.
    pub fn top_n(mut self, top_n: usize) -> Self {
        self.top_n = top_n;
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

    /// Seed of the scoring random number generators.
    pub fn seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }
}

/// Results of a bucket pass.
#[derive(Clone, Debug, Serialize)]
pub struct BucketRun {
    /// Recall after bucket `cold_start_buckets + row` on each holdout.
    pub results: ResultsMatrix,
    /// Training statistics, one per bucket.
    pub buckets: Vec<BucketRecord>,
    /// Scoring statistics, one per matrix cell.
    pub holdouts: Vec<HoldoutRecord>,
    /// Number of leading training-only buckets.
    pub cold_start_buckets: usize,
}

/// Train `model` over `buckets`, scoring it against `holdouts` after each
/// non-cold-start bucket.
pub fn train_evaluate<M>(
    model: &mut M,
    buckets: &[InteractionStore<M::User, M::Item>],
    holdouts: &[InteractionStore<M::User, M::Item>],
    config: &BucketConfig,
    cancel: Option<&AtomicBool>,
) -> Result<BucketRun, EvaluationError>
where
    M: IncrementalModel + Sync,
{
    if holdouts.len() > buckets.len() {
        return Err(EvaluationError::InvalidConfig(format!(
            "{} holdouts cannot pair with {} buckets",
            holdouts.len(),
            buckets.len()
        )));
    }
    if config.top_n == 0 {
        return Err(EvaluationError::InvalidConfig(
            "top_n must be positive".to_owned(),
        ));
    }

    let cold_start_buckets = buckets.len() - holdouts.len();
    let params = RecommendParams::top(config.top_n)
        .exclude_known_items(config.exclude_known_items)
        .default_user(config.default_user);

    let mut results = ResultsMatrix::new(holdouts.len(), holdouts.len());
    let mut bucket_records = Vec::with_capacity(buckets.len());
    let mut holdout_records = Vec::with_capacity(holdouts.len() * holdouts.len());
    let mut position = 0;

    info!(
        buckets = buckets.len(),
        holdouts = holdouts.len(),
        cold_start_buckets,
        "starting bucket evaluation"
    );

    for (index, bucket) in buckets.iter().enumerate() {
        let mut train_secs = Vec::with_capacity(bucket.len());

        for (user, item) in bucket.iter() {
            check_cancelled(cancel, position)?;

            let start = Instant::now();
            model.incr_train(user.clone(), item.clone());
            train_secs.push(start.elapsed().as_secs_f64());

            position += 1;
        }

        let record = BucketRecord::new(index, &train_secs);
        debug!(
            bucket = index,
            size = record.size,
            total_train_secs = record.total_train_secs,
            "trained bucket"
        );
        bucket_records.push(record);

        if index >= cold_start_buckets {
            let row = index - cold_start_buckets;

            for record in score_row(&*model, row, holdouts, &params, config.seed) {
                results.set(row, record.holdout, record.recall);
                holdout_records.push(record);
            }
        }
    }

    info!("finished bucket evaluation");

    Ok(BucketRun {
        results,
        buckets: bucket_records,
        holdouts: holdout_records,
        cold_start_buckets,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::data::{Interaction, InteractionLog};
    use crate::evaluation::mock::LastItemModel;
    use crate::models::user_knn;
    use crate::partition::{IntervalScheme, Partitioner};

    fn store(pairs: &[(u32, u32)]) -> InteractionStore<u32, u32> {
        let (users, items): (Vec<u32>, Vec<u32>) = pairs.iter().cloned().unzip();
        InteractionStore::new(users, items).unwrap()
    }

    #[test]
    fn rows_follow_non_cold_start_buckets() {
        let mut model = LastItemModel::default();
        let buckets = vec![store(&[(0, 1)]), store(&[(0, 5)]), store(&[(0, 3), (0, 7)])];
        let holdouts = vec![store(&[(0, 5)]), store(&[(0, 7)])];

        let run = train_evaluate(&mut model, &buckets, &holdouts, &BucketConfig::new(), None).unwrap();

        assert_eq!(run.cold_start_buckets, 1);
        assert_eq!(
            run.results.to_rows(),
            vec![vec![Some(1.0), Some(0.0)], vec![Some(0.0), Some(1.0)]]
        );
        assert_eq!(run.holdouts.len(), 4);

        let sizes: Vec<usize> = run.buckets.iter().map(|record| record.size).collect();
        assert_eq!(sizes, vec![1, 1, 2]);
    }

    #[test]
    fn more_holdouts_than_buckets() {
        let mut model = LastItemModel::default();
        let holdouts = vec![store(&[(0, 1)]), store(&[(0, 2)])];

        assert!(matches!(
            train_evaluate(&mut model, &[store(&[(0, 1)])], &holdouts, &BucketConfig::new(), None),
            Err(EvaluationError::InvalidConfig(_))
        ));
    }

    #[test]
    fn cancellation_stops_training() {
        let mut model = LastItemModel::default();
        let flag = AtomicBool::new(true);

        let result = train_evaluate(&mut model, &[store(&[(0, 1)])], &[], &BucketConfig::new(), Some(&flag));

        assert!(matches!(result, Err(EvaluationError::Cancelled { position: 0 })));
    }

    #[test]
    fn partitioned_log_end_to_end() {
        let day = |d| {
            chrono::NaiveDate::from_ymd_opt(2021, 3, d)
                .and_then(|date| date.and_hms_opt(0, 0, 0))
                .unwrap()
        };

        // Users 0 and 1 share tastes; user 1's last item each week is held out.
        let rows = vec![
            (0, 10, day(1)),
            (1, 10, day(2)),
            (0, 11, day(3)),
            (1, 12, day(9)),
            (0, 12, day(10)),
            (1, 11, day(11)),
            (0, 13, day(16)),
            (1, 14, day(17)),
            (1, 13, day(18)),
        ];
        let log = InteractionLog::new(
            rows.into_iter()
                .map(|(user, item, timestamp)| Interaction::new(user, item, timestamp))
                .collect(),
        );

        let partition = Partitioner::new(IntervalScheme::Week)
            .partition(&log, &[1])
            .unwrap();
        assert_eq!(partition.buckets.len(), 3);
        assert_eq!(partition.holdouts.len(), 2);

        let mut model = user_knn::Hyperparameters::new().k(5).build(InteractionStore::empty());
        let run = train_evaluate(
            &mut model,
            &partition.buckets,
            &partition.holdouts,
            &BucketConfig::new(),
            None,
        )
        .unwrap();

        assert_eq!((run.results.rows(), run.results.cols()), (2, 2));
        // After the second week the only item user 1 has not seen is 11,
        // which its neighbour 0 interacted with.
        assert_eq!(run.results.get(0, 0), Some(1.0));
    }
}
