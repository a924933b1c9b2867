//! Incremental SGD matrix factorization for positive-only feedback (ISGD).
//!
//! Every observed `(user, item)` pair is treated as a positive example with
//! target 1. One update step performs `num_iterations` rounds of
//!
//! ```text
//! err  = 1 - p_u · q_i
//! p_u += lr * (err * q_i - reg_u * p_u)
//! q_i += lr * (err * p_u - reg_i * q_i)
//! ```
//!
//! Recommendations are ranked by how close the predicted affinity is to the
//! positive target: the score is `|1 - p_u · q_i|` and **smaller is better**.
//!
//! Reference: Vinagre, Jorge & Gama, *Fast incremental matrix factorization
//! for recommendation with positive-only feedback*, UMAP 2014.
use rand::distributions::{Distribution, Uniform};
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use rand_xorshift::XorShiftRng;

use super::{candidate_items, select_top, to_external, user_vector, Factors, RecommendParams, UpdateFlags};
use crate::data::InteractionStore;
use crate::{ExternalId, IncrementalModel, ItemId, PredictionError, UserId};

/// Hyperparameters describing the ISGD model.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Hyperparameters {
    num_factors: usize,
    num_iterations: usize,
    learning_rate: f32,
    user_regularization: f32,
    item_regularization: f32,
    seed: u64,
}

impl Default for Hyperparameters {
    fn default() -> Self {
        Hyperparameters::new()
    }
}

impl Hyperparameters {
    /// Build new hyperparameters.
    pub fn new() -> Self {
        Hyperparameters {
            num_factors: 10,
            num_iterations: 10,
            learning_rate: 0.01,
            user_regularization: 0.1,
            item_regularization: 0.1,
            seed: 1,
        }
    }

    /// Set the number of latent factors.
    pub fn num_factors(mut self, num_factors: usize) -> Self {
        self.num_factors = num_factors;
        self
    }

    /// Set the number of gradient rounds per update step.
    pub fn num_iterations(mut self, num_iterations: usize) -> Self {
        self.num_iterations = num_iterations;
        self
    }

    /// Set the learning rate.
    pub fn learning_rate(mut self, learning_rate: f32) -> Self {
        self.learning_rate = learning_rate;
        self
    }

    /// Set the user factor regularization.
    pub fn user_regularization(mut self, user_regularization: f32) -> Self {
        self.user_regularization = user_regularization;
        self
    }

    /// Set the item factor regularization.
    pub fn item_regularization(mut self, item_regularization: f32) -> Self {
        self.item_regularization = item_regularization;
        self
    }

    /// Set the random seed.
    pub fn seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// Set hyperparameters randomly: useful for hyperparameter search.
    pub fn random<R: Rng>(rng: &mut R) -> Self {
        Hyperparameters {
            num_factors: 2_usize.pow(Uniform::new(2, 8).sample(rng)),
            num_iterations: Uniform::new(1, 20).sample(rng),
            learning_rate: (10.0_f32).powf(Uniform::new(-3.0, -0.5).sample(rng)),
            user_regularization: (10.0_f32).powf(Uniform::new(-4.0, 0.0).sample(rng)),
            item_regularization: (10.0_f32).powf(Uniform::new(-4.0, 0.0).sample(rng)),
            seed: rng.gen(),
        }
    }

    /// Build the model on top of `data`, with factors for every id it
    /// already holds.
    pub fn build<U: ExternalId, I: ExternalId>(self, data: InteractionStore<U, I>) -> ISGDModel<U, I> {
        let mut rng = XorShiftRng::seed_from_u64(self.seed);
        let user_factors = Factors::new(data.num_users(), self.num_factors, &mut rng);
        let item_factors = Factors::new(data.num_items(), self.num_factors, &mut rng);

        ISGDModel {
            hyper: self,
            data,
            user_factors,
            item_factors,
            rng,
        }
    }
}

/// Incremental SGD matrix factorization model.
#[derive(Clone, Debug)]
pub struct ISGDModel<U, I> {
    hyper: Hyperparameters,
    data: InteractionStore<U, I>,
    user_factors: Factors,
    item_factors: Factors,
    rng: XorShiftRng,
}

impl<U: ExternalId, I: ExternalId> ISGDModel<U, I> {
    /// The model's hyperparameters.
    pub fn hyperparameters(&self) -> &Hyperparameters {
        &self.hyper
    }

    /// Record `(user, item)` and update with explicit flags.
    pub fn incr_train_with(&mut self, user: U, item: I, flags: UpdateFlags) {
        let (user_id, item_id) = self.record(user, item);

        if flags.users || flags.items {
            for _ in 0..flags.n_times {
                self.update_factors(user_id, item_id, flags.users, flags.items, 1.0);
            }
        }
    }

    /// Add the feedback to the store and make sure both ids have factors.
    pub(crate) fn record(&mut self, user: U, item: I) -> (UserId, ItemId) {
        let (user_id, item_id) = self.data.add_feedback(user, item);

        self.user_factors.ensure_capacity(user_id, &mut self.rng);
        self.item_factors.ensure_capacity(item_id, &mut self.rng);

        (user_id, item_id)
    }

    pub(crate) fn rng(&mut self) -> &mut XorShiftRng {
        &mut self.rng
    }

    /// Move `p_u · q_i` towards `target`.
    pub(crate) fn update_factors(
        &mut self,
        user_id: UserId,
        item_id: ItemId,
        update_users: bool,
        update_items: bool,
        target: f32,
    ) {
        let learning_rate = self.hyper.learning_rate;
        let user_regularization = self.hyper.user_regularization;
        let item_regularization = self.hyper.item_regularization;

        let mut p_u = self.user_factors.row(user_id).clone();
        let mut q_i = self.item_factors.row(item_id).clone();

        for _ in 0..self.hyper.num_iterations {
            let err = target - p_u.dot(&q_i);

            if update_users {
                let delta = (&q_i * err - &p_u * user_regularization) * learning_rate;
                p_u += &delta;
            }

            if update_items {
                let delta = (&p_u * err - &q_i * item_regularization) * learning_rate;
                q_i += &delta;
            }
        }

        *self.user_factors.row_mut(user_id) = p_u;
        *self.item_factors.row_mut(item_id) = q_i;
    }
}

impl<U: ExternalId, I: ExternalId> IncrementalModel for ISGDModel<U, I> {
    type User = U;
    type Item = I;

    fn data(&self) -> &InteractionStore<U, I> {
        &self.data
    }

    fn incr_train(&mut self, user: U, item: I) {
        self.incr_train_with(user, item, UpdateFlags::default());
    }

    fn batch_train(&mut self) {
        let mut positions: Vec<usize> = (0..self.data.len()).collect();

        for _ in 0..self.hyper.num_iterations {
            positions.shuffle(&mut self.rng);

            for &position in &positions {
                if let Some((user_id, item_id)) = self.data.internal_tuple(position) {
                    self.update_factors(user_id, item_id, true, true, 1.0);
                }
            }
        }
    }

    fn predict(&self, user_id: UserId, item_id: ItemId) -> Result<f32, PredictionError> {
        let p_u = self
            .user_factors
            .get(user_id)
            .ok_or(PredictionError::UnknownUser(user_id))?;
        let q_i = self
            .item_factors
            .get(item_id)
            .ok_or(PredictionError::UnknownItem(item_id))?;

        let prediction = p_u.dot(q_i);

        if prediction.is_finite() {
            Ok(prediction)
        } else {
            Err(PredictionError::InvalidPredictionValue)
        }
    }

    fn recommend<R: Rng + ?Sized>(
        &self,
        user: &U,
        params: &RecommendParams,
        rng: &mut R,
    ) -> Vec<(I, f32)> {
        let (user_id, p_u) =
            match user_vector(&self.data, &self.user_factors, user, params.default_user, rng) {
                Some(resolved) => resolved,
                None => return Vec::new(),
            };

        let scores: Vec<(ItemId, f32)> = candidate_items(
            &self.data,
            self.item_factors.len(),
            user_id,
            params.exclude_known_items,
        )
        .into_iter()
        .map(|item_id| (item_id, (1.0 - p_u.dot(self.item_factors.row(item_id))).abs()))
        .collect();

        // Ascending: the smallest distance from the positive target wins.
        let ranked = select_top(scores, params.n, |a, b| {
            a.1.total_cmp(&b.1).then(a.0.cmp(&b.0))
        });

        to_external(&self.data, ranked)
    }

    fn reset_model(&mut self) {
        self.rng = XorShiftRng::seed_from_u64(self.hyper.seed);
        self.user_factors = Factors::new(
            self.data.num_users(),
            self.hyper.num_factors,
            &mut self.rng,
        );
        self.item_factors = Factors::new(
            self.data.num_items(),
            self.hyper.num_factors,
            &mut self.rng,
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::models::DefaultUser;

    fn model() -> ISGDModel<&'static str, &'static str> {
        let data = InteractionStore::new(vec!["a", "b", "b"], vec!["x", "y", "z"]).unwrap();

        Hyperparameters::new()
            .num_factors(2)
            .learning_rate(0.1)
            .seed(42)
            .build(data)
    }

    #[test]
    fn trained_item_ranks_by_ascending_distance() {
        let mut model = model();
        let mut rng = XorShiftRng::seed_from_u64(0);

        for _ in 0..20 {
            model.incr_train("u", "i");
        }

        let user_id = model.data().user_internal_id(&"u").unwrap();
        let item_id = model.data().item_internal_id(&"i").unwrap();
        let trained = (1.0 - model.predict(user_id, item_id).unwrap()).abs();
        let untouched = (1.0 - model.predict(user_id, 0).unwrap()).abs();
        assert!(trained < untouched);

        let recommendations = model.recommend(
            &"u",
            &RecommendParams::all().exclude_known_items(false),
            &mut rng,
        );

        assert_eq!(recommendations.len(), 4);
        assert_eq!(recommendations[0].0, "i");
        for pair in recommendations.windows(2) {
            assert!(pair[0].1 <= pair[1].1);
        }
    }

    #[test]
    fn top_n_keeps_the_smallest_scores() {
        let model = model();
        let mut rng = XorShiftRng::seed_from_u64(0);

        let all = model.recommend(&"b", &RecommendParams::all().exclude_known_items(false), &mut rng);
        let top = model.recommend(
            &"b",
            &RecommendParams::top(2).exclude_known_items(false),
            &mut rng,
        );

        assert_eq!(&all[..2], &top[..]);
    }

    #[test]
    fn factors_grow_with_new_ids() {
        let mut model = model();

        model.incr_train("new user", "new item");

        assert_eq!(model.user_factors.len(), model.data().num_users());
        assert_eq!(model.item_factors.len(), model.data().num_items());
        assert!(model.predict(2, 3).is_ok());
        assert!(model.predict(3, 0).is_err());
    }

    #[test]
    fn known_items_are_excluded() {
        let model = model();
        let mut rng = XorShiftRng::seed_from_u64(0);

        let recommendations = model.recommend(&"b", &RecommendParams::all(), &mut rng);

        assert_eq!(recommendations.len(), 1);
        assert_eq!(recommendations[0].0, "x");
    }

    #[test]
    fn unknown_users_follow_the_default_policy() {
        let model = model();
        let mut rng = XorShiftRng::seed_from_u64(0);

        assert!(model
            .recommend(&"nobody", &RecommendParams::all(), &mut rng)
            .is_empty());

        for &policy in &[DefaultUser::Random, DefaultUser::Average, DefaultUser::Median] {
            let recommendations = model.recommend(
                &"nobody",
                &RecommendParams::top(2).default_user(policy),
                &mut rng,
            );
            assert_eq!(recommendations.len(), 2);
        }
    }

    #[test]
    fn disabled_updates_leave_factors_alone() {
        let mut model = model();
        let before = model.clone();

        model.incr_train_with(
            "a",
            "x",
            UpdateFlags {
                users: false,
                items: false,
                n_times: 1,
            },
        );

        assert_eq!(model.user_factors, before.user_factors);
        assert_eq!(model.item_factors, before.item_factors);
        assert_eq!(model.data().len(), before.data().len() + 1);
    }

    #[test]
    fn reset_is_reproducible() {
        let mut model = model();
        let fresh = model.clone();

        model.incr_train("a", "y");
        model.batch_train();
        model.reset_model();

        assert_eq!(model.user_factors, fresh.user_factors);
        assert_eq!(model.item_factors, fresh.item_factors);
    }
}
