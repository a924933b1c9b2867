//! Incremental Bayesian Personalized Ranking matrix factorization.
//!
//! Each positive `(u, i)` is paired with one item `j` sampled uniformly from
//! the items `u` has not interacted with, and the factors are moved to
//! increase `x_ui - x_uj`. Items are ranked by descending `p_u · q_i`.
//!
//! Reference: Rendle et al., *BPR: Bayesian personalized ranking from
//! implicit feedback*, UAI 2009.
use std::collections::HashSet;

use rand::distributions::{Distribution, Uniform};
use rand::seq::{IteratorRandom, SliceRandom};
use rand::{Rng, SeedableRng};
use rand_xorshift::XorShiftRng;

use super::{candidate_items, select_top, to_external, user_vector, Factors, RecommendParams, UpdateFlags};
use crate::data::InteractionStore;
use crate::{ExternalId, IncrementalModel, ItemId, PredictionError, UserId};

/// Hyperparameters describing the BPRMF model.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Hyperparameters {
    num_factors: usize,
    num_iterations: usize,
    learning_rate: f32,
    user_regularization: f32,
    item_regularization: f32,
    negative_item_regularization: f32,
    update_negative_items: bool,
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
            negative_item_regularization: 0.1,
            update_negative_items: false,
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

    /// Set the positive item regularization.
    pub fn item_regularization(mut self, item_regularization: f32) -> Self {
        self.item_regularization = item_regularization;
        self
    }

    /// Set the negative item regularization.
    pub fn negative_item_regularization(mut self, negative_item_regularization: f32) -> Self {
        self.negative_item_regularization = negative_item_regularization;
        self
    }

    /// Whether the sampled negative item's factors are updated too.
    pub fn update_negative_items(mut self, update_negative_items: bool) -> Self {
        self.update_negative_items = update_negative_items;
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
            negative_item_regularization: (10.0_f32).powf(Uniform::new(-4.0, 0.0).sample(rng)),
            update_negative_items: rng.gen(),
            seed: rng.gen(),
        }
    }

    /// Build the model.
    pub fn build<U: ExternalId, I: ExternalId>(self, data: InteractionStore<U, I>) -> BPRMFModel<U, I> {
        let mut rng = XorShiftRng::seed_from_u64(self.seed);
        let user_factors = Factors::new(data.num_users(), self.num_factors, &mut rng);
        let item_factors = Factors::new(data.num_items(), self.num_factors, &mut rng);

        BPRMFModel {
            hyper: self,
            data,
            user_factors,
            item_factors,
            rng,
        }
    }
}

/// Incremental BPR matrix factorization model.
#[derive(Clone, Debug)]
pub struct BPRMFModel<U, I> {
    hyper: Hyperparameters,
    data: InteractionStore<U, I>,
    user_factors: Factors,
    item_factors: Factors,
    rng: XorShiftRng,
}

fn sigmoid_complement(x: f32) -> f32 {
    1.0 / (1.0 + x.exp())
}

impl<U: ExternalId, I: ExternalId> BPRMFModel<U, I> {
    /// The model's hyperparameters.
    pub fn hyperparameters(&self) -> &Hyperparameters {
        &self.hyper
    }

    /// Record `(user, item)` and update with explicit flags.
    ///
    /// Only the store changes when the user already knows every item.
    pub fn incr_train_with(&mut self, user: U, item: I, flags: UpdateFlags) {
        let (user_id, item_id) = self.data.add_feedback(user, item);

        self.user_factors.ensure_capacity(user_id, &mut self.rng);
        self.item_factors.ensure_capacity(item_id, &mut self.rng);

        if !(flags.users || flags.items) {
            return;
        }

        if let Some(negative_item_id) = self.sample_negative(user_id) {
            for _ in 0..flags.n_times {
                self.update_factors(user_id, item_id, negative_item_id, flags.users, flags.items);
            }
        }
    }

    fn sample_negative(&mut self, user_id: UserId) -> Option<ItemId> {
        let known: HashSet<ItemId> = self.data.user_items(user_id).iter().cloned().collect();

        (0..self.data.num_items())
            .filter(|item_id| !known.contains(item_id))
            .choose(&mut self.rng)
    }

    fn update_factors(
        &mut self,
        user_id: UserId,
        item_id: ItemId,
        negative_item_id: ItemId,
        update_users: bool,
        update_items: bool,
    ) {
        let learning_rate = self.hyper.learning_rate;
        let update_negative_items = self.hyper.update_negative_items;

        let mut p_u = self.user_factors.row(user_id).clone();
        let mut q_i = self.item_factors.row(item_id).clone();
        let mut q_j = self.item_factors.row(negative_item_id).clone();

        for _ in 0..self.hyper.num_iterations {
            let x_uij = p_u.dot(&q_i) - p_u.dot(&q_j);
            let sigmoid = sigmoid_complement(x_uij);

            if update_users {
                let delta = ((&q_i - &q_j) * sigmoid - &p_u * self.hyper.user_regularization)
                    * learning_rate;
                p_u += &delta;
            }

            if update_items {
                let delta = (&p_u * sigmoid - &q_i * self.hyper.item_regularization) * learning_rate;
                q_i += &delta;
            }

            if update_negative_items {
                let delta = (&p_u * -sigmoid - &q_j * self.hyper.negative_item_regularization)
                    * learning_rate;
                q_j += &delta;
            }
        }

        *self.user_factors.row_mut(user_id) = p_u;
        *self.item_factors.row_mut(item_id) = q_i;
        *self.item_factors.row_mut(negative_item_id) = q_j;
    }
}

impl<U: ExternalId, I: ExternalId> IncrementalModel for BPRMFModel<U, I> {
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
                    if let Some(negative_item_id) = self.sample_negative(user_id) {
                        self.update_factors(user_id, item_id, negative_item_id, true, true);
                    }
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
        .map(|item_id| (item_id, p_u.dot(self.item_factors.row(item_id))))
        .collect();

        let ranked = select_top(scores, params.n, |a, b| {
            b.1.total_cmp(&a.1).then(a.0.cmp(&b.0))
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
