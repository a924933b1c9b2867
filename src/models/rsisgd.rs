//! ISGD with recency-based negative feedback (RSISGD).
//!
//! Before each positive update, `ra_length` items the user has never
//! interacted with are drawn uniformly at random and used as negative
//! examples with target 0. Negative steps only move the user's factors.
//! They are skipped while the user knows all but `ra_length` items or more.
use std::collections::HashSet;

use rand::Rng;

use super::isgd::{self, ISGDModel};
use super::RecommendParams;
use crate::data::InteractionStore;
use crate::{ExternalId, IncrementalModel, ItemId, PredictionError, UserId};

/// Hyperparameters describing the RSISGD model.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Hyperparameters {
    #[serde(flatten)]
    isgd: isgd::Hyperparameters,
    ra_length: usize,
}

impl Default for Hyperparameters {
    fn default() -> Self {
        Hyperparameters::new()
    }
}

impl Hyperparameters {
    /// Build new hyperparameters: ISGD defaults and one negative per update.
    pub fn new() -> Self {
        Hyperparameters {
            isgd: isgd::Hyperparameters::new(),
            ra_length: 1,
        }
    }

    /// Set the underlying factorization hyperparameters.
    pub fn isgd(mut self, isgd: isgd::Hyperparameters) -> Self {
        self.isgd = isgd;
        self
    }

    /// Set the number of negative items sampled per update.
    pub fn ra_length(mut self, ra_length: usize) -> Self {
        self.ra_length = ra_length;
        self
    }

    /// Set hyperparameters randomly: useful for hyperparameter search.
    pub fn random<R: Rng>(rng: &mut R) -> Self {
        Hyperparameters {
            isgd: isgd::Hyperparameters::random(rng),
            ra_length: rng.gen_range(1..5),
        }
    }

    /// Build the model.
    pub fn build<U: ExternalId, I: ExternalId>(self, data: InteractionStore<U, I>) -> RSISGDModel<U, I> {
        RSISGDModel {
            model: self.isgd.build(data),
            ra_length: self.ra_length,
        }
    }
}

/// ISGD with sampled negative feedback.
#[derive(Clone, Debug)]
pub struct RSISGDModel<U, I> {
    model: ISGDModel<U, I>,
    ra_length: usize,
}

impl<U: ExternalId, I: ExternalId> RSISGDModel<U, I> {
    /// Number of negatives sampled per update.
    pub fn ra_length(&self) -> usize {
        self.ra_length
    }

    /// The wrapped factorization.
    pub fn inner(&self) -> &ISGDModel<U, I> {
        &self.model
    }

    fn sample_negatives(&mut self, user_id: UserId) -> Vec<ItemId> {
        let num_items = self.model.data().num_items();
        let known: HashSet<ItemId> = self.model.data().user_items(user_id).iter().cloned().collect();

        if known.len() + self.ra_length >= num_items {
            return Vec::new();
        }

        // At least `ra_length` unknown items exist, so rejection terminates.
        let rng = self.model.rng();
        (0..self.ra_length)
            .map(|_| loop {
                let item_id = rng.gen_range(0..num_items);
                if !known.contains(&item_id) {
                    break item_id;
                }
            })
            .collect()
    }
}

impl<U: ExternalId, I: ExternalId> IncrementalModel for RSISGDModel<U, I> {
    type User = U;
    type Item = I;

    fn data(&self) -> &InteractionStore<U, I> {
        self.model.data()
    }

    fn incr_train(&mut self, user: U, item: I) {
        let (user_id, item_id) = self.model.record(user, item);

        for negative in self.sample_negatives(user_id) {
            self.model.update_factors(user_id, negative, true, false, 0.0);
        }

        self.model.update_factors(user_id, item_id, true, true, 1.0);
    }

    fn batch_train(&mut self) {
        self.model.batch_train();
    }

    fn predict(&self, user_id: UserId, item_id: ItemId) -> Result<f32, PredictionError> {
        self.model.predict(user_id, item_id)
    }

    fn recommend<R: Rng + ?Sized>(
        &self,
        user: &U,
        params: &RecommendParams,
        rng: &mut R,
    ) -> Vec<(I, f32)> {
        self.model.recommend(user, params, rng)
    }

    fn reset_model(&mut self) {
        self.model.reset_model();
    }
}
