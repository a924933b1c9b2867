//! Incremental user-based nearest neighbours.
//!
//! The model keeps a co-occurrence count `f(u, v)` for every pair of users
//! (with `f(u, u)` the number of interactions of `u`), the cosine similarity
//! derived from it, and a list of the `k` most similar other users per user.
//!
//! Neighbour lists are recomputed eagerly inside `incr_train`: first the
//! acting user's own list, then the lists of every user that currently
//! counts the acting user as a neighbour, and those of the acting user's new
//! neighbours.
use std::collections::HashSet;

use itertools::Itertools;
use rand::Rng;

use super::{candidate_items, select_top, to_external, RecommendParams};
use crate::data::InteractionStore;
use crate::matrix::SymmetricMatrix;
use crate::{ExternalId, IncrementalModel, ItemId, PredictionError, UserId};

/// Hyperparameters describing the UserKNN model.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Hyperparameters {
    k: usize,
}

impl Default for Hyperparameters {
    fn default() -> Self {
        Hyperparameters::new()
    }
}

impl Hyperparameters {
    /// Build new hyperparameters.
    pub fn new() -> Self {
        Hyperparameters { k: 10 }
    }

    /// Set the neighbourhood size.
    pub fn k(mut self, k: usize) -> Self {
        self.k = k;
        self
    }

    /// Set hyperparameters randomly: useful for hyperparameter search.
    pub fn random<R: Rng>(rng: &mut R) -> Self {
        Hyperparameters {
            k: rng.gen_range(5..100),
        }
    }

    /// Build the model. Existing interactions in `data` only count after
    /// a call to [`IncrementalModel::batch_train`].
    pub fn build<U: ExternalId, I: ExternalId>(self, data: InteractionStore<U, I>) -> UserKNNModel<U, I> {
        let mut model = UserKNNModel {
            hyper: self,
            data,
            user_freq: SymmetricMatrix::default(),
            user_sim: SymmetricMatrix::default(),
            neighbors: Vec::new(),
        };
        model.reset_model();

        model
    }
}

/// Incremental user-based KNN model.
#[derive(Clone, Debug)]
pub struct UserKNNModel<U, I> {
    hyper: Hyperparameters,
    data: InteractionStore<U, I>,
    user_freq: SymmetricMatrix,
    user_sim: SymmetricMatrix,
    neighbors: Vec<Vec<(UserId, f32)>>,
}

fn cosine(f_uv: f32, f_u: f32, f_v: f32) -> f32 {
    if f_uv == 0.0 {
        0.0
    } else {
        f_uv / (f_u * f_v).sqrt()
    }
}

impl<U: ExternalId, I: ExternalId> UserKNNModel<U, I> {
    /// The model's hyperparameters.
    pub fn hyperparameters(&self) -> &Hyperparameters {
        &self.hyper
    }

    /// Current neighbours of `user_id`, most similar first.
    pub fn neighbors(&self, user_id: UserId) -> &[(UserId, f32)] {
        self.neighbors
            .get(user_id)
            .map(|neighbors| neighbors.as_slice())
            .unwrap_or(&[])
    }

    /// Cosine similarity between two internal user ids.
    pub fn similarity(&self, u: UserId, v: UserId) -> f32 {
        self.user_sim.get(u, v)
    }

    /// Co-occurrence count between two internal user ids.
    pub fn frequency(&self, u: UserId, v: UserId) -> f32 {
        self.user_freq.get(u, v)
    }

    fn ensure_capacity(&mut self, user_id: UserId) {
        let num_users = self.data.num_users().max(user_id + 1);

        self.user_freq.ensure_dim(num_users);
        self.user_sim.ensure_dim(num_users);
        if self.neighbors.len() < num_users {
            self.neighbors.resize_with(num_users, Vec::new);
        }
    }

    fn update_similarity_row(&mut self, u: UserId) {
        let f_u = self.user_freq.get(u, u);

        for v in (0..self.data.num_users()).filter(|&v| v != u) {
            let similarity = cosine(self.user_freq.get(u, v), f_u, self.user_freq.get(v, v));
            self.user_sim.set(u, v, similarity);
        }
    }

    /// The `k` most similar other users with positive similarity.
    fn compute_neighbors(&self, u: UserId) -> Vec<(UserId, f32)> {
        let candidates: Vec<(UserId, f32)> = (0..self.data.num_users())
            .filter(|&v| v != u)
            .map(|v| (v, self.user_sim.get(u, v)))
            .filter(|&(_, similarity)| similarity > 0.0)
            .collect();

        select_top(candidates, Some(self.hyper.k), |a, b| {
            b.1.total_cmp(&a.1).then(a.0.cmp(&b.0))
        })
    }

    fn update_neighbors(&mut self, u: UserId) {
        self.neighbors[u] = self.compute_neighbors(u);

        let mut affected: Vec<UserId> = self
            .neighbors
            .iter()
            .enumerate()
            .filter(|&(v, neighbors)| v != u && neighbors.iter().any(|&(w, _)| w == u))
            .map(|(v, _)| v)
            .chain(self.neighbors[u].iter().map(|&(v, _)| v))
            .collect();
        affected.sort_unstable();
        affected.dedup();

        trace!(user_id = u, affected = affected.len(), "propagating neighbourhoods");

        for v in affected {
            self.neighbors[v] = self.compute_neighbors(v);
        }
    }
}

impl<U: ExternalId, I: ExternalId> IncrementalModel for UserKNNModel<U, I> {
    type User = U;
    type Item = I;

    fn data(&self) -> &InteractionStore<U, I> {
        &self.data
    }

    fn incr_train(&mut self, user: U, item: I) {
        let (u, i) = self.data.add_feedback(user, item);
        self.ensure_capacity(u);

        self.user_freq.increment_diag(u);
        for &v in self.data.item_users(i) {
            if v != u {
                self.user_freq.increment(u, v);
            }
        }

        self.update_similarity_row(u);
        self.update_neighbors(u);
    }

    fn batch_train(&mut self) {
        self.reset_model();

        for item_id in 0..self.data.num_items() {
            let users = self.data.item_users(item_id);

            for &u in users {
                self.user_freq.increment_diag(u);
            }

            for (&u, &v) in users.iter().tuple_combinations() {
                if u != v {
                    self.user_freq.increment(u, v);
                }
            }
        }

        let num_users = self.data.num_users();
        for (u, v) in (0..num_users).tuple_combinations() {
            let similarity = cosine(
                self.user_freq.get(u, v),
                self.user_freq.get(u, u),
                self.user_freq.get(v, v),
            );
            self.user_sim.set(u, v, similarity);
        }

        self.neighbors = (0..num_users).map(|u| self.compute_neighbors(u)).collect();
    }

    fn predict(&self, user_id: UserId, item_id: ItemId) -> Result<f32, PredictionError> {
        let neighbors = self
            .neighbors
            .get(user_id)
            .ok_or(PredictionError::UnknownUser(user_id))?;
        if item_id >= self.data.num_items() {
            return Err(PredictionError::UnknownItem(item_id));
        }

        let (score, norm) = neighbors
            .iter()
            .fold((0.0, 0.0), |(score, norm), &(v, similarity)| {
                if self.data.user_items(v).contains(&item_id) {
                    (score + similarity, norm + similarity)
                } else {
                    (score, norm + similarity)
                }
            });

        if norm == 0.0 {
            Ok(0.0)
        } else {
            Ok(score / norm)
        }
    }

    /// Unknown users always get an empty list: there are no neighbours to
    /// borrow from, whatever the cold-start policy.
    fn recommend<R: Rng + ?Sized>(
        &self,
        user: &U,
        params: &RecommendParams,
        _rng: &mut R,
    ) -> Vec<(I, f32)> {
        let user_id = match self.data.user_internal_id(user) {
            Some(user_id) if user_id < self.neighbors.len() => user_id,
            _ => return Vec::new(),
        };

        let num_items = self.data.num_items();
        let mut scores = vec![0.0_f32; num_items];
        let mut norm = 0.0_f32;

        for &(v, similarity) in &self.neighbors[user_id] {
            let items: HashSet<ItemId> = self.data.user_items(v).iter().cloned().collect();
            for item_id in items {
                scores[item_id] += similarity;
            }
            norm += similarity;
        }

        let scored: Vec<(ItemId, f32)> =
            candidate_items(&self.data, num_items, Some(user_id), params.exclude_known_items)
                .into_iter()
                .map(|item_id| {
                    let score = if norm == 0.0 { 0.0 } else { scores[item_id] / norm };
                    (item_id, score)
                })
                .collect();

        let ranked = select_top(scored, params.n, |a, b| {
            b.1.total_cmp(&a.1).then(a.0.cmp(&b.0))
        });

        to_external(&self.data, ranked)
    }

    fn reset_model(&mut self) {
        let num_users = self.data.num_users();

        self.user_freq = SymmetricMatrix::new(num_users);
        self.user_sim = SymmetricMatrix::new(num_users);
        self.neighbors = vec![Vec::new(); num_users];
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use rand::SeedableRng;
    use rand_xorshift::XorShiftRng;

    use crate::models::DefaultUser;

    fn replay(k: usize, log: &[(&'static str, &'static str)]) -> UserKNNModel<&'static str, &'static str> {
        let mut model = Hyperparameters::new().k(k).build(InteractionStore::empty());

        for &(user, item) in log {
            model.incr_train(user, item);
        }

        model
    }

    const LOG: &[(&str, &str)] = &[
        ("a", "x"),
        ("a", "y"),
        ("b", "x"),
        ("b", "y"),
        ("b", "z"),
        ("c", "w"),
    ];

    #[test]
    fn counts_and_cosine() {
        let model = replay(2, LOG);

        assert_eq!(model.frequency(0, 0), 2.0);
        assert_eq!(model.frequency(1, 1), 3.0);
        assert_eq!(model.frequency(0, 1), 2.0);
        assert_eq!(model.frequency(0, 2), 0.0);

        assert!((model.similarity(0, 1) - 2.0 / 6.0_f32.sqrt()).abs() < 1e-6);
        assert_eq!(model.similarity(1, 0), model.similarity(0, 1));
        assert_eq!(model.similarity(2, 0), 0.0);

        assert_eq!(model.neighbors(0).len(), 1);
        assert_eq!(model.neighbors(0)[0].0, 1);
        assert!(model.neighbors(2).is_empty());
    }

    #[test]
    fn predict_normalizes_by_all_neighbours() {
        let model = replay(2, LOG);

        // a's only neighbour b knows z but not w.
        assert_eq!(model.predict(0, 2).unwrap(), 1.0);
        assert_eq!(model.predict(0, 3).unwrap(), 0.0);
        // c has no neighbours at all.
        assert_eq!(model.predict(2, 0).unwrap(), 0.0);

        assert!(model.predict(3, 0).is_err());
        assert!(model.predict(0, 4).is_err());
    }

    #[test]
    fn recommend_descending_without_known_items() {
        let model = replay(2, LOG);
        let mut rng = XorShiftRng::seed_from_u64(0);

        let recommendations = model.recommend(&"a", &RecommendParams::all(), &mut rng);
        assert_eq!(recommendations, vec![("z", 1.0), ("w", 0.0)]);

        // All zero: ties are broken by internal id.
        let recommendations = model.recommend(&"c", &RecommendParams::top(2), &mut rng);
        assert_eq!(recommendations, vec![("x", 0.0), ("y", 0.0)]);
    }

    #[test]
    fn unknown_users_get_nothing() {
        let model = replay(2, LOG);
        let mut rng = XorShiftRng::seed_from_u64(0);

        let params = RecommendParams::all().default_user(DefaultUser::Average);
        assert!(model.recommend(&"nobody", &params, &mut rng).is_empty());
    }

    #[test]
    fn propagation_refreshes_stale_neighbourhoods() {
        let model = replay(
            1,
            &[("a", "x"), ("b", "x"), ("c", "x"), ("b", "y"), ("b", "z")],
        );

        // b's extra items dilute its similarity to a, so a now prefers c.
        assert_eq!(model.neighbors(0), &[(2, 1.0)]);
        assert_eq!(model.neighbors(2), &[(0, 1.0)]);
    }

    #[test]
    fn batch_matches_incremental_counts() {
        let incremental = replay(2, LOG);

        let users: Vec<&str> = LOG.iter().map(|&(user, _)| user).collect();
        let items: Vec<&str> = LOG.iter().map(|&(_, item)| item).collect();
        let mut batch = Hyperparameters::new()
            .k(2)
            .build(InteractionStore::new(users, items).unwrap());

        assert_eq!(batch.predict(0, 2).unwrap(), 0.0);
        batch.batch_train();

        for u in 0..3 {
            for v in 0..3 {
                let (eu, ev) = (
                    incremental.data().user_external_id(u).unwrap(),
                    incremental.data().user_external_id(v).unwrap(),
                );
                let (bu, bv) = (
                    batch.data().user_internal_id(eu).unwrap(),
                    batch.data().user_internal_id(ev).unwrap(),
                );

                assert_eq!(incremental.frequency(u, v), batch.frequency(bu, bv));
                assert_eq!(incremental.similarity(u, v), batch.similarity(bu, bv));
            }
        }
    }

    #[test]
    fn duplicate_interactions_count_twice() {
        let model = replay(2, &[("a", "x"), ("b", "x"), ("b", "x")]);

        assert_eq!(model.frequency(1, 1), 2.0);
        assert_eq!(model.frequency(0, 1), 2.0);
    }
}
