//! Models module.
use std::cmp::Ordering;
use std::collections::HashSet;
use std::str::FromStr;

use ndarray::Array1;
use rand::Rng;
use rand_distr::StandardNormal;

use crate::data::InteractionStore;
use crate::{DataError, ExternalId, ItemId, UserId};

pub mod bprmf;
pub mod isgd;
pub mod rsisgd;
pub mod user_knn;

/// Standard deviation of freshly initialized factors.
const INIT_STD: f32 = 0.1;

/// How to represent a user the model has never seen.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DefaultUser {
    /// Make no recommendation.
    None,
    /// Draw a fresh random representation.
    Random,
    /// Use the mean of all known user representations.
    Average,
    /// Use the per-dimension median of all known user representations.
    Median,
}

impl Default for DefaultUser {
    fn default() -> Self {
        DefaultUser::None
    }
}

impl FromStr for DefaultUser {
    type Err = DataError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "none" => Ok(DefaultUser::None),
            "random" => Ok(DefaultUser::Random),
            "average" => Ok(DefaultUser::Average),
            "median" => Ok(DefaultUser::Median),
            other => Err(DataError::InvalidConfig(format!(
                "unknown default user policy `{}`",
                other
            ))),
        }
    }
}

/// Parameters of a single `recommend` call.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq)]
pub struct RecommendParams {
    /// Maximum number of items returned; `None` ranks every candidate.
    pub n: Option<usize>,
    /// Drop items the user already interacted with.
    pub exclude_known_items: bool,
    /// Cold-start policy for unknown users.
    pub default_user: DefaultUser,
}

impl Default for RecommendParams {
    fn default() -> Self {
        RecommendParams {
            n: None,
            exclude_known_items: true,
            default_user: DefaultUser::None,
        }
    }
}

impl RecommendParams {
    /// Rank every candidate item.
    pub fn all() -> Self {
        RecommendParams::default()
    }

    /// Return at most `n` items.
    pub fn top(n: usize) -> Self {
        RecommendParams {
            n: Some(n),
            ..RecommendParams::default()
        }
    }

    /// Set whether known items are excluded.
    pub fn exclude_known_items(mut self, exclude_known_items: bool) -> Self {
        self.exclude_known_items = exclude_known_items;
        self
    }

    /// Set the cold-start policy.
    pub fn default_user(mut self, default_user: DefaultUser) -> Self {
        self.default_user = default_user;
        self
    }
}

/// Which factors an incremental update may touch, and how many times the
/// update is repeated.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct UpdateFlags {
    /// Update the user's factors.
    pub users: bool,
    /// Update the item's factors.
    pub items: bool,
    /// Number of repetitions of the update step.
    pub n_times: usize,
}

impl Default for UpdateFlags {
    fn default() -> Self {
        UpdateFlags {
            users: true,
            items: true,
            n_times: 1,
        }
    }
}

fn random_factors<R: Rng + ?Sized>(num_factors: usize, rng: &mut R) -> Array1<f32> {
    (0..num_factors)
        .map(|_| {
            let z: f32 = rng.sample(StandardNormal);
            z * INIT_STD
        })
        .collect()
}

fn median(values: &mut [f32]) -> f32 {
    values.sort_by(|a, b| a.total_cmp(b));

    let mid = values.len() / 2;
    if values.len() % 2 == 0 {
        (values[mid - 1] + values[mid]) / 2.0
    } else {
        values[mid]
    }
}

/// Arena of per-entity factor vectors, indexed by internal id.
#[derive(Clone, Debug, PartialEq)]
pub(crate) struct Factors {
    num_factors: usize,
    rows: Vec<Array1<f32>>,
}

impl Factors {
    pub(crate) fn new<R: Rng + ?Sized>(len: usize, num_factors: usize, rng: &mut R) -> Self {
        let mut factors = Factors {
            num_factors,
            rows: Vec::with_capacity(len),
        };
        factors.ensure_len(len, rng);

        factors
    }

    /// Allocate normally initialized rows until `id` has storage.
    pub(crate) fn ensure_capacity<R: Rng + ?Sized>(&mut self, id: usize, rng: &mut R) {
        self.ensure_len(id + 1, rng);
    }

    fn ensure_len<R: Rng + ?Sized>(&mut self, len: usize, rng: &mut R) {
        while self.rows.len() < len {
            self.rows.push(random_factors(self.num_factors, rng));
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.rows.len()
    }

    pub(crate) fn get(&self, id: usize) -> Option<&Array1<f32>> {
        self.rows.get(id)
    }

    pub(crate) fn row(&self, id: usize) -> &Array1<f32> {
        &self.rows[id]
    }

    pub(crate) fn row_mut(&mut self, id: usize) -> &mut Array1<f32> {
        &mut self.rows[id]
    }

    /// A representation for a user without factors, or `None` when the
    /// policy declines to make one.
    pub(crate) fn synthesize<R: Rng + ?Sized>(
        &self,
        policy: DefaultUser,
        rng: &mut R,
    ) -> Option<Array1<f32>> {
        match policy {
            DefaultUser::None => None,
            DefaultUser::Random => Some(random_factors(self.num_factors, rng)),
            DefaultUser::Average => {
                if self.rows.is_empty() {
                    return None;
                }

                let mut sum = Array1::zeros(self.num_factors);
                for row in &self.rows {
                    sum += row;
                }

                Some(sum / self.rows.len() as f32)
            }
            DefaultUser::Median => {
                if self.rows.is_empty() {
                    return None;
                }

                let mut column = Vec::with_capacity(self.rows.len());

                Some(
                    (0..self.num_factors)
                        .map(|dim| {
                            column.clear();
                            column.extend(self.rows.iter().map(|row| row[dim]));
                            median(&mut column)
                        })
                        .collect(),
                )
            }
        }
    }
}

/// Resolve the factor vector used to score items for `user`.
///
/// Returns the user's internal id when the user is known, together with the
/// vector; unknown users go through the cold-start policy.
pub(crate) fn user_vector<U, I, R>(
    data: &InteractionStore<U, I>,
    user_factors: &Factors,
    user: &U,
    policy: DefaultUser,
    rng: &mut R,
) -> Option<(Option<UserId>, Array1<f32>)>
where
    U: ExternalId,
    I: ExternalId,
    R: Rng + ?Sized,
{
    match data.user_internal_id(user) {
        Some(user_id) => user_factors
            .get(user_id)
            .map(|factors| (Some(user_id), factors.clone())),
        None => user_factors
            .synthesize(policy, rng)
            .map(|factors| (None, factors)),
    }
}

/// Item ids eligible for recommendation to `user_id`.
pub(crate) fn candidate_items<U: ExternalId, I: ExternalId>(
    data: &InteractionStore<U, I>,
    num_items: usize,
    user_id: Option<UserId>,
    exclude_known_items: bool,
) -> Vec<ItemId> {
    let known: HashSet<ItemId> = match user_id {
        Some(user_id) if exclude_known_items => data.user_items(user_id).iter().cloned().collect(),
        _ => HashSet::new(),
    };

    (0..num_items).filter(|item_id| !known.contains(item_id)).collect()
}

/// Keep the first `n` elements of `candidates` under `cmp`, in order.
///
/// Uses a partial selection before sorting, so ranking all items costs a
/// full sort only when `n` is `None`.
pub(crate) fn select_top<T, F>(mut candidates: Vec<T>, n: Option<usize>, cmp: F) -> Vec<T>
where
    F: Fn(&T, &T) -> Ordering,
{
    if let Some(n) = n {
        if n == 0 {
            return Vec::new();
        }

        if n < candidates.len() {
            candidates.select_nth_unstable_by(n - 1, &cmp);
            candidates.truncate(n);
        }
    }

    candidates.sort_by(&cmp);
    candidates
}

/// Attach external ids to ranked internal item ids.
pub(crate) fn to_external<U: ExternalId, I: ExternalId>(
    data: &InteractionStore<U, I>,
    ranked: Vec<(ItemId, f32)>,
) -> Vec<(I, f32)> {
    ranked
        .into_iter()
        .filter_map(|(item_id, score)| {
            data.item_external_id(item_id)
                .map(|item| (item.clone(), score))
        })
        .collect()
}
