//! Square symmetric matrix over internal user ids.
use crate::UserId;

/// A symmetric matrix stored as its packed lower triangle.
///
/// Entry `(u, v)` and entry `(v, u)` share one slot, so they can never
/// disagree. Row `r` occupies slots `r * (r + 1) / 2 ..= r * (r + 1) / 2 + r`,
/// which means growing the dimension only appends to the backing vector.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct SymmetricMatrix {
    dim: usize,
    values: Vec<f32>,
}

fn slot(u: UserId, v: UserId) -> usize {
    let (row, col) = if u >= v { (u, v) } else { (v, u) };
    row * (row + 1) / 2 + col
}

impl SymmetricMatrix {
    /// A zero matrix of dimension `dim`.
    pub fn new(dim: usize) -> Self {
        SymmetricMatrix {
            dim,
            values: vec![0.0; dim * (dim + 1) / 2],
        }
    }

    /// Current dimension.
    pub fn dim(&self) -> usize {
        self.dim
    }

    /// Grow to at least `dim` rows, zero-filling new entries.
    pub fn ensure_dim(&mut self, dim: usize) {
        if dim > self.dim {
            self.dim = dim;
            self.values.resize(dim * (dim + 1) / 2, 0.0);
        }
    }

    /// Entry `(u, v)`; zero outside the current dimension.
    pub fn get(&self, u: UserId, v: UserId) -> f32 {
        if u >= self.dim || v >= self.dim {
            return 0.0;
        }

        self.values[slot(u, v)]
    }

    /// Overwrite entry `(u, v)` (and so `(v, u)`).
    pub fn set(&mut self, u: UserId, v: UserId, value: f32) {
        self.ensure_dim(u.max(v) + 1);
        self.values[slot(u, v)] = value;
    }

    /// Add one to the pair count `(u, v)`.
    pub fn increment(&mut self, u: UserId, v: UserId) {
        self.ensure_dim(u.max(v) + 1);
        self.values[slot(u, v)] += 1.0;
    }

    /// Add one to `u`'s own count.
    pub fn increment_diag(&mut self, u: UserId) {
        self.increment(u, u);
    }

    /// Entries `(u, 0..dim)`, including the diagonal.
    pub fn row(&self, u: UserId) -> Vec<f32> {
        (0..self.dim).map(|v| self.get(u, v)).collect()
    }
}
