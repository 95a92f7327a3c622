//! Markov-style operation mixes.
//!
//! A [`MixMatrix`] holds, for every operation type, the probabilities of which operation follows
//! it. Selection uses inverse-CDF sampling over a precomputed cumulative row, so picking the next
//! operation costs one uniform draw and a binary search.

use rand::Rng;

use crate::error::{Error, Result};

/// Row-normalized transition weights between operation types.
#[derive(Clone, Debug, PartialEq)]
pub struct MixMatrix {
    name: String,
    probabilities: Vec<Vec<f64>>,
    selection: Vec<Vec<f64>>,
}

impl MixMatrix {
    /// Builds a mix from raw non-negative weights.
    ///
    /// Rows do not need to be normalized. The matrix must be square, and every row needs at least
    /// one positive weight.
    pub fn new(name: impl Into<String>, weights: Vec<Vec<f64>>) -> Result<Self> {
        let name = name.into();
        let invalid = |reason: String| Error::InvalidMix {
            mix: name.clone(),
            reason,
        };

        let size = weights.len();
        if size == 0 {
            return Err(invalid("matrix is empty".into()));
        }

        let mut probabilities = Vec::with_capacity(size);
        let mut selection = Vec::with_capacity(size);

        for (i, row) in weights.into_iter().enumerate() {
            if row.len() != size {
                return Err(invalid(format!(
                    "row {i} has {} columns, expected {size}",
                    row.len()
                )));
            }
            if let Some(w) = row.iter().find(|w| !w.is_finite() || **w < 0.0) {
                return Err(invalid(format!("row {i} contains invalid weight {w}")));
            }

            let total: f64 = row.iter().sum();
            if total <= 0.0 {
                return Err(invalid(format!("row {i} has no positive weight")));
            }

            let normalized: Vec<f64> = row.iter().map(|w| w / total).collect();

            let mut cumulative = Vec::with_capacity(size);
            let mut sum = 0.0;
            for p in &normalized {
                sum += p;
                cumulative.push(sum);
            }
            // Pin the tail to exactly 1.0 so every draw in [0, 1) lands on a positive column.
            if let Some(last) = normalized.iter().rposition(|p| *p > 0.0) {
                for c in &mut cumulative[last..] {
                    *c = 1.0;
                }
            }

            probabilities.push(normalized);
            selection.push(cumulative);
        }

        Ok(Self {
            name,
            probabilities,
            selection,
        })
    }

    /// Name of the mix as configured on the track.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Number of operation types.
    pub fn len(&self) -> usize {
        self.probabilities.len()
    }

    /// Always false, since empty matrices are rejected on construction.
    pub fn is_empty(&self) -> bool {
        self.probabilities.is_empty()
    }

    /// Normalized transition probabilities, one row per preceding operation.
    pub fn probabilities(&self) -> &[Vec<f64>] {
        &self.probabilities
    }

    /// Cumulative selection rows.
    pub fn selection(&self) -> &[Vec<f64>] {
        &self.selection
    }

    /// Picks the operation following `last` with a single uniform draw.
    ///
    /// Without a previous operation (or with an out-of-range index), row 0 is used.
    pub fn next_operation<R: Rng>(&self, last: Option<usize>, rng: &mut R) -> usize {
        self.select(last, rng.random::<f64>())
    }

    /// Maps a draw `r` in `[0, 1)` onto the next operation index.
    pub fn select(&self, last: Option<usize>, r: f64) -> usize {
        let row = last.filter(|&i| i < self.len()).unwrap_or(0);
        let cumulative = &self.selection[row];
        // First column whose cumulative bound exceeds the draw. Zero-weight columns repeat the
        // previous bound and can never be first.
        cumulative
            .partition_point(|c| *c <= r)
            .min(self.len() - 1)
    }
}
