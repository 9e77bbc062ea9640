use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::{
    error::RecommendResult,
    models::{EntityId, PreferenceMatrix, Ratings},
    services::cancel::CancelToken,
};

/// Variance terms at or below this fraction of the squared sum count as zero.
/// Keeps constant vectors from producing noise-over-noise correlations.
const DEGENERATE_TOLERANCE: f64 = 1e-12;

/// Row id -> (other row id -> score), both directions stored
pub type ScoreMatrix = BTreeMap<EntityId, BTreeMap<EntityId, f64>>;

/// Pairwise scoring of two rating vectors keyed by a shared id space
///
/// Item ids are the keys when comparing users, user ids when comparing
/// items. Implementations return exactly 0 when the vectors cannot be
/// compared (too little overlap or a zero denominator).
#[cfg_attr(test, mockall::automock)]
pub trait Similarity: Send + Sync {
    fn score(&self, a: &Ratings, b: &Ratings) -> f64;
}

/// Built-in metrics, selectable from configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SimilarityMetric {
    Pearson,
    Cosine,
    Euclidean,
}

impl SimilarityMetric {
    /// Builds the engine for this metric with the given overlap threshold
    pub fn engine(self, min_shared_keys: usize) -> Arc<dyn Similarity> {
        match self {
            SimilarityMetric::Pearson => Arc::new(PearsonSimilarity::new(min_shared_keys)),
            SimilarityMetric::Cosine => Arc::new(CosineSimilarity::new(min_shared_keys)),
            SimilarityMetric::Euclidean => Arc::new(EuclideanSimilarity::new(min_shared_keys)),
        }
    }
}

/// Keys rated in both vectors, ascending
pub fn shared_keys<'a>(a: &'a Ratings, b: &Ratings) -> Vec<&'a EntityId> {
    a.keys().filter(|key| b.contains_key(*key)).collect()
}

fn too_few(shared: usize, min_shared_keys: usize) -> bool {
    shared == 0 || shared < min_shared_keys
}

fn is_degenerate(variance: f64, squared_sum: f64) -> bool {
    variance <= DEGENERATE_TOLERANCE * squared_sum.max(1.0)
}

/// Pearson correlation over the co-rated keys
#[derive(Debug, Clone)]
pub struct PearsonSimilarity {
    min_shared_keys: usize,
}

impl PearsonSimilarity {
    pub fn new(min_shared_keys: usize) -> Self {
        Self { min_shared_keys }
    }
}

impl Similarity for PearsonSimilarity {
    fn score(&self, a: &Ratings, b: &Ratings) -> f64 {
        let shared = shared_keys(a, b);
        let n = shared.len();
        if too_few(n, self.min_shared_keys) {
            return 0.0;
        }

        let (mut sum_a, mut sum_b, mut sum_a_sq, mut sum_b_sq, mut sum_products) =
            (0.0, 0.0, 0.0, 0.0, 0.0);
        for key in shared {
            let (x, y) = (a[key], b[key]);
            sum_a += x;
            sum_b += y;
            sum_a_sq += x * x;
            sum_b_sq += y * y;
            sum_products += x * y;
        }

        let n = n as f64;
        let variance_a = sum_a_sq - sum_a * sum_a / n;
        let variance_b = sum_b_sq - sum_b * sum_b / n;
        if is_degenerate(variance_a, sum_a_sq) || is_degenerate(variance_b, sum_b_sq) {
            return 0.0;
        }

        let numerator = sum_products - sum_a * sum_b / n;
        let denominator = variance_a.sqrt() * variance_b.sqrt();
        (numerator / denominator).clamp(-1.0, 1.0)
    }
}

/// Cosine similarity after centring each vector on its own mean rating
///
/// The mean is taken over every rating in the vector, not just the shared
/// ones, so a row's overall rating scale is removed before comparison.
#[derive(Debug, Clone)]
pub struct CosineSimilarity {
    min_shared_keys: usize,
}

impl CosineSimilarity {
    pub fn new(min_shared_keys: usize) -> Self {
        Self { min_shared_keys }
    }
}

fn mean(ratings: &Ratings) -> f64 {
    ratings.values().sum::<f64>() / ratings.len() as f64
}

impl Similarity for CosineSimilarity {
    fn score(&self, a: &Ratings, b: &Ratings) -> f64 {
        let shared = shared_keys(a, b);
        if too_few(shared.len(), self.min_shared_keys) {
            return 0.0;
        }

        let (mean_a, mean_b) = (mean(a), mean(b));
        let (mut numerator, mut magnitude_a, mut magnitude_b) = (0.0, 0.0, 0.0);
        let (mut raw_a, mut raw_b) = (0.0, 0.0);
        for key in shared {
            let (x, y) = (a[key], b[key]);
            let (dx, dy) = (x - mean_a, y - mean_b);
            numerator += dx * dy;
            magnitude_a += dx * dx;
            magnitude_b += dy * dy;
            raw_a += x * x;
            raw_b += y * y;
        }

        if is_degenerate(magnitude_a, raw_a) || is_degenerate(magnitude_b, raw_b) {
            return 0.0;
        }

        (numerator / (magnitude_a.sqrt() * magnitude_b.sqrt())).clamp(-1.0, 1.0)
    }
}

/// `1 / (1 + distance)` over the co-rated keys
#[derive(Debug, Clone)]
pub struct EuclideanSimilarity {
    min_shared_keys: usize,
}

impl EuclideanSimilarity {
    pub fn new(min_shared_keys: usize) -> Self {
        Self { min_shared_keys }
    }
}

impl Similarity for EuclideanSimilarity {
    fn score(&self, a: &Ratings, b: &Ratings) -> f64 {
        let shared = shared_keys(a, b);
        if too_few(shared.len(), self.min_shared_keys) {
            return 0.0;
        }

        let squared_distance: f64 = shared
            .into_iter()
            .map(|key| (a[key] - b[key]).powi(2))
            .sum();

        1.0 / (1.0 + squared_distance.sqrt())
    }
}

/// Scores every unordered pair of rows once and stores both directions
///
/// Each row gets an entry, even when it is the only row. Cancellation is
/// checked before each outer row; with `parallel` the outer rows are
/// spread over rayon and their pair lists merged afterward.
pub fn score_matrix(
    engine: &dyn Similarity,
    rows: &PreferenceMatrix,
    parallel: bool,
    cancel: &CancelToken,
) -> RecommendResult<ScoreMatrix> {
    let entries: Vec<(&EntityId, &Ratings)> = rows.iter().collect();

    let row_pairs = |i: usize| -> Option<Vec<(usize, usize, f64)>> {
        if cancel.is_cancelled() {
            return None;
        }
        let (_, ratings) = entries[i];
        Some(
            entries
                .iter()
                .enumerate()
                .skip(i + 1)
                .map(|(j, (_, other))| (i, j, engine.score(ratings, other)))
                .collect(),
        )
    };

    let partitions: Vec<Option<Vec<(usize, usize, f64)>>> = if parallel {
        (0..entries.len()).into_par_iter().map(row_pairs).collect()
    } else {
        let mut partitions = Vec::with_capacity(entries.len());
        for i in 0..entries.len() {
            let partition = row_pairs(i);
            let stop = partition.is_none();
            partitions.push(partition);
            if stop {
                break;
            }
        }
        partitions
    };
    cancel.check()?;

    let mut matrix: ScoreMatrix = entries
        .iter()
        .map(|(id, _)| ((*id).clone(), BTreeMap::new()))
        .collect();

    for partition in partitions.into_iter().flatten() {
        for (i, j, score) in partition {
            let (id_i, id_j) = (entries[i].0, entries[j].0);
            if let Some(row) = matrix.get_mut(id_i) {
                row.insert(id_j.clone(), score);
            }
            if let Some(row) = matrix.get_mut(id_j) {
                row.insert(id_i.clone(), score);
            }
        }
    }

    tracing::debug!(rows = entries.len(), parallel, "Score matrix computed");

    Ok(matrix)
}
