//! K-means style clustering over a dense preference matrix.
//!
//! One run goes `Initializing -> Assigning -> Updating -> ...` until the
//! assignment stops changing (`Converged`) or the iteration budget runs out
//! (`MaxIterationsReached`). Rows are compared with centroids through a
//! [`Similarity`], so "closest" means "highest score".

use rand::Rng;
use rayon::prelude::*;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};

use crate::{
    error::RecommendResult,
    models::{EntityId, PreferenceMatrix, Ratings},
    services::{cancel::CancelToken, similarity::Similarity},
};

/// Row-major matrix, one row per row id and one column per column id,
/// both ascending. Unrated cells hold 0.
#[derive(Debug, Clone, PartialEq)]
pub struct DenseMatrix {
    row_ids: Vec<EntityId>,
    column_ids: Vec<EntityId>,
    values: Vec<f64>,
}

impl DenseMatrix {
    /// Lays out `rows` against the given columns
    ///
    /// Ratings whose key is not among `column_ids` are ignored.
    pub fn from_preferences<'a>(
        rows: &PreferenceMatrix,
        column_ids: impl IntoIterator<Item = &'a EntityId>,
    ) -> Self {
        let mut column_ids: Vec<EntityId> = column_ids.into_iter().cloned().collect();
        column_ids.sort();
        column_ids.dedup();

        let column_index: BTreeMap<&EntityId, usize> =
            column_ids.iter().enumerate().map(|(i, id)| (id, i)).collect();

        let width = column_ids.len();
        let mut values = vec![0.0; rows.len() * width];
        for (row, ratings) in rows.values().enumerate() {
            for (key, rating) in ratings {
                if let Some(&column) = column_index.get(key) {
                    values[row * width + column] = *rating;
                }
            }
        }

        Self {
            row_ids: rows.keys().cloned().collect(),
            column_ids,
            values,
        }
    }

    pub fn row_ids(&self) -> &[EntityId] {
        &self.row_ids
    }

    pub fn column_ids(&self) -> &[EntityId] {
        &self.column_ids
    }

    pub fn width(&self) -> usize {
        self.column_ids.len()
    }

    pub fn row(&self, index: usize) -> &[f64] {
        let width = self.width();
        &self.values[index * width..(index + 1) * width]
    }

    /// Smallest and largest rated (non-zero) value, if any
    pub fn observed_range(&self) -> Option<(f64, f64)> {
        self.values
            .iter()
            .filter(|v| **v != 0.0)
            .fold(None, |range, &v| match range {
                None => Some((v, v)),
                Some((lo, hi)) => Some((lo.min(v), hi.max(v))),
            })
    }

    /// A dense vector over this matrix's columns as sparse ratings
    fn sparse(&self, vector: &[f64]) -> Ratings {
        self.column_ids
            .iter()
            .zip(vector)
            .filter(|(_, v)| **v != 0.0)
            .map(|(id, v)| (id.clone(), *v))
            .collect()
    }
}

/// How a clustering run ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ClusterOutcome {
    /// Two consecutive passes produced the same assignment
    Converged,
    /// The iteration budget ran out first; the last assignment is kept
    MaxIterationsReached,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Cluster {
    id: usize,
    centroid: Vec<f64>,
    members: BTreeSet<EntityId>,
}

impl Cluster {
    pub fn id(&self) -> usize {
        self.id
    }

    /// Indexed like the columns of the clustered matrix
    pub fn centroid(&self) -> &[f64] {
        &self.centroid
    }

    pub fn members(&self) -> &BTreeSet<EntityId> {
        &self.members
    }
}

/// Result of one clustering run
#[derive(Debug, Clone, PartialEq)]
pub struct Clustering {
    clusters: Vec<Cluster>,
    assignments: BTreeMap<EntityId, usize>,
    outcome: ClusterOutcome,
    iterations: usize,
}

impl Clustering {
    pub fn clusters(&self) -> &[Cluster] {
        &self.clusters
    }

    pub fn assignments(&self) -> &BTreeMap<EntityId, usize> {
        &self.assignments
    }

    pub fn outcome(&self) -> ClusterOutcome {
        self.outcome
    }

    /// Assignment passes performed, including the confirming one on convergence
    pub fn iterations(&self) -> usize {
        self.iterations
    }

    pub fn cluster_of(&self, row_id: &EntityId) -> Option<&Cluster> {
        self.assignments
            .get(row_id)
            .and_then(|index| self.clusters.get(*index))
    }
}

/// Lloyd-style iteration with similarity-based assignment
pub struct KMeans<'a> {
    similarity: &'a dyn Similarity,
    k: usize,
    max_iterations: usize,
    parallel: bool,
}

impl<'a> KMeans<'a> {
    pub fn new(similarity: &'a dyn Similarity, k: usize, max_iterations: usize) -> Self {
        Self {
            similarity,
            k,
            max_iterations,
            parallel: false,
        }
    }

    pub fn parallel(mut self, parallel: bool) -> Self {
        self.parallel = parallel;
        self
    }

    /// Clusters the rows of `matrix`
    ///
    /// `rng` only feeds centroid initialization, so a seeded generator
    /// makes the whole run reproducible. `cancel` is checked before every
    /// assignment pass.
    pub fn run<R: Rng>(
        &self,
        matrix: &DenseMatrix,
        rng: &mut R,
        cancel: &CancelToken,
    ) -> RecommendResult<Clustering> {
        let mut centroids = self.initial_centroids(matrix, rng);

        let mut previous: Option<Vec<usize>> = None;
        let mut outcome = ClusterOutcome::MaxIterationsReached;
        let mut iterations = 0;

        for iteration in 1..=self.max_iterations {
            cancel.check()?;
            iterations = iteration;

            let assignment = self.assign(matrix, &centroids);

            if let Some(previous) = &previous {
                let changed = previous
                    .iter()
                    .zip(&assignment)
                    .filter(|(a, b)| a != b)
                    .count();
                tracing::debug!(iteration, changed, "Clustering pass complete");
                if changed == 0 {
                    outcome = ClusterOutcome::Converged;
                    break;
                }
            }

            update_centroids(matrix, &assignment, &mut centroids);
            previous = Some(assignment);
        }

        let assignment = match previous {
            Some(assignment) => assignment,
            None => self.assign(matrix, &centroids),
        };

        Ok(build_clustering(matrix, centroids, &assignment, outcome, iterations))
    }

    /// `k` centroids, each coordinate uniform over the observed rating range
    fn initial_centroids<R: Rng>(&self, matrix: &DenseMatrix, rng: &mut R) -> Vec<Vec<f64>> {
        let (lo, hi) = matrix.observed_range().unwrap_or((0.0, 0.0));
        (0..self.k)
            .map(|_| (0..matrix.width()).map(|_| rng.gen_range(lo..=hi)).collect())
            .collect()
    }

    /// Index of the best-scoring centroid per row
    ///
    /// Cluster 0 is the baseline; only a strictly greater score moves a
    /// row, so ties stay with the lowest cluster index.
    fn assign(&self, matrix: &DenseMatrix, centroids: &[Vec<f64>]) -> Vec<usize> {
        let centroids: Vec<Ratings> = centroids.iter().map(|c| matrix.sparse(c)).collect();

        let assign_row = |row: usize| -> usize {
            let ratings = matrix.sparse(matrix.row(row));
            let mut best = 0;
            let mut best_score = f64::NEG_INFINITY;
            for (index, centroid) in centroids.iter().enumerate() {
                let score = self.similarity.score(&ratings, centroid);
                if index == 0 || score > best_score {
                    best = index;
                    best_score = score;
                }
            }
            best
        };

        let rows = matrix.row_ids().len();
        if self.parallel {
            (0..rows).into_par_iter().map(assign_row).collect()
        } else {
            (0..rows).map(assign_row).collect()
        }
    }
}

/// Moves every non-empty cluster's centroid to the mean of its members
fn update_centroids(matrix: &DenseMatrix, assignment: &[usize], centroids: &mut [Vec<f64>]) {
    let width = matrix.width();
    let mut sums = vec![vec![0.0; width]; centroids.len()];
    let mut counts = vec![0usize; centroids.len()];

    for (row, &cluster) in assignment.iter().enumerate() {
        counts[cluster] += 1;
        for (sum, value) in sums[cluster].iter_mut().zip(matrix.row(row)) {
            *sum += value;
        }
    }

    for ((centroid, sum), count) in centroids.iter_mut().zip(sums).zip(counts) {
        if count == 0 {
            continue;
        }
        *centroid = sum.into_iter().map(|s| s / count as f64).collect();
    }
}

fn build_clustering(
    matrix: &DenseMatrix,
    centroids: Vec<Vec<f64>>,
    assignment: &[usize],
    outcome: ClusterOutcome,
    iterations: usize,
) -> Clustering {
    let mut clusters: Vec<Cluster> = centroids
        .into_iter()
        .enumerate()
        .map(|(id, centroid)| Cluster {
            id,
            centroid,
            members: BTreeSet::new(),
        })
        .collect();

    let mut assignments = BTreeMap::new();
    for (row_id, &cluster) in matrix.row_ids().iter().zip(assignment) {
        clusters[cluster].members.insert(row_id.clone());
        assignments.insert(row_id.clone(), cluster);
    }

    Clustering {
        clusters,
        assignments,
        outcome,
        iterations,
    }
}
