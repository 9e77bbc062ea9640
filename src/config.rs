use serde::Deserialize;

use crate::error::{RecommendError, RecommendResult};
use crate::services::similarity::SimilarityMetric;

/// Prefix shared by every environment variable the core reads
pub const ENV_PREFIX: &str = "CF_";

/// Recommender configuration loaded from environment variables
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct RecommenderConfig {
    /// Minimum number of co-rated keys before two rows are comparable
    #[serde(default = "default_min_shared_keys")]
    pub min_shared_keys: usize,

    /// Precompute both pairwise score matrices during load
    #[serde(default)]
    pub memoize: bool,

    /// Metric used by the weighted-similarity recommenders
    #[serde(default = "default_metric")]
    pub metric: SimilarityMetric,

    /// Metric used to compare rows against cluster centroids
    #[serde(default = "default_cluster_metric")]
    pub cluster_metric: SimilarityMetric,

    /// Number of clusters per axis
    #[serde(default = "default_cluster_count")]
    pub cluster_count: usize,

    /// Upper bound on assign/update rounds per clustering run
    #[serde(default = "default_max_iterations")]
    pub max_iterations: usize,

    /// Seed for centroid initialization
    #[serde(default = "default_seed")]
    pub seed: u64,

    /// Spread score matrices and cluster assignment across the rayon pool
    #[serde(default)]
    pub parallel: bool,
}

fn default_min_shared_keys() -> usize {
    5
}

fn default_metric() -> SimilarityMetric {
    SimilarityMetric::Pearson
}

fn default_cluster_metric() -> SimilarityMetric {
    SimilarityMetric::Cosine
}

fn default_cluster_count() -> usize {
    100
}

fn default_max_iterations() -> usize {
    50
}

fn default_seed() -> u64 {
    42
}

impl Default for RecommenderConfig {
    fn default() -> Self {
        Self {
            min_shared_keys: default_min_shared_keys(),
            memoize: false,
            metric: default_metric(),
            cluster_metric: default_cluster_metric(),
            cluster_count: default_cluster_count(),
            max_iterations: default_max_iterations(),
            seed: default_seed(),
            parallel: false,
        }
    }
}

impl RecommenderConfig {
    /// Load configuration from `CF_`-prefixed environment variables
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();
        let config = envy::prefixed(ENV_PREFIX)
            .from_env::<RecommenderConfig>()
            .map_err(|e| anyhow::anyhow!("Failed to load config: {}", e))?;
        config.validate()?;
        Ok(config)
    }

    /// Rejects settings the clustering loop cannot run with
    pub fn validate(&self) -> RecommendResult<()> {
        if self.cluster_count == 0 {
            return Err(RecommendError::Config(
                "cluster_count must be at least 1".to_string(),
            ));
        }
        if self.max_iterations == 0 {
            return Err(RecommendError::Config(
                "max_iterations must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn from_pairs(pairs: &[(&str, &str)]) -> RecommenderConfig {
        envy::prefixed(ENV_PREFIX)
            .from_iter(
                pairs
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect::<Vec<_>>(),
            )
            .unwrap()
    }

    #[test]
    fn test_defaults_match_empty_environment() {
        let config = from_pairs(&[]);
        assert_eq!(config, RecommenderConfig::default());
        assert_eq!(config.min_shared_keys, 5);
        assert_eq!(config.cluster_count, 100);
        assert_eq!(config.metric, SimilarityMetric::Pearson);
        assert_eq!(config.cluster_metric, SimilarityMetric::Cosine);
        assert!(!config.memoize);
    }

    #[test]
    fn test_overrides_from_environment() {
        let config = from_pairs(&[
            ("CF_MIN_SHARED_KEYS", "2"),
            ("CF_MEMOIZE", "true"),
            ("CF_METRIC", "euclidean"),
            ("CF_CLUSTER_COUNT", "8"),
            ("CF_SEED", "7"),
            ("UNRELATED", "ignored"),
        ]);
        assert_eq!(config.min_shared_keys, 2);
        assert!(config.memoize);
        assert_eq!(config.metric, SimilarityMetric::Euclidean);
        assert_eq!(config.cluster_count, 8);
        assert_eq!(config.seed, 7);
        assert_eq!(config.max_iterations, 50);
    }

    #[test]
    fn test_validate_rejects_zero_clusters() {
        let config = RecommenderConfig {
            cluster_count: 0,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(RecommendError::Config(_))));
    }

    #[test]
    fn test_validate_rejects_zero_iterations() {
        let config = RecommenderConfig {
            max_iterations: 0,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(RecommendError::Config(_))));
    }

    #[test]
    fn test_from_env_rejects_zero_clusters() {
        std::env::set_var("CF_CLUSTER_COUNT", "0");
        let result = RecommenderConfig::from_env();
        std::env::remove_var("CF_CLUSTER_COUNT");

        let err = result.unwrap_err();
        assert_eq!(
            err.downcast_ref::<RecommendError>(),
            Some(&RecommendError::Config(
                "cluster_count must be at least 1".to_string()
            ))
        );
    }
}
