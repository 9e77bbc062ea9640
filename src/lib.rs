//! Collaborative-filtering recommendation core.
//!
//! Feed validated [`User`]s and [`Item`]s into a [`Recommender`] and query
//! it for similar users, similar items and personalized recommendations.
//! Two strategies are provided: [`WeightedSimilarityRecommender`]
//! (item- or user-based weighted-sum prediction over a pluggable
//! [`Similarity`]) and [`ClusterRecommender`] (k-means clusters of users
//! and items).

pub mod config;
pub mod error;
pub mod models;
pub mod services;
pub mod telemetry;

pub use config::RecommenderConfig;
pub use error::{RecommendError, RecommendResult};
pub use models::{EntityId, Item, PreferenceMatrix, Ratings, ScoredEntity, User};
pub use services::{
    CancelToken, ClusterOutcome, ClusterRecommender, Recommender, Similarity, SimilarityMetric,
    Strategy, WeightedSimilarityRecommender,
};
