pub mod cancel;
pub mod cluster_recommender;
pub mod clustering;
pub mod preferences;
pub mod recommender;
pub mod similarity;
pub mod weighted;

pub use cancel::CancelToken;
pub use cluster_recommender::ClusterRecommender;
pub use clustering::{Cluster, ClusterOutcome, Clustering, DenseMatrix, KMeans};
pub use preferences::PreferenceStore;
pub use recommender::Recommender;
pub use similarity::{
    score_matrix, CosineSimilarity, EuclideanSimilarity, PearsonSimilarity, ScoreMatrix,
    Similarity, SimilarityMetric,
};
pub use weighted::{Strategy, WeightedSimilarityRecommender};
