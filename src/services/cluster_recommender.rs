use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use crate::{
    config::RecommenderConfig,
    error::{RecommendError, RecommendResult},
    models::{EntityId, Item, Ratings, ScoredEntity, User},
    services::{
        cancel::CancelToken,
        clustering::{ClusterOutcome, Clustering, DenseMatrix, KMeans},
        preferences::PreferenceStore,
        recommender::{top_n, Recommender},
        similarity::Similarity,
    },
};

struct Loaded {
    store: PreferenceStore,
    users: Clustering,
    items: Clustering,
}

/// Collaborative recommender based on k-means clusters of users and items
///
/// Cluster co-membership replaces pairwise similarity: neighbours are the
/// other members of a row's cluster, ranked by their average rating.
pub struct ClusterRecommender {
    config: RecommenderConfig,
    similarity: Arc<dyn Similarity>,
    state: Option<Loaded>,
}

impl ClusterRecommender {
    /// Recommender comparing rows to centroids with the configured cluster metric
    pub fn new(config: RecommenderConfig) -> Self {
        let similarity = config.cluster_metric.engine(config.min_shared_keys);
        Self::with_similarity(config, similarity)
    }

    pub fn with_similarity(config: RecommenderConfig, similarity: Arc<dyn Similarity>) -> Self {
        Self {
            config,
            similarity,
            state: None,
        }
    }

    fn loaded(&self) -> RecommendResult<&Loaded> {
        self.state
            .as_ref()
            .ok_or_else(|| RecommendError::NotFound("no data loaded".to_string()))
    }

    /// Clusters of users from the last successful load
    pub fn user_clustering(&self) -> RecommendResult<&Clustering> {
        Ok(&self.loaded()?.users)
    }

    /// Clusters of items from the last successful load
    pub fn item_clustering(&self) -> RecommendResult<&Clustering> {
        Ok(&self.loaded()?.items)
    }

    fn run_clustering(
        &self,
        axis: &'static str,
        matrix: &DenseMatrix,
        rng: &mut ChaCha8Rng,
        cancel: &CancelToken,
    ) -> RecommendResult<Clustering> {
        let clustering = KMeans::new(
            self.similarity.as_ref(),
            self.config.cluster_count,
            self.config.max_iterations,
        )
        .parallel(self.config.parallel)
        .run(matrix, rng, cancel)
        .inspect_err(|_| {
            tracing::warn!(axis, "Clustering cancelled, keeping previous state");
        })?;

        match clustering.outcome() {
            ClusterOutcome::Converged => tracing::info!(
                axis,
                rows = matrix.row_ids().len(),
                iterations = clustering.iterations(),
                "Clustering converged"
            ),
            ClusterOutcome::MaxIterationsReached => tracing::warn!(
                axis,
                rows = matrix.row_ids().len(),
                iterations = clustering.iterations(),
                "Clustering stopped at iteration limit without converging"
            ),
        }

        Ok(clustering)
    }

    /// Other members of `row_id`'s cluster, scored by their average rating
    fn cluster_mates(
        clustering: &Clustering,
        matrix: &BTreeMap<EntityId, Ratings>,
        row_id: &EntityId,
        n: usize,
    ) -> Vec<(EntityId, f64)> {
        // Unrated rows land in cluster 0 by default, not by likeness
        if matrix.get(row_id).map_or(true, |ratings| ratings.is_empty()) {
            return Vec::new();
        }
        let Some(cluster) = clustering.cluster_of(row_id) else {
            return Vec::new();
        };
        let mates = cluster
            .members()
            .iter()
            .filter(|member| *member != row_id)
            .map(|member| {
                let average = matrix.get(member).map(average_rating).unwrap_or(0.0);
                (member.clone(), average)
            })
            .collect();
        top_n(mates, n)
    }
}

fn average_rating(ratings: &Ratings) -> f64 {
    if ratings.is_empty() {
        return 0.0;
    }
    ratings.values().sum::<f64>() / ratings.len() as f64
}

impl Recommender for ClusterRecommender {
    fn load_with_cancel(
        &mut self,
        users: Vec<User>,
        items: Vec<Item>,
        cancel: &CancelToken,
    ) -> RecommendResult<()> {
        self.config.validate()?;
        let start = Instant::now();

        tracing::info!(
            users = users.len(),
            items = items.len(),
            clusters = self.config.cluster_count,
            max_iterations = self.config.max_iterations,
            seed = self.config.seed,
            "Loading cluster recommender"
        );

        let store = PreferenceStore::build(users, items)?;

        let user_matrix = DenseMatrix::from_preferences(store.forward(), store.inverted().keys());
        let item_matrix = DenseMatrix::from_preferences(store.inverted(), store.forward().keys());

        // One stream for both axes, users first
        let mut rng = ChaCha8Rng::seed_from_u64(self.config.seed);
        let user_clusters = self.run_clustering("users", &user_matrix, &mut rng, cancel)?;
        let item_clusters = self.run_clustering("items", &item_matrix, &mut rng, cancel)?;

        tracing::info!(
            ratings = store.rating_count(),
            processing_time_ms = start.elapsed().as_millis(),
            "Cluster recommender loaded"
        );

        self.state = Some(Loaded {
            store,
            users: user_clusters,
            items: item_clusters,
        });
        Ok(())
    }

    fn similar_users(&self, user_id: &EntityId, n: usize) -> RecommendResult<Vec<ScoredEntity>> {
        let state = self.loaded()?;
        state.store.user(user_id)?;

        Self::cluster_mates(&state.users, state.store.forward(), user_id, n)
            .into_iter()
            .map(|(id, score)| {
                let user = state.store.user(&id)?;
                Ok(ScoredEntity::new(user.display_value(), id, score))
            })
            .collect()
    }

    fn similar_items(&self, item_id: &EntityId, n: usize) -> RecommendResult<Vec<ScoredEntity>> {
        let state = self.loaded()?;
        state.store.item(item_id)?;

        Self::cluster_mates(&state.items, state.store.inverted(), item_id, n)
            .into_iter()
            .map(|(id, score)| {
                let item = state.store.item(&id)?;
                Ok(ScoredEntity::new(item.display_value(), id, score))
            })
            .collect()
    }

    /// Items rated by the user's cluster mates, ranked by mean rating there
    fn recommendations(
        &self,
        user_id: &EntityId,
        n: usize,
    ) -> RecommendResult<Vec<ScoredEntity>> {
        let state = self.loaded()?;
        let rated = state.store.user(user_id)?.preferences();
        if rated.is_empty() {
            return Ok(Vec::new());
        }

        let Some(cluster) = state.users.cluster_of(user_id) else {
            return Ok(Vec::new());
        };

        let mut totals: BTreeMap<EntityId, (f64, usize)> = BTreeMap::new();
        for member in cluster.members().iter().filter(|m| *m != user_id) {
            let Some(ratings) = state.store.forward().get(member) else {
                continue;
            };
            for (item_id, rating) in ratings {
                if rated.contains_key(item_id) {
                    continue;
                }
                let entry = totals.entry(item_id.clone()).or_insert((0.0, 0));
                entry.0 += rating;
                entry.1 += 1;
            }
        }

        let averages = totals
            .into_iter()
            .map(|(id, (sum, count))| (id, sum / count as f64))
            .collect();

        top_n(averages, n)
            .into_iter()
            .map(|(id, score)| {
                let item = state.store.item(&id)?;
                Ok(ScoredEntity::new(item.display_value(), id, score))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> RecommenderConfig {
        RecommenderConfig {
            min_shared_keys: 2,
            cluster_count: 2,
            max_iterations: 20,
            seed: 7,
            ..Default::default()
        }
    }

    fn catalog() -> Vec<Item> {
        vec![
            Item::new(1, "Amélie"),
            Item::new(2, "Chocolat"),
            Item::new(3, "Predator"),
            Item::new(4, "Commando"),
        ]
    }

    fn users() -> Vec<User> {
        let rate = |id: u64, name: &str, ratings: &[(u64, f64)]| {
            ratings
                .iter()
                .fold(User::new(id, name), |u, (item, r)| u.with_preference(*item, *r))
        };
        vec![
            rate(1, "romantic-a", &[(1, 5.0), (2, 5.0), (3, 1.0), (4, 1.0)]),
            rate(2, "romantic-b", &[(1, 5.0), (2, 5.0), (3, 1.0), (4, 1.0)]),
            rate(3, "action-a", &[(1, 1.0), (2, 1.0), (3, 5.0), (4, 5.0)]),
            rate(4, "action-b", &[(1, 1.0), (2, 1.0), (3, 5.0), (4, 5.0)]),
            rate(5, "newcomer", &[(1, 5.0), (2, 5.0), (3, 1.0)]),
        ]
    }

    fn catalog_with_unrated() -> Vec<Item> {
        let mut items = catalog();
        items.push(Item::new(5, "Unreleased"));
        items
    }

    fn loaded() -> ClusterRecommender {
        let mut recommender = ClusterRecommender::new(config());
        recommender.load(users(), catalog()).unwrap();
        recommender
    }

    #[test]
    fn test_newcomer_joins_matching_cluster() {
        let recommender = loaded();
        let clustering = recommender.user_clustering().unwrap();
        assert_eq!(clustering.outcome(), ClusterOutcome::Converged);

        let newcomer = clustering.assignments()[&EntityId::from(5)];
        assert_eq!(clustering.assignments()[&EntityId::from(1)], newcomer);
        assert_ne!(clustering.assignments()[&EntityId::from(3)], newcomer);
    }

    #[test]
    fn test_recommendations_from_cluster_mates() {
        let recommender = loaded();
        let recs = recommender.recommendations(&EntityId::from(5), 10).unwrap();
        assert_eq!(recs.len(), 1);
        assert_eq!(recs[0].id, EntityId::from(4));
        assert_eq!(recs[0].display_value, "Commando");
        assert_eq!(recs[0].score, 1.0);
    }

    #[test]
    fn test_similar_users_ranked_by_average() {
        let recommender = loaded();
        let similar = recommender.similar_users(&EntityId::from(5), 10).unwrap();
        let ids: Vec<EntityId> = similar.iter().map(|s| s.id.clone()).collect();
        assert_eq!(ids, vec![EntityId::from(1), EntityId::from(2)]);
        assert!(similar.iter().all(|s| s.score == 3.0));
    }

    #[test]
    fn test_similar_items_share_cluster() {
        let recommender = loaded();
        let similar = recommender.similar_items(&EntityId::from(1), 10).unwrap();
        assert_eq!(similar.len(), 1);
        assert_eq!(similar[0].id, EntityId::from(2));
        assert_eq!(similar[0].display_value, "Chocolat");
    }

    #[test]
    fn test_invalid_config_rejected_on_load() {
        let mut recommender = ClusterRecommender::new(RecommenderConfig {
            cluster_count: 0,
            ..config()
        });
        assert!(matches!(
            recommender.load(users(), catalog()),
            Err(RecommendError::Config(_))
        ));
    }

    #[test]
    fn test_cancelled_load_keeps_previous_clusters() {
        let mut recommender = loaded();
        let before = recommender.user_clustering().unwrap().clone();

        let cancel = CancelToken::new();
        cancel.cancel();
        let result = recommender.load_with_cancel(users(), catalog(), &cancel);
        assert_eq!(result, Err(RecommendError::Cancelled));
        assert_eq!(recommender.user_clustering().unwrap(), &before);
    }

    #[test]
    fn test_user_without_ratings_gets_nothing() {
        let mut users = users();
        users.push(User::new(6, "lurker"));
        let mut recommender = ClusterRecommender::new(config());
        recommender.load(users, catalog()).unwrap();

        let lurker = EntityId::from(6);
        assert!(recommender.user_clustering().unwrap().cluster_of(&lurker).is_some());
        assert!(recommender.recommendations(&lurker, 10).unwrap().is_empty());
        assert!(recommender.similar_users(&lurker, 10).unwrap().is_empty());
    }

    #[test]
    fn test_unrated_item_has_no_similar_items() {
        let mut recommender = ClusterRecommender::new(config());
        recommender.load(users(), catalog_with_unrated()).unwrap();
        assert!(recommender
            .similar_items(&EntityId::from(5), 10)
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_unknown_user_not_found() {
        let recommender = loaded();
        assert!(matches!(
            recommender.recommendations(&EntityId::from(42), 5),
            Err(RecommendError::NotFound(_))
        ));
    }
}
