use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use crate::{
    config::RecommenderConfig,
    error::{RecommendError, RecommendResult},
    models::{EntityId, Item, PreferenceMatrix, ScoredEntity, User},
    services::{
        cancel::CancelToken,
        preferences::PreferenceStore,
        recommender::{top_n, Recommender},
        similarity::{score_matrix, ScoreMatrix, Similarity},
    },
};

/// Which axis the weighted-sum prediction walks
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    /// Neighbours are items similar to the ones the user rated
    ItemBased,
    /// Neighbours are users similar to the query user
    UserBased,
}

#[derive(Debug, Clone, Copy)]
enum Axis {
    Users,
    Items,
}

/// Precomputed score matrices, replaced wholesale on every load
struct Memo {
    users: ScoreMatrix,
    items: ScoreMatrix,
}

struct Loaded {
    store: PreferenceStore,
    memo: Option<Memo>,
}

/// Collaborative recommender based on weighted similarity vectors
///
/// Predicts a rating as the similarity-weighted average of known ratings:
/// `Σ(rating · s) / Σ|s|` over neighbours with non-zero similarity `s`.
pub struct WeightedSimilarityRecommender {
    strategy: Strategy,
    config: RecommenderConfig,
    similarity: Arc<dyn Similarity>,
    state: Option<Loaded>,
}

impl WeightedSimilarityRecommender {
    /// Item-based recommender using the configured metric
    pub fn item_based(config: RecommenderConfig) -> Self {
        let similarity = config.metric.engine(config.min_shared_keys);
        Self::with_similarity(Strategy::ItemBased, config, similarity)
    }

    /// User-based recommender using the configured metric
    pub fn user_based(config: RecommenderConfig) -> Self {
        let similarity = config.metric.engine(config.min_shared_keys);
        Self::with_similarity(Strategy::UserBased, config, similarity)
    }

    /// Recommender with a caller-supplied similarity engine
    pub fn with_similarity(
        strategy: Strategy,
        config: RecommenderConfig,
        similarity: Arc<dyn Similarity>,
    ) -> Self {
        Self {
            strategy,
            config,
            similarity,
            state: None,
        }
    }

    pub fn strategy(&self) -> Strategy {
        self.strategy
    }

    pub fn is_memoized(&self) -> bool {
        self.state.as_ref().is_some_and(|s| s.memo.is_some())
    }

    fn loaded(&self) -> RecommendResult<&Loaded> {
        self.state
            .as_ref()
            .ok_or_else(|| RecommendError::NotFound("no data loaded".to_string()))
    }

    /// Scores of `row_id` against every other row on the axis, unordered
    fn similarities(&self, state: &Loaded, axis: Axis, row_id: &EntityId) -> Vec<(EntityId, f64)> {
        if let Some(memo) = &state.memo {
            let matrix = match axis {
                Axis::Users => &memo.users,
                Axis::Items => &memo.items,
            };
            return matrix
                .get(row_id)
                .map(|row| row.iter().map(|(id, s)| (id.clone(), *s)).collect())
                .unwrap_or_default();
        }

        let matrix = match axis {
            Axis::Users => state.store.forward(),
            Axis::Items => state.store.inverted(),
        };
        let Some(ratings) = matrix.get(row_id) else {
            return Vec::new();
        };
        matrix
            .iter()
            .filter(|(other_id, _)| *other_id != row_id)
            .map(|(other_id, other)| (other_id.clone(), self.similarity.score(ratings, other)))
            .collect()
    }

    fn memo_matrix(
        &self,
        axis: &'static str,
        rows: &PreferenceMatrix,
        cancel: &CancelToken,
    ) -> RecommendResult<ScoreMatrix> {
        score_matrix(self.similarity.as_ref(), rows, self.config.parallel, cancel).inspect_err(
            |_| tracing::warn!(axis, "Score matrix cancelled, keeping previous state"),
        )
    }

    /// Accumulates `(weighted sum, total |weight|)` per candidate item
    fn weighted_scores(
        &self,
        state: &Loaded,
        user_id: &EntityId,
    ) -> RecommendResult<BTreeMap<EntityId, (f64, f64)>> {
        let rated = state.store.user(user_id)?.preferences();
        let mut scores: BTreeMap<EntityId, (f64, f64)> = BTreeMap::new();

        let mut accumulate = |candidate: &EntityId, rating: f64, similarity: f64| {
            let entry = scores.entry(candidate.clone()).or_insert((0.0, 0.0));
            entry.0 += rating * similarity;
            entry.1 += similarity.abs();
        };

        match self.strategy {
            Strategy::ItemBased => {
                for (item_id, rating) in rated {
                    for (candidate, similarity) in self.similarities(state, Axis::Items, item_id) {
                        if similarity == 0.0 || rated.contains_key(&candidate) {
                            continue;
                        }
                        accumulate(&candidate, *rating, similarity);
                    }
                }
            }
            Strategy::UserBased => {
                let forward = state.store.forward();
                for (neighbour, similarity) in self.similarities(state, Axis::Users, user_id) {
                    if similarity == 0.0 {
                        continue;
                    }
                    let Some(neighbour_ratings) = forward.get(&neighbour) else {
                        continue;
                    };
                    for (candidate, rating) in neighbour_ratings {
                        if rated.contains_key(candidate) {
                            continue;
                        }
                        accumulate(candidate, *rating, similarity);
                    }
                }
            }
        }

        Ok(scores)
    }
}

impl Recommender for WeightedSimilarityRecommender {
    fn load_with_cancel(
        &mut self,
        users: Vec<User>,
        items: Vec<Item>,
        cancel: &CancelToken,
    ) -> RecommendResult<()> {
        let start = Instant::now();

        tracing::info!(
            strategy = ?self.strategy,
            metric = ?self.config.metric,
            users = users.len(),
            items = items.len(),
            memoize = self.config.memoize,
            "Loading weighted-similarity recommender"
        );

        let store = PreferenceStore::build(users, items)?;

        let memo = if self.config.memoize {
            let users = self.memo_matrix("users", store.forward(), cancel)?;
            let items = self.memo_matrix("items", store.inverted(), cancel)?;
            Some(Memo { users, items })
        } else {
            None
        };

        tracing::info!(
            users = store.user_count(),
            items = store.item_count(),
            ratings = store.rating_count(),
            processing_time_ms = start.elapsed().as_millis(),
            "Weighted-similarity recommender loaded"
        );

        self.state = Some(Loaded { store, memo });
        Ok(())
    }

    fn similar_users(&self, user_id: &EntityId, n: usize) -> RecommendResult<Vec<ScoredEntity>> {
        let state = self.loaded()?;
        state.store.user(user_id)?;

        top_n(self.similarities(state, Axis::Users, user_id), n)
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

        top_n(self.similarities(state, Axis::Items, item_id), n)
            .into_iter()
            .map(|(id, score)| {
                let item = state.store.item(&id)?;
                Ok(ScoredEntity::new(item.display_value(), id, score))
            })
            .collect()
    }

    fn recommendations(
        &self,
        user_id: &EntityId,
        n: usize,
    ) -> RecommendResult<Vec<ScoredEntity>> {
        let state = self.loaded()?;

        let predictions: Vec<(EntityId, f64)> = self
            .weighted_scores(state, user_id)?
            .into_iter()
            .filter(|(_, (_, total))| *total > 0.0)
            .map(|(id, (weighted, total))| (id, weighted / total))
            .collect();

        tracing::debug!(
            user_id = %user_id,
            candidates = predictions.len(),
            "Weighted predictions computed"
        );

        top_n(predictions, n)
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
    use crate::services::similarity::{MockSimilarity, SimilarityMetric};

    fn config() -> RecommenderConfig {
        RecommenderConfig {
            min_shared_keys: 1,
            ..Default::default()
        }
    }

    fn catalog() -> Vec<Item> {
        vec![
            Item::new(1, "Alien"),
            Item::new(2, "Aliens"),
            Item::new(3, "Alien 3"),
        ]
    }

    fn users() -> Vec<User> {
        vec![
            User::new(100, "query").with_preference(1, 5.0),
            User::new(101, "close").with_preference(1, 4.0).with_preference(2, 2.0),
            User::new(102, "far")
                .with_preference(1, 1.0)
                .with_preference(2, 4.0)
                .with_preference(3, 3.0),
        ]
    }

    #[test]
    fn test_zero_similarity_neighbours_skipped() {
        // Anyone who rated item 3 counts as unrelated
        let mut mock = MockSimilarity::new();
        mock.expect_score().returning(|a, b| {
            let far = EntityId::from(3);
            if a.contains_key(&far) || b.contains_key(&far) {
                0.0
            } else {
                0.5
            }
        });

        let mut recommender = WeightedSimilarityRecommender::with_similarity(
            Strategy::UserBased,
            config(),
            Arc::new(mock),
        );
        recommender.load(users(), catalog()).unwrap();

        let recs = recommender.recommendations(&EntityId::from(100), 10).unwrap();
        assert_eq!(recs.len(), 1);
        assert_eq!(recs[0].id, EntityId::from(2));
        assert_eq!(recs[0].display_value, "Aliens");
        assert_eq!(recs[0].score, 2.0);
    }

    #[test]
    fn test_negative_similarity_weights_by_magnitude() {
        let mut mock = MockSimilarity::new();
        mock.expect_score().returning(|_, _| -0.5);

        let mut recommender = WeightedSimilarityRecommender::with_similarity(
            Strategy::ItemBased,
            config(),
            Arc::new(mock),
        );
        recommender.load(users(), catalog()).unwrap();

        let recs = recommender.recommendations(&EntityId::from(100), 10).unwrap();
        // 5 * -0.5 / |-0.5| for both unrated items
        assert_eq!(recs.len(), 2);
        assert!(recs.iter().all(|r| r.score == -5.0));
        assert_eq!(recs[0].id, EntityId::from(2));
        assert_eq!(recs[1].id, EntityId::from(3));
    }

    #[test]
    fn test_memoized_matches_on_demand() {
        let memo_config = RecommenderConfig {
            memoize: true,
            ..config()
        };
        for strategy in [Strategy::ItemBased, Strategy::UserBased] {
            let engine = SimilarityMetric::Euclidean.engine(1);
            let mut lazy =
                WeightedSimilarityRecommender::with_similarity(strategy, config(), engine.clone());
            let mut eager = WeightedSimilarityRecommender::with_similarity(
                strategy,
                memo_config.clone(),
                engine,
            );
            lazy.load(users(), catalog()).unwrap();
            eager.load(users(), catalog()).unwrap();

            assert!(eager.is_memoized());
            assert!(!lazy.is_memoized());

            let id = EntityId::from(100);
            assert_eq!(
                lazy.recommendations(&id, 5).unwrap(),
                eager.recommendations(&id, 5).unwrap()
            );
            assert_eq!(
                lazy.similar_users(&id, 5).unwrap(),
                eager.similar_users(&id, 5).unwrap()
            );
            let item = EntityId::from(1);
            assert_eq!(
                lazy.similar_items(&item, 5).unwrap(),
                eager.similar_items(&item, 5).unwrap()
            );
        }
    }

    #[test]
    fn test_queries_before_load_not_found() {
        let recommender = WeightedSimilarityRecommender::item_based(config());
        assert!(matches!(
            recommender.similar_users(&EntityId::from(1), 3),
            Err(RecommendError::NotFound(_))
        ));
    }

    #[test]
    fn test_unknown_ids_not_found() {
        let mut recommender = WeightedSimilarityRecommender::user_based(config());
        recommender.load(users(), catalog()).unwrap();

        let missing = EntityId::from(999);
        assert!(matches!(
            recommender.similar_users(&missing, 3),
            Err(RecommendError::NotFound(_))
        ));
        assert!(matches!(
            recommender.similar_items(&missing, 3),
            Err(RecommendError::NotFound(_))
        ));
        assert!(matches!(
            recommender.recommendations(&missing, 3),
            Err(RecommendError::NotFound(_))
        ));
    }

    #[test]
    fn test_failed_load_keeps_previous_state() {
        let mut recommender = WeightedSimilarityRecommender::user_based(config());
        recommender.load(users(), catalog()).unwrap();

        let bad = vec![User::new(7, "ghost").with_preference(42, 1.0)];
        assert!(recommender.load(bad, catalog()).is_err());
        assert!(recommender.similar_users(&EntityId::from(100), 2).is_ok());
    }
}
