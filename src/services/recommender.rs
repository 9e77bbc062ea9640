use std::cmp::Ordering;

use crate::{
    error::RecommendResult,
    models::{EntityId, Item, ScoredEntity, User},
    services::cancel::CancelToken,
};

/// Common contract of every collaborative-filtering strategy
///
/// `load` replaces all prior state; queries are pure reads afterwards.
/// Queries on an instance that was never loaded report `NotFound`.
pub trait Recommender {
    /// Builds all derived state, checking `cancel` at coarse boundaries
    ///
    /// A failed or cancelled load leaves the previous state in place.
    fn load_with_cancel(
        &mut self,
        users: Vec<User>,
        items: Vec<Item>,
        cancel: &CancelToken,
    ) -> RecommendResult<()>;

    fn load(&mut self, users: Vec<User>, items: Vec<Item>) -> RecommendResult<()> {
        self.load_with_cancel(users, items, &CancelToken::new())
    }

    fn similar_users(&self, user_id: &EntityId, n: usize) -> RecommendResult<Vec<ScoredEntity>>;

    fn similar_items(&self, item_id: &EntityId, n: usize) -> RecommendResult<Vec<ScoredEntity>>;

    /// Items the user has not rated, best prediction first
    fn recommendations(&self, user_id: &EntityId, n: usize)
        -> RecommendResult<Vec<ScoredEntity>>;
}

/// Sorts by score descending, then id ascending, and keeps the first `n`
pub fn top_n(mut scores: Vec<(EntityId, f64)>, n: usize) -> Vec<(EntityId, f64)> {
    scores.sort_by(|a, b| {
        b.1.partial_cmp(&a.1)
            .unwrap_or(Ordering::Equal)
            .then_with(|| a.0.cmp(&b.0))
    });
    scores.truncate(n);
    scores
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_top_n_orders_and_truncates() {
        let scores = vec![
            (EntityId::from(4), 0.5),
            (EntityId::from(2), 0.9),
            (EntityId::from(3), 0.5),
            (EntityId::from(1), -0.2),
        ];
        let ranked = top_n(scores, 3);
        assert_eq!(
            ranked,
            vec![
                (EntityId::from(2), 0.9),
                (EntityId::from(3), 0.5),
                (EntityId::from(4), 0.5),
            ]
        );
    }

    #[test]
    fn test_top_n_negative_zero_ties_by_id() {
        let scores = vec![(EntityId::from(2), 0.0), (EntityId::from(1), -0.0)];
        let ranked = top_n(scores, 5);
        assert_eq!(ranked[0].0, EntityId::from(1));
    }

    #[test]
    fn test_top_n_zero() {
        assert!(top_n(vec![(EntityId::from(1), 1.0)], 0).is_empty());
    }
}
