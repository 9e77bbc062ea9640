use std::collections::{BTreeMap, HashSet};

use crate::{
    error::{RecommendError, RecommendResult},
    models::{EntityId, Item, PreferenceMatrix, User},
};

/// Validated users and items with both orientations of the rating data
///
/// The forward matrix has a row for every user and the inverted matrix a
/// row for every item, possibly empty. Both hold exactly the same
/// `(user, item, rating)` triples.
#[derive(Debug, Clone, Default)]
pub struct PreferenceStore {
    users: BTreeMap<EntityId, User>,
    items: BTreeMap<EntityId, Item>,
    forward: PreferenceMatrix,
    inverted: PreferenceMatrix,
}

impl PreferenceStore {
    /// Validates the records and builds both matrices
    ///
    /// Fails on duplicate user or item ids, on ratings of unknown items and
    /// on non-finite ratings. Nothing is built unless every record passes.
    pub fn build(users: Vec<User>, items: Vec<Item>) -> RecommendResult<Self> {
        validate(&users, &items)?;

        let items: BTreeMap<EntityId, Item> = items
            .into_iter()
            .map(|item| (item.id().clone(), item))
            .collect();

        let mut forward = PreferenceMatrix::new();
        let mut inverted: PreferenceMatrix = items
            .keys()
            .map(|item_id| (item_id.clone(), Default::default()))
            .collect();

        for user in &users {
            for (item_id, rating) in user.preferences() {
                if let Some(column) = inverted.get_mut(item_id) {
                    column.insert(user.id().clone(), *rating);
                }
            }
            forward.insert(user.id().clone(), user.preferences().clone());
        }

        let users = users
            .into_iter()
            .map(|user| (user.id().clone(), user))
            .collect();

        Ok(Self {
            users,
            items,
            forward,
            inverted,
        })
    }

    pub fn user(&self, id: &EntityId) -> RecommendResult<&User> {
        self.users
            .get(id)
            .ok_or_else(|| RecommendError::NotFound(format!("user {}", id)))
    }

    pub fn item(&self, id: &EntityId) -> RecommendResult<&Item> {
        self.items
            .get(id)
            .ok_or_else(|| RecommendError::NotFound(format!("item {}", id)))
    }

    /// user -> item -> rating
    pub fn forward(&self) -> &PreferenceMatrix {
        &self.forward
    }

    /// item -> user -> rating
    pub fn inverted(&self) -> &PreferenceMatrix {
        &self.inverted
    }

    pub fn user_count(&self) -> usize {
        self.users.len()
    }

    pub fn item_count(&self) -> usize {
        self.items.len()
    }

    pub fn rating_count(&self) -> usize {
        self.forward.values().map(|row| row.len()).sum()
    }
}

fn validate(users: &[User], items: &[Item]) -> RecommendResult<()> {
    let mut item_ids = HashSet::with_capacity(items.len());
    for item in items {
        if !item_ids.insert(item.id()) {
            return Err(RecommendError::Validation(format!(
                "duplicate item id {}",
                item.id()
            )));
        }
    }

    let mut user_ids = HashSet::with_capacity(users.len());
    for user in users {
        if !user_ids.insert(user.id()) {
            return Err(RecommendError::Validation(format!(
                "duplicate user id {}",
                user.id()
            )));
        }
        for (item_id, rating) in user.preferences() {
            if !item_ids.contains(item_id) {
                return Err(RecommendError::Validation(format!(
                    "user {} rated unknown item {}",
                    user.id(),
                    item_id
                )));
            }
            if !rating.is_finite() {
                return Err(RecommendError::Validation(format!(
                    "user {} gave item {} a non-finite rating",
                    user.id(),
                    item_id
                )));
            }
            // Zero marks "unrated" in the dense clustering rows
            if *rating == 0.0 {
                return Err(RecommendError::Validation(format!(
                    "user {} gave item {} a zero rating",
                    user.id(),
                    item_id
                )));
            }
        }
    }

    Ok(())
}
