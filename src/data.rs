//! Interaction logs and the bidirectionally indexed interaction store.
use std::collections::HashMap;

use chrono::NaiveDateTime;

use crate::{DataError, ExternalId, ItemId, UserId};

/// A single implicit-feedback event.
#[derive(Clone, Serialize, Deserialize, Debug, PartialEq)]
pub struct Interaction<U, I> {
    user_id: U,
    item_id: I,
    timestamp: NaiveDateTime,
}

impl<U, I> Interaction<U, I> {
    /// Build a new interaction.
    pub fn new(user_id: U, item_id: I, timestamp: NaiveDateTime) -> Self {
        Interaction {
            user_id,
            item_id,
            timestamp,
        }
    }

    /// External user id.
    pub fn user_id(&self) -> &U {
        &self.user_id
    }

    /// External item id.
    pub fn item_id(&self) -> &I {
        &self.item_id
    }

    /// When the interaction happened.
    pub fn timestamp(&self) -> NaiveDateTime {
        self.timestamp
    }
}

/// A chronologically ordered table of interactions.
///
/// The position of a row in the log is its position in the stream; the
/// partitioner uses it to restore the original order after moving rows
/// between buckets and holdouts.
#[derive(Clone, Debug)]
pub struct InteractionLog<U, I> {
    interactions: Vec<Interaction<U, I>>,
}

impl<U: ExternalId, I: ExternalId> InteractionLog<U, I> {
    /// Build a log, stably sorting the rows by timestamp.
    pub fn new(mut interactions: Vec<Interaction<U, I>>) -> Self {
        interactions.sort_by_key(|x| x.timestamp());

        InteractionLog { interactions }
    }

    /// The rows, in chronological order.
    pub fn data(&self) -> &[Interaction<U, I>] {
        &self.interactions
    }

    /// Number of rows.
    pub fn len(&self) -> usize {
        self.interactions.len()
    }

    /// Whether the log has no rows.
    pub fn is_empty(&self) -> bool {
        self.interactions.is_empty()
    }

    /// Materialize the whole log as a single store, in log order.
    pub fn to_store(&self) -> InteractionStore<U, I> {
        let mut store = InteractionStore::empty();

        for interaction in &self.interactions {
            store.add_feedback(interaction.user_id.clone(), interaction.item_id.clone());
        }

        store
    }
}

/// Interactions indexed both ways: user → items and item → users.
///
/// External ids are mapped to dense internal ids on first sight. Ids created
/// by the initial batch follow the sorted order of the unique external ids;
/// ids created later by [`add_feedback`](InteractionStore::add_feedback) are
/// appended. An internal id never changes once assigned.
#[derive(Clone, Debug)]
pub struct InteractionStore<U, I> {
    userlist: Vec<U>,
    itemlist: Vec<I>,
    userindices: Vec<UserId>,
    itemindices: Vec<ItemId>,
    userset: Vec<U>,
    itemset: Vec<I>,
    user_lookup: HashMap<U, UserId>,
    item_lookup: HashMap<I, ItemId>,
    useritems: Vec<Vec<ItemId>>,
    itemusers: Vec<Vec<UserId>>,
}

impl<U: ExternalId, I: ExternalId> Default for InteractionStore<U, I> {
    fn default() -> Self {
        InteractionStore::empty()
    }
}

fn unique_sorted<T: ExternalId>(values: &[T]) -> Vec<T> {
    let mut unique = values.to_vec();
    unique.sort();
    unique.dedup();
    unique
}

impl<U: ExternalId, I: ExternalId> InteractionStore<U, I> {
    /// Build a store from parallel user and item columns.
    pub fn new(user_list: Vec<U>, item_list: Vec<I>) -> Result<Self, DataError> {
        if user_list.len() != item_list.len() {
            return Err(DataError::LengthMismatch {
                users: user_list.len(),
                items: item_list.len(),
            });
        }

        let userset = unique_sorted(&user_list);
        let itemset = unique_sorted(&item_list);

        // Every value is in its own unique set, so the searches cannot miss.
        let userindices: Vec<UserId> = user_list
            .iter()
            .map(|user| userset.binary_search(user).unwrap_or_default())
            .collect();
        let itemindices: Vec<ItemId> = item_list
            .iter()
            .map(|item| itemset.binary_search(item).unwrap_or_default())
            .collect();

        let mut useritems = vec![Vec::new(); userset.len()];
        let mut itemusers = vec![Vec::new(); itemset.len()];

        for (&user_id, &item_id) in userindices.iter().zip(itemindices.iter()) {
            useritems[user_id].push(item_id);
            itemusers[item_id].push(user_id);
        }

        let user_lookup = userset
            .iter()
            .cloned()
            .enumerate()
            .map(|(idx, user)| (user, idx))
            .collect();
        let item_lookup = itemset
            .iter()
            .cloned()
            .enumerate()
            .map(|(idx, item)| (item, idx))
            .collect();

        Ok(InteractionStore {
            userlist: user_list,
            itemlist: item_list,
            userindices,
            itemindices,
            userset,
            itemset,
            user_lookup,
            item_lookup,
            useritems,
            itemusers,
        })
    }

    /// A store with no interactions.
    pub fn empty() -> Self {
        InteractionStore {
            userlist: Vec::new(),
            itemlist: Vec::new(),
            userindices: Vec::new(),
            itemindices: Vec::new(),
            userset: Vec::new(),
            itemset: Vec::new(),
            user_lookup: HashMap::new(),
            item_lookup: HashMap::new(),
            useritems: Vec::new(),
            itemusers: Vec::new(),
        }
    }

    /// Append one interaction, allocating internal ids for unseen users
    /// and items. Returns the internal `(user, item)` pair.
    pub fn add_feedback(&mut self, user: U, item: I) -> (UserId, ItemId) {
        let user_id = match self.user_lookup.get(&user) {
            Some(&user_id) => user_id,
            None => {
                let user_id = self.userset.len();
                self.userset.push(user.clone());
                self.user_lookup.insert(user.clone(), user_id);
                self.useritems.push(Vec::new());
                user_id
            }
        };

        let item_id = match self.item_lookup.get(&item) {
            Some(&item_id) => item_id,
            None => {
                let item_id = self.itemset.len();
                self.itemset.push(item.clone());
                self.item_lookup.insert(item.clone(), item_id);
                self.itemusers.push(Vec::new());
                item_id
            }
        };

        self.userlist.push(user);
        self.itemlist.push(item);
        self.userindices.push(user_id);
        self.itemindices.push(item_id);
        self.useritems[user_id].push(item_id);
        self.itemusers[item_id].push(user_id);

        (user_id, item_id)
    }

    /// Number of recorded interactions.
    pub fn len(&self) -> usize {
        self.userlist.len()
    }

    /// Whether no interactions were recorded.
    pub fn is_empty(&self) -> bool {
        self.userlist.is_empty()
    }

    /// Number of distinct users.
    pub fn num_users(&self) -> usize {
        self.userset.len()
    }

    /// Number of distinct items.
    pub fn num_items(&self) -> usize {
        self.itemset.len()
    }

    /// External user ids, indexed by internal id.
    pub fn users(&self) -> &[U] {
        &self.userset
    }

    /// External item ids, indexed by internal id.
    pub fn items(&self) -> &[I] {
        &self.itemset
    }

    /// Internal ids of the items `user_id` interacted with, in interaction
    /// order. Unknown users have no history.
    pub fn user_items(&self, user_id: UserId) -> &[ItemId] {
        self.useritems
            .get(user_id)
            .map(|items| items.as_slice())
            .unwrap_or(&[])
    }

    /// Internal ids of the users who interacted with `item_id`.
    pub fn item_users(&self, item_id: ItemId) -> &[UserId] {
        self.itemusers
            .get(item_id)
            .map(|users| users.as_slice())
            .unwrap_or(&[])
    }

    /// External ids of the items an external user interacted with.
    pub fn user_items_external(&self, user: &U) -> Vec<&I> {
        match self.user_internal_id(user) {
            Some(user_id) => self.useritems[user_id]
                .iter()
                .map(|&item_id| &self.itemset[item_id])
                .collect(),
            None => Vec::new(),
        }
    }

    /// External ids of the users who interacted with an external item.
    pub fn item_users_external(&self, item: &I) -> Vec<&U> {
        match self.item_internal_id(item) {
            Some(item_id) => self.itemusers[item_id]
                .iter()
                .map(|&user_id| &self.userset[user_id])
                .collect(),
            None => Vec::new(),
        }
    }

    /// The interaction at `position`, as originally supplied.
    pub fn tuple(&self, position: usize) -> Option<(&U, &I)> {
        Some((self.userlist.get(position)?, self.itemlist.get(position)?))
    }

    /// The interaction at `position`, as internal ids.
    pub fn internal_tuple(&self, position: usize) -> Option<(UserId, ItemId)> {
        Some((
            *self.userindices.get(position)?,
            *self.itemindices.get(position)?,
        ))
    }

    /// Iterate over the interactions in recording order.
    pub fn iter(&self) -> impl Iterator<Item = (&U, &I)> {
        self.userlist.iter().zip(self.itemlist.iter())
    }

    /// Internal id of an external user, if seen.
    pub fn user_internal_id(&self, user: &U) -> Option<UserId> {
        self.user_lookup.get(user).cloned()
    }

    /// Internal id of an external item, if seen.
    pub fn item_internal_id(&self, item: &I) -> Option<ItemId> {
        self.item_lookup.get(item).cloned()
    }

    /// External id of an internal user id, if allocated.
    pub fn user_external_id(&self, user_id: UserId) -> Option<&U> {
        self.userset.get(user_id)
    }

    /// External id of an internal item id, if allocated.
    pub fn item_external_id(&self, item_id: ItemId) -> Option<&I> {
        self.itemset.get(item_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use chrono::NaiveDate;

    fn store() -> InteractionStore<&'static str, &'static str> {
        InteractionStore::new(vec!["A", "A", "B"], vec!["x", "y", "x"]).unwrap()
    }

    fn assert_adjacency_mirrors(store: &InteractionStore<&'static str, &'static str>) {
        let from_users: usize = (0..store.num_users())
            .map(|u| store.user_items(u).len())
            .sum();
        let from_items: usize = (0..store.num_items())
            .map(|i| store.item_users(i).len())
            .sum();

        assert_eq!(from_users, store.len());
        assert_eq!(from_items, store.len());

        for u in 0..store.num_users() {
            for &i in store.user_items(u) {
                let forward = store.user_items(u).iter().filter(|&&x| x == i).count();
                let backward = store.item_users(i).iter().filter(|&&x| x == u).count();
                assert_eq!(forward, backward);
            }
        }
    }

    #[test]
    fn builds_sorted_id_sets() {
        let store = store();

        assert_eq!(store.users(), &["A", "B"]);
        assert_eq!(store.items(), &["x", "y"]);
        assert_eq!(store.len(), 3);

        let a = store.user_internal_id(&"A").unwrap();
        let mut items = store.user_items(a).to_vec();
        items.sort();
        assert_eq!(
            items,
            vec![
                store.item_internal_id(&"x").unwrap(),
                store.item_internal_id(&"y").unwrap()
            ]
        );
        assert_adjacency_mirrors(&store);
    }

    #[test]
    fn add_feedback_appends_new_ids() {
        let mut store = store();

        let (user_id, item_id) = store.add_feedback("A", "z");

        assert_eq!(user_id, 0);
        assert_eq!(item_id, 2);
        assert_eq!(store.items(), &["x", "y", "z"]);
        assert_eq!(store.item_internal_id(&"z"), Some(2));
        assert_eq!(store.item_users(2), &[0]);
        assert_eq!(store.len(), 4);
        assert_adjacency_mirrors(&store);
    }

    #[test]
    fn ids_are_stable_under_growth() {
        let mut store = InteractionStore::empty();
        let users = ["u3", "u1", "u3", "u2", "u1", "u3"];
        let items = ["i1", "i2", "i2", "i3", "i1", "i4"];

        let mut first_seen = HashMap::new();

        for (&user, &item) in users.iter().zip(items.iter()) {
            let (user_id, _) = store.add_feedback(user, item);
            let expected = *first_seen.entry(user).or_insert(user_id);
            assert_eq!(user_id, expected);
        }

        assert_eq!(store.users(), &["u3", "u1", "u2"]);
        assert_eq!(store.user_items(0), &[0, 1, 3]);
        assert_adjacency_mirrors(&store);
    }

    #[test]
    fn unknown_ids_resolve_to_none() {
        let store = store();

        assert_eq!(store.user_internal_id(&"C"), None);
        assert_eq!(store.item_internal_id(&"q"), None);
        assert_eq!(store.user_external_id(7), None);
        assert_eq!(store.item_external_id(2), None);
        assert!(store.user_items(42).is_empty());
        assert!(store.item_users(42).is_empty());
        assert!(store.user_items_external(&"C").is_empty());
    }

    #[test]
    fn tuples_by_position() {
        let store = store();

        assert_eq!(store.tuple(1), Some((&"A", &"y")));
        assert_eq!(store.internal_tuple(2), Some((1, 0)));
        assert_eq!(store.tuple(3), None);
        assert_eq!(store.user_items_external(&"B"), vec![&"x"]);
        assert_eq!(store.item_users_external(&"x"), vec![&"A", &"B"]);
    }

    #[test]
    fn mismatched_lengths_fail() {
        let result = InteractionStore::new(vec![1, 2], vec![1]);

        match result {
            Err(DataError::LengthMismatch { users, items }) => {
                assert_eq!(users, 2);
                assert_eq!(items, 1);
            }
            other => panic!("unexpected result: {:?}", other.map(|s| s.len())),
        }
    }

    #[test]
    fn log_sorts_and_converts() {
        let day = |d| {
            NaiveDate::from_ymd_opt(2020, 1, d)
                .unwrap()
                .and_hms_opt(0, 0, 0)
                .unwrap()
        };
        let log = InteractionLog::new(vec![
            Interaction::new(2, 20, day(3)),
            Interaction::new(1, 10, day(1)),
            Interaction::new(1, 30, day(2)),
        ]);

        let store = log.to_store();

        assert_eq!(store.tuple(0), Some((&1, &10)));
        assert_eq!(store.tuple(2), Some((&2, &20)));
        assert_eq!(store.users(), &[1, 2]);
    }
}
