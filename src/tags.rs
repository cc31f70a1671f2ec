use crate::types::CacheKey;
use parking_lot::Mutex;
use std::{
    collections::{HashMap, HashSet},
    fmt::Debug,
    hash::Hash,
};

#[derive(Debug)]
struct Index<T> {
    by_tag: HashMap<T, HashSet<CacheKey>>,
    by_key: HashMap<CacheKey, HashSet<T>>,
}

impl<T> Default for Index<T> {
    fn default() -> Self {
        Self {
            by_tag: HashMap::new(),
            by_key: HashMap::new(),
        }
    }
}

impl<T> Index<T>
where
    T: Debug + Clone + Eq + Hash,
{
    fn detach(&mut self, key: &CacheKey) -> Option<HashSet<T>> {
        let tags = self.by_key.remove(key)?;
        for tag in tags.iter() {
            if let Some(keys) = self.by_tag.get_mut(tag) {
                keys.remove(key);
                if keys.is_empty() {
                    self.by_tag.remove(tag);
                }
            }
        }
        Some(tags)
    }
}

/// Maps tags to the cache keys whose entries currently provide them.
#[derive(Debug)]
pub struct TagIndex<T> {
    index: Mutex<Index<T>>,
}

impl<T> Default for TagIndex<T> {
    fn default() -> Self {
        Self {
            index: Mutex::new(Index::default()),
        }
    }
}

impl<T> TagIndex<T>
where
    T: Debug + Clone + Eq + Hash,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace whatever tags `key` provided before with `tags`.
    pub fn record(&self, key: &CacheKey, tags: impl IntoIterator<Item = T>) {
        let mut index = self.index.lock();
        index.detach(key);

        let tags: HashSet<T> = tags.into_iter().collect();
        if tags.is_empty() {
            return;
        }
        for tag in tags.iter() {
            index.by_tag.entry(tag.clone()).or_default().insert(key.clone());
        }
        index.by_key.insert(key.clone(), tags);
    }

    pub fn remove(&self, key: &CacheKey) -> Option<HashSet<T>> {
        self.index.lock().detach(key)
    }

    /// All keys providing any of `tags`.
    pub fn keys_for_tags<'a>(&self, tags: impl IntoIterator<Item = &'a T>) -> HashSet<CacheKey>
    where
        T: 'a,
    {
        let index = self.index.lock();
        tags.into_iter()
            .filter_map(|tag| index.by_tag.get(tag))
            .flat_map(|keys| keys.iter().cloned())
            .collect()
    }

    pub fn tags_of(&self, key: &CacheKey) -> HashSet<T> {
        self.index.lock().by_key.get(key).cloned().unwrap_or_default()
    }

    pub fn clear(&self) {
        let mut index = self.index.lock();
        index.by_tag.clear();
        index.by_key.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.index.lock().by_key.is_empty()
    }
}
