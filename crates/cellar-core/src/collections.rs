//! Typed views over substrate maps.
//!
//! Values are stored bincode-encoded; a set is a map whose keys are the
//! elements, and a list is one map entry edited under its entry lock.

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::marker::PhantomData;
use std::sync::Arc;
use tokio::sync::broadcast;

use crate::error::Result;
use crate::substrate::{EntryLock, MapEvent, Substrate};

/// A distributed map of string keys to `V`.
pub struct DistributedMap<V> {
    name: String,
    substrate: Arc<dyn Substrate>,
    _marker: PhantomData<fn() -> V>,
}

impl<V> Clone for DistributedMap<V> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            substrate: self.substrate.clone(),
            _marker: PhantomData,
        }
    }
}

impl<V: Serialize + DeserializeOwned> DistributedMap<V> {
    /// Opens the named map.
    pub fn new(substrate: Arc<dyn Substrate>, name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            substrate,
            _marker: PhantomData,
        }
    }

    /// Map name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Reads an entry.
    pub fn get(&self, key: &str) -> Result<Option<V>> {
        match self.substrate.map_get(&self.name, key)? {
            Some(bytes) => Ok(Some(bincode::deserialize(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Writes an entry.
    pub fn put(&self, key: &str, value: &V) -> Result<()> {
        self.substrate
            .map_put(&self.name, key, bincode::serialize(value)?)?;
        Ok(())
    }

    /// Removes an entry, returning the previous value.
    pub fn remove(&self, key: &str) -> Result<Option<V>> {
        match self.substrate.map_remove(&self.name, key)? {
            Some(bytes) => Ok(Some(bincode::deserialize(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Returns true if the key is present.
    pub fn contains_key(&self, key: &str) -> Result<bool> {
        Ok(self.substrate.map_get(&self.name, key)?.is_some())
    }

    /// Every entry, sorted by key.
    pub fn entries(&self) -> Result<BTreeMap<String, V>> {
        self.substrate
            .map_entries(&self.name)?
            .into_iter()
            .map(|(k, v)| -> Result<(String, V)> { Ok((k, bincode::deserialize(&v)?)) })
            .collect()
    }

    /// Every key, sorted.
    pub fn keys(&self) -> Result<Vec<String>> {
        Ok(self
            .substrate
            .map_entries(&self.name)?
            .into_iter()
            .map(|(k, _)| k)
            .collect())
    }

    /// Acquires the cluster-wide lock on one entry.
    pub async fn lock(&self, key: &str) -> Result<EntryLock> {
        self.substrate.lock(&self.name, key).await
    }

    /// Subscribes to changes of this map.
    pub fn subscribe(&self) -> broadcast::Receiver<MapEvent> {
        self.substrate.subscribe_map(&self.name)
    }
}

/// A distributed set of strings.
#[derive(Clone)]
pub struct DistributedSet {
    inner: DistributedMap<()>,
}

impl DistributedSet {
    /// Opens the named set.
    pub fn new(substrate: Arc<dyn Substrate>, name: impl Into<String>) -> Self {
        Self {
            inner: DistributedMap::new(substrate, name),
        }
    }

    /// Set name.
    pub fn name(&self) -> &str {
        self.inner.name()
    }

    /// Adds an element. Returns false if it was already present.
    pub fn add(&self, value: &str) -> Result<bool> {
        if self.inner.contains_key(value)? {
            return Ok(false);
        }
        self.inner.put(value, &())?;
        Ok(true)
    }

    /// Removes an element. Returns true if it was present.
    pub fn remove(&self, value: &str) -> Result<bool> {
        Ok(self.inner.remove(value)?.is_some())
    }

    /// Returns true if the element is present.
    pub fn contains(&self, value: &str) -> Result<bool> {
        self.inner.contains_key(value)
    }

    /// Every element.
    pub fn members(&self) -> Result<BTreeSet<String>> {
        Ok(self.inner.keys()?.into_iter().collect())
    }
}

const LIST_ENTRY: &str = "items";

/// A distributed list of `V`, kept in insertion order.
pub struct DistributedList<V> {
    inner: DistributedMap<Vec<V>>,
}

impl<V> Clone for DistributedList<V> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<V: Serialize + DeserializeOwned + PartialEq> DistributedList<V> {
    /// Opens the named list.
    pub fn new(substrate: Arc<dyn Substrate>, name: impl Into<String>) -> Self {
        Self {
            inner: DistributedMap::new(substrate, name),
        }
    }

    /// List name.
    pub fn name(&self) -> &str {
        self.inner.name()
    }

    /// Every element, in order.
    pub fn items(&self) -> Result<Vec<V>> {
        Ok(self.inner.get(LIST_ENTRY)?.unwrap_or_default())
    }

    /// Element at `index`.
    pub fn get(&self, index: usize) -> Result<Option<V>> {
        Ok(self.items()?.into_iter().nth(index))
    }

    /// Number of elements.
    pub fn len(&self) -> Result<usize> {
        Ok(self.items()?.len())
    }

    /// True when the list has no elements.
    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Appends an element. Returns the new length.
    pub async fn push(&self, value: V) -> Result<usize> {
        let _guard = self.inner.lock(LIST_ENTRY).await?;
        let mut items = self.items()?;
        items.push(value);
        self.inner.put(LIST_ENTRY, &items)?;
        Ok(items.len())
    }

    /// Removes the first element equal to `value`. Returns true if one was
    /// removed.
    pub async fn remove(&self, value: &V) -> Result<bool> {
        let _guard = self.inner.lock(LIST_ENTRY).await?;
        let mut items = self.items()?;
        let Some(position) = items.iter().position(|item| item == value) else {
            return Ok(false);
        };
        items.remove(position);
        self.inner.put(LIST_ENTRY, &items)?;
        Ok(true)
    }

    /// Removes every element.
    pub async fn clear(&self) -> Result<()> {
        let _guard = self.inner.lock(LIST_ENTRY).await?;
        self.inner.remove(LIST_ENTRY)?;
        Ok(())
    }
}
