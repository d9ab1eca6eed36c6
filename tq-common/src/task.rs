use std::{collections::HashMap, future::Future};

use tokio::task::{AbortHandle, Id, JoinError, JoinSet};

/// A collection of keyed tasks spawned on a Tokio runtime.
///
/// Unlike a plain [`JoinSet`], the key of a task is handed back together with its result, also
/// when the task panicked or was aborted. This lets the caller attribute a failure to the work
/// item that caused it.
#[derive(Debug)]
pub struct JoinMap<K, V> {
    keys: HashMap<Id, K>,
    joinset: JoinSet<V>,
}

impl<K, V> Default for JoinMap<K, V> {
    fn default() -> Self {
        Self {
            keys: HashMap::new(),
            joinset: JoinSet::new(),
        }
    }
}

impl<K, V> JoinMap<K, V> {
    /// Create a new, empty `JoinMap`.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of tasks currently in the map.
    pub fn len(&self) -> usize {
        self.joinset.len()
    }

    /// Returns whether the map is empty.
    pub fn is_empty(&self) -> bool {
        self.joinset.is_empty()
    }
}

impl<K, V> JoinMap<K, V>
where
    K: PartialEq,
    V: Send + 'static,
{
    /// Spawns `future` under `key`, unless a task with the same key is still running.
    ///
    /// Returns `None` if the key is already taken.
    pub fn spawn<F>(&mut self, key: K, future: F) -> Option<AbortHandle>
    where
        F: Future<Output = V> + Send + 'static,
    {
        if self.contains_key(&key) {
            return None;
        }

        let handle = self.joinset.spawn(future);
        self.keys.insert(handle.id(), key);
        Some(handle)
    }

    /// Aborts all tasks. Their keys are still returned by [`JoinMap::join_next`], with a
    /// cancelled [`JoinError`].
    pub fn abort_all(&mut self) {
        self.joinset.abort_all();
    }

    /// Returns `true` if the map contains a task for the given key.
    pub fn contains_key(&self, key: &K) -> bool {
        self.keys.values().any(|k| k == key)
    }

    /// Waits until one of the tasks completes and returns its key and output.
    ///
    /// Returns `None` if the map is empty.
    ///
    /// # Cancel Safety
    ///
    /// This method is cancel safe, like [`JoinSet::join_next`].
    pub async fn join_next(&mut self) -> Option<(K, Result<V, JoinError>)> {
        loop {
            let (id, result) = match self.joinset.join_next_with_id().await? {
                Ok((id, value)) => (id, Ok(value)),
                Err(e) => (e.id(), Err(e)),
            };

            if let Some(key) = self.keys.remove(&id) {
                return Some((key, result));
            }

            tracing::warn!(%id, "joined task without a key");
        }
    }

    /// Waits for every task and returns the results in completion order.
    pub async fn join_all(mut self) -> Vec<(K, Result<V, JoinError>)> {
        let mut results = Vec::with_capacity(self.len());
        while let Some(result) = self.join_next().await {
            results.push(result);
        }
        results
    }
}
