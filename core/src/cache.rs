//! Request-scoped result de-duplication

use crate::{CommandKey, publisher::PublishedResult};
use parking_lot::Mutex;
use std::any::Any;
use std::collections::HashMap;

type Entry = Box<dyn Any + Send + Sync>;

/// Scope within which commands sharing a command key and cache key resolve
/// to the same published result
///
/// Create one per logical request and drop it when the request ends.
#[derive(Default)]
pub struct RequestContext {
    entries: Mutex<HashMap<(CommandKey, String), Entry>>,
}

impl RequestContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// The cached result for `command` and `cache_key`, if one of type `T` exists
    pub fn get<T>(&self, command: &CommandKey, cache_key: &str) -> Option<PublishedResult<T>>
    where
        T: Clone + Send + Sync + 'static,
    {
        self.entries
            .lock()
            .get(&(command.clone(), cache_key.to_string()))
            .and_then(|entry| entry.downcast_ref::<PublishedResult<T>>())
            .cloned()
    }

    /// Return the cached result or insert the one `create` builds
    ///
    /// The boolean is true on a cache hit. `create` runs under the context's
    /// lock so concurrent callers never launch duplicates.
    pub(crate) fn get_or_insert_with<T, F>(
        &self,
        command: &CommandKey,
        cache_key: String,
        create: F,
    ) -> (PublishedResult<T>, bool)
    where
        T: Clone + Send + Sync + 'static,
        F: FnOnce() -> PublishedResult<T>,
    {
        let mut entries = self.entries.lock();
        let key = (command.clone(), cache_key);

        if let Some(cached) = entries
            .get(&key)
            .and_then(|entry| entry.downcast_ref::<PublishedResult<T>>())
        {
            return (cached.clone(), true);
        }

        let created = create();
        entries.insert(key, Box::new(created.detached()));
        (created, false)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Forget every cached result
    pub fn clear(&self) {
        self.entries.lock().clear();
    }
}

impl std::fmt::Debug for RequestContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestContext")
            .field("entries", &self.len())
            .finish()
    }
}
