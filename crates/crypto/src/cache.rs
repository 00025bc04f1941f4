//! In-Memory Schluessel-Cache
//!
//! Ersetzt modulglobale Maps: jeder Manager bekommt seine eigene Instanz,
//! Tests bauen isolierte Caches.

use std::hash::Hash;

use dashmap::DashMap;

/// Nebenlaeufiger Cache fuer unveraenderliches Schluesselmaterial
#[derive(Debug)]
pub struct KeyCache<K, V>
where
    K: Eq + Hash,
{
    eintraege: DashMap<K, V>,
}

impl<K, V> Default for KeyCache<K, V>
where
    K: Eq + Hash,
{
    fn default() -> Self {
        Self {
            eintraege: DashMap::new(),
        }
    }
}

impl<K, V> KeyCache<K, V>
where
    K: Eq + Hash,
    V: Clone,
{
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &K) -> Option<V> {
        self.eintraege.get(key).map(|e| e.value().clone())
    }

    pub fn put(&self, key: K, value: V) {
        self.eintraege.insert(key, value);
    }

    /// Entfernt einen Eintrag; gibt true zurueck wenn einer vorhanden war
    pub fn invalidate(&self, key: &K) -> bool {
        self.eintraege.remove(key).is_some()
    }

    pub fn len(&self) -> usize {
        self.eintraege.len()
    }

    pub fn is_empty(&self) -> bool {
        self.eintraege.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn get_put_invalidate() {
        let cache: KeyCache<u32, String> = KeyCache::new();
        assert!(cache.get(&1).is_none());

        cache.put(1, "eins".into());
        assert_eq!(cache.get(&1).as_deref(), Some("eins"));
        assert!(cache.invalidate(&1));
        assert!(!cache.invalidate(&1));
        assert!(cache.is_empty());
    }

    #[test]
    fn isolierte_instanzen() {
        let a: KeyCache<u8, u8> = KeyCache::new();
        let b: KeyCache<u8, u8> = KeyCache::new();
        a.put(1, 1);
        assert!(b.get(&1).is_none());
    }
}
