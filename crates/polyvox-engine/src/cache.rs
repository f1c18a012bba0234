//! Decoded-buffer cache, shared across all groups of one engine.
//!
//! Entries are reference counted explicitly: a group retains its buffer when
//! it finishes loading and releases it on unload, and the entry is evicted
//! once no group holds it.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use polyvox_core::DecodedBuffer;
use tracing::debug;

struct CacheEntry {
    buffer: Arc<DecodedBuffer>,
    refs: usize,
}

/// Keyed cache of decoded audio, so several groups loading the same source
/// decode it once.
#[derive(Default)]
pub struct BufferCache {
    entries: Mutex<HashMap<String, CacheEntry>>,
}

impl BufferCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<Arc<DecodedBuffer>> {
        self.entries.lock().get(key).map(|e| e.buffer.clone())
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.lock().contains_key(key)
    }

    /// Insert the buffer if absent and take one reference on the entry.
    pub fn retain(&self, key: &str, buffer: Arc<DecodedBuffer>) -> Arc<DecodedBuffer> {
        let mut entries = self.entries.lock();
        let entry = entries.entry(key.to_string()).or_insert(CacheEntry {
            buffer,
            refs: 0,
        });
        entry.refs += 1;
        entry.buffer.clone()
    }

    /// Drop one reference. The entry is evicted when the last holder lets
    /// go. Returns true when this call evicted the entry.
    pub fn release(&self, key: &str) -> bool {
        let mut entries = self.entries.lock();
        let Some(entry) = entries.get_mut(key) else {
            return false;
        };
        entry.refs = entry.refs.saturating_sub(1);
        if entry.refs == 0 {
            entries.remove(key);
            debug!(key, "evicted decoded buffer");
            return true;
        }
        false
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn buffer(duration: f64) -> Arc<DecodedBuffer> {
        Arc::new(DecodedBuffer {
            duration,
            samples: Arc::new(vec![0.0; 8]),
            sample_rate: 8,
            channels: 1,
        })
    }

    #[test]
    fn retain_shares_the_first_insert() {
        let cache = BufferCache::new();
        let first = cache.retain("click.wav", buffer(1.0));
        let second = cache.retain("click.wav", buffer(9.0));
        assert!((second.duration - 1.0).abs() < f64::EPSILON);
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn entry_survives_until_last_release() {
        let cache = BufferCache::new();
        cache.retain("click.wav", buffer(1.0));
        cache.retain("click.wav", buffer(1.0));
        assert!(!cache.release("click.wav"));
        assert!(cache.contains("click.wav"));
        assert!(cache.release("click.wav"));
        assert!(!cache.contains("click.wav"));
    }

    #[test]
    fn releasing_an_unknown_key_is_harmless() {
        let cache = BufferCache::new();
        assert!(!cache.release("missing.wav"));
        assert!(cache.is_empty());
    }
}
