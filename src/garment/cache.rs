use std::{
    collections::{HashMap, VecDeque},
    sync::Arc,
};

use image::RgbaImage;

/// Width of one cache bucket in pixels.
pub const BUCKET_PX: f32 = 10.0;

/// A pre-scaled garment image plus the exact scale it was produced with.
#[derive(Clone, Debug)]
pub struct ScaledGarment {
    pub image: Arc<RgbaImage>,
    pub scale: f32,
}

/// Bounded FIFO memo of shoulder-width bucket -> scaled garment.
#[derive(Debug)]
pub struct ResizeCache {
    capacity: usize,
    entries: HashMap<u32, ScaledGarment>,
    order: VecDeque<u32>,
    hits: u64,
    misses: u64,
}

impl ResizeCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            entries: HashMap::new(),
            order: VecDeque::new(),
            hits: 0,
            misses: 0,
        }
    }

    pub fn bucket_for(width: f32) -> u32 {
        (width.max(0.0) / BUCKET_PX).floor() as u32
    }

    /// Looks up the bucket for `width`, counting a hit when present.
    pub fn get(&mut self, width: f32) -> Option<ScaledGarment> {
        let hit = self.entries.get(&Self::bucket_for(width)).cloned();
        if hit.is_some() {
            self.hits += 1;
        }
        hit
    }

    /// Stores a freshly resampled entry, evicting the oldest buckets past capacity.
    pub fn insert(&mut self, width: f32, entry: ScaledGarment) {
        let bucket = Self::bucket_for(width);
        self.misses += 1;
        if self.entries.insert(bucket, entry).is_some() {
            return;
        }
        self.order.push_back(bucket);
        while self.order.len() > self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.entries.remove(&oldest);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains_width(&self, width: f32) -> bool {
        self.entries.contains_key(&Self::bucket_for(width))
    }

    pub fn hits(&self) -> u64 {
        self.hits
    }

    /// Number of actual resamples performed.
    pub fn misses(&self) -> u64 {
        self.misses
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.order.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(scale: f32) -> ScaledGarment {
        ScaledGarment {
            image: Arc::new(RgbaImage::new(1, 1)),
            scale,
        }
    }

    #[test]
    fn widths_in_same_bucket_share_an_entry() {
        let mut cache = ResizeCache::new(5);
        assert!(cache.get(301.0).is_none());
        cache.insert(301.0, entry(1.0));
        let second = cache.get(305.0).expect("same bucket");
        assert_eq!(second.scale, 1.0);
        assert_eq!(cache.hits(), 1);
        assert_eq!(cache.misses(), 1);
    }

    #[test]
    fn evicts_oldest_bucket_first() {
        let mut cache = ResizeCache::new(2);
        cache.insert(100.0, entry(1.0));
        cache.insert(200.0, entry(2.0));
        // A hit on the oldest does not refresh its position.
        assert!(cache.get(101.0).is_some());
        cache.insert(300.0, entry(3.0));
        assert_eq!(cache.len(), 2);
        assert!(!cache.contains_width(100.0));
        assert!(cache.contains_width(200.0));
        assert!(cache.contains_width(300.0));
    }

    #[test]
    fn bucket_boundaries() {
        assert_eq!(ResizeCache::bucket_for(299.9), 29);
        assert_eq!(ResizeCache::bucket_for(300.0), 30);
        assert_eq!(ResizeCache::bucket_for(309.9), 30);
        assert_eq!(ResizeCache::bucket_for(-5.0), 0);
    }
}
