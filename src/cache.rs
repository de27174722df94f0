//! Fixed-capacity pixel slab cache.
//!
//! Every pipe owns one of these: a small pool of equally sized `f32` slabs
//! keyed by 64-bit content hashes. Lookups either bind an existing slab
//! (hit) or repurpose the least valuable entry (miss); a missed line is
//! *reserved* until the processor publishes it, and an abandoned line keeps
//! a zero hash so no later lookup can observe half-written pixels.

use std::hash::{BuildHasher, Hasher};
use std::sync::Arc;

use crate::roi::Roi;

/// A published pixel buffer. Consumers hold clones of the slab; the cache
/// identifies entries for [`PixelCache::invalidate`] and
/// [`PixelCache::reweight`] by pointer equality.
pub type PixBuf = Arc<Vec<f32>>;

/// Extra weight granted by [`PixelCache::reweight`] on top of the touch
/// clock.
const REWEIGHT_BONUS: u64 = 64;

struct CacheEntry {
    /// 0 marks a free (or abandoned) line.
    hash: u64,
    /// Touch-clock value; lowest goes first on eviction.
    weight: u64,
    /// Pinned entries are only evicted when every entry is pinned.
    important: bool,
    /// Reserved lines are being written and never match a lookup.
    reserved: bool,
    slab: Arc<Vec<f32>>,
}

/// Token for one cache line handed out by a lookup.
///
/// A missed line must be either [`PixelCache::publish`]ed after its slab
/// has been filled or [`PixelCache::abandon`]ed on an error path.
#[derive(Debug)]
pub struct CacheLine {
    index: usize,
    len: usize,
    /// True when the lookup found already-published pixels.
    pub hit: bool,
}

pub struct PixelCache {
    entries: Vec<CacheEntry>,
    slab_len: usize,
    clock: u64,
}

impl PixelCache {
    /// A pool of `entries` slabs, each holding `slab_len` floats.
    pub fn new(entries: usize, slab_len: usize) -> Self {
        let entries = (0..entries)
            .map(|_| CacheEntry {
                hash: 0,
                weight: 0,
                important: false,
                reserved: false,
                slab: Arc::new(vec![0.0; slab_len]),
            })
            .collect();
        Self {
            entries,
            slab_len,
            clock: 0,
        }
    }

    fn touch(&mut self, index: usize) {
        self.clock += 1;
        self.entries[index].weight = self.clock;
    }

    /// Pick the entry to repurpose: lowest weight among non-pinned lines,
    /// ties broken by scan order (equal to least-recently touched since the
    /// clock never repeats). Pinned lines only lose when everything is
    /// pinned.
    fn victim(&self) -> usize {
        let mut best: Option<usize> = None;
        for (i, e) in self.entries.iter().enumerate() {
            if e.important {
                continue;
            }
            match best {
                Some(b) if self.entries[b].weight <= e.weight => {}
                _ => best = Some(i),
            }
        }
        best.unwrap_or_else(|| {
            // all pinned: fall back to the globally lowest weight
            let mut b = 0;
            for (i, e) in self.entries.iter().enumerate() {
                if e.weight < self.entries[b].weight {
                    b = i;
                }
            }
            b
        })
    }

    fn lookup(&mut self, hash: u64, len: usize, important: bool) -> CacheLine {
        debug_assert!(hash != 0, "zero is the free-line marker");
        if let Some(index) = self
            .entries
            .iter()
            .position(|e| e.hash == hash && !e.reserved)
        {
            self.touch(index);
            if important {
                self.entries[index].important = true;
            }
            return CacheLine {
                index,
                len,
                hit: true,
            };
        }

        let index = self.victim();
        self.touch(index);
        let entry = &mut self.entries[index];
        entry.hash = hash;
        entry.important = important;
        entry.reserved = true;
        // Repurposed slabs are not zero-filled; callers must treat the
        // contents as uninitialised.
        if len > entry.slab.len() {
            entry.slab = Arc::new(vec![0.0; len]);
        }
        CacheLine {
            index,
            len,
            hit: false,
        }
    }

    /// Bind `hash` to a slab of at least `len` floats. Returns a hit line
    /// when the hash is already published, otherwise a reserved miss line.
    pub fn get(&mut self, hash: u64, len: usize) -> CacheLine {
        self.lookup(hash, len, false)
    }

    /// Like [`get`](Self::get), but the entry receives the pinned bit and
    /// is biased against eviction. Used for the terminal display buffer.
    pub fn get_important(&mut self, hash: u64, len: usize) -> CacheLine {
        self.lookup(hash, len, true)
    }

    /// Presence test without materialising a line. Reserved lines count:
    /// their hash is bound even though the pixels are still being written.
    pub fn available(&self, hash: u64) -> bool {
        hash != 0 && self.entries.iter().any(|e| e.hash == hash)
    }

    /// Writable view of a line's slab. For a miss this is the repurposed
    /// slab; writing to a hit line copies the pixels first so published
    /// clones stay untouched.
    pub fn writer(&mut self, line: &CacheLine) -> &mut [f32] {
        let entry = &mut self.entries[line.index];
        &mut Arc::make_mut(&mut entry.slab)[..line.len]
    }

    /// Read-only view of a line's pixels.
    pub fn reader(&self, line: &CacheLine) -> &[f32] {
        &self.entries[line.index].slab[..line.len]
    }

    /// Mark the line valid and hand out the shared buffer.
    pub fn publish(&mut self, line: CacheLine) -> PixBuf {
        let entry = &mut self.entries[line.index];
        entry.reserved = false;
        entry.slab.clone()
    }

    /// Give up a reserved line: its hash goes back to zero so the entry is
    /// reclaimable and unreachable by future lookups.
    pub fn abandon(&mut self, line: CacheLine) {
        let entry = &mut self.entries[line.index];
        entry.hash = 0;
        entry.reserved = false;
        entry.important = false;
    }

    /// Free the entry backing `buf`, if any.
    pub fn invalidate(&mut self, buf: &PixBuf) {
        for entry in &mut self.entries {
            if Arc::ptr_eq(&entry.slab, buf) {
                entry.hash = 0;
                entry.important = false;
            }
        }
    }

    /// Raise the LRU weight of the entry backing `buf`.
    pub fn reweight(&mut self, buf: &PixBuf) {
        self.clock += 1;
        let weight = self.clock + REWEIGHT_BONUS;
        for entry in &mut self.entries {
            if Arc::ptr_eq(&entry.slab, buf) {
                entry.weight = weight;
            }
        }
    }

    /// Invalidate every entry.
    pub fn flush(&mut self) {
        for entry in &mut self.entries {
            entry.hash = 0;
            entry.important = false;
            entry.reserved = false;
        }
    }

    pub fn slab_len(&self) -> usize {
        self.slab_len
    }
}

/// Deterministic 64-bit key for one pipeline position.
///
/// Folds the image id, the requested region and the committed per-piece
/// hashes of every enabled node up to (and including) `position`. Fixed
/// seeds keep two pipes with identical upstream state in agreement.
pub fn pipeline_hash<I>(image_id: i64, roi: &Roi, piece_hashes: I) -> u64
where
    I: IntoIterator<Item = u64>,
{
    let mut h = ahash::RandomState::with_seeds(
        0x7c2e_9d14_553a_001d,
        0x1f83_d9ab_fb41_bd6b,
        0x5be0_cd19_137e_2179,
        0x9b05_688c_2b3e_6c1f,
    )
    .build_hasher();
    h.write_u64(image_id as u64);
    for word in roi.hash_words() {
        h.write_u64(word);
    }
    for piece in piece_hashes {
        h.write_u64(piece);
    }
    let out = h.finish();
    // zero is reserved for free cache lines
    if out == 0 {
        1
    } else {
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn miss_then_hit() {
        let mut cache = PixelCache::new(2, 16);
        let line = cache.get(42, 16);
        assert!(!line.hit);
        cache.writer(&line).fill(1.5);
        let buf = cache.publish(line);
        assert_eq!(buf[0], 1.5);

        let line = cache.get(42, 16);
        assert!(line.hit);
        assert_eq!(cache.reader(&line)[0], 1.5);
    }

    #[test]
    fn coherence_after_get_and_invalidate() {
        let mut cache = PixelCache::new(2, 16);
        let line = cache.get(7, 16);
        assert!(cache.available(7));
        let buf = cache.publish(line);
        assert!(cache.available(7));
        cache.invalidate(&buf);
        assert!(!cache.available(7));
    }

    #[test]
    fn abandoned_lines_keep_zero_hash() {
        let mut cache = PixelCache::new(2, 16);
        let line = cache.get(9, 16);
        cache.abandon(line);
        assert!(!cache.available(9));
    }

    #[test]
    fn eviction_prefers_lowest_weight() {
        let mut cache = PixelCache::new(2, 16);
        let a = cache.get(1, 16);
        let a = cache.publish(a);
        let b = cache.get(2, 16);
        cache.publish(b);
        // touch entry 1 so entry 2 is the colder line
        cache.reweight(&a);
        let c = cache.get(3, 16);
        cache.publish(c);
        assert!(cache.available(1));
        assert!(!cache.available(2));
    }

    #[test]
    fn pinned_entries_survive_pressure() {
        let mut cache = PixelCache::new(2, 16);
        let gamma = cache.get_important(10, 16);
        cache.publish(gamma);
        for hash in 20..24 {
            let line = cache.get(hash, 16);
            cache.publish(line);
        }
        assert!(cache.available(10));
    }

    #[test]
    fn flush_clears_everything() {
        let mut cache = PixelCache::new(3, 16);
        for hash in 1..4 {
            let line = cache.get(hash, 16);
            cache.publish(line);
        }
        cache.flush();
        for hash in 1..4 {
            assert!(!cache.available(hash));
        }
    }

    #[test]
    fn hash_is_deterministic_and_parameter_sensitive() {
        let roi = Roi::new(0, 0, 8, 8, 1.0);
        let a = pipeline_hash(5, &roi, [11, 22].into_iter());
        let b = pipeline_hash(5, &roi, [11, 22].into_iter());
        assert_eq!(a, b);
        assert_ne!(a, pipeline_hash(5, &roi, [11, 23].into_iter()));
        assert_ne!(a, pipeline_hash(6, &roi, [11, 22].into_iter()));
        assert_ne!(
            a,
            pipeline_hash(5, &Roi::new(1, 0, 8, 8, 1.0), [11, 22].into_iter())
        );
    }
}
