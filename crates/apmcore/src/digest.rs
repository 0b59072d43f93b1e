//! TDigest: mergeable streaming quantile sketch (spec §3, §6, §8).
//!
//! Centroids are kept sorted by mean and periodically recompressed using
//! the standard t-digest scale function, bounding centroid count to
//! roughly `compression`. Serialization uses the exact little-endian
//! layout spec §6 mandates so two processes merging serialized digests
//! never need to agree on anything beyond these bytes.

use crate::error::{Error, Result};

const MAGIC_LEN: usize = 8 * 2 + 8 + 4 + 8 * 2; // header size before centroids
const CENTROID_LEN: usize = 8 + 4; // mean:f64, weight:u32

#[derive(Debug, Clone)]
struct Centroid {
    mean: f64,
    weight: u64,
}

/// A streaming quantile sketch.
#[derive(Debug, Clone)]
pub struct TDigest {
    compression: f64,
    count: u64,
    min: f64,
    max: f64,
    centroids: Vec<Centroid>,
    /// Unmerged additions since the last compression pass.
    unmerged: usize,
}

impl Default for TDigest {
    fn default() -> Self {
        Self::new(100.0)
    }
}

impl TDigest {
    pub fn new(compression: f64) -> Self {
        Self {
            compression,
            count: 0,
            min: f64::INFINITY,
            max: f64::NEG_INFINITY,
            centroids: Vec::new(),
            unmerged: 0,
        }
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Adds one observation.
    pub fn add(&mut self, value: f64) {
        self.count += 1;
        self.min = self.min.min(value);
        self.max = self.max.max(value);
        self.centroids.push(Centroid {
            mean: value,
            weight: 1,
        });
        self.unmerged += 1;
        if self.unmerged > (self.compression as usize).max(20) * 4 {
            self.compress();
        }
    }

    /// Merges another digest's centroids into this one (union semantics,
    /// associative — spec §8's merge law).
    pub fn merge(&mut self, other: &TDigest) {
        if other.count == 0 {
            return;
        }
        self.count += other.count;
        self.min = self.min.min(other.min);
        self.max = self.max.max(other.max);
        self.centroids.extend(other.centroids.iter().cloned());
        self.unmerged += other.centroids.len();
        self.compress();
    }

    /// Recompresses centroids: sorts by mean, then greedily merges adjacent
    /// centroids while respecting the k-size scale function so no centroid
    /// claims more than its share of the rank space.
    fn compress(&mut self) {
        if self.centroids.is_empty() {
            self.unmerged = 0;
            return;
        }
        self.centroids
            .sort_by(|a, b| a.mean.partial_cmp(&b.mean).unwrap());

        let total: f64 = self.centroids.iter().map(|c| c.weight as f64).sum();
        let mut merged: Vec<Centroid> = Vec::with_capacity(self.centroids.len());
        let mut running = 0.0_f64;

        for c in self.centroids.drain(..) {
            match merged.last_mut() {
                Some(last) => {
                    let q = (running + last.weight as f64 / 2.0) / total;
                    let max_weight = 4.0 * total * q * (1.0 - q) / self.compression;
                    if (last.weight + c.weight) as f64 <= max_weight.max(1.0) {
                        let combined = last.weight + c.weight;
                        last.mean = (last.mean * last.weight as f64 + c.mean * c.weight as f64)
                            / combined as f64;
                        last.weight = combined;
                    } else {
                        running += last.weight as f64;
                        merged.push(c);
                    }
                }
                None => merged.push(c),
            }
        }

        self.centroids = merged;
        self.unmerged = 0;
    }

    /// Estimated value at quantile `q` in `[0, 1]`.
    pub fn quantile(&mut self, q: f64) -> f64 {
        if self.unmerged > 0 {
            self.compress();
        }
        if self.centroids.is_empty() {
            return 0.0;
        }
        if self.centroids.len() == 1 {
            return self.centroids[0].mean;
        }

        let q = q.clamp(0.0, 1.0);
        let total: f64 = self.centroids.iter().map(|c| c.weight as f64).sum();
        let target = q * total;

        let mut cumulative = 0.0_f64;
        for (i, c) in self.centroids.iter().enumerate() {
            let next_cumulative = cumulative + c.weight as f64;
            if target <= next_cumulative || i == self.centroids.len() - 1 {
                if i == 0 {
                    return self.min.max(c.mean - (next_cumulative - target).max(0.0));
                }
                if i == self.centroids.len() - 1 {
                    return self.max.min(c.mean + (target - cumulative).max(0.0));
                }
                // Linear interpolation between this centroid and its weight-half point.
                let fraction = (target - cumulative) / c.weight as f64;
                return c.mean
                    + (fraction - 0.5) * (self.max - self.min) / total.max(1.0) * c.weight as f64;
            }
            cumulative = next_cumulative;
        }
        self.max
    }

    pub fn min(&self) -> f64 {
        if self.count == 0 { 0.0 } else { self.min }
    }

    pub fn max(&self) -> f64 {
        if self.count == 0 { 0.0 } else { self.max }
    }

    /// Serializes to the exact layout spec §6 mandates:
    /// `compression:f64 | count:u64 | n_centroids:u32 | min:f64 | max:f64 | n x (mean:f64, weight:u32)`.
    pub fn serialize(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(MAGIC_LEN + self.centroids.len() * CENTROID_LEN);
        out.extend_from_slice(&self.compression.to_le_bytes());
        out.extend_from_slice(&self.count.to_le_bytes());
        out.extend_from_slice(&(self.centroids.len() as u32).to_le_bytes());
        out.extend_from_slice(&self.min().to_le_bytes());
        out.extend_from_slice(&self.max().to_le_bytes());
        for c in &self.centroids {
            out.extend_from_slice(&c.mean.to_le_bytes());
            out.extend_from_slice(&(c.weight as u32).to_le_bytes());
        }
        out
    }

    /// Deserializes from the layout above. On malformed input, returns
    /// `Error::DigestCorrupt` — callers are expected (spec §7) to fall back
    /// to treating the bucket's digest as empty and log once.
    pub fn deserialize(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < MAGIC_LEN {
            return Err(Error::DigestCorrupt("buffer shorter than header".into()));
        }
        let mut off = 0usize;
        let read_f64 = |b: &[u8], o: usize| f64::from_le_bytes(b[o..o + 8].try_into().unwrap());
        let read_u64 = |b: &[u8], o: usize| u64::from_le_bytes(b[o..o + 8].try_into().unwrap());
        let read_u32 = |b: &[u8], o: usize| u32::from_le_bytes(b[o..o + 4].try_into().unwrap());

        let compression = read_f64(bytes, off);
        off += 8;
        let count = read_u64(bytes, off);
        off += 8;
        let n_centroids = read_u32(bytes, off) as usize;
        off += 4;
        let min = read_f64(bytes, off);
        off += 8;
        let max = read_f64(bytes, off);
        off += 8;

        let expected = off + n_centroids * CENTROID_LEN;
        if bytes.len() < expected {
            return Err(Error::DigestCorrupt(format!(
                "expected {expected} bytes, got {}",
                bytes.len()
            )));
        }

        let mut centroids = Vec::with_capacity(n_centroids);
        for _ in 0..n_centroids {
            let mean = read_f64(bytes, off);
            off += 8;
            let weight = read_u32(bytes, off) as u64;
            off += 4;
            centroids.push(Centroid { mean, weight });
        }

        Ok(Self {
            compression,
            count,
            min,
            max,
            centroids,
            unmerged: 0,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn percentile_accuracy_uniform() {
        let mut d = TDigest::new(100.0);
        for i in 1..=1000 {
            d.add(i as f64);
        }
        let p50 = d.quantile(0.50);
        let p95 = d.quantile(0.95);
        let p99 = d.quantile(0.99);
        assert!((485.0..=515.0).contains(&p50), "p50={p50}");
        assert!((935.0..=965.0).contains(&p95), "p95={p95}");
        assert!((975.0..=1005.0).contains(&p99), "p99={p99}");
    }

    #[test]
    fn round_trip_preserves_percentiles_within_tolerance() {
        let mut d = TDigest::new(100.0);
        for i in 1..=2000 {
            d.add((i * i % 997) as f64);
        }
        let before = d.quantile(0.95);
        let bytes = d.serialize();
        let mut restored = TDigest::deserialize(&bytes).unwrap();
        let after = restored.quantile(0.95);
        assert!((before - after).abs() / before.max(1.0) < 0.01);
        assert_eq!(d.count(), restored.count());
    }

    #[test]
    fn merge_is_associative_for_count() {
        let mut a = TDigest::new(100.0);
        let mut b = TDigest::new(100.0);
        let mut c = TDigest::new(100.0);
        for i in 0..300 {
            a.add(i as f64);
        }
        for i in 300..600 {
            b.add(i as f64);
        }
        for i in 600..900 {
            c.add(i as f64);
        }

        let mut ab_then_c = a.clone();
        ab_then_c.merge(&b);
        ab_then_c.merge(&c);

        let mut bc = b.clone();
        bc.merge(&c);
        let mut a_then_bc = a.clone();
        a_then_bc.merge(&bc);

        assert_eq!(ab_then_c.count(), a_then_bc.count());
        assert_eq!(ab_then_c.count(), 900);
    }

    #[test]
    fn deserialize_rejects_truncated_input() {
        let err = TDigest::deserialize(&[0u8; 4]).unwrap_err();
        matches!(err, Error::DigestCorrupt(_));
    }
}
