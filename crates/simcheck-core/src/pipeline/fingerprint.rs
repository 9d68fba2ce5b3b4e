use dashmap::DashMap;
use std::collections::VecDeque;
use std::sync::Arc;
use tracing::trace;

use crate::error::Error;

const ROLLING_BASE: u64 = 911382323;

/// Winnowed fingerprints for one token stream.
///
/// `hashes` is the deduplicated, sorted set used for overlap comparison and
/// persisted as the blob; `positions` keeps every selected (hash, k-gram
/// start) in selection order so matches can be mapped back to token ranges
/// for evidence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fingerprints {
    pub hashes: Vec<u64>,
    pub positions: Vec<(u64, u32)>,
}

impl Fingerprints {
    pub fn count(&self) -> usize {
        self.hashes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hashes.is_empty()
    }
}

/// Select fingerprints from a normalized token stream: rolling hash over
/// every k-gram, then the minimum hash within each sliding window of `w`
/// consecutive k-grams, preferring the rightmost occurrence on ties.
///
/// Streams shorter than `k` tokens produce an empty set; that is not an
/// error. Streams with fewer than `w` k-grams select the single overall
/// minimum so short files still fingerprint.
pub fn winnow(codes: &[u32], k: usize, w: usize) -> Fingerprints {
    if k == 0 || w == 0 || codes.len() < k {
        return Fingerprints {
            hashes: Vec::new(),
            positions: Vec::new(),
        };
    }

    let grams = gram_hashes(codes, k);

    let mut selected: Vec<(u64, usize)> = Vec::new();
    let mut window: VecDeque<usize> = VecDeque::new();
    for (i, &hash) in grams.iter().enumerate() {
        while window.front().is_some_and(|&idx| idx + w <= i) {
            window.pop_front();
        }
        // `<=` keeps the rightmost of equal minima.
        while window.back().is_some_and(|&idx| hash <= grams[idx]) {
            window.pop_back();
        }
        window.push_back(i);

        if i + 1 >= w {
            let min_idx = *window.front().expect("window has items");
            if selected.last().map(|&(_, idx)| idx) != Some(min_idx) {
                selected.push((grams[min_idx], min_idx));
            }
        }
    }

    // Fewer k-grams than a full window: take the single minimum seen.
    if selected.is_empty() {
        if let Some(&min_idx) = window.front() {
            selected.push((grams[min_idx], min_idx));
        }
    }

    let mut hashes: Vec<u64> = selected.iter().map(|&(h, _)| h).collect();
    hashes.sort_unstable();
    hashes.dedup();

    Fingerprints {
        hashes,
        positions: selected
            .into_iter()
            .map(|(h, idx)| (h, idx as u32))
            .collect(),
    }
}

/// Rolling polynomial hash of every k-gram, left to right. Index `i` holds
/// the hash of `codes[i..i + k]`.
fn gram_hashes(codes: &[u32], k: usize) -> Vec<u64> {
    let mut pow = 1u64;
    for _ in 1..k {
        pow = pow.wrapping_mul(ROLLING_BASE);
    }

    let mut hash = 0u64;
    for &code in &codes[..k] {
        hash = hash
            .wrapping_mul(ROLLING_BASE)
            .wrapping_add(u64::from(code).wrapping_add(1));
    }

    let mut grams = Vec::with_capacity(codes.len() - k + 1);
    grams.push(hash);
    for i in 1..=codes.len() - k {
        let outgoing = u64::from(codes[i - 1]).wrapping_add(1);
        let incoming = u64::from(codes[i + k - 1]).wrapping_add(1);
        hash = hash
            .wrapping_sub(outgoing.wrapping_mul(pow))
            .wrapping_mul(ROLLING_BASE)
            .wrapping_add(incoming);
        grams.push(hash);
    }
    grams
}

/// Serialize the sorted hash set for the `fingerprint_blob` column.
pub fn encode_blob(hashes: &[u64]) -> Result<Vec<u8>, Error> {
    bincode::serialize(hashes).map_err(|e| Error::Other(format!("fingerprint blob encode: {e}")))
}

pub fn decode_blob(blob: &[u8]) -> Result<Vec<u64>, Error> {
    bincode::deserialize(blob).map_err(|e| Error::Other(format!("fingerprint blob decode: {e}")))
}

#[derive(Debug, Clone, Hash, PartialEq, Eq)]
struct CacheKey {
    content_hash: String,
    k: usize,
    w: usize,
    algo_version: String,
}

/// Shares fingerprint computations between files with identical bytes.
/// Keyed by content hash plus the full parameter set, so runs with
/// different `k`/`w`/version never see each other's entries.
pub struct FingerprintCache {
    entries: DashMap<CacheKey, Arc<Fingerprints>>,
}

impl FingerprintCache {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }

    pub fn get_or_compute(
        &self,
        content_hash: &str,
        k: usize,
        w: usize,
        algo_version: &str,
        codes: &[u32],
    ) -> Arc<Fingerprints> {
        let key = CacheKey {
            content_hash: content_hash.to_string(),
            k,
            w,
            algo_version: algo_version.to_string(),
        };
        if let Some(hit) = self.entries.get(&key) {
            trace!("Fingerprint cache hit for {}", content_hash);
            return Arc::clone(hit.value());
        }
        let computed = Arc::new(winnow(codes, k, w));
        self.entries
            .entry(key)
            .or_insert(computed)
            .value()
            .clone()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for FingerprintCache {
    fn default() -> Self {
        Self::new()
    }
}
