use ahash::AHashMap;
use std::sync::Arc;
use tracing::{debug, warn};

use super::fingerprint::Fingerprints;

/// A file pair emitted by the candidate index, canonicalized to
/// `file_a_id < file_b_id`.
#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    pub file_a_id: i64,
    pub file_b_id: i64,
    pub overlap_count: i64,
    pub fingerprint_score: f64,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct IndexStats {
    pub hashes_indexed: u64,
    /// Hashes dropped because their posting list exceeded the cap.
    pub postings_dropped: u64,
}

/// Build candidate pairs from all files' fingerprint sets.
///
/// One inverted-index pass over total fingerprints rather than all-pairs
/// file comparison; cost stays near-linear in fingerprint volume. Hashes
/// whose posting list exceeds `max_postings` are boilerplate shared by many
/// submissions and are dropped from indexing (logged, non-fatal) so one
/// common header cannot blow the pairwise counters up quadratically.
pub fn build_candidates(
    sets: &[(i64, Arc<Fingerprints>)],
    min_overlap: usize,
    max_postings: usize,
) -> (Vec<Candidate>, IndexStats) {
    let mut stats = IndexStats::default();

    let mut inverted: AHashMap<u64, Vec<i64>> = AHashMap::new();
    let mut set_sizes: AHashMap<i64, usize> = AHashMap::new();
    for (file_id, fingerprints) in sets {
        set_sizes.insert(*file_id, fingerprints.count());
        for &hash in &fingerprints.hashes {
            inverted.entry(hash).or_default().push(*file_id);
        }
    }
    stats.hashes_indexed = inverted.len() as u64;

    let mut overlap: AHashMap<(i64, i64), i64> = AHashMap::new();
    for (hash, file_ids) in &inverted {
        if file_ids.len() > max_postings {
            stats.postings_dropped += 1;
            warn!(
                "Dropping fingerprint {:#018x} from index: posting list {} exceeds cap {}",
                hash,
                file_ids.len(),
                max_postings
            );
            continue;
        }
        for i in 0..file_ids.len() {
            for j in (i + 1)..file_ids.len() {
                let (a, b) = if file_ids[i] < file_ids[j] {
                    (file_ids[i], file_ids[j])
                } else {
                    (file_ids[j], file_ids[i])
                };
                if a == b {
                    continue;
                }
                *overlap.entry((a, b)).or_insert(0) += 1;
            }
        }
    }

    let mut candidates: Vec<Candidate> = overlap
        .into_iter()
        .filter(|&(_, count)| count >= min_overlap as i64)
        .map(|((a, b), count)| {
            let size_a = set_sizes.get(&a).copied().unwrap_or(0);
            let size_b = set_sizes.get(&b).copied().unwrap_or(0);
            let smaller = size_a.min(size_b).max(1);
            Candidate {
                file_a_id: a,
                file_b_id: b,
                overlap_count: count,
                fingerprint_score: count as f64 / smaller as f64,
            }
        })
        .collect();
    candidates.sort_by_key(|c| (c.file_a_id, c.file_b_id));

    debug!(
        "Candidate index: {} hashes, {} dropped, {} pairs",
        stats.hashes_indexed,
        stats.postings_dropped,
        candidates.len()
    );
    (candidates, stats)
}
