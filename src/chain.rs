//! Hash chain generation and verification.
//!
//! Goals:
//! - Commit the house to every round outcome before the round is played.
//! - Generate each segment back-to-front from a secret seed so a disclosed
//!   round hash never reveals the hash of the round after it.
//! - Persist progress per batch so an interrupted run resumes where it stopped.

use crate::{
    crash::{CrashResolver, RoundHash},
    errors::{ChainError, ChainResult, StoreError},
    storage::{keys, parse_hash, LedgerStore},
    types::{Round, FIRST_ROUND_ID},
};
use serde::{Deserialize, Serialize};

/// Persisted bookkeeping for one contiguous run of rounds sharing a seed.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct SegmentRecord {
    pub first_round_id: u64,
    pub last_round_id: u64,
    /// Lowest round id whose hash has been written. Generation runs downward.
    pub lowest_written: u64,
    /// `sha256(hex(hash_first))`, set once the whole segment is written.
    pub commitment: Option<RoundHash>,
}

impl SegmentRecord {
    pub fn is_complete(&self) -> bool {
        self.commitment.is_some()
    }

    pub fn contains(&self, round_id: u64) -> bool {
        (self.first_round_id..=self.last_round_id).contains(&round_id)
    }
}

/// Result of a completed `extend` call.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChainSegment {
    /// Public value to publish before play. Hashing the segment's first round
    /// hash must reproduce it.
    pub commitment: RoundHash,
    pub pairs: Vec<(u64, RoundHash)>,
}

/// Outcome of walking the stored chain.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ChainReport {
    pub segments: usize,
    pub hashes_checked: u64,
    pub rounds_checked: u64,
    pub problems: Vec<String>,
}

impl ChainReport {
    pub fn is_valid(&self) -> bool {
        self.problems.is_empty()
    }
}

/// `true` if `later` is the hash of the round directly after `earlier`.
pub fn verify_link(earlier: &RoundHash, later: &RoundHash) -> bool {
    later.preceding() == *earlier
}

/// Recompute a segment from its disclosed seed and compare.
///
/// `pairs` must be ascending and contiguous; the last pair must be the hash of
/// the seed and `commitment` must be the hash of the first pair's hash.
pub fn verify_segment(seed: &str, commitment: &RoundHash, pairs: &[(u64, RoundHash)]) -> ChainResult<()> {
    let Some(&(last_id, last_hash)) = pairs.last() else {
        return Err(ChainError::EmptySegment);
    };
    if RoundHash::from_seed(seed) != last_hash {
        return Err(ChainError::SeedMismatch { round_id: last_id });
    }

    for window in pairs.windows(2) {
        let (earlier_id, earlier) = window[0];
        let (later_id, later) = window[1];
        if earlier_id.checked_add(1) != Some(later_id) || !verify_link(&earlier, &later) {
            return Err(ChainError::BrokenLink { round_id: earlier_id, next: later_id });
        }
    }

    let (first_id, first_hash) = pairs[0];
    let before = first_id.checked_sub(1).ok_or(ChainError::RangeOverflow {
        from: first_id,
        count: pairs.len() as u64,
    })?;
    if first_hash.preceding() != *commitment {
        return Err(ChainError::BrokenLink { round_id: before, next: first_id });
    }
    Ok(())
}

/// Offline producer of the committed round hashes.
pub struct HashChainGenerator {
    store: LedgerStore,
    resolver: CrashResolver,
    batch_size: u64,
}

impl HashChainGenerator {
    pub fn new(store: LedgerStore, resolver: CrashResolver, batch_size: usize) -> Self {
        Self {
            store,
            resolver,
            batch_size: batch_size.max(1) as u64,
        }
    }

    /// Highest round id covered by a completed segment. Before any segment
    /// exists this is the round just below the first playable one.
    pub fn head(&self) -> ChainResult<u64> {
        let mut head = FIRST_ROUND_ID - 1;
        for segment in self.segments()? {
            if segment.is_complete() {
                head = head.max(segment.last_round_id);
            }
        }
        Ok(head)
    }

    /// Segment whose generation was interrupted, if any.
    pub fn pending_segment(&self) -> ChainResult<Option<SegmentRecord>> {
        Ok(self.segments()?.into_iter().find(|s| !s.is_complete()))
    }

    pub fn segments(&self) -> ChainResult<Vec<SegmentRecord>> {
        Ok(self.store.scan_json(keys::CHAIN_SEGMENT, usize::MAX)?)
    }

    pub fn segment_for(&self, round_id: u64) -> ChainResult<Option<SegmentRecord>> {
        Ok(self.segments()?.into_iter().find(|s| s.contains(round_id)))
    }

    /// Extend the chain by `count` rounds after `from_round_id`.
    ///
    /// Calling again with the same arguments and seed resumes an interrupted
    /// segment or, once complete, returns the stored segment unchanged.
    pub fn extend(&self, from_round_id: u64, count: u64, seed: &str) -> ChainResult<ChainSegment> {
        if count == 0 {
            return Err(ChainError::EmptySegment);
        }
        let overflow = || ChainError::RangeOverflow { from: from_round_id, count };
        let first = from_round_id.checked_add(1).ok_or_else(overflow)?;
        let last = from_round_id.checked_add(count).ok_or_else(overflow)?;
        // The write cursor starts one past the last round.
        last.checked_add(1).ok_or_else(overflow)?;

        let mut segment = match self.store.get_json::<SegmentRecord>(&keys::chain_segment(first))? {
            Some(existing) if existing.last_round_id != last => {
                return Err(ChainError::SegmentMismatch {
                    in_progress: existing.last_round_id,
                    requested: last,
                });
            }
            Some(existing) => {
                self.check_seed(&existing, seed)?;
                existing
            }
            None => self.begin_segment(from_round_id, first, last)?,
        };

        while !segment.is_complete() {
            self.write_batch(&mut segment, seed)?;
        }

        let commitment = segment.commitment.ok_or(ChainError::EmptySegment)?;
        let pairs = self.stored_pairs(first, last)?;
        Ok(ChainSegment { commitment, pairs })
    }

    /// Hashes stored for rounds `first..=last`, ascending.
    pub fn stored_pairs(&self, first: u64, last: u64) -> ChainResult<Vec<(u64, RoundHash)>> {
        let limit = (last - first + 1) as usize;
        let rows = self
            .store
            .scan_from(keys::CHAIN_HASH, &keys::chain_hash(first), limit)?;

        let mut pairs = Vec::with_capacity(rows.len());
        for (key, value) in rows {
            let round_id = keys::trailing_id(&key).ok_or_else(|| StoreError::Corrupted {
                key: String::from_utf8_lossy(&key).to_string(),
                reason: "missing round id suffix".to_string(),
            })?;
            pairs.push((round_id, parse_hash(&key, &value)?));
        }

        if pairs.len() != limit {
            let missing = pairs
                .iter()
                .zip(first..)
                .find(|((id, _), expected)| id != expected)
                .map(|(_, expected)| expected)
                .unwrap_or(first + pairs.len() as u64);
            return Err(ChainError::BrokenLink {
                round_id: missing,
                next: missing + 1,
            });
        }
        Ok(pairs)
    }

    /// Walk every stored segment and every created round.
    pub fn verify_stored(&self) -> ChainResult<ChainReport> {
        let mut report = ChainReport::default();

        for segment in self.segments()? {
            report.segments += 1;
            let Some(commitment) = segment.commitment else {
                report.problems.push(format!(
                    "segment {}..={} is incomplete (lowest written {})",
                    segment.first_round_id, segment.last_round_id, segment.lowest_written
                ));
                continue;
            };

            let pairs = match self.stored_pairs(segment.first_round_id, segment.last_round_id) {
                Ok(pairs) => pairs,
                Err(e) => {
                    report.problems.push(e.to_string());
                    continue;
                }
            };
            report.hashes_checked += pairs.len() as u64;

            if pairs[0].1.preceding() != commitment {
                report
                    .problems
                    .push(format!("round {} does not match its segment commitment", segment.first_round_id));
            }
            for window in pairs.windows(2) {
                if !verify_link(&window[0].1, &window[1].1) {
                    report
                        .problems
                        .push(format!("broken link between rounds {} and {}", window[0].0, window[1].0));
                }
            }
        }

        for round in self.store.scan_json::<Round>(keys::ROUND, usize::MAX)? {
            report.rounds_checked += 1;
            match self.store.round_hash(round.id)? {
                Some(hash) if hash == round.hash => {}
                Some(_) => report
                    .problems
                    .push(format!("round {} hash differs from the committed chain", round.id)),
                None => report
                    .problems
                    .push(format!("round {} has no committed hash", round.id)),
            }
            if self.resolver.crash_point(&round.hash) != round.crash_point {
                report
                    .problems
                    .push(format!("round {} crash point does not match its hash", round.id));
            }
        }

        Ok(report)
    }

    fn begin_segment(&self, from_round_id: u64, first: u64, last: u64) -> ChainResult<SegmentRecord> {
        if let Some(pending) = self.pending_segment()? {
            return Err(ChainError::SegmentMismatch {
                in_progress: pending.last_round_id,
                requested: last,
            });
        }
        let head = self.head()?;
        if from_round_id != head {
            return Err(ChainError::NotAtHead { head, from: from_round_id });
        }

        let segment = SegmentRecord {
            first_round_id: first,
            last_round_id: last,
            lowest_written: last + 1,
            commitment: None,
        };
        let txn = self.store.begin();
        txn.put(&keys::chain_segment(first), &segment)?;
        txn.commit()?;

        tracing::info!(first_round_id = first, last_round_id = last, "starting hash chain segment");
        Ok(segment)
    }

    fn check_seed(&self, segment: &SegmentRecord, seed: &str) -> ChainResult<()> {
        if segment.lowest_written > segment.last_round_id {
            return Ok(());
        }
        match self.store.round_hash(segment.last_round_id)? {
            Some(stored) if stored == RoundHash::from_seed(seed) => Ok(()),
            _ => Err(ChainError::SeedMismatch { round_id: segment.last_round_id }),
        }
    }

    /// Write the next batch downward and advance the persisted cursor in the
    /// same transaction.
    fn write_batch(&self, segment: &mut SegmentRecord, seed: &str) -> ChainResult<()> {
        let mut hash = if segment.lowest_written > segment.last_round_id {
            RoundHash::from_seed(seed)
        } else {
            self.store
                .round_hash(segment.lowest_written)?
                .ok_or(ChainError::BrokenLink {
                    round_id: segment.lowest_written - 1,
                    next: segment.lowest_written,
                })?
                .preceding()
        };

        let top = segment.lowest_written - 1;
        let bottom = top
            .saturating_sub(self.batch_size - 1)
            .max(segment.first_round_id);

        let txn = self.store.begin();
        for round_id in (bottom..=top).rev() {
            txn.put_raw(&keys::chain_hash(round_id), hash.as_bytes())?;
            if round_id > bottom {
                hash = hash.preceding();
            }
        }

        let mut next = segment.clone();
        next.lowest_written = bottom;
        if bottom == segment.first_round_id {
            next.commitment = Some(hash.preceding());
        }
        txn.put(&keys::chain_segment(segment.first_round_id), &next)?;
        txn.commit()?;

        tracing::debug!(
            first_round_id = segment.first_round_id,
            lowest_written = bottom,
            "hash chain batch written"
        );
        if next.is_complete() {
            tracing::info!(
                first_round_id = next.first_round_id,
                last_round_id = next.last_round_id,
                "hash chain segment complete"
            );
        }

        *segment = next;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const SEED: &str = "crashline-test-seed";

    fn generator(dir: &TempDir, batch_size: usize) -> HashChainGenerator {
        let store = LedgerStore::open_path(dir.path()).unwrap();
        HashChainGenerator::new(store, CrashResolver::default(), batch_size)
    }

    #[test]
    fn test_extend_builds_back_to_front() {
        let dir = TempDir::new().unwrap();
        let chain = generator(&dir, 4);

        let segment = chain.extend(FIRST_ROUND_ID - 1, 10, SEED).unwrap();
        assert_eq!(segment.pairs.len(), 10);
        assert_eq!(segment.pairs[0].0, 1_000_000);
        assert_eq!(
            segment.pairs[0].1.to_hex(),
            "a6c4da331f3a0b24791f5b601e09c852e89d8904ae3bfe1c350a70539cd6da5a"
        );
        assert_eq!(segment.pairs[9].1, RoundHash::from_seed(SEED));
        assert_eq!(
            segment.commitment.to_hex(),
            "d66c25c806eb952d32bd6ebcaa8a3f309c0a221115dbe420f0204dfc0e92d593"
        );
        assert_eq!(chain.head().unwrap(), 1_000_009);
        verify_segment(SEED, &segment.commitment, &segment.pairs).unwrap();
    }

    #[test]
    fn test_extend_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let chain = generator(&dir, 3);

        let first = chain.extend(FIRST_ROUND_ID - 1, 7, SEED).unwrap();
        let again = chain.extend(FIRST_ROUND_ID - 1, 7, SEED).unwrap();
        assert_eq!(first, again);

        let err = chain.extend(FIRST_ROUND_ID - 1, 7, "other-seed").unwrap_err();
        assert!(matches!(err, ChainError::SeedMismatch { .. }));
    }

    #[test]
    fn test_resume_interrupted_segment() {
        let dir = TempDir::new().unwrap();
        let chain = generator(&dir, 4);

        let mut segment = chain.begin_segment(FIRST_ROUND_ID - 1, FIRST_ROUND_ID, FIRST_ROUND_ID + 9).unwrap();
        chain.write_batch(&mut segment, SEED).unwrap();
        assert_eq!(chain.pending_segment().unwrap().unwrap().lowest_written, FIRST_ROUND_ID + 6);
        assert_eq!(chain.head().unwrap(), FIRST_ROUND_ID - 1);

        let resumed = chain.extend(FIRST_ROUND_ID - 1, 10, SEED).unwrap();
        assert!(chain.pending_segment().unwrap().is_none());

        let fresh_dir = TempDir::new().unwrap();
        let fresh = generator(&fresh_dir, 100).extend(FIRST_ROUND_ID - 1, 10, SEED).unwrap();
        assert_eq!(resumed, fresh);
    }

    #[test]
    fn test_extend_rejects_gaps_and_overlaps() {
        let dir = TempDir::new().unwrap();
        let chain = generator(&dir, 10);
        chain.extend(FIRST_ROUND_ID - 1, 5, SEED).unwrap();

        let err = chain.extend(FIRST_ROUND_ID + 10, 5, "next").unwrap_err();
        assert!(matches!(err, ChainError::NotAtHead { head, .. } if head == FIRST_ROUND_ID + 4));
        assert!(matches!(chain.extend(FIRST_ROUND_ID - 1, 3, SEED), Err(ChainError::SegmentMismatch { .. })));
        assert!(matches!(chain.extend(FIRST_ROUND_ID + 4, 0, "next"), Err(ChainError::EmptySegment)));

        let next = chain.extend(FIRST_ROUND_ID + 4, 5, "next-secret").unwrap();
        assert_eq!(next.pairs[0].0, FIRST_ROUND_ID + 5);
        assert_eq!(chain.head().unwrap(), FIRST_ROUND_ID + 9);
        assert!(chain.verify_stored().unwrap().is_valid());
    }

    #[test]
    fn test_disclosed_hash_does_not_link_forward() {
        let dir = TempDir::new().unwrap();
        let chain = generator(&dir, 10);
        let segment = chain.extend(FIRST_ROUND_ID - 1, 3, SEED).unwrap();

        let (_, first) = segment.pairs[0];
        let (_, second) = segment.pairs[1];
        assert!(verify_link(&first, &second));
        assert_ne!(first.preceding(), second);
    }

    #[test]
    fn test_verify_segment_detects_tampering() {
        let dir = TempDir::new().unwrap();
        let chain = generator(&dir, 10);
        let segment = chain.extend(FIRST_ROUND_ID - 1, 4, SEED).unwrap();

        let mut tampered = segment.pairs.clone();
        tampered[1].1 = RoundHash::from_seed("forged");
        assert!(matches!(
            verify_segment(SEED, &segment.commitment, &tampered),
            Err(ChainError::BrokenLink { .. })
        ));
        assert!(matches!(
            verify_segment("wrong", &segment.commitment, &segment.pairs),
            Err(ChainError::SeedMismatch { .. })
        ));
        assert!(matches!(verify_segment(SEED, &segment.commitment, &[]), Err(ChainError::EmptySegment)));
    }

    #[test]
    fn test_round_ids_past_the_range_are_rejected() {
        let dir = TempDir::new().unwrap();
        let chain = generator(&dir, 10);

        assert!(matches!(
            chain.extend(u64::MAX - 1, 5, SEED),
            Err(ChainError::RangeOverflow { count: 5, .. })
        ));
        assert!(matches!(chain.extend(u64::MAX - 1, 1, SEED), Err(ChainError::RangeOverflow { .. })));
        assert!(chain.segments().unwrap().is_empty());

        let tail = RoundHash::from_seed(SEED);
        let commitment = tail.preceding().preceding();
        assert!(matches!(
            verify_segment(SEED, &commitment, &[(0, tail)]),
            Err(ChainError::RangeOverflow { from: 0, .. })
        ));
        assert!(matches!(
            verify_segment(SEED, &commitment, &[(u64::MAX, tail.preceding()), (0, tail)]),
            Err(ChainError::BrokenLink { round_id: u64::MAX, next: 0 })
        ));
    }
}
