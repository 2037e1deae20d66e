use std::collections::HashMap;

use tracing::debug;

use crate::app::Result;
use crate::domain::{CandidateEntry, Entry};
use crate::store::SharedStore;

#[derive(Debug, Default)]
pub struct DedupOutcome {
    /// Entries inserted by this batch.
    pub new: Vec<Entry>,
    /// Candidates that were already stored.
    pub known: usize,
}

/// Splits a batch of candidates into new and already-seen entries.
pub struct Deduplicator {
    store: SharedStore,
}

impl Deduplicator {
    pub fn new(store: SharedStore) -> Self {
        Self { store }
    }

    pub fn dedup(&self, feed_id: i64, candidates: Vec<CandidateEntry>) -> Result<DedupOutcome> {
        let batch = collapse(candidates);
        let survivors = batch.len();

        let new = self.store.insert_entries(feed_id, &batch)?;
        let known = survivors - new.len();

        debug!(feed_id, new = new.len(), known, "Deduplicated batch");
        Ok(DedupOutcome { new, known })
    }
}

/// Collapse in-batch duplicates by case-insensitive key.
///
/// The later published timestamp wins; a timestamp beats none; ties keep the
/// first occurrence. Order of first appearance is preserved.
pub fn collapse(candidates: Vec<CandidateEntry>) -> Vec<CandidateEntry> {
    let mut index: HashMap<String, usize> = HashMap::new();
    let mut out: Vec<CandidateEntry> = Vec::with_capacity(candidates.len());

    for candidate in candidates {
        let Some(key) = candidate.normalized_key() else {
            continue;
        };

        match index.get(&key) {
            Some(&i) => {
                if candidate.published_at > out[i].published_at {
                    out[i] = candidate;
                }
            }
            None => {
                index.insert(key, out.len());
                out.push(candidate);
            }
        }
    }

    out
}
