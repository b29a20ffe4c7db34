use chrono::{DateTime, Utc};
use perkwise_core::StoredTransaction;
use std::collections::hash_map::Entry;
use std::collections::{BTreeMap, HashMap};

/// Per-benefit credits derived from one card-level import.
pub type DerivedCredits = BTreeMap<String, Vec<StoredTransaction>>;

#[derive(Debug, Clone)]
struct CacheEntry {
    imported_at: DateTime<Utc>,
    credits: DerivedCredits,
}

/// Matched credits keyed by card, valid for one import timestamp.
///
/// Owned by the caller rather than shared process state; a new import for a
/// card carries a new timestamp and replaces the entry on next lookup.
#[derive(Debug, Clone, Default)]
pub struct MatchCache {
    entries: HashMap<String, CacheEntry>,
}

impl MatchCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cached credits for `(card_id, imported_at)`, computing them with
    /// `derive` on a miss or when the cached entry is from another import.
    pub fn get_or_derive<F>(
        &mut self,
        card_id: &str,
        imported_at: DateTime<Utc>,
        derive: F,
    ) -> &DerivedCredits
    where
        F: FnOnce() -> DerivedCredits,
    {
        let entry = match self.entries.entry(card_id.to_string()) {
            Entry::Occupied(occupied) => {
                let entry = occupied.into_mut();
                if entry.imported_at != imported_at {
                    tracing::debug!(card_id, %imported_at, "Card import changed, re-deriving credits");
                    *entry = CacheEntry {
                        imported_at,
                        credits: derive(),
                    };
                }
                entry
            }
            Entry::Vacant(vacant) => {
                tracing::debug!(card_id, %imported_at, "Deriving credits for card import");
                vacant.insert(CacheEntry {
                    imported_at,
                    credits: derive(),
                })
            }
        };
        &entry.credits
    }

    pub fn invalidate(&mut self, card_id: &str) {
        self.entries.remove(card_id);
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
