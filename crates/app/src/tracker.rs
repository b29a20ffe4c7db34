//! Application service tying the catalog, the user-state store and the
//! import pipeline together. Snapshots are recomputed from a fresh store read
//! on every call; only derived card-import credits are cached.

use chrono::{DateTime, Duration, Utc};
use perkwise_core::{
    merge_transactions, reconcile, BenefitCatalog, BenefitDefinition, BenefitSnapshot,
    BenefitStatus, BenefitUsage, BenefitUserState, Money, Stats, StoredTransaction,
};
use perkwise_import::{
    derive_card_credits, import_statement, ImportError, ImportOutcome, MatchCache, StatementImport,
};
use perkwise_storage::{StoreError, UserDocument, UserStateStore};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError};
use thiserror::Error;

use crate::config::{ConfigError, Settings};

#[derive(Error, Debug)]
pub enum TrackerError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Import(#[from] ImportError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("Unknown benefit: {0}")]
    UnknownBenefit(String),
    #[error("Benefit {benefit} has no period {period}")]
    UnknownPeriod { benefit: String, period: String },
    #[error("Unknown card: {0}")]
    UnknownCard(String),
}

/// A pending benefit whose current window closes soon.
#[derive(Debug, Clone, Serialize)]
pub struct Expiring {
    pub ends_at: DateTime<Utc>,
    pub days_remaining: i64,
    /// Credit still available in the closing window.
    pub remaining: Money,
    pub snapshot: BenefitSnapshot,
}

/// What a confirmed import changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ImportSummary {
    pub credits_recorded: usize,
    pub rows_saved: usize,
}

pub struct Tracker {
    catalog: BenefitCatalog,
    store: Arc<UserStateStore>,
    cache: Mutex<MatchCache>,
}

impl Tracker {
    pub fn new(catalog: BenefitCatalog, store: Arc<UserStateStore>) -> Self {
        Self {
            catalog,
            store,
            cache: Mutex::new(MatchCache::new()),
        }
    }

    /// Loads the configured catalog and opens the user-state file.
    pub fn open(settings: &Settings) -> Result<Self, TrackerError> {
        let catalog = settings.load_catalog()?;
        let store = UserStateStore::open(settings.state_path());
        tracing::debug!(
            state = %settings.state_path().display(),
            benefits = catalog.definitions().len(),
            "Tracker opened"
        );
        Ok(Self::new(catalog, Arc::new(store)))
    }

    pub fn catalog(&self) -> &BenefitCatalog {
        &self.catalog
    }

    pub fn store(&self) -> &Arc<UserStateStore> {
        &self.store
    }

    // ── Reconciliation ────────────────────────────────────────────────────────

    /// Snapshots for every catalog benefit, optionally limited to one card.
    /// Ignored benefits are left out unless `include_ignored` is set.
    pub fn benefits(
        &self,
        card_id: Option<&str>,
        include_ignored: bool,
        year: Option<i32>,
        now: DateTime<Utc>,
    ) -> Result<Vec<BenefitSnapshot>, TrackerError> {
        let document = self.store.read()?;
        let derived = self.derived_credits(&document);

        let snapshots = self
            .catalog
            .definitions()
            .iter()
            .filter(|d| card_id.map_or(true, |id| d.card_id == id))
            .map(|definition| {
                let state = effective_state(
                    definition,
                    document.benefit(&definition.id),
                    derived.get(&definition.id),
                );
                reconcile(definition, state.as_ref(), year, now)
            })
            .filter(|snapshot| include_ignored || !snapshot.ignored)
            .collect();
        Ok(snapshots)
    }

    /// Summary over visible benefits, optionally limited to one card.
    pub fn stats(
        &self,
        card_id: Option<&str>,
        year: Option<i32>,
        now: DateTime<Utc>,
    ) -> Result<Stats, TrackerError> {
        let snapshots = self.benefits(card_id, false, year, now)?;
        Ok(Stats::aggregate(&snapshots, year, now))
    }

    /// Pending, visible benefits whose current window ends within `days` of
    /// `now`, soonest first.
    pub fn upcoming_expirations(&self, days: i64, now: DateTime<Utc>) -> Result<Vec<Expiring>, TrackerError> {
        let horizon = now + Duration::days(days);
        let mut expiring: Vec<Expiring> = self
            .benefits(None, false, None, now)?
            .into_iter()
            .filter_map(|snapshot| {
                let (range, status, remaining) = match snapshot.current_period() {
                    Some(period) => (
                        period.range,
                        period.status,
                        clamp_remaining(snapshot.segment_value() - period.used),
                    ),
                    None if !snapshot.has_periods() => {
                        (snapshot.effective_range, snapshot.status, snapshot.remaining())
                    }
                    None => return None,
                };
                if status != BenefitStatus::Pending || range.end < now || range.end > horizon {
                    return None;
                }
                Some(Expiring {
                    ends_at: range.end,
                    days_remaining: range.days_remaining(now),
                    remaining,
                    snapshot,
                })
            })
            .collect();
        expiring.sort_by(|a, b| {
            a.ends_at
                .cmp(&b.ends_at)
                .then_with(|| a.snapshot.benefit_id.cmp(&b.snapshot.benefit_id))
        });
        Ok(expiring)
    }

    /// Credits re-derived from every saved card import, keyed by benefit id.
    fn derived_credits(&self, document: &UserDocument) -> BTreeMap<String, Vec<StoredTransaction>> {
        let mut cache = self.cache.lock().unwrap_or_else(PoisonError::into_inner);
        let mut combined: BTreeMap<String, Vec<StoredTransaction>> = BTreeMap::new();
        for (card_id, import) in &document.card_imports {
            let credits = cache.get_or_derive(card_id, import.imported_at, || {
                derive_card_credits(card_id, &import.transactions, self.catalog.definitions())
            });
            for (benefit_id, transactions) in credits {
                combined
                    .entry(benefit_id.clone())
                    .or_default()
                    .extend(transactions.iter().cloned());
            }
        }
        combined
    }

    // ── Import ────────────────────────────────────────────────────────────────

    /// Parses and matches a statement without persisting anything.
    pub fn preview_import(&self, text: &str, card_id: &str) -> Result<ImportOutcome, TrackerError> {
        if self.catalog.card(card_id).is_none() {
            return Err(TrackerError::UnknownCard(card_id.to_string()));
        }
        Ok(import_statement(text, card_id, self.catalog.definitions())?)
    }

    /// Records a previewed import's matched credits and keeps its rows on the
    /// card so later reads can re-derive them.
    pub fn confirm_import(
        &self,
        import: &StatementImport,
        now: DateTime<Utc>,
    ) -> Result<ImportSummary, TrackerError> {
        let (credits_recorded, rows_saved) = self.store.record_import(
            &self.catalog,
            &import.usage(),
            &import.card_id,
            import.stored_transactions(),
            now,
        )?;
        self.cache
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .invalidate(&import.card_id);
        tracing::info!(
            card_id = %import.card_id,
            credits_recorded,
            rows_saved,
            "Import confirmed"
        );
        Ok(ImportSummary {
            credits_recorded,
            rows_saved,
        })
    }

    // ── Mutations ─────────────────────────────────────────────────────────────

    /// Records one manual credit. Returns `false` when it was already recorded.
    pub fn record(
        &self,
        benefit_id: &str,
        transaction: StoredTransaction,
        period_id: Option<&str>,
    ) -> Result<bool, TrackerError> {
        let definition = self.definition(benefit_id)?;
        let mut usage = BenefitUsage::default();
        match period_id {
            Some(period_id) => {
                if !definition.periods.iter().any(|p| p.id == period_id) {
                    return Err(TrackerError::UnknownPeriod {
                        benefit: benefit_id.to_string(),
                        period: period_id.to_string(),
                    });
                }
                usage.periods.insert(period_id.to_string(), vec![transaction]);
            }
            None => usage.transactions.push(transaction),
        }
        let mut by_benefit = BTreeMap::new();
        by_benefit.insert(benefit_id.to_string(), usage);
        Ok(self.store.record_usage(&self.catalog, &by_benefit)? > 0)
    }

    pub fn toggle_enrollment(&self, benefit_id: &str) -> Result<bool, TrackerError> {
        Ok(self.store.toggle_enrollment(self.definition(benefit_id)?)?)
    }

    pub fn set_ignored(&self, benefit_id: &str, ignored: bool) -> Result<(), TrackerError> {
        Ok(self.store.set_ignored(self.definition(benefit_id)?, ignored)?)
    }

    pub fn toggle_activation(&self, benefit_id: &str, now: DateTime<Utc>) -> Result<bool, TrackerError> {
        Ok(self.store.toggle_activation(self.definition(benefit_id)?, now)?)
    }

    pub fn note(&self, card_id: &str) -> Result<Option<String>, TrackerError> {
        self.card(card_id)?;
        Ok(self.store.import_note(card_id)?)
    }

    pub fn set_note(&self, card_id: &str, note: &str) -> Result<(), TrackerError> {
        self.card(card_id)?;
        Ok(self.store.set_import_note(card_id, note)?)
    }

    /// Drops all user state and cached derivations.
    pub fn reset(&self) -> Result<(), TrackerError> {
        self.store.reset()?;
        self.cache.lock().unwrap_or_else(PoisonError::into_inner).clear();
        Ok(())
    }

    fn definition(&self, benefit_id: &str) -> Result<&BenefitDefinition, TrackerError> {
        self.catalog
            .get(benefit_id)
            .ok_or_else(|| TrackerError::UnknownBenefit(benefit_id.to_string()))
    }

    fn card(&self, card_id: &str) -> Result<(), TrackerError> {
        self.catalog
            .card(card_id)
            .map(|_| ())
            .ok_or_else(|| TrackerError::UnknownCard(card_id.to_string()))
    }
}

/// Stored state with derived card-import credits merged in.
fn effective_state(
    definition: &BenefitDefinition,
    stored: Option<&BenefitUserState>,
    derived: Option<&Vec<StoredTransaction>>,
) -> Option<BenefitUserState> {
    let derived = derived.filter(|d| !d.is_empty());
    match (stored, derived) {
        (stored, None) => stored.cloned(),
        (stored, Some(derived)) => {
            let mut state = stored
                .cloned()
                .unwrap_or_else(|| BenefitUserState::for_definition(definition));
            let known: Vec<_> = state
                .periods
                .values()
                .flat_map(|p| p.transactions.iter().map(StoredTransaction::key))
                .collect();
            let fresh = derived.iter().filter(|tx| !known.contains(&tx.key())).cloned();
            merge_transactions(&mut state.transactions, fresh);
            Some(state)
        }
    }
}

fn clamp_remaining(amount: Money) -> Money {
    if amount.is_negative() {
        Money::zero()
    } else {
        amount
    }
}
