//! Mutation helpers. Each one is a single read-modify-write of the whole
//! document.

use chrono::{DateTime, Utc};
use perkwise_core::{
    merge_transactions, BenefitCatalog, BenefitDefinition, BenefitUsage, BenefitUserState,
    StoredTransaction,
};
use std::collections::BTreeMap;

use crate::document::{CardImport, UserDocument};
use crate::store::UserStateStore;
use crate::StoreError;

impl UserStateStore {
    /// Applies `change` to the benefit's state, creating it with defaults if
    /// needed, and returns the updated state.
    pub fn update_benefit(
        &self,
        definition: &BenefitDefinition,
        change: impl FnOnce(&mut BenefitUserState),
    ) -> Result<BenefitUserState, StoreError> {
        self.update(|doc| {
            let state = doc.benefit_mut(definition);
            change(state);
            state.clone()
        })
    }

    pub fn toggle_enrollment(&self, definition: &BenefitDefinition) -> Result<bool, StoreError> {
        let state = self.update_benefit(definition, |state| state.enrolled = !state.enrolled)?;
        tracing::info!(benefit = %definition.id, enrolled = state.enrolled, "Enrollment toggled");
        Ok(state.enrolled)
    }

    pub fn set_ignored(&self, definition: &BenefitDefinition, ignored: bool) -> Result<(), StoreError> {
        self.update_benefit(definition, |state| state.ignored = ignored)?;
        tracing::info!(benefit = %definition.id, ignored, "Visibility changed");
        Ok(())
    }

    /// Flips the activation acknowledgement, stamping it with `now` when set.
    pub fn toggle_activation(
        &self,
        definition: &BenefitDefinition,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let state = self.update_benefit(definition, |state| {
            state.activation_acknowledged = !state.activation_acknowledged;
            state.activation_acknowledged_at = state.activation_acknowledged.then_some(now);
        })?;
        Ok(state.activation_acknowledged)
    }

    /// Merges credits into the user state of each benefit, skipping any
    /// transaction already recorded. Benefits missing from the catalog are
    /// still recorded. Returns the number of transactions added.
    pub fn record_usage(
        &self,
        catalog: &BenefitCatalog,
        usage: &BTreeMap<String, BenefitUsage>,
    ) -> Result<usize, StoreError> {
        let added = self.update(|doc| apply_usage(doc, catalog, usage))?;
        tracing::info!(benefits = usage.len(), added, "Recorded usage");
        Ok(added)
    }

    /// Adds statement rows to a card's saved import and stamps it with
    /// `imported_at`. Returns the number of new rows.
    pub fn save_card_import(
        &self,
        card_id: &str,
        transactions: Vec<StoredTransaction>,
        imported_at: DateTime<Utc>,
    ) -> Result<usize, StoreError> {
        let added = self.update(|doc| apply_card_import(doc, card_id, transactions, imported_at))?;
        tracing::info!(card_id, added, "Saved card import");
        Ok(added)
    }

    /// Records a confirmed statement import in one document write: matched
    /// credits go into benefit state and the rows are kept on the card.
    /// Returns `(credits added, rows added)`.
    pub fn record_import(
        &self,
        catalog: &BenefitCatalog,
        usage: &BTreeMap<String, BenefitUsage>,
        card_id: &str,
        transactions: Vec<StoredTransaction>,
        imported_at: DateTime<Utc>,
    ) -> Result<(usize, usize), StoreError> {
        let (credits, rows) = self.update(|doc| {
            let credits = apply_usage(doc, catalog, usage);
            let rows = apply_card_import(doc, card_id, transactions, imported_at);
            (credits, rows)
        })?;
        tracing::info!(card_id, credits, rows, "Recorded statement import");
        Ok((credits, rows))
    }

    /// Sets the note for a card; an empty note removes it.
    pub fn set_import_note(&self, card_id: &str, note: &str) -> Result<(), StoreError> {
        let note = note.trim();
        self.update(|doc| {
            if note.is_empty() {
                doc.import_notes.remove(card_id);
            } else {
                doc.import_notes.insert(card_id.to_string(), note.to_string());
            }
        })
    }

    pub fn import_note(&self, card_id: &str) -> Result<Option<String>, StoreError> {
        Ok(self.read()?.import_note(card_id).map(str::to_string))
    }
}

fn apply_usage(
    doc: &mut UserDocument,
    catalog: &BenefitCatalog,
    usage: &BTreeMap<String, BenefitUsage>,
) -> usize {
    let mut added = 0;
    for (benefit_id, benefit_usage) in usage {
        let state = match catalog.get(benefit_id) {
            Some(definition) => doc.benefit_mut(definition),
            None => doc.benefits.entry(benefit_id.clone()).or_default(),
        };
        added += merge_transactions(&mut state.transactions, benefit_usage.transactions.iter().cloned());
        for (period_id, transactions) in &benefit_usage.periods {
            let period = state.periods.entry(period_id.clone()).or_default();
            added += merge_transactions(&mut period.transactions, transactions.iter().cloned());
        }
    }
    added
}

fn apply_card_import(
    doc: &mut UserDocument,
    card_id: &str,
    transactions: Vec<StoredTransaction>,
    imported_at: DateTime<Utc>,
) -> usize {
    let entry = doc
        .card_imports
        .entry(card_id.to_string())
        .or_insert_with(|| CardImport {
            imported_at,
            transactions: Vec::new(),
        });
    entry.imported_at = imported_at;
    merge_transactions(&mut entry.transactions, transactions)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use perkwise_core::Money;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    const CATALOG: &str = r#"
[[cards]]
id = "amex-platinum"
name = "Platinum"

[[benefits]]
id = "amex-resy-credit"
card_id = "amex-platinum"
name = "Resy"
credit_amount = 400
cadence = "quarterly"
start_date = "2025-01-01T00:00:00Z"
end_date = "2025-12-31T23:59:59Z"
enrollment_required = true
"#;

    fn catalog() -> BenefitCatalog {
        BenefitCatalog::from_toml(CATALOG).unwrap()
    }

    fn at(m: u32, d: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, m, d, 0, 0, 0).unwrap()
    }

    fn tx(m: u32, d: u32, dollars: i64) -> StoredTransaction {
        StoredTransaction::new(at(m, d), "AMEX RESY CREDIT", Money::from_dollars(dollars))
    }

    // ── toggles ───────────────────────────────────────────────────────────────

    #[test]
    fn enrollment_toggles_from_default() {
        let store = UserStateStore::in_memory();
        let catalog = catalog();
        let resy = catalog.get("amex-resy-credit").unwrap();
        assert!(store.toggle_enrollment(resy).unwrap());
        assert!(!store.toggle_enrollment(resy).unwrap());
    }

    #[test]
    fn ignore_flag_persists() {
        let store = UserStateStore::in_memory();
        let catalog = catalog();
        let resy = catalog.get("amex-resy-credit").unwrap();
        store.set_ignored(resy, true).unwrap();
        assert!(store.read().unwrap().benefit("amex-resy-credit").unwrap().ignored);
        store.set_ignored(resy, false).unwrap();
        assert!(!store.read().unwrap().benefit("amex-resy-credit").unwrap().ignored);
    }

    #[test]
    fn activation_carries_timestamp() {
        let store = UserStateStore::in_memory();
        let catalog = catalog();
        let resy = catalog.get("amex-resy-credit").unwrap();
        assert!(store.toggle_activation(resy, at(3, 1)).unwrap());
        let state = store.read().unwrap().benefit("amex-resy-credit").cloned().unwrap();
        assert_eq!(state.activation_acknowledged_at, Some(at(3, 1)));

        assert!(!store.toggle_activation(resy, at(3, 2)).unwrap());
        let state = store.read().unwrap().benefit("amex-resy-credit").cloned().unwrap();
        assert!(state.activation_acknowledged_at.is_none());
    }

    // ── usage ─────────────────────────────────────────────────────────────────

    #[test]
    fn record_usage_dedupes_repeat_imports() {
        let store = UserStateStore::in_memory();
        let mut usage = BTreeMap::new();
        usage.insert(
            "amex-resy-credit".to_string(),
            BenefitUsage {
                transactions: vec![tx(2, 1, 100), tx(5, 1, 50)],
                periods: BTreeMap::new(),
            },
        );
        assert_eq!(store.record_usage(&catalog(), &usage).unwrap(), 2);
        assert_eq!(store.record_usage(&catalog(), &usage).unwrap(), 0);

        let doc = store.read().unwrap();
        let state = doc.benefit("amex-resy-credit").unwrap();
        assert_eq!(state.transactions.len(), 2);
        // Created lazily with the definition's defaults.
        assert!(!state.enrolled);
    }

    #[test]
    fn record_usage_into_periods_and_unknown_benefits() {
        let store = UserStateStore::in_memory();
        let mut periods = BTreeMap::new();
        periods.insert("q2".to_string(), vec![tx(4, 3, 100)]);
        let mut usage = BTreeMap::new();
        usage.insert(
            "amex-resy-credit".to_string(),
            BenefitUsage {
                transactions: vec![],
                periods,
            },
        );
        usage.insert(
            "amex-oura".to_string(),
            BenefitUsage {
                transactions: vec![tx(6, 1, 50)],
                periods: BTreeMap::new(),
            },
        );
        assert_eq!(store.record_usage(&catalog(), &usage).unwrap(), 2);
        let doc = store.read().unwrap();
        assert_eq!(doc.benefit("amex-resy-credit").unwrap().periods["q2"].transactions.len(), 1);
        assert_eq!(doc.benefit("amex-oura").unwrap().transactions.len(), 1);
    }

    // ── card imports & notes ──────────────────────────────────────────────────

    #[test]
    fn card_import_merges_rows_and_restamps() {
        let store = UserStateStore::in_memory();
        assert_eq!(store.save_card_import("amex-platinum", vec![tx(1, 5, -15)], at(2, 1)).unwrap(), 1);
        assert_eq!(
            store
                .save_card_import("amex-platinum", vec![tx(1, 5, -15), tx(2, 5, -15)], at(3, 1))
                .unwrap(),
            1
        );
        let doc = store.read().unwrap();
        let import = doc.card_import("amex-platinum").unwrap();
        assert_eq!(import.imported_at, at(3, 1));
        assert_eq!(import.transactions.len(), 2);
    }

    #[test]
    fn statement_import_is_a_single_write() {
        let store = UserStateStore::in_memory();
        let writes = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&writes);
        store.subscribe(move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
        });

        let mut usage = BTreeMap::new();
        usage.insert(
            "amex-resy-credit".to_string(),
            BenefitUsage {
                transactions: vec![tx(2, 10, 100)],
                periods: BTreeMap::new(),
            },
        );
        let rows = vec![tx(2, 10, -100), tx(2, 11, 40)];
        let added = store
            .record_import(&catalog(), &usage, "amex-platinum", rows.clone(), at(3, 1))
            .unwrap();
        assert_eq!(added, (1, 2));
        assert_eq!(writes.load(Ordering::SeqCst), 1);

        let doc = store.read().unwrap();
        assert_eq!(doc.benefit("amex-resy-credit").unwrap().transactions.len(), 1);
        assert_eq!(doc.card_import("amex-platinum").unwrap().transactions, rows);

        let again = store
            .record_import(&catalog(), &usage, "amex-platinum", rows, at(3, 2))
            .unwrap();
        assert_eq!(again, (0, 0));
    }

    #[test]
    fn import_notes_set_and_clear() {
        let store = UserStateStore::in_memory();
        store.set_import_note("amex-platinum", " imported through March ").unwrap();
        assert_eq!(
            store.import_note("amex-platinum").unwrap().as_deref(),
            Some("imported through March")
        );
        store.set_import_note("amex-platinum", "").unwrap();
        assert!(store.import_note("amex-platinum").unwrap().is_none());
    }
}
