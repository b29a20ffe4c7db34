use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::money::Money;
use crate::period::{DateRange, ResetCadence};

// ── Definitions (immutable, catalog-supplied) ─────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeriodDefinition {
    pub id: String,
    pub start_date: DateTime<Utc>,
    pub end_date: DateTime<Utc>,
}

impl PeriodDefinition {
    pub fn range(&self) -> DateRange {
        DateRange::new(self.start_date, self.end_date)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BenefitDefinition {
    pub id: String,
    pub card_id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub credit_amount: Money,
    pub cadence: ResetCadence,
    pub start_date: DateTime<Utc>,
    pub end_date: DateTime<Utc>,
    #[serde(default)]
    pub periods: Vec<PeriodDefinition>,
    #[serde(default)]
    pub enrollment_required: bool,
    #[serde(default)]
    pub category: String,
}

impl BenefitDefinition {
    pub fn range(&self) -> DateRange {
        DateRange::new(self.start_date, self.end_date)
    }

    pub fn has_periods(&self) -> bool {
        !self.periods.is_empty()
    }

    /// Value of one sub-period; the whole credit when there are none.
    pub fn segment_value(&self) -> Money {
        self.credit_amount.split(self.periods.len())
    }
}

// ── Transactions ──────────────────────────────────────────────────────────────

/// Deduplication key: two transactions with the same date, description and
/// amount are the same transaction.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TransactionKey {
    pub date: DateTime<Utc>,
    pub description: String,
    pub amount: Money,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredTransaction {
    pub date: DateTime<Utc>,
    pub description: String,
    pub amount: Money,
    /// Extra statement text some issuers put next to the description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
    /// Issuer-specific transaction type (e.g. `Adjustment`, `Payment`).
    #[serde(default, skip_serializing_if = "Option::is_none", rename = "type")]
    pub type_tag: Option<String>,
}

impl StoredTransaction {
    pub fn new(date: DateTime<Utc>, description: impl Into<String>, amount: Money) -> Self {
        StoredTransaction {
            date,
            description: description.into(),
            amount,
            details: None,
            type_tag: None,
        }
    }

    pub fn key(&self) -> TransactionKey {
        TransactionKey {
            date: self.date,
            description: self.description.clone(),
            amount: self.amount,
        }
    }
}

/// Appends every transaction of `incoming` whose key is not yet present.
/// Returns how many were added.
pub fn merge_transactions(
    existing: &mut Vec<StoredTransaction>,
    incoming: impl IntoIterator<Item = StoredTransaction>,
) -> usize {
    let mut seen: std::collections::HashSet<TransactionKey> =
        existing.iter().map(StoredTransaction::key).collect();
    let before = existing.len();
    for tx in incoming {
        if seen.insert(tx.key()) {
            existing.push(tx);
        }
    }
    existing.len() - before
}

// ── User state (mutable, persisted) ───────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PeriodUserState {
    #[serde(default)]
    pub transactions: Vec<StoredTransaction>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BenefitUserState {
    #[serde(default)]
    pub enrolled: bool,
    #[serde(default)]
    pub ignored: bool,
    #[serde(default)]
    pub activation_acknowledged: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub activation_acknowledged_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub transactions: Vec<StoredTransaction>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub periods: BTreeMap<String, PeriodUserState>,
    /// Single-number usage recorded before per-period tracking existed.
    #[serde(default, skip_serializing_if = "is_zero", alias = "current_used")]
    pub legacy_used: Money,
}

impl BenefitUserState {
    /// State for a benefit the user has never touched.
    pub fn for_definition(definition: &BenefitDefinition) -> Self {
        BenefitUserState {
            enrolled: !definition.enrollment_required,
            ..Default::default()
        }
    }

    /// Every recorded transaction, benefit-level and per-period.
    pub fn all_transactions(&self) -> impl Iterator<Item = &StoredTransaction> {
        self.transactions
            .iter()
            .chain(self.periods.values().flat_map(|p| p.transactions.iter()))
    }
}

fn is_zero(amount: &Money) -> bool {
    amount.is_zero()
}

/// Credits grouped for one benefit, ready to be recorded into its user state.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BenefitUsage {
    pub transactions: Vec<StoredTransaction>,
    pub periods: BTreeMap<String, Vec<StoredTransaction>>,
}

impl BenefitUsage {
    pub fn is_empty(&self) -> bool {
        self.transactions.is_empty() && self.periods.values().all(Vec::is_empty)
    }
}

// ── Snapshots (derived, never persisted) ──────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BenefitStatus {
    Pending,
    Completed,
    Missed,
}

impl fmt::Display for BenefitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BenefitStatus::Pending => write!(f, "pending"),
            BenefitStatus::Completed => write!(f, "completed"),
            BenefitStatus::Missed => write!(f, "missed"),
        }
    }
}

/// Presentation figures for the period containing the reference instant.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct TimeProgress {
    pub percent_elapsed: f64,
    pub days_remaining: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResolvedPeriod {
    pub id: String,
    pub range: DateRange,
    pub used: Money,
    pub status: BenefitStatus,
    pub transactions: Vec<StoredTransaction>,
    /// Set only for the period containing the reference instant.
    pub progress: Option<TimeProgress>,
}

impl ResolvedPeriod {
    pub fn is_current(&self) -> bool {
        self.progress.is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BenefitSnapshot {
    pub benefit_id: String,
    pub card_id: String,
    pub name: String,
    pub description: String,
    pub category: String,
    pub cadence: ResetCadence,
    pub credit_amount: Money,
    pub enrollment_required: bool,
    pub enrolled: bool,
    pub auto_enrolled_at: Option<DateTime<Utc>>,
    pub ignored: bool,
    pub activation_acknowledged: bool,
    /// Cycle range, moved onto the requested year when one was given.
    pub effective_range: DateRange,
    /// Instant statuses were computed against.
    pub reference: DateTime<Utc>,
    pub periods: Vec<ResolvedPeriod>,
    pub current_used: Money,
    /// Usage that fell outside every period and was not back-filled.
    pub unattributed: Money,
    pub status: BenefitStatus,
    pub claimed_elsewhere_year: Option<i32>,
    pub year_transactions: Vec<StoredTransaction>,
    /// Progress through the whole cycle when it has no sub-periods.
    pub progress: Option<TimeProgress>,
}

impl BenefitSnapshot {
    pub fn segment_value(&self) -> Money {
        self.credit_amount.split(self.periods.len())
    }

    pub fn has_periods(&self) -> bool {
        !self.periods.is_empty()
    }

    pub fn cycle_started(&self) -> bool {
        self.effective_range.has_started(self.reference)
    }

    pub fn current_period(&self) -> Option<&ResolvedPeriod> {
        self.periods.iter().find(|p| p.is_current())
    }

    pub fn remaining(&self) -> Money {
        let left = self.credit_amount - self.current_used;
        if left.is_negative() {
            Money::zero()
        } else {
            left
        }
    }
}
