pub mod adapter;
pub mod cache;
pub mod lexer;
pub mod matcher;

pub use adapter::{AdapterError, Issuer, NormalizedTransaction, SignConvention, StatementAdapter};
pub use cache::{DerivedCredits, MatchCache};
pub use lexer::{tokenize, LexError};
pub use matcher::{aggregate, BenefitMatcher, BenefitRule, Confidence, ImportResult, MatchedCredit, RuleError};

use chrono::{DateTime, Utc};
use perkwise_core::{BenefitDefinition, BenefitUsage, Money, StoredTransaction, TransactionKey};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, HashSet};
use thiserror::Error;

/// Display name used for a matched benefit missing from the catalog.
pub const UNKNOWN_BENEFIT: &str = "Unknown";

#[derive(Error, Debug)]
pub enum ImportError {
    #[error("Could not read statement: {0}")]
    Malformed(#[from] AdapterError),
    #[error("Statements for card '{0}' are not supported yet")]
    UnsupportedIssuer(String),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PreviewKind {
    Matched { benefit_id: String, benefit_name: String },
    Credit,
    Transaction,
}

/// One statement row as shown before an import is confirmed.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PreviewRow {
    pub date: DateTime<Utc>,
    pub description: String,
    pub amount: Money,
    #[serde(flatten)]
    pub kind: PreviewKind,
}

/// A parsed statement with at least one credit, ready to confirm.
#[derive(Debug, Clone, Serialize)]
pub struct StatementImport {
    pub card_id: String,
    pub issuer: Issuer,
    /// Every parsed row, statement signs intact.
    pub transactions: Vec<NormalizedTransaction>,
    pub result: ImportResult,
}

impl StatementImport {
    pub fn credit_count(&self) -> usize {
        self.result.total_matched() + self.result.total_unmatched()
    }

    pub fn usage(&self) -> BTreeMap<String, BenefitUsage> {
        aggregate(&self.result.matched)
    }

    /// All parsed rows in stored form, for keeping the statement per card.
    pub fn stored_transactions(&self) -> Vec<StoredTransaction> {
        self.transactions
            .iter()
            .map(|tx| tx.to_stored(tx.amount))
            .collect()
    }

    pub fn preview(&self) -> Vec<PreviewRow> {
        let mut matched: HashMap<TransactionKey, &MatchedCredit> = HashMap::new();
        for m in &self.result.matched {
            matched.insert(m.transaction.to_stored(m.transaction.amount).key(), m);
        }
        let credits: HashSet<TransactionKey> = self
            .result
            .unmatched
            .iter()
            .map(|c| c.to_stored(c.amount).key())
            .collect();

        self.transactions
            .iter()
            .map(|tx| {
                let key = tx.to_stored(tx.amount).key();
                let kind = if let Some(m) = matched.get(&key) {
                    PreviewKind::Matched {
                        benefit_id: m.benefit_id.clone(),
                        benefit_name: m
                            .benefit_name
                            .clone()
                            .unwrap_or_else(|| UNKNOWN_BENEFIT.to_string()),
                    }
                } else if credits.contains(&key) {
                    PreviewKind::Credit
                } else {
                    PreviewKind::Transaction
                };
                PreviewRow {
                    date: tx.date,
                    description: tx.description.clone(),
                    amount: tx.amount,
                    kind,
                }
            })
            .collect()
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ImportOutcome {
    Ready(StatementImport),
    /// The statement parsed but holds no benefit credits.
    NoCredits { card_id: String, transaction_count: usize },
}

/// Parses a statement for `card_id` and matches its credits against
/// `candidates`. Nothing is persisted.
pub fn import_statement(
    text: &str,
    card_id: &str,
    candidates: &[BenefitDefinition],
) -> Result<ImportOutcome, ImportError> {
    let issuer = Issuer::from_card_id(card_id)
        .ok_or_else(|| ImportError::UnsupportedIssuer(card_id.to_string()))?;
    let adapter = issuer.adapter();

    let transactions = adapter.parse(text)?;
    let credits = adapter.extract_credits(transactions.clone());
    tracing::info!(
        card_id,
        rows = transactions.len(),
        credits = credits.len(),
        "Parsed statement"
    );
    if credits.is_empty() {
        return Ok(ImportOutcome::NoCredits {
            card_id: card_id.to_string(),
            transaction_count: transactions.len(),
        });
    }

    let card_candidates: Vec<BenefitDefinition> = candidates
        .iter()
        .filter(|b| b.card_id == card_id)
        .cloned()
        .collect();
    let result = BenefitMatcher::for_issuer(issuer).match_credits(credits, &card_candidates);

    Ok(ImportOutcome::Ready(StatementImport {
        card_id: card_id.to_string(),
        issuer,
        transactions,
        result,
    }))
}

/// Re-derives per-benefit credits from a card's saved statement rows.
pub fn derive_card_credits(
    card_id: &str,
    transactions: &[StoredTransaction],
    definitions: &[BenefitDefinition],
) -> DerivedCredits {
    let Some(issuer) = Issuer::from_card_id(card_id) else {
        return DerivedCredits::new();
    };
    let adapter = issuer.adapter();
    let credits: Vec<NormalizedTransaction> = transactions
        .iter()
        .filter(|tx| adapter.is_benefit_credit(tx))
        .map(NormalizedTransaction::from)
        .collect();
    if credits.is_empty() {
        return DerivedCredits::new();
    }

    let card_definitions: Vec<BenefitDefinition> = definitions
        .iter()
        .filter(|d| d.card_id == card_id)
        .cloned()
        .collect();
    let result = BenefitMatcher::for_issuer(issuer).match_credits(credits, &card_definitions);
    aggregate(&result.matched)
        .into_iter()
        .map(|(benefit_id, usage)| {
            let mut all = usage.transactions;
            all.extend(usage.periods.into_values().flatten());
            (benefit_id, all)
        })
        .collect()
}
