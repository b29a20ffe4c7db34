use perkwise_core::{BenefitDefinition, BenefitUsage, Money, StoredTransaction, TransactionKey};
use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use thiserror::Error;

use crate::adapter::{Issuer, NormalizedTransaction};

/// Ordered pattern rules for American Express. More specific patterns come
/// first: the first match wins.
const AMEX_RULES: &[(&str, &str)] = &[
    (r"uber.*one", "amex-uber-one"),
    (r"uber", "amex-uber-cash"),
    (r"lululemon", "amex-lululemon"),
    (r"saks", "amex-saks"),
    (r"clear", "amex-clear-plus"),
    (r"airline", "amex-airline-fee"),
    (r"resy", "amex-resy-credit"),
    (r"digital.*ent|entertainment", "amex-digital-entertainment"),
    (r"walmart", "amex-walmart-plus"),
    (r"hotel", "amex-hotel-credit"),
    (r"oura", "amex-oura"),
    (r"equinox", "amex-equinox"),
    (r"global.*entry|tsa.*precheck|nexus", "amex-global-entry"),
];

/// Amex credits read like ordinary refunds unless they name the card.
const AMEX_BRAND_GATE: &str = r"platinum|plat\b|amex";

const CHASE_RULES: &[(&str, &str)] = &[
    (r"travel\s*credit", "csr-travel-credit"),
    (r"the\s*edit", "csr-edit-hotel"),
    (r"exclusive\s*tables", "csr-dining-exclusive-tables"),
    (r"doordash", "csr-doordash"),
    (r"lyft", "csr-lyft"),
    (r"peloton", "csr-peloton"),
    (r"stubhub|viagogo", "csr-stubhub"),
    (r"global\s*entry|tsa\s*precheck|nexus", "csr-global-entry"),
];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BenefitRule {
    pub pattern: String,
    pub benefit_id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Confidence {
    High,
    /// Not produced by pattern rules; kept for fuzzier matchers.
    Low,
}

#[derive(Error, Debug)]
pub enum RuleError {
    #[error("Failed to parse rules: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("Invalid brand pattern '{pattern}': {source}")]
    InvalidBrandGate {
        pattern: String,
        source: regex::Error,
    },
}

#[derive(Debug, Deserialize)]
struct RuleFile {
    brand_gate: Option<String>,
    #[serde(default)]
    rules: Vec<BenefitRule>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MatchedCredit {
    pub transaction: NormalizedTransaction,
    pub benefit_id: String,
    /// `None` when the benefit id is not among the candidate definitions.
    pub benefit_name: Option<String>,
    pub period_id: Option<String>,
    /// Absolute value of the statement amount.
    pub credit_amount: Money,
    pub confidence: Confidence,
}

impl MatchedCredit {
    pub fn to_stored(&self) -> StoredTransaction {
        self.transaction.to_stored(self.credit_amount)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ImportResult {
    pub matched: Vec<MatchedCredit>,
    pub unmatched: Vec<NormalizedTransaction>,
}

impl ImportResult {
    pub fn total_matched(&self) -> usize {
        self.matched.len()
    }

    pub fn total_unmatched(&self) -> usize {
        self.unmatched.len()
    }
}

/// Internal pairing of a rule with its compiled, case-insensitive regex.
#[derive(Debug, Clone)]
struct CompiledRule {
    rule: BenefitRule,
    regex: Regex,
}

/// Assigns credits to benefit ids with an ordered list of pattern rules.
#[derive(Debug, Clone)]
pub struct BenefitMatcher {
    issuer: Issuer,
    brand_gate: Option<Regex>,
    rules: Vec<CompiledRule>,
}

impl BenefitMatcher {
    pub fn for_issuer(issuer: Issuer) -> Self {
        let (rules, gate) = match issuer {
            Issuer::Amex => (AMEX_RULES, Some(AMEX_BRAND_GATE)),
            Issuer::Chase => (CHASE_RULES, None),
        };
        let rules = rules
            .iter()
            .map(|(pattern, benefit_id)| BenefitRule {
                pattern: pattern.to_string(),
                benefit_id: benefit_id.to_string(),
            })
            .collect();
        Self {
            issuer,
            brand_gate: gate.and_then(|g| compile(g).ok()),
            rules: compile_rules(rules),
        }
    }

    /// Rules from TOML: an optional `brand_gate` pattern and an ordered
    /// `[[rules]]` array of `pattern`/`benefit_id` pairs. Rules with an
    /// invalid pattern are skipped.
    pub fn from_toml(issuer: Issuer, toml_content: &str) -> Result<Self, RuleError> {
        let file: RuleFile = toml::from_str(toml_content)?;
        let brand_gate = file
            .brand_gate
            .map(|pattern| {
                compile(&pattern).map_err(|source| RuleError::InvalidBrandGate { pattern, source })
            })
            .transpose()?;
        Ok(Self {
            issuer,
            brand_gate,
            rules: compile_rules(file.rules),
        })
    }

    pub fn issuer(&self) -> Issuer {
        self.issuer
    }

    pub fn rules(&self) -> impl Iterator<Item = &BenefitRule> {
        self.rules.iter().map(|cr| &cr.rule)
    }

    /// First rule matching `text`, after the brand gate (if any) admits it.
    pub fn match_benefit(&self, text: &str) -> Option<(&str, Confidence)> {
        if let Some(gate) = &self.brand_gate {
            if !gate.is_match(text) {
                return None;
            }
        }
        self.rules
            .iter()
            .find(|cr| cr.regex.is_match(text))
            .map(|cr| (cr.rule.benefit_id.as_str(), Confidence::High))
    }

    pub fn match_credits(
        &self,
        credits: Vec<NormalizedTransaction>,
        candidates: &[BenefitDefinition],
    ) -> ImportResult {
        let names: HashMap<&str, &str> = candidates
            .iter()
            .map(|b| (b.id.as_str(), b.name.as_str()))
            .collect();

        let mut result = ImportResult::default();
        for credit in credits {
            let found = self
                .match_benefit(&credit.combined_text())
                .map(|(id, confidence)| (id.to_string(), confidence));
            match found {
                Some((benefit_id, confidence)) => {
                    let benefit_name = names.get(benefit_id.as_str()).map(|n| n.to_string());
                    if benefit_name.is_none() {
                        tracing::debug!(%benefit_id, "Matched benefit is not in the catalog");
                    }
                    result.matched.push(MatchedCredit {
                        credit_amount: credit.amount.abs(),
                        transaction: credit,
                        benefit_id,
                        benefit_name,
                        period_id: None,
                        confidence,
                    });
                }
                None => result.unmatched.push(credit),
            }
        }
        result
    }
}

fn compile(pattern: &str) -> Result<Regex, regex::Error> {
    RegexBuilder::new(pattern).case_insensitive(true).build()
}

fn compile_rules(rules: Vec<BenefitRule>) -> Vec<CompiledRule> {
    rules
        .into_iter()
        .filter_map(|rule| match compile(&rule.pattern) {
            Ok(regex) => Some(CompiledRule { rule, regex }),
            Err(e) => {
                tracing::warn!(pattern = %rule.pattern, "Skipping invalid benefit rule: {e}");
                None
            }
        })
        .collect()
}

/// Groups matched credits per benefit, dropping repeats of the same
/// transaction. Credits carrying a period id land in that period's list.
pub fn aggregate(matched: &[MatchedCredit]) -> BTreeMap<String, BenefitUsage> {
    let mut seen: HashSet<(String, TransactionKey)> = HashSet::new();
    let mut usage: BTreeMap<String, BenefitUsage> = BTreeMap::new();

    for credit in matched {
        let stored = credit.to_stored();
        if !seen.insert((credit.benefit_id.clone(), stored.key())) {
            continue;
        }
        let entry = usage.entry(credit.benefit_id.clone()).or_default();
        match &credit.period_id {
            Some(period_id) => entry.periods.entry(period_id.clone()).or_default().push(stored),
            None => entry.transactions.push(stored),
        }
    }
    usage
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use perkwise_core::ResetCadence;

    fn credit(description: &str, cents: i64) -> NormalizedTransaction {
        NormalizedTransaction {
            date: Utc.with_ymd_and_hms(2025, 3, 1, 0, 0, 0).unwrap(),
            description: description.to_string(),
            amount: Money::from_cents(cents),
            details: None,
            type_tag: None,
            category: None,
            reference: None,
        }
    }

    fn definition(id: &str, name: &str) -> BenefitDefinition {
        BenefitDefinition {
            id: id.to_string(),
            card_id: "amex-platinum".to_string(),
            name: name.to_string(),
            description: String::new(),
            credit_amount: Money::from_dollars(200),
            cadence: ResetCadence::Monthly,
            start_date: Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap(),
            end_date: Utc.with_ymd_and_hms(2025, 12, 31, 23, 59, 59).unwrap(),
            periods: vec![],
            enrollment_required: false,
            category: String::new(),
        }
    }

    fn amex_id(text: &str) -> Option<String> {
        BenefitMatcher::for_issuer(Issuer::Amex)
            .match_benefit(&text.to_lowercase())
            .map(|(id, _)| id.to_string())
    }

    fn chase_id(text: &str) -> Option<String> {
        BenefitMatcher::for_issuer(Issuer::Chase)
            .match_benefit(text)
            .map(|(id, _)| id.to_string())
    }

    // ── amex rules ────────────────────────────────────────────────────────────

    #[test]
    fn amex_uber_cash_credit_matches() {
        assert_eq!(amex_id("AMEX UBER CASH CREDIT").as_deref(), Some("amex-uber-cash"));
    }

    #[test]
    fn amex_uber_purchase_without_brand_is_unmatched() {
        assert_eq!(amex_id("Uber Eats Purchase"), None);
    }

    #[test]
    fn amex_specific_rule_precedes_generic() {
        assert_eq!(amex_id("Platinum Uber One Credit").as_deref(), Some("amex-uber-one"));
    }

    #[test]
    fn amex_brand_tokens() {
        assert_eq!(amex_id("PLAT SAKS CREDIT").as_deref(), Some("amex-saks"));
        assert_eq!(amex_id("Platinum Digital Entertainment Credit").as_deref(), Some("amex-digital-entertainment"));
        // "plat" must end on a word boundary.
        assert_eq!(amex_id("PLATE RESY CREDIT"), None);
    }

    #[test]
    fn amex_rule_order_is_stable() {
        let matcher = BenefitMatcher::for_issuer(Issuer::Amex);
        let ids: Vec<&str> = matcher.rules().map(|r| r.benefit_id.as_str()).collect();
        assert_eq!(ids.first(), Some(&"amex-uber-one"));
        assert_eq!(ids[1], "amex-uber-cash");
        assert_eq!(ids.last(), Some(&"amex-global-entry"));
        assert_eq!(ids.len(), AMEX_RULES.len());
    }

    #[test]
    fn amex_global_entry_variants() {
        for text in ["AMEX GLOBAL ENTRY CREDIT", "AMEX TSA PRECHECK CREDIT", "AMEX NEXUS CREDIT"] {
            assert_eq!(amex_id(text).as_deref(), Some("amex-global-entry"), "{text}");
        }
    }

    // ── chase rules ───────────────────────────────────────────────────────────

    #[test]
    fn chase_needs_no_brand_token() {
        assert_eq!(chase_id("TRAVEL CREDIT $300/YEAR").as_deref(), Some("csr-travel-credit"));
        assert_eq!(chase_id("TRAVELCREDIT").as_deref(), Some("csr-travel-credit"));
        assert_eq!(chase_id("VIAGOGO CREDIT").as_deref(), Some("csr-stubhub"));
        assert_eq!(chase_id("GROCERY CREDIT"), None);
    }

    // ── match_credits ─────────────────────────────────────────────────────────

    #[test]
    fn match_credits_splits_matched_and_unmatched() {
        let matcher = BenefitMatcher::for_issuer(Issuer::Amex);
        let result = matcher.match_credits(
            vec![
                credit("AMEX UBER CASH CREDIT", -1500),
                credit("MERCHANT REFUND CREDIT", -2000),
            ],
            &[definition("amex-uber-cash", "Uber Cash")],
        );
        assert_eq!(result.total_matched(), 1);
        assert_eq!(result.total_unmatched(), 1);
        let m = &result.matched[0];
        assert_eq!(m.benefit_id, "amex-uber-cash");
        assert_eq!(m.benefit_name.as_deref(), Some("Uber Cash"));
        assert_eq!(m.credit_amount, Money::from_cents(1500));
        assert_eq!(m.confidence, Confidence::High);
        assert!(m.period_id.is_none());
    }

    #[test]
    fn match_outside_candidates_keeps_null_name() {
        let matcher = BenefitMatcher::for_issuer(Issuer::Amex);
        let result = matcher.match_credits(vec![credit("AMEX OURA CREDIT", -5000)], &[]);
        assert_eq!(result.matched[0].benefit_id, "amex-oura");
        assert!(result.matched[0].benefit_name.is_none());
    }

    #[test]
    fn details_take_part_in_matching() {
        let matcher = BenefitMatcher::for_issuer(Issuer::Amex);
        let mut tx = credit("PLATINUM CREDIT", -1000);
        tx.details = Some("Walmart+ membership".to_string());
        let result = matcher.match_credits(vec![tx], &[]);
        assert_eq!(result.matched[0].benefit_id, "amex-walmart-plus");
    }

    // ── from_toml ─────────────────────────────────────────────────────────────

    #[test]
    fn rules_from_toml_keep_order_and_skip_invalid() {
        let toml = r#"
brand_gate = "acme"

[[rules]]
pattern = "coffee"
benefit_id = "acme-coffee"

[[rules]]
pattern = "(unclosed"
benefit_id = "broken"

[[rules]]
pattern = "co"
benefit_id = "acme-generic"
"#;
        let matcher = BenefitMatcher::from_toml(Issuer::Chase, toml).unwrap();
        assert_eq!(matcher.rules().count(), 2);
        assert_eq!(matcher.match_benefit("ACME COFFEE CREDIT").map(|m| m.0), Some("acme-coffee"));
        assert_eq!(matcher.match_benefit("ACME COMPANY").map(|m| m.0), Some("acme-generic"));
        assert_eq!(matcher.match_benefit("COFFEE"), None);
    }

    #[test]
    fn invalid_brand_gate_is_an_error() {
        let result = BenefitMatcher::from_toml(Issuer::Amex, "brand_gate = \"(\"\n");
        assert!(matches!(result, Err(RuleError::InvalidBrandGate { .. })));
    }

    // ── aggregate ─────────────────────────────────────────────────────────────

    #[test]
    fn aggregate_groups_and_dedupes() {
        let matcher = BenefitMatcher::for_issuer(Issuer::Amex);
        let result = matcher.match_credits(
            vec![
                credit("AMEX UBER CASH CREDIT", -1500),
                credit("AMEX UBER CASH CREDIT", -1500),
                credit("AMEX RESY CREDIT", -5000),
            ],
            &[],
        );
        let usage = aggregate(&result.matched);
        assert_eq!(usage.len(), 2);
        let uber = &usage["amex-uber-cash"];
        assert_eq!(uber.transactions.len(), 1);
        assert_eq!(uber.transactions[0].amount, Money::from_cents(1500));
        assert!(uber.periods.is_empty());
    }

    #[test]
    fn aggregate_honours_period_ids() {
        let matcher = BenefitMatcher::for_issuer(Issuer::Amex);
        let mut result = matcher.match_credits(vec![credit("AMEX RESY CREDIT", -5000)], &[]);
        result.matched[0].period_id = Some("q1".to_string());
        let usage = aggregate(&result.matched);
        let resy = &usage["amex-resy-credit"];
        assert!(resy.transactions.is_empty());
        assert_eq!(resy.periods["q1"].len(), 1);
    }
}
