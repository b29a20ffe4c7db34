use chrono::{DateTime, Utc};
use perkwise_core::{BenefitDefinition, BenefitUserState, StoredTransaction};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Raw statement rows saved for a card, stamped with the last import time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CardImport {
    pub imported_at: DateTime<Utc>,
    #[serde(default)]
    pub transactions: Vec<StoredTransaction>,
}

/// The whole persisted user state. Always read and written as one unit.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UserDocument {
    #[serde(default)]
    pub benefits: BTreeMap<String, BenefitUserState>,
    #[serde(default)]
    pub import_notes: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub card_imports: BTreeMap<String, CardImport>,
}

impl UserDocument {
    /// Parses a stored document. Empty or unreadable content yields the
    /// default document; corruption is logged, never returned.
    pub fn parse_or_default(bytes: &[u8]) -> Self {
        if bytes.iter().all(u8::is_ascii_whitespace) {
            return Self::default();
        }
        match serde_json::from_slice(bytes) {
            Ok(document) => document,
            Err(e) => {
                tracing::warn!("Stored user state is corrupt, starting from empty: {e}");
                Self::default()
            }
        }
    }

    pub fn to_json(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec_pretty(self)
    }

    pub fn benefit(&self, benefit_id: &str) -> Option<&BenefitUserState> {
        self.benefits.get(benefit_id)
    }

    /// State for `definition`, created with its defaults on first access.
    pub fn benefit_mut(&mut self, definition: &BenefitDefinition) -> &mut BenefitUserState {
        self.benefits
            .entry(definition.id.clone())
            .or_insert_with(|| BenefitUserState::for_definition(definition))
    }

    pub fn card_import(&self, card_id: &str) -> Option<&CardImport> {
        self.card_imports.get(card_id)
    }

    pub fn import_note(&self, card_id: &str) -> Option<&str> {
        self.import_notes.get(card_id).map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use perkwise_core::{Money, ResetCadence};

    fn definition(enrollment_required: bool) -> BenefitDefinition {
        BenefitDefinition {
            id: "amex-resy-credit".into(),
            card_id: "amex-platinum".into(),
            name: "Resy".into(),
            description: String::new(),
            credit_amount: Money::from_dollars(400),
            cadence: ResetCadence::Quarterly,
            start_date: Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap(),
            end_date: Utc.with_ymd_and_hms(2025, 12, 31, 0, 0, 0).unwrap(),
            periods: vec![],
            enrollment_required,
            category: String::new(),
        }
    }

    #[test]
    fn empty_and_corrupt_content_fall_back_to_default() {
        assert_eq!(UserDocument::parse_or_default(b""), UserDocument::default());
        assert_eq!(UserDocument::parse_or_default(b"  \n"), UserDocument::default());
        assert_eq!(UserDocument::parse_or_default(b"{not json"), UserDocument::default());
        assert_eq!(UserDocument::parse_or_default(b"[1,2]"), UserDocument::default());
    }

    #[test]
    fn partial_document_fills_defaults() {
        let doc = UserDocument::parse_or_default(br#"{"benefits":{"x":{"enrolled":true}}}"#);
        let state = doc.benefit("x").unwrap();
        assert!(state.enrolled);
        assert!(!state.ignored);
        assert!(state.transactions.is_empty());
        assert!(doc.import_notes.is_empty());
    }

    #[test]
    fn legacy_usage_field_is_read() {
        let doc = UserDocument::parse_or_default(br#"{"benefits":{"x":{"current_used":"150"}}}"#);
        assert_eq!(doc.benefit("x").unwrap().legacy_used, Money::from_dollars(150));
    }

    #[test]
    fn round_trips_through_json() {
        let mut doc = UserDocument::default();
        doc.benefit_mut(&definition(true)).ignored = true;
        doc.import_notes.insert("amex-platinum".into(), "through March".into());
        doc.card_imports.insert(
            "amex-platinum".into(),
            CardImport {
                imported_at: Utc.with_ymd_and_hms(2025, 4, 2, 9, 30, 0).unwrap(),
                transactions: vec![],
            },
        );
        let bytes = doc.to_json().unwrap();
        assert_eq!(UserDocument::parse_or_default(&bytes), doc);
    }

    #[test]
    fn lazily_created_state_follows_enrollment_requirement() {
        let mut doc = UserDocument::default();
        assert!(!doc.benefit_mut(&definition(true)).enrolled);
        let mut other = UserDocument::default();
        assert!(other.benefit_mut(&definition(false)).enrolled);
    }
}
