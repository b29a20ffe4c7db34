use chrono::{DateTime, NaiveDate, Utc};
use perkwise_core::{Money, StoredTransaction};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

use crate::lexer::{tokenize, LexError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Issuer {
    Amex,
    Chase,
}

impl Issuer {
    /// Issuer whose statements a card's imports come from.
    pub fn from_card_id(card_id: &str) -> Option<Self> {
        if card_id.starts_with("amex") {
            Some(Issuer::Amex)
        } else if card_id.starts_with("chase") || card_id.starts_with("csr") {
            Some(Issuer::Chase)
        } else {
            None
        }
    }

    pub fn adapter(self) -> StatementAdapter {
        match self {
            Issuer::Amex => StatementAdapter::amex(),
            Issuer::Chase => StatementAdapter::chase(),
        }
    }
}

impl fmt::Display for Issuer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Issuer::Amex => write!(f, "American Express"),
            Issuer::Chase => write!(f, "Chase"),
        }
    }
}

/// Which sign a statement gives to credits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignConvention {
    CreditsNegative,
    CreditsPositive,
}

impl SignConvention {
    fn is_credit_sign(self, amount: Money) -> bool {
        match self {
            SignConvention::CreditsNegative => amount.is_negative(),
            SignConvention::CreditsPositive => amount.is_positive(),
        }
    }
}

/// Header names of the columns an adapter reads.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ColumnMapping {
    pub date: String,
    pub description: String,
    pub amount: String,
    pub details: Option<String>,
    pub type_tag: Option<String>,
    pub category: Option<String>,
    pub reference: Option<String>,
}

#[derive(Error, Debug)]
pub enum AdapterError {
    #[error(transparent)]
    Lex(#[from] LexError),
    #[error("Statement is empty")]
    Empty,
    #[error("Missing required column: {0}")]
    MissingColumn(String),
    #[error("Invalid date: {0}")]
    InvalidDate(String),
    #[error("Invalid amount: {0}")]
    InvalidAmount(String),
}

/// A statement row mapped onto issuer-independent fields. The amount keeps
/// the statement's sign.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NormalizedTransaction {
    pub date: DateTime<Utc>,
    pub description: String,
    pub amount: Money,
    pub details: Option<String>,
    pub type_tag: Option<String>,
    pub category: Option<String>,
    pub reference: Option<String>,
}

impl NormalizedTransaction {
    /// Lowercased description and details, the text credit rules look at.
    pub fn combined_text(&self) -> String {
        combined_text(&self.description, self.details.as_deref())
    }

    /// Stored form, carrying `amount` in place of the statement amount.
    pub fn to_stored(&self, amount: Money) -> StoredTransaction {
        StoredTransaction {
            date: self.date,
            description: self.description.clone(),
            amount,
            details: self.details.clone(),
            type_tag: self.type_tag.clone(),
        }
    }
}

impl From<&StoredTransaction> for NormalizedTransaction {
    fn from(tx: &StoredTransaction) -> Self {
        NormalizedTransaction {
            date: tx.date,
            description: tx.description.clone(),
            amount: tx.amount,
            details: tx.details.clone(),
            type_tag: tx.type_tag.clone(),
            category: None,
            reference: None,
        }
    }
}

fn combined_text(description: &str, details: Option<&str>) -> String {
    format!("{} {}", description, details.unwrap_or_default())
        .trim()
        .to_lowercase()
}

/// Issuer-specific statement layout plus the rules that tell benefit credits
/// apart from purchases, payments and refunds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatementAdapter {
    pub issuer: Issuer,
    pub columns: ColumnMapping,
    pub date_format: String,
    pub delimiter: u8,
    pub sign: SignConvention,
    pub decode_html_entities: bool,
    /// Type tags that are never credits (compared case-insensitively).
    pub excluded_types: Vec<String>,
    /// Type tags that mark a credit on their own.
    pub accepted_types: Vec<String>,
    pub exclusion_keywords: Vec<String>,
    pub inclusion_keywords: Vec<String>,
    /// Phrases that make a row a credit regardless of the keyword rules.
    pub allow_list: Vec<String>,
}

impl StatementAdapter {
    pub fn amex() -> Self {
        Self {
            issuer: Issuer::Amex,
            columns: ColumnMapping {
                date: "Date".to_string(),
                description: "Description".to_string(),
                amount: "Amount".to_string(),
                details: Some("Extended Details".to_string()),
                type_tag: None,
                category: Some("Category".to_string()),
                reference: Some("Reference".to_string()),
            },
            date_format: "%m/%d/%Y".to_string(),
            delimiter: b',',
            sign: SignConvention::CreditsNegative,
            decode_html_entities: false,
            excluded_types: vec![],
            accepted_types: vec![],
            exclusion_keywords: vec!["payment".to_string(), "autopay".to_string()],
            inclusion_keywords: vec!["credit".to_string()],
            allow_list: vec!["airline fee reimbursement".to_string()],
        }
    }

    pub fn chase() -> Self {
        Self {
            issuer: Issuer::Chase,
            columns: ColumnMapping {
                date: "Transaction Date".to_string(),
                description: "Description".to_string(),
                amount: "Amount".to_string(),
                details: None,
                type_tag: Some("Type".to_string()),
                category: Some("Category".to_string()),
                reference: None,
            },
            date_format: "%m/%d/%Y".to_string(),
            delimiter: b',',
            sign: SignConvention::CreditsPositive,
            decode_html_entities: true,
            excluded_types: vec!["payment".to_string(), "return".to_string()],
            accepted_types: vec!["adjustment".to_string()],
            exclusion_keywords: vec!["payment".to_string(), "autopay".to_string()],
            inclusion_keywords: vec!["credit".to_string()],
            allow_list: vec![],
        }
    }

    /// Parses a statement export. The first row is the header; rows whose
    /// date or amount cannot be read are skipped.
    pub fn parse(&self, text: &str) -> Result<Vec<NormalizedTransaction>, AdapterError> {
        let mut rows = tokenize(text, self.delimiter)?.into_iter();
        let header = rows.next().ok_or(AdapterError::Empty)?;

        let required = |name: &str| {
            column_index(&header, name).ok_or_else(|| AdapterError::MissingColumn(name.to_string()))
        };
        let date_col = required(&self.columns.date)?;
        let description_col = required(&self.columns.description)?;
        let amount_col = required(&self.columns.amount)?;
        let optional = |name: &Option<String>| name.as_deref().and_then(|n| column_index(&header, n));
        let details_col = optional(&self.columns.details);
        let type_col = optional(&self.columns.type_tag);
        let category_col = optional(&self.columns.category);
        let reference_col = optional(&self.columns.reference);

        let mut transactions = Vec::new();
        for (line, row) in rows.enumerate() {
            let field = |col: usize| row.get(col).map(String::as_str).unwrap_or_default();
            let optional_field = |col: Option<usize>| {
                col.map(field)
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
            };

            let date = match parse_date(field(date_col), &self.date_format) {
                Ok(date) => date,
                Err(e) => {
                    tracing::debug!(issuer = %self.issuer, row = line + 2, "Skipping row: {e}");
                    continue;
                }
            };
            let amount = match parse_amount(field(amount_col)) {
                Ok(amount) => amount,
                Err(e) => {
                    tracing::debug!(issuer = %self.issuer, row = line + 2, "Skipping row: {e}");
                    continue;
                }
            };

            let description = if self.decode_html_entities {
                decode_html_entities(field(description_col))
            } else {
                field(description_col).to_string()
            };

            transactions.push(NormalizedTransaction {
                date,
                description,
                amount,
                details: optional_field(details_col),
                type_tag: optional_field(type_col),
                category: optional_field(category_col),
                reference: optional_field(reference_col).map(|r| r.replace('\'', "")),
            });
        }

        Ok(transactions)
    }

    pub fn extract_credits(&self, transactions: Vec<NormalizedTransaction>) -> Vec<NormalizedTransaction> {
        transactions
            .into_iter()
            .filter(|tx| self.is_credit(tx))
            .collect()
    }

    pub fn is_credit(&self, tx: &NormalizedTransaction) -> bool {
        self.classify(tx.amount, &tx.combined_text(), tx.type_tag.as_deref())
    }

    /// Same test applied to an already stored transaction, used when credits
    /// are re-derived from a saved statement.
    pub fn is_benefit_credit(&self, tx: &StoredTransaction) -> bool {
        self.classify(
            tx.amount,
            &combined_text(&tx.description, tx.details.as_deref()),
            tx.type_tag.as_deref(),
        )
    }

    fn classify(&self, amount: Money, text: &str, type_tag: Option<&str>) -> bool {
        if !self.sign.is_credit_sign(amount) {
            return false;
        }

        let type_tag = type_tag.map(str::to_lowercase);
        let has_type = |list: &[String]| {
            type_tag
                .as_deref()
                .is_some_and(|t| list.iter().any(|candidate| candidate == t))
        };
        if has_type(&self.excluded_types) {
            return false;
        }
        if self.exclusion_keywords.iter().any(|k| text.contains(k.as_str())) {
            return false;
        }
        if self.allow_list.iter().any(|phrase| text.contains(phrase.as_str())) {
            return true;
        }
        has_type(&self.accepted_types) || self.inclusion_keywords.iter().any(|k| text.contains(k.as_str()))
    }
}

fn column_index(header: &[String], name: &str) -> Option<usize> {
    header.iter().position(|h| h.eq_ignore_ascii_case(name))
}

/// Parses a statement date as midnight UTC. Falls back to ISO dates.
pub fn parse_date(s: &str, format: &str) -> Result<DateTime<Utc>, AdapterError> {
    let s = s.trim();
    [format, "%Y-%m-%d"]
        .iter()
        .find_map(|fmt| NaiveDate::parse_from_str(s, fmt).ok())
        .and_then(|date| date.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
        .ok_or_else(|| AdapterError::InvalidDate(s.to_string()))
}

/// Parses a statement amount, accepting `$`, thousands separators and
/// accounting-style parentheses for negatives.
pub fn parse_amount(s: &str) -> Result<Money, AdapterError> {
    let s = s.trim();
    let (negative, s) = if s.starts_with('(') && s.ends_with(')') && s.len() >= 2 {
        (true, &s[1..s.len() - 1])
    } else {
        (false, s)
    };
    let s = s.replace([',', '$', ' '], "");
    let dec = Decimal::from_str(&s).map_err(|_| AdapterError::InvalidAmount(s.to_string()))?;
    let amount = Money::from_decimal(dec);
    Ok(if negative { -amount } else { amount })
}

pub fn decode_html_entities(text: &str) -> String {
    text.replace("&amp;", "&")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
}
