use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use thiserror::Error;

use crate::benefit::{BenefitDefinition, PeriodDefinition};
use crate::money::Money;
use crate::period::{CalendarYear, ResetCadence};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Card {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub annual_fee: Money,
}

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("Failed to parse catalog: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("Duplicate benefit id: {0}")]
    DuplicateBenefit(String),
    #[error("Duplicate card id: {0}")]
    DuplicateCard(String),
    #[error("Benefit {benefit} references unknown card {card}")]
    UnknownCard { benefit: String, card: String },
    #[error("Benefit {benefit} repeats period id {period}")]
    DuplicatePeriod { benefit: String, period: String },
    #[error("Range of {0} ends before it starts")]
    InvertedRange(String),
}

#[derive(Debug, Deserialize)]
struct CatalogFile {
    #[serde(default)]
    cards: Vec<Card>,
    #[serde(default)]
    benefits: Vec<BenefitEntry>,
}

/// A catalog benefit as written in TOML; `periods` may be left out for
/// non-annual cadences and are then generated.
#[derive(Debug, Deserialize)]
struct BenefitEntry {
    id: String,
    card_id: String,
    name: String,
    #[serde(default)]
    description: String,
    credit_amount: Money,
    cadence: ResetCadence,
    start_date: DateTime<Utc>,
    end_date: DateTime<Utc>,
    periods: Option<Vec<PeriodDefinition>>,
    #[serde(default)]
    enrollment_required: bool,
    #[serde(default)]
    category: String,
}

impl BenefitEntry {
    fn into_definition(self) -> BenefitDefinition {
        let periods = match self.periods {
            Some(periods) => periods,
            None => self
                .cadence
                .sub_periods(CalendarYear::of(self.start_date))
                .into_iter()
                .map(|(id, range)| PeriodDefinition {
                    id,
                    start_date: range.start,
                    end_date: range.end,
                })
                .collect(),
        };
        BenefitDefinition {
            id: self.id,
            card_id: self.card_id,
            name: self.name,
            description: self.description,
            credit_amount: self.credit_amount,
            cadence: self.cadence,
            start_date: self.start_date,
            end_date: self.end_date,
            periods,
            enrollment_required: self.enrollment_required,
            category: self.category,
        }
    }
}

/// Read-only source of card and benefit definitions.
#[derive(Debug, Clone, Default)]
pub struct BenefitCatalog {
    cards: Vec<Card>,
    benefits: Vec<BenefitDefinition>,
}

impl BenefitCatalog {
    pub fn new(cards: Vec<Card>, benefits: Vec<BenefitDefinition>) -> Result<Self, CatalogError> {
        validate(&cards, &benefits)?;
        Ok(Self { cards, benefits })
    }

    pub fn from_toml(toml_content: &str) -> Result<Self, CatalogError> {
        let file: CatalogFile = toml::from_str(toml_content)?;
        let benefits = file
            .benefits
            .into_iter()
            .map(BenefitEntry::into_definition)
            .collect();
        Self::new(file.cards, benefits)
    }

    pub fn cards(&self) -> &[Card] {
        &self.cards
    }

    pub fn card(&self, card_id: &str) -> Option<&Card> {
        self.cards.iter().find(|c| c.id == card_id)
    }

    pub fn definitions(&self) -> &[BenefitDefinition] {
        &self.benefits
    }

    pub fn get(&self, benefit_id: &str) -> Option<&BenefitDefinition> {
        self.benefits.iter().find(|b| b.id == benefit_id)
    }

    pub fn for_card<'a>(&'a self, card_id: &'a str) -> impl Iterator<Item = &'a BenefitDefinition> {
        self.benefits.iter().filter(move |b| b.card_id == card_id)
    }
}

fn validate(cards: &[Card], benefits: &[BenefitDefinition]) -> Result<(), CatalogError> {
    let mut card_ids = HashSet::new();
    for card in cards {
        if !card_ids.insert(card.id.as_str()) {
            return Err(CatalogError::DuplicateCard(card.id.clone()));
        }
    }

    let mut benefit_ids = HashSet::new();
    for benefit in benefits {
        if !benefit_ids.insert(benefit.id.as_str()) {
            return Err(CatalogError::DuplicateBenefit(benefit.id.clone()));
        }
        if !card_ids.contains(benefit.card_id.as_str()) {
            return Err(CatalogError::UnknownCard {
                benefit: benefit.id.clone(),
                card: benefit.card_id.clone(),
            });
        }
        if benefit.end_date < benefit.start_date {
            return Err(CatalogError::InvertedRange(benefit.id.clone()));
        }
        let mut period_ids = HashSet::new();
        for period in &benefit.periods {
            if !period_ids.insert(period.id.as_str()) {
                return Err(CatalogError::DuplicatePeriod {
                    benefit: benefit.id.clone(),
                    period: period.id.clone(),
                });
            }
            if period.end_date < period.start_date {
                return Err(CatalogError::InvertedRange(format!(
                    "{}/{}",
                    benefit.id, period.id
                )));
            }
        }
    }
    Ok(())
}
