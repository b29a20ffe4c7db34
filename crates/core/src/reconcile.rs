//! Resolves a benefit definition plus user state into a point-in-time
//! snapshot.
//!
//! [`reconcile`] is a pure function of its inputs: the definition, the user
//! state (if any), an optional calendar year to view, and the wall-clock
//! instant supplied by the caller. It never reads a clock and has no error
//! channel. Missing or partial user state resolves to defaults.

use chrono::{DateTime, Datelike, Utc};
use std::collections::HashSet;

use crate::benefit::{
    BenefitDefinition, BenefitSnapshot, BenefitStatus, BenefitUserState, ResolvedPeriod,
    StoredTransaction, TimeProgress, TransactionKey,
};
use crate::money::Money;
use crate::period::{CalendarYear, DateRange};

/// Instant that statuses are evaluated against.
///
/// Without a year this is `now`. A future year is viewed from its first
/// instant, a past year from the first instant of the following year (so the
/// whole year reads as elapsed), and the current year from `now`.
pub fn reference_instant(year: Option<i32>, now: DateTime<Utc>) -> DateTime<Utc> {
    match year {
        None => now,
        Some(y) if y > now.year() => CalendarYear(y).start(),
        Some(y) if y < now.year() => CalendarYear(y).end_exclusive(),
        Some(_) => now,
    }
}

pub fn reconcile(
    definition: &BenefitDefinition,
    state: Option<&BenefitUserState>,
    year: Option<i32>,
    now: DateTime<Utc>,
) -> BenefitSnapshot {
    let default_state;
    let state = match state {
        Some(state) => state,
        None => {
            default_state = BenefitUserState::for_definition(definition);
            &default_state
        }
    };

    let reference = reference_instant(year, now);
    let year_shift = year.map_or(0, |y| y.saturating_sub(definition.start_date.year()));
    let effective_range = definition.range().shift_years(year_shift);
    let period_ranges: Vec<DateRange> = definition
        .periods
        .iter()
        .map(|p| p.range().shift_years(year_shift))
        .collect();

    let attribution = attribute(definition, state, year, &period_ranges);

    let legacy_applies = year.map_or(true, |y| y == definition.start_date.year());
    let transaction_total: Money = attribution.year_transactions.iter().map(|t| t.amount).sum();
    let usage_total = if attribution.year_transactions.is_empty() && legacy_applies {
        state.legacy_used
    } else {
        transaction_total
    };

    let claimed_elsewhere_year = match year {
        Some(y) if y < now.year() && usage_total.is_zero() => {
            nearest_prior_year(state, y)
        }
        _ => None,
    };

    let segment = definition.segment_value();
    let mut period_used: Vec<Money> = attribution
        .period_transactions
        .iter()
        .map(|txs| txs.iter().map(|t| t.amount).sum())
        .collect();

    if claimed_elsewhere_year.is_some() {
        period_used.iter_mut().for_each(|used| *used = segment);
    } else if usage_total.is_positive() && period_used.iter().all(|used| used.is_zero()) {
        backfill(&mut period_used, &period_ranges, definition, usage_total, segment);
    }

    let periods: Vec<ResolvedPeriod> = definition
        .periods
        .iter()
        .zip(period_ranges.iter().copied())
        .zip(period_used.iter().copied())
        .zip(attribution.period_transactions)
        .map(|(((period, range), used), transactions)| ResolvedPeriod {
            id: period.id.clone(),
            range,
            used,
            status: segment_status(used, segment, range, reference),
            transactions,
            progress: progress_at(range, reference),
        })
        .collect();

    let current_used = if claimed_elsewhere_year.is_some() && periods.is_empty() {
        definition.credit_amount
    } else if periods.is_empty() {
        usage_total
    } else {
        periods.iter().map(|p| p.used).sum()
    };

    let unattributed = if claimed_elsewhere_year.is_some() || usage_total <= current_used {
        Money::zero()
    } else {
        usage_total - current_used
    };

    let status = if claimed_elsewhere_year.is_some() {
        BenefitStatus::Completed
    } else if periods.is_empty() {
        segment_status(current_used, definition.credit_amount, effective_range, reference)
    } else {
        overall_status(&periods)
    };

    let all_dates = state.all_transactions().map(|t| t.date);
    let auto_enrolled_at = if definition.enrollment_required {
        all_dates.min()
    } else {
        None
    };

    BenefitSnapshot {
        benefit_id: definition.id.clone(),
        card_id: definition.card_id.clone(),
        name: definition.name.clone(),
        description: definition.description.clone(),
        category: definition.category.clone(),
        cadence: definition.cadence,
        credit_amount: definition.credit_amount,
        enrollment_required: definition.enrollment_required,
        enrolled: state.enrolled || auto_enrolled_at.is_some(),
        auto_enrolled_at,
        ignored: state.ignored,
        activation_acknowledged: state.activation_acknowledged,
        effective_range,
        reference,
        progress: if periods.is_empty() {
            progress_at(effective_range, reference)
        } else {
            None
        },
        periods,
        current_used,
        unattributed,
        status,
        claimed_elsewhere_year,
        year_transactions: attribution.year_transactions,
    }
}

// ── attribution ───────────────────────────────────────────────────────────────

struct Attribution {
    /// Transactions of the viewed year, deduplicated and date-ordered.
    year_transactions: Vec<StoredTransaction>,
    /// Per-period transactions, index-aligned with the definition's periods.
    period_transactions: Vec<Vec<StoredTransaction>>,
}

/// Places each transaction of the viewed year. Per-period records are taken
/// first so they win ties against identical benefit-level records; a
/// benefit-level transaction lands in the first period whose range holds its
/// date, or stays unplaced.
fn attribute(
    definition: &BenefitDefinition,
    state: &BenefitUserState,
    year: Option<i32>,
    period_ranges: &[DateRange],
) -> Attribution {
    let in_view = |tx: &StoredTransaction| year.map_or(true, |y| CalendarYear(y).contains(tx.date));
    let mut seen: HashSet<TransactionKey> = HashSet::new();
    let mut year_transactions = Vec::new();
    let mut period_transactions = vec![Vec::new(); definition.periods.len()];
    let mut loose: Vec<&StoredTransaction> = Vec::new();

    for (period_state_id, period_state) in &state.periods {
        let index = definition.periods.iter().position(|p| &p.id == period_state_id);
        for tx in period_state.transactions.iter().filter(|tx| in_view(*tx)) {
            match index {
                Some(index) => {
                    if seen.insert(tx.key()) {
                        period_transactions[index].push(tx.clone());
                        year_transactions.push(tx.clone());
                    }
                }
                // Periods that no longer exist in the definition.
                None => loose.push(tx),
            }
        }
    }
    loose.extend(state.transactions.iter().filter(|tx| in_view(*tx)));

    for tx in loose {
        if !seen.insert(tx.key()) {
            continue;
        }
        if let Some(index) = period_ranges.iter().position(|r| r.contains(tx.date)) {
            period_transactions[index].push(tx.clone());
        }
        year_transactions.push(tx.clone());
    }

    year_transactions.sort_by(|a, b| a.key().cmp(&b.key()));
    for txs in &mut period_transactions {
        txs.sort_by(|a, b| a.key().cmp(&b.key()));
    }

    Attribution {
        year_transactions,
        period_transactions,
    }
}

/// Nearest year before `year` holding at least one transaction.
fn nearest_prior_year(state: &BenefitUserState, year: i32) -> Option<i32> {
    state
        .all_transactions()
        .map(|t| t.date.year())
        .filter(|y| *y < year)
        .max()
}

/// Spreads a usage total over periods that show none, most recent period
/// first, each capped at the segment value. Periods are ordered by end, then
/// start, descending; equal ranges fall back to ascending period id.
fn backfill(
    period_used: &mut [Money],
    period_ranges: &[DateRange],
    definition: &BenefitDefinition,
    total: Money,
    segment: Money,
) {
    let mut order: Vec<usize> = (0..period_used.len()).collect();
    order.sort_by(|&a, &b| {
        period_ranges[b]
            .end
            .cmp(&period_ranges[a].end)
            .then(period_ranges[b].start.cmp(&period_ranges[a].start))
            .then(definition.periods[a].id.cmp(&definition.periods[b].id))
    });

    let mut remaining = total;
    for index in order {
        if !remaining.is_positive() {
            break;
        }
        let share = if remaining < segment { remaining } else { segment };
        period_used[index] = share;
        remaining = remaining - share;
    }
}

// ── status ────────────────────────────────────────────────────────────────────

fn segment_status(
    used: Money,
    cap: Money,
    range: DateRange,
    reference: DateTime<Utc>,
) -> BenefitStatus {
    if used >= cap {
        BenefitStatus::Completed
    } else if range.has_ended(reference) {
        BenefitStatus::Missed
    } else {
        BenefitStatus::Pending
    }
}

fn overall_status(periods: &[ResolvedPeriod]) -> BenefitStatus {
    let any_pending = periods.iter().any(|p| p.status == BenefitStatus::Pending);
    let any_missed = periods.iter().any(|p| p.status == BenefitStatus::Missed);
    if periods.iter().all(|p| p.status == BenefitStatus::Completed) {
        BenefitStatus::Completed
    } else if any_missed && !any_pending {
        BenefitStatus::Missed
    } else {
        BenefitStatus::Pending
    }
}

fn progress_at(range: DateRange, reference: DateTime<Utc>) -> Option<TimeProgress> {
    range.contains(reference).then(|| TimeProgress {
        percent_elapsed: range.time_progress(reference),
        days_remaining: range.days_remaining(reference),
    })
}
