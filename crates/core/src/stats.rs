use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::benefit::BenefitSnapshot;
use crate::money::Money;
use crate::reconcile::reference_instant;

/// Dashboard figures across a set of snapshots.
///
/// Every period that has started by the reference instant counts toward
/// `ytd_total_periods` and lands in exactly one of the completed, pending or
/// missed buckets.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Stats {
    pub total_benefits: usize,
    pub total_value: Money,
    pub used_value: Money,
    pub current_period_completed_count: usize,
    pub ytd_completed_periods: usize,
    pub ytd_total_periods: usize,
    pub pending_count: usize,
    pub missed_count: usize,
}

impl Stats {
    pub fn aggregate(snapshots: &[BenefitSnapshot], year: Option<i32>, now: DateTime<Utc>) -> Self {
        let reference = reference_instant(year, now);
        let mut stats = Stats {
            total_benefits: snapshots.len(),
            ..Default::default()
        };

        for snapshot in snapshots {
            stats.total_value += snapshot.credit_amount;
            stats.used_value += snapshot.current_used;

            if snapshot.has_periods() {
                let segment = snapshot.segment_value();
                for period in &snapshot.periods {
                    stats.count_segment(
                        period.used >= segment,
                        period.range.has_started(reference),
                        period.range.has_ended(reference),
                    );
                }
            } else {
                stats.count_segment(
                    snapshot.current_used >= snapshot.credit_amount,
                    snapshot.effective_range.has_started(reference),
                    snapshot.effective_range.has_ended(reference),
                );
            }
        }
        stats
    }

    fn count_segment(&mut self, complete: bool, started: bool, ended: bool) {
        if !started {
            return;
        }
        self.ytd_total_periods += 1;
        if complete {
            self.ytd_completed_periods += 1;
            if !ended {
                self.current_period_completed_count += 1;
            }
        } else if ended {
            self.missed_count += 1;
        } else {
            self.pending_count += 1;
        }
    }
}
