pub mod benefit;
pub mod catalog;
pub mod money;
pub mod period;
pub mod reconcile;
pub mod stats;

pub use benefit::{
    merge_transactions, BenefitDefinition, BenefitSnapshot, BenefitStatus, BenefitUsage,
    BenefitUserState, PeriodDefinition, PeriodUserState, ResolvedPeriod, StoredTransaction,
    TimeProgress, TransactionKey,
};
pub use catalog::{BenefitCatalog, Card, CatalogError};
pub use money::Money;
pub use period::{with_calendar_year, CalendarYear, DateRange, ResetCadence};
pub use reconcile::{reconcile, reference_instant};
pub use stats::Stats;
