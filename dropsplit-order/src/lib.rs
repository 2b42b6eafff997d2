pub mod jobs;
pub mod processor_events;
pub mod quantities;
pub mod rates;
pub mod reconciler;
pub mod router;
pub mod settlement;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use jobs::{JobError, JobRunner};
pub use processor_events::{EventEffect, ProcessorEventHandler};
pub use rates::{CarrierRateQuoter, QuoteError};
pub use reconciler::{FulfillmentReconciler, ReconcileError, ReconcileOutcome};
pub use router::{OrderRouter, RoutingError, RoutingReport};
pub use settlement::{SettlementError, SettlementOutcome, SettlementPlan, SettlementService};
