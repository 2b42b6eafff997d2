pub mod cache;
pub mod commerce;
pub mod directory;
pub mod ledger;
pub mod payment;
pub mod queue;
pub mod repository;

pub use cache::EstimateCache;
pub use commerce::{CommerceError, CommercePlatform, StoreHandle};
pub use directory::{DirectoryError, ImportedVariant, PartnerDirectory, PartnerRole, PaymentProfile, StoreAccount};
pub use ledger::{
    Fulfillment, LineMutation, NewLineItem, NewOrder, Order, OrderLineItem, PaymentStatus, ProcessedWebhook,
    QuantityError,
};
pub use payment::{ChargeRequest, PaymentError, PaymentProcessor, PaymentReceipt, TransferRequest};
pub use queue::{JobQueue, QueueError};
pub use repository::{FulfillmentRecord, InsertOutcome, LedgerError, LedgerRepository, LineUpdate};
