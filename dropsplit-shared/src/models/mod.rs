pub mod common;
pub mod events;
pub mod jobs;
pub mod processor;
pub mod rates;

pub use common::{Address, TrackingInfo};
pub use events::{EventSchemaError, PlatformEvent, PlatformTopic};
pub use jobs::Job;
pub use processor::{ParsedProcessorEvent, ProcessorEnvelope, ProcessorEvent};
