pub mod breaker;
pub mod platform;
pub mod processor;

pub use breaker::CircuitBreaker;
pub use platform::PlatformClient;
pub use processor::ProcessorClient;
