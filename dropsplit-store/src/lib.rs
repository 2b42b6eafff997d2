pub mod app_config;
pub mod database;
pub mod directory_repo;
pub mod events;
pub mod ledger_repo;
pub mod memory_repo;
pub mod redis_repo;

pub use app_config::Config;
pub use database::DbClient;
pub use directory_repo::PgPartnerDirectory;
pub use events::EventProducer;
pub use ledger_repo::PgLedgerRepository;
pub use memory_repo::{InMemoryDirectory, InMemoryLedger};
pub use redis_repo::RedisClient;
