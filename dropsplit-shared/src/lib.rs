pub mod models;
pub mod money;
pub mod pii;

pub use money::MoneyError;
pub use pii::Masked;
