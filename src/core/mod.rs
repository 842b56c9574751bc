pub mod error;
pub mod types;
pub mod value;

pub use error::{DbError, Result};
pub use types::{EntityState, IsolationLevel, ScopeOption, TransactionId};
pub use value::Value;
