use super::with_chain;
use crate::core::{DbError, Result};

/// Marks an ambient transaction that is managed outside of this crate,
/// such as a distributed transaction opened by the host.
///
/// Scoped execution refuses to run while one is active.
pub struct ExternalTransactionScope {
    _private: (),
}

impl ExternalTransactionScope {
    pub fn enter() -> Self {
        with_chain(|chain| chain.external_transactions += 1);
        Self { _private: () }
    }

    /// Whether an external transaction is ambient in the current flow
    pub fn is_active() -> bool {
        with_chain(|chain| chain.external_transactions > 0)
    }

    pub(crate) fn ensure_inactive() -> Result<()> {
        if Self::is_active() {
            return Err(DbError::InvalidOperation(
                "An ambient transaction has been detected. Scoped execution does not support ambient transactions.".to_string(),
            ));
        }
        Ok(())
    }
}

impl Drop for ExternalTransactionScope {
    fn drop(&mut self) {
        with_chain(|chain| {
            chain.external_transactions = chain.external_transactions.saturating_sub(1)
        });
    }
}
