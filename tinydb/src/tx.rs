//! Transaction states and the checks deferred to commit time.
//!
//! One logical writer: `Idle → Active → Committing → Idle`, with
//! `Active → Aborting → Idle` on failure. In explicit mode a statement
//! error parks the transaction in `Aborting` until the caller rolls back.

use crate::error::{Error, Result};
use crate::value::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TxnStatus {
    #[default]
    Idle,
    Active,
    Committing,
    Aborting,
}

/// Referential checks queued during a transaction and verified against the
/// then-current state at commit.
#[derive(Debug, Clone)]
pub enum PendingCheck {
    /// An inserted/updated FK value must match an existing parent key.
    ParentExists {
        child_table: String,
        column: String,
        parent_table: String,
        key: Vec<Value>,
    },
    /// A deleted (or re-keyed) row must leave no dangling referents.
    NoReferents {
        parent_table: String,
        key: Vec<Value>,
    },
}

#[derive(Debug, Default)]
pub struct TxnManager {
    status: TxnStatus,
    explicit: bool,
    pending: Vec<PendingCheck>,
}

impl TxnManager {
    pub fn status(&self) -> TxnStatus {
        self.status
    }

    pub fn is_active(&self) -> bool {
        self.status == TxnStatus::Active
    }

    pub fn in_explicit(&self) -> bool {
        self.explicit && matches!(self.status, TxnStatus::Active | TxnStatus::Aborting)
    }

    pub fn begin_explicit(&mut self) -> Result<()> {
        if self.status != TxnStatus::Idle {
            return Err(Error::Busy);
        }
        self.status = TxnStatus::Active;
        self.explicit = true;
        Ok(())
    }

    pub fn begin_implicit(&mut self) -> Result<()> {
        if self.status != TxnStatus::Idle {
            return Err(Error::Busy);
        }
        self.status = TxnStatus::Active;
        self.explicit = false;
        Ok(())
    }

    /// A doomed transaction accepts nothing but ROLLBACK.
    pub fn assert_writable(&self) -> Result<()> {
        if self.status == TxnStatus::Aborting {
            return Err(Error::Busy);
        }
        Ok(())
    }

    pub fn queue_check(&mut self, check: PendingCheck) {
        self.pending.push(check);
    }

    pub fn take_checks(&mut self) -> Vec<PendingCheck> {
        std::mem::take(&mut self.pending)
    }

    pub fn mark_committing(&mut self) -> Result<()> {
        if self.status != TxnStatus::Active {
            return Err(Error::Busy);
        }
        self.status = TxnStatus::Committing;
        Ok(())
    }

    pub fn mark_aborting(&mut self) {
        self.status = TxnStatus::Aborting;
    }

    pub fn finish(&mut self) {
        self.status = TxnStatus::Idle;
        self.explicit = false;
        self.pending.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn begin_while_active_is_busy() {
        let mut txn = TxnManager::default();
        txn.begin_explicit().unwrap();
        assert!(matches!(txn.begin_explicit(), Err(Error::Busy)));
        assert!(matches!(txn.begin_implicit(), Err(Error::Busy)));
    }

    #[test]
    fn commit_walks_through_committing() {
        let mut txn = TxnManager::default();
        txn.begin_implicit().unwrap();
        txn.mark_committing().unwrap();
        txn.finish();
        assert_eq!(txn.status(), TxnStatus::Idle);
    }

    #[test]
    fn aborting_blocks_further_statements() {
        let mut txn = TxnManager::default();
        txn.begin_explicit().unwrap();
        txn.mark_aborting();
        assert!(matches!(txn.assert_writable(), Err(Error::Busy)));
        assert!(txn.in_explicit());
        txn.finish();
        assert!(txn.assert_writable().is_ok());
    }

    #[test]
    fn finish_drops_pending_checks() {
        let mut txn = TxnManager::default();
        txn.begin_explicit().unwrap();
        txn.queue_check(PendingCheck::NoReferents {
            parent_table: "t".into(),
            key: vec![Value::Integer(1)],
        });
        txn.finish();
        assert!(txn.take_checks().is_empty());
    }
}
