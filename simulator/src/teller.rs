//! Simulated tellers moving money between accounts.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::RwLock;

use banklock_common::{BankLockError, Priority, ResourceKey, WorkerId};
use banklock_crypto::TokenSigner;
use banklock_worker::{WorkerClient, WorkerClientBuilder, WorkerConfig};

#[derive(Debug, Default)]
struct Account {
    balance: i64,
    /// Set while a transfer is inside its critical section.
    in_use: bool,
}

/// In-memory account balances shared by every teller.
///
/// Entering an account that another transfer is already inside means the
/// coordinator handed out overlapping locks.
#[derive(Debug, Default)]
pub struct AccountBook {
    accounts: RwLock<HashMap<String, Account>>,
}

impl AccountBook {
    /// Open `count` accounts with `initial_balance` each.
    pub fn new(count: usize, initial_balance: i64) -> Self {
        let accounts = (0..count)
            .map(|i| {
                (
                    account_id(i),
                    Account {
                        balance: initial_balance,
                        in_use: false,
                    },
                )
            })
            .collect();
        Self {
            accounts: RwLock::new(accounts),
        }
    }

    pub async fn len(&self) -> usize {
        self.accounts.read().await.len()
    }

    /// Sum of all balances; constant while transfers are exclusive.
    pub async fn total(&self) -> i64 {
        self.accounts.read().await.values().map(|a| a.balance).sum()
    }

    #[allow(dead_code)]
    pub async fn balance(&self, id: &str) -> Option<i64> {
        self.accounts.read().await.get(id).map(|a| a.balance)
    }

    /// Mark both accounts busy, failing if either already is.
    async fn enter(&self, from: &str, to: &str) -> Result<(), TransferError> {
        let mut accounts = self.accounts.write().await;
        for id in [from, to] {
            match accounts.get(id) {
                Some(account) if account.in_use => return Err(TransferError::ExclusionViolated),
                Some(_) => {}
                None => return Err(TransferError::UnknownAccount(id.to_string())),
            }
        }
        for id in [from, to] {
            if let Some(account) = accounts.get_mut(id) {
                account.in_use = true;
            }
        }
        Ok(())
    }

    async fn leave(&self, from: &str, to: &str) {
        let mut accounts = self.accounts.write().await;
        for id in [from, to] {
            if let Some(account) = accounts.get_mut(id) {
                account.in_use = false;
            }
        }
    }

    async fn move_funds(&self, from: &str, to: &str, amount: i64) -> Result<(), TransferError> {
        let mut accounts = self.accounts.write().await;
        let available = accounts.get(from).map(|a| a.balance).unwrap_or(0);
        if available < amount {
            return Err(TransferError::InsufficientFunds);
        }
        if let Some(account) = accounts.get_mut(from) {
            account.balance -= amount;
        }
        if let Some(account) = accounts.get_mut(to) {
            account.balance += amount;
        }
        Ok(())
    }
}

/// Account id for index `i`.
pub fn account_id(i: usize) -> String {
    format!("acc-{}", i + 1)
}

/// Why a transfer did not complete.
#[derive(Debug)]
pub enum TransferError {
    /// The coordinator refused the locks.
    Denied(String),
    /// No grant within the acquire timeout.
    TimedOut,
    InsufficientFunds,
    /// Another transfer was inside one of the accounts.
    ExclusionViolated,
    UnknownAccount(String),
    Client(BankLockError),
}

impl From<BankLockError> for TransferError {
    fn from(e: BankLockError) -> Self {
        match e {
            BankLockError::LockDenied { reason, .. } => TransferError::Denied(reason),
            BankLockError::LockTimeout { .. } => TransferError::TimedOut,
            other => TransferError::Client(other),
        }
    }
}

/// One teller process.
pub struct SimulatedTeller {
    pub id: WorkerId,
    client: WorkerClient,
    /// Time spent inside the critical section.
    hold: Duration,
}

impl SimulatedTeller {
    /// Connect and register with the coordinator.
    pub async fn connect(&self) -> banklock_common::Result<()> {
        self.client.connect().await
    }

    pub async fn disconnect(&self) -> banklock_common::Result<()> {
        self.client.disconnect().await
    }

    /// Move `amount` from `from` to `to` while holding both account locks.
    pub async fn transfer(
        &self,
        book: &AccountBook,
        from: &str,
        to: &str,
        amount: i64,
        priority: Priority,
    ) -> Result<(), TransferError> {
        let handle = self
            .client
            .acquire(
                [ResourceKey::account(from), ResourceKey::account(to)],
                priority,
                "transfer",
            )
            .await?;

        let outcome = match book.enter(from, to).await {
            Ok(()) => {
                tokio::time::sleep(self.hold).await;
                let moved = book.move_funds(from, to, amount).await;
                book.leave(from, to).await;
                moved
            }
            Err(e) => Err(e),
        };

        self.client.release(handle).await?;
        outcome
    }
}

/// Teller factory for creating registered clients.
pub struct TellerFactory;

impl TellerFactory {
    /// Create `count` tellers with tokens minted by `signer`.
    pub fn create_tellers(
        count: usize,
        base: &WorkerConfig,
        signer: &TokenSigner,
        hold: Duration,
    ) -> anyhow::Result<Vec<Arc<SimulatedTeller>>> {
        (0..count)
            .map(|i| {
                let id = WorkerId::new(format!("teller-{}", i + 1));
                let token = signer.issue(&id, Utc::now()).token;
                let client = WorkerClientBuilder::new()
                    .config(WorkerConfig {
                        worker_id: id.clone(),
                        token: Some(token),
                        listen_port: base.listen_port + i as u16,
                        ..base.clone()
                    })
                    .build()?;
                Ok(Arc::new(SimulatedTeller { id, client, hold }))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_book_detects_overlap() {
        let book = AccountBook::new(3, 1_000);

        book.enter("acc-1", "acc-2").await.unwrap();
        assert!(matches!(
            book.enter("acc-2", "acc-3").await,
            Err(TransferError::ExclusionViolated)
        ));
        book.leave("acc-1", "acc-2").await;
        assert!(book.enter("acc-2", "acc-3").await.is_ok());
    }

    #[tokio::test]
    async fn test_move_funds_preserves_total() {
        let book = AccountBook::new(2, 1_000);

        book.move_funds("acc-1", "acc-2", 400).await.unwrap();
        assert!(matches!(
            book.move_funds("acc-1", "acc-2", 700).await,
            Err(TransferError::InsufficientFunds)
        ));

        assert_eq!(book.balance("acc-1").await, Some(600));
        assert_eq!(book.total().await, 2_000);
    }
}
