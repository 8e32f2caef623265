use std::collections::HashMap;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use thiserror::Error;

use crate::{
    account::AccountError,
    id::{AccountId, IdempotencyKey, RequestId, TransactionId},
    money::{Amount, Currency},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionKind {
    Send,
    RequestFulfillment,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TransactionStatus {
    Pending,
    Completed,
    Failed,
}

#[derive(Debug, Error)]
pub enum LogError {
    #[error("No transaction with sequence number {0}")]
    UnknownSequence(u64),
    #[error("Transaction {sequence} is already {status:?}")]
    AlreadyFinalized {
        sequence: u64,
        status: TransactionStatus,
    },
}

/// A money movement accepted for processing, before the log numbers it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewTransaction {
    pub kind: TransactionKind,
    pub from: AccountId,
    pub to: AccountId,
    pub amount: Amount,
    pub currency: Currency,
    pub memo: Option<String>,
    pub idempotency_key: IdempotencyKey,
    pub request_id: Option<RequestId>,
}

#[derive(Debug, Clone)]
pub struct Transaction {
    id: TransactionId,
    sequence_number: u64,
    kind: TransactionKind,
    from: AccountId,
    to: AccountId,
    amount: Amount,
    currency: Currency,
    memo: Option<String>,
    status: TransactionStatus,
    idempotency_key: IdempotencyKey,
    request_id: Option<RequestId>,
    created_at: DateTime<Utc>,
    completed_at: Option<DateTime<Utc>>,
    failure: Option<AccountError>,
}

impl Transaction {
    pub fn id(&self) -> &TransactionId {
        &self.id
    }

    pub fn sequence_number(&self) -> u64 {
        self.sequence_number
    }

    pub fn kind(&self) -> TransactionKind {
        self.kind
    }

    pub fn from(&self) -> &AccountId {
        &self.from
    }

    pub fn to(&self) -> &AccountId {
        &self.to
    }

    pub fn amount(&self) -> Amount {
        self.amount
    }

    pub fn currency(&self) -> &Currency {
        &self.currency
    }

    pub fn memo(&self) -> Option<&str> {
        self.memo.as_deref()
    }

    pub fn status(&self) -> TransactionStatus {
        self.status
    }

    pub fn idempotency_key(&self) -> &IdempotencyKey {
        &self.idempotency_key
    }

    pub fn request_id(&self) -> Option<&RequestId> {
        self.request_id.as_ref()
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn completed_at(&self) -> Option<DateTime<Utc>> {
        self.completed_at
    }

    /// Why the ledger rejected the transfer, for failed transactions.
    pub fn failure(&self) -> Option<&AccountError> {
        self.failure.as_ref()
    }

    pub fn involves(&self, account: &AccountId) -> bool {
        &self.from == account || &self.to == account
    }

    /// The other side of the transaction, seen from `account`.
    pub fn counterparty(&self, account: &AccountId) -> Option<&AccountId> {
        if &self.from == account {
            Some(&self.to)
        } else if &self.to == account {
            Some(&self.from)
        } else {
            None
        }
    }

    /// Whether `entry` describes the same command as this transaction.
    pub fn matches(&self, entry: &NewTransaction) -> bool {
        self.kind == entry.kind
            && self.from == entry.from
            && self.to == entry.to
            && self.amount == entry.amount
            && self.currency == entry.currency
            && self.memo == entry.memo
            && self.idempotency_key == entry.idempotency_key
            && self.request_id == entry.request_id
    }
}

pub enum Outcome {
    Completed(DateTime<Utc>),
    Failed(AccountError),
}

/// Result of an append. An entry whose idempotency key is already taken is
/// not appended, the transaction holding the key is returned instead.
#[derive(Debug)]
pub enum Appended {
    New(Transaction),
    Existing(Transaction),
}

#[derive(Default)]
struct LogEntries {
    entries: Vec<Transaction>,
    by_key: HashMap<IdempotencyKey, usize>,
    by_id: HashMap<TransactionId, usize>,
}

/// Append-only record of every accepted money movement, ordered by sequence
/// number. Sequence numbers start at 1.
#[derive(Default)]
pub struct TransactionLog {
    inner: RwLock<LogEntries>,
}

impl TransactionLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends `entry` as `Pending`, numbering and timestamping it.
    pub fn append(&self, entry: NewTransaction, now: DateTime<Utc>) -> Appended {
        let mut log = self.inner.write();
        if let Some(&index) = log.by_key.get(&entry.idempotency_key) {
            return Appended::Existing(log.entries[index].clone());
        }

        let index = log.entries.len();
        // timestamps never run backwards along the sequence
        let created_at = log
            .entries
            .last()
            .map_or(now, |last| now.max(last.created_at));
        let transaction = Transaction {
            id: TransactionId::generate(),
            sequence_number: index as u64 + 1,
            kind: entry.kind,
            from: entry.from,
            to: entry.to,
            amount: entry.amount,
            currency: entry.currency,
            memo: entry.memo,
            status: TransactionStatus::Pending,
            idempotency_key: entry.idempotency_key,
            request_id: entry.request_id,
            created_at,
            completed_at: None,
            failure: None,
        };
        log.by_key
            .insert(transaction.idempotency_key.clone(), index);
        log.by_id.insert(transaction.id.clone(), index);
        log.entries.push(transaction.clone());
        Appended::New(transaction)
    }

    /// The single `Pending -> Completed | Failed` transition.
    pub fn finalize(&self, sequence: u64, outcome: Outcome) -> Result<Transaction, LogError> {
        let mut log = self.inner.write();
        let index = sequence
            .checked_sub(1)
            .ok_or(LogError::UnknownSequence(sequence))?;
        let transaction = log
            .entries
            .get_mut(index as usize)
            .ok_or(LogError::UnknownSequence(sequence))?;
        if transaction.status != TransactionStatus::Pending {
            return Err(LogError::AlreadyFinalized {
                sequence,
                status: transaction.status,
            });
        }
        match outcome {
            Outcome::Completed(at) => {
                transaction.status = TransactionStatus::Completed;
                transaction.completed_at = Some(at);
            }
            Outcome::Failed(reason) => {
                transaction.status = TransactionStatus::Failed;
                transaction.failure = Some(reason);
            }
        }
        Ok(transaction.clone())
    }

    pub fn find_by_idempotency_key(&self, key: &IdempotencyKey) -> Option<Transaction> {
        let log = self.inner.read();
        log.by_key.get(key).map(|&index| log.entries[index].clone())
    }

    pub fn get(&self, id: &TransactionId) -> Option<Transaction> {
        let log = self.inner.read();
        log.by_id.get(id).map(|&index| log.entries[index].clone())
    }

    pub fn len(&self) -> usize {
        self.inner.read().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Lazily walks the entries that existed when it was created, oldest
    /// first. Clone it or call [`LogIter::restart`] to walk again.
    pub fn iter(&self) -> LogIter<'_> {
        LogIter {
            log: self,
            next: 0,
            end: self.len(),
        }
    }

    pub fn iterate<P>(&self, predicate: P) -> std::iter::Filter<LogIter<'_>, P>
    where
        P: FnMut(&Transaction) -> bool,
    {
        self.iter().filter(predicate)
    }
}

#[derive(Clone)]
pub struct LogIter<'a> {
    log: &'a TransactionLog,
    next: usize,
    end: usize,
}

impl LogIter<'_> {
    pub fn restart(&mut self) {
        self.next = 0;
    }
}

impl Iterator for LogIter<'_> {
    type Item = Transaction;

    fn next(&mut self) -> Option<Self::Item> {
        if self.next >= self.end {
            return None;
        }
        let transaction = self.log.inner.read().entries.get(self.next).cloned();
        self.next += 1;
        transaction
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.end.saturating_sub(self.next);
        (remaining, Some(remaining))
    }
}
