use thiserror::Error;

use crate::{
    account::AccountError,
    command::{
        AccountRef, CommandError, CreateRequestCommand, FulfillRequestCommand, SendCommand,
    },
    id::{AccountId, IdempotencyKey, RequestId, TransactionId},
    link::{LinkError, PublicHandle},
    log::LogError,
    money::{Amount, MoneyError},
    query::{HistoryEntry, Page, QueryError, TransactionFilter},
    request::RequestError,
};

pub mod in_memory_processor;

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error(transparent)]
    Command(#[from] CommandError),
    #[error(transparent)]
    Money(#[from] MoneyError),
    #[error(transparent)]
    Account(#[from] AccountError),
    #[error(transparent)]
    Request(#[from] RequestError),
    #[error(transparent)]
    Link(#[from] LinkError),
    #[error(transparent)]
    Query(#[from] QueryError),
    #[error(transparent)]
    Log(#[from] LogError),
    #[error("Idempotency key `{key}` already belongs to transaction `{existing}` with different parameters")]
    Conflict {
        key: IdempotencyKey,
        existing: TransactionId,
    },
}

/// How a caller should treat an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Validation,
    NotFound,
    InsufficientFunds,
    InvalidState,
    Expired,
    Conflict,
    /// lock contention, safe to retry
    Transient,
    /// needs out-of-band reconciliation
    Fatal,
}

impl LedgerError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            LedgerError::Command(_) | LedgerError::Money(_) | LedgerError::Query(_) => {
                ErrorKind::Validation
            }
            LedgerError::Account(err) => match err {
                AccountError::UnknownAccount(_) => ErrorKind::NotFound,
                AccountError::InsufficientFunds { .. } => ErrorKind::InsufficientFunds,
                AccountError::DuplicateAccount(_) => ErrorKind::Conflict,
                AccountError::Inactive(_)
                | AccountError::CurrencyMismatch { .. }
                | AccountError::InvalidAmount(_)
                | AccountError::SelfTransfer(_)
                | AccountError::Overflow(_)
                | AccountError::FundingOverflow(_) => ErrorKind::Validation,
                AccountError::LockTimeout(_) => ErrorKind::Transient,
                AccountError::Frozen(_)
                | AccountError::ConservationViolated { .. }
                | AccountError::AuditMismatch { .. } => ErrorKind::Fatal,
            },
            LedgerError::Request(err) => match err {
                RequestError::NotFound(_) => ErrorKind::NotFound,
                RequestError::Expired { .. } => ErrorKind::Expired,
                RequestError::InvalidState { .. } => ErrorKind::InvalidState,
                RequestError::AlreadyFulfilled { .. } => ErrorKind::Conflict,
                RequestError::NotParticipant { .. }
                | RequestError::SelfRequest(_)
                | RequestError::InvalidAmount
                | RequestError::NegativeTtl(_) => ErrorKind::Validation,
                RequestError::LockTimeout(_) => ErrorKind::Transient,
            },
            LedgerError::Link(err) => match err {
                LinkError::UnknownHandle(_) => ErrorKind::NotFound,
                LinkError::InvalidHandle(_) => ErrorKind::Validation,
                LinkError::HandleTaken(_) | LinkError::AlreadyIssued { .. } => {
                    ErrorKind::Conflict
                }
            },
            LedgerError::Log(_) => ErrorKind::Fatal,
            LedgerError::Conflict { .. } => ErrorKind::Conflict,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.kind() == ErrorKind::Transient
    }
}

/// Commands and queries the presentation layer may issue. Callers are
/// already authenticated.
pub trait PaymentProcessor {
    fn get_balance(&self, account: &AccountId) -> Result<Amount, LedgerError>;

    fn send(&self, command: SendCommand) -> Result<TransactionId, LedgerError>;

    fn create_request(&self, command: CreateRequestCommand) -> Result<RequestId, LedgerError>;

    fn cancel_request(
        &self,
        request: &RequestId,
        requester: &AccountRef,
    ) -> Result<(), LedgerError>;

    fn fulfill_request(&self, command: FulfillRequestCommand)
    -> Result<TransactionId, LedgerError>;

    fn list_transactions(
        &self,
        account: &AccountId,
        filter: &TransactionFilter,
    ) -> Result<Page<HistoryEntry>, LedgerError>;

    fn resolve_link(&self, handle: &str) -> Result<AccountId, LedgerError>;

    fn issue_link(&self, account: &AccountId) -> Result<PublicHandle, LedgerError>;
}
