use std::{convert::Infallible, fmt, str::FromStr};

use chrono::TimeDelta;
use rust_decimal::Decimal;
use serde::Deserialize;
use thiserror::Error;

use crate::{
    id::{AccountId, IdempotencyKey, RequestId},
    money::{Amount, Currency, MoneyError},
};

pub const MAX_MEMO_LEN: usize = 280;

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum CommandKind {
    Open,
    Send,
    Request,
    Fulfill,
    Cancel,
    Deactivate,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CommandError {
    #[error("Amount is required for {kind:?}")]
    AmountRequired { kind: CommandKind },
    #[error("Amount must be positive for {kind:?}")]
    NonPositiveAmount { kind: CommandKind },
    #[error("Idempotency key is required for {kind:?}")]
    KeyRequired { kind: CommandKind },
    #[error("{field} is required for {kind:?}")]
    MissingField {
        kind: CommandKind,
        field: &'static str,
    },
    #[error("Memo is longer than {} characters", MAX_MEMO_LEN)]
    MemoTooLong,
    #[error(transparent)]
    Money(#[from] MoneyError),
}

/// An account named either by id or, with a leading `@`, by public handle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AccountRef {
    Id(AccountId),
    Handle(String),
}

impl From<&str> for AccountRef {
    fn from(value: &str) -> Self {
        let value = value.trim();
        match value.strip_prefix('@') {
            Some(handle) => AccountRef::Handle(handle.to_owned()),
            None => AccountRef::Id(AccountId::new(value)),
        }
    }
}

impl FromStr for AccountRef {
    type Err = Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(s.into())
    }
}

impl From<AccountId> for AccountRef {
    fn from(value: AccountId) -> Self {
        AccountRef::Id(value)
    }
}

impl From<&AccountId> for AccountRef {
    fn from(value: &AccountId) -> Self {
        AccountRef::Id(value.clone())
    }
}

impl fmt::Display for AccountRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AccountRef::Id(id) => write!(f, "{id}"),
            AccountRef::Handle(handle) => write!(f, "@{handle}"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct OpenAccountCommand {
    pub id: Option<AccountId>,
    pub display_name: String,
    pub currency: Currency,
    pub opening_balance: Amount,
    pub handle: Option<String>,
}

#[derive(Debug, Clone)]
pub struct SendCommand {
    pub from: AccountRef,
    pub to: AccountRef,
    pub amount: Amount,
    pub currency: Currency,
    pub memo: Option<String>,
    pub idempotency_key: IdempotencyKey,
}

#[derive(Debug, Clone)]
pub struct CreateRequestCommand {
    pub requester: AccountRef,
    pub payer: AccountRef,
    pub amount: Amount,
    pub memo: Option<String>,
    /// falls back to the configured default
    pub ttl: Option<TimeDelta>,
}

#[derive(Debug, Clone)]
pub struct FulfillRequestCommand {
    pub request_id: RequestId,
    pub payer: AccountRef,
    pub idempotency_key: IdempotencyKey,
}

impl OpenAccountCommand {
    pub fn new(
        id: Option<AccountId>,
        display_name: &str,
        currency: &str,
        opening_balance: Option<Decimal>,
        handle: Option<&str>,
    ) -> Result<Self, CommandError> {
        let display_name = display_name.trim();
        if display_name.is_empty() {
            return Err(CommandError::MissingField {
                kind: CommandKind::Open,
                field: "display name",
            });
        }
        Ok(Self {
            id,
            display_name: display_name.to_owned(),
            currency: currency.parse()?,
            opening_balance: Amount::new(opening_balance.unwrap_or_default())?,
            handle: handle
                .map(str::trim)
                .filter(|handle| !handle.is_empty())
                .map(str::to_owned),
        })
    }
}

impl SendCommand {
    pub fn new(
        from: impl Into<AccountRef>,
        to: impl Into<AccountRef>,
        amount: Option<Decimal>,
        currency: &str,
        memo: Option<&str>,
        idempotency_key: &str,
    ) -> Result<Self, CommandError> {
        let kind = CommandKind::Send;
        Ok(Self {
            from: from.into(),
            to: to.into(),
            amount: parse_amount(kind, amount)?,
            currency: currency.parse()?,
            memo: parse_memo(memo)?,
            idempotency_key: parse_key(kind, idempotency_key)?,
        })
    }
}

impl CreateRequestCommand {
    pub fn new(
        requester: impl Into<AccountRef>,
        payer: impl Into<AccountRef>,
        amount: Option<Decimal>,
        memo: Option<&str>,
        ttl: Option<TimeDelta>,
    ) -> Result<Self, CommandError> {
        Ok(Self {
            requester: requester.into(),
            payer: payer.into(),
            amount: parse_amount(CommandKind::Request, amount)?,
            memo: parse_memo(memo)?,
            ttl,
        })
    }
}

impl FulfillRequestCommand {
    pub fn new(
        request_id: RequestId,
        payer: impl Into<AccountRef>,
        idempotency_key: &str,
    ) -> Result<Self, CommandError> {
        Ok(Self {
            request_id,
            payer: payer.into(),
            idempotency_key: parse_key(CommandKind::Fulfill, idempotency_key)?,
        })
    }
}

fn parse_amount(kind: CommandKind, amount: Option<Decimal>) -> Result<Amount, CommandError> {
    let Some(amount) = amount else {
        return Err(CommandError::AmountRequired { kind });
    };
    if amount <= Decimal::ZERO {
        return Err(CommandError::NonPositiveAmount { kind });
    }
    Ok(Amount::new(amount)?)
}

fn parse_key(kind: CommandKind, key: &str) -> Result<IdempotencyKey, CommandError> {
    let key = key.trim();
    if key.is_empty() {
        Err(CommandError::KeyRequired { kind })
    } else {
        Ok(IdempotencyKey::new(key))
    }
}

fn parse_memo(memo: Option<&str>) -> Result<Option<String>, CommandError> {
    match memo.map(str::trim).filter(|memo| !memo.is_empty()) {
        Some(memo) if memo.chars().count() > MAX_MEMO_LEN => Err(CommandError::MemoTooLong),
        memo => Ok(memo.map(str::to_owned)),
    }
}
