use std::{collections::HashMap, sync::Arc, time::Duration};

use chrono::{DateTime, TimeDelta, Utc};
use parking_lot::{Mutex, MutexGuard, RwLock};
use serde::Serialize;
use thiserror::Error;
use tracing::debug;

use crate::{
    id::{AccountId, IdempotencyKey, RequestId, TransactionId},
    money::{Amount, Currency},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RequestStatus {
    Pending,
    Fulfilled,
    Cancelled,
    Expired,
}

impl RequestStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, RequestStatus::Pending)
    }
}

/// Which side of a request an account is looked up on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestRole {
    /// requests the account sent and waits to collect
    Requester,
    /// requests the account was asked to pay
    Payer,
    Any,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RequestError {
    #[error("Payment request `{0}` does not exist")]
    NotFound(RequestId),
    #[error("Payment request `{id}` expired at {expires_at}")]
    Expired {
        id: RequestId,
        expires_at: DateTime<Utc>,
    },
    #[error("Payment request `{id}` is {status:?}, only pending requests can be {action}")]
    InvalidState {
        id: RequestId,
        status: RequestStatus,
        action: &'static str,
    },
    #[error("Payment request `{id}` was fulfilled by `{transaction}` under another idempotency key")]
    AlreadyFulfilled {
        id: RequestId,
        transaction: TransactionId,
    },
    #[error("Account `{account}` is not the {role} of payment request `{id}`")]
    NotParticipant {
        id: RequestId,
        account: AccountId,
        role: &'static str,
    },
    #[error("Cannot request money from `{0}` on its own behalf")]
    SelfRequest(AccountId),
    #[error("Request amount must be positive")]
    InvalidAmount,
    #[error("Request time-to-live must not be negative, got {0}")]
    NegativeTtl(TimeDelta),
    #[error("Timed out waiting for the lock on payment request `{0}`")]
    LockTimeout(RequestId),
}

/// What a fulfilment attempt has to do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Settlement {
    /// the transfer still has to happen
    Due,
    /// a retry of the fulfilment that already settled the request
    Settled(TransactionId),
}

#[derive(Debug, Clone)]
pub struct PaymentRequest {
    id: RequestId,
    requester: AccountId,
    payer: AccountId,
    amount: Amount,
    currency: Currency,
    memo: Option<String>,
    status: RequestStatus,
    created_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
    fulfilling_transaction_id: Option<TransactionId>,
    fulfillment_key: Option<IdempotencyKey>,
    closed_at: Option<DateTime<Utc>>,
}

impl PaymentRequest {
    pub fn new(
        requester: AccountId,
        payer: AccountId,
        amount: Amount,
        currency: Currency,
        memo: Option<String>,
        now: DateTime<Utc>,
        ttl: TimeDelta,
    ) -> Result<Self, RequestError> {
        if requester == payer {
            return Err(RequestError::SelfRequest(requester));
        }
        if amount.is_zero() {
            return Err(RequestError::InvalidAmount);
        }
        if ttl < TimeDelta::zero() {
            return Err(RequestError::NegativeTtl(ttl));
        }
        Ok(Self {
            id: RequestId::generate(),
            requester,
            payer,
            amount,
            currency,
            memo,
            status: RequestStatus::Pending,
            created_at: now,
            expires_at: now + ttl,
            fulfilling_transaction_id: None,
            fulfillment_key: None,
            closed_at: None,
        })
    }

    pub fn id(&self) -> &RequestId {
        &self.id
    }

    pub fn requester(&self) -> &AccountId {
        &self.requester
    }

    pub fn payer(&self) -> &AccountId {
        &self.payer
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

    pub fn status(&self) -> RequestStatus {
        self.status
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn expires_at(&self) -> DateTime<Utc> {
        self.expires_at
    }

    pub fn fulfilling_transaction_id(&self) -> Option<&TransactionId> {
        self.fulfilling_transaction_id.as_ref()
    }

    /// When the request reached its terminal state.
    pub fn closed_at(&self) -> Option<DateTime<Utc>> {
        self.closed_at
    }

    pub fn involves(&self, account: &AccountId, role: RequestRole) -> bool {
        match role {
            RequestRole::Requester => &self.requester == account,
            RequestRole::Payer => &self.payer == account,
            RequestRole::Any => &self.requester == account || &self.payer == account,
        }
    }

    /// A request expires at `expires_at` itself, so a zero ttl is born
    /// expired. Returns whether this call moved it to `Expired`.
    pub fn check_expiry(&mut self, now: DateTime<Utc>) -> bool {
        if self.status == RequestStatus::Pending && now >= self.expires_at {
            self.status = RequestStatus::Expired;
            self.closed_at = Some(self.expires_at);
            debug!(request = %self.id, "payment request expired");
            true
        } else {
            false
        }
    }

    fn invalid_state(&self, action: &'static str) -> RequestError {
        RequestError::InvalidState {
            id: self.id.clone(),
            status: self.status,
            action,
        }
    }

    pub fn cancel(&mut self, by: &AccountId, now: DateTime<Utc>) -> Result<(), RequestError> {
        self.check_expiry(now);
        if by != &self.requester {
            return Err(RequestError::NotParticipant {
                id: self.id.clone(),
                account: by.clone(),
                role: "requester",
            });
        }
        if self.status != RequestStatus::Pending {
            return Err(self.invalid_state("cancelled"));
        }
        self.status = RequestStatus::Cancelled;
        self.closed_at = Some(now);
        Ok(())
    }

    /// Decides whether `payer` paying under `key` at `now` needs a transfer,
    /// is a retry of the settling call, or is refused.
    pub fn settlement(
        &mut self,
        payer: &AccountId,
        key: &IdempotencyKey,
        now: DateTime<Utc>,
    ) -> Result<Settlement, RequestError> {
        self.check_expiry(now);
        if payer != &self.payer {
            return Err(RequestError::NotParticipant {
                id: self.id.clone(),
                account: payer.clone(),
                role: "payer",
            });
        }
        match self.status {
            RequestStatus::Pending => Ok(Settlement::Due),
            RequestStatus::Fulfilled => {
                let transaction = self
                    .fulfilling_transaction_id
                    .clone()
                    .ok_or_else(|| self.invalid_state("fulfilled"))?;
                if self.fulfillment_key.as_ref() == Some(key) {
                    Ok(Settlement::Settled(transaction))
                } else {
                    Err(RequestError::AlreadyFulfilled {
                        id: self.id.clone(),
                        transaction,
                    })
                }
            }
            RequestStatus::Expired => Err(RequestError::Expired {
                id: self.id.clone(),
                expires_at: self.expires_at,
            }),
            RequestStatus::Cancelled => Err(self.invalid_state("fulfilled")),
        }
    }

    pub fn fulfill(
        &mut self,
        transaction: TransactionId,
        key: IdempotencyKey,
        now: DateTime<Utc>,
    ) -> Result<(), RequestError> {
        if self.status != RequestStatus::Pending {
            return Err(self.invalid_state("fulfilled"));
        }
        self.status = RequestStatus::Fulfilled;
        self.fulfilling_transaction_id = Some(transaction);
        self.fulfillment_key = Some(key);
        self.closed_at = Some(now);
        Ok(())
    }
}

type RequestCell = Arc<Mutex<PaymentRequest>>;

/// All payment requests ever created, one lock per request. Terminal
/// requests stay for audit.
pub struct RequestBook {
    requests: RwLock<HashMap<RequestId, RequestCell>>,
    lock_timeout: Duration,
}

impl RequestBook {
    pub fn new(lock_timeout: Duration) -> Self {
        Self {
            requests: RwLock::new(HashMap::new()),
            lock_timeout,
        }
    }

    pub fn insert(&self, request: PaymentRequest) -> RequestId {
        let id = request.id.clone();
        self.requests
            .write()
            .insert(id.clone(), Arc::new(Mutex::new(request)));
        id
    }

    fn lock<'a>(
        &self,
        id: &RequestId,
        cell: &'a RequestCell,
    ) -> Result<MutexGuard<'a, PaymentRequest>, RequestError> {
        cell.try_lock_for(self.lock_timeout)
            .ok_or_else(|| RequestError::LockTimeout(id.clone()))
    }

    /// Runs `f` with the request locked. Anything `f` does, transfers
    /// included, is isolated from other commands on the same request.
    pub fn with_request<T>(
        &self,
        id: &RequestId,
        f: impl FnOnce(&mut PaymentRequest) -> T,
    ) -> Result<T, RequestError> {
        let cell = self
            .requests
            .read()
            .get(id)
            .cloned()
            .ok_or_else(|| RequestError::NotFound(id.clone()))?;
        let mut request = self.lock(id, &cell)?;
        Ok(f(&mut request))
    }

    /// Snapshot of a request, expired lazily.
    pub fn get(&self, id: &RequestId, now: DateTime<Utc>) -> Result<PaymentRequest, RequestError> {
        self.with_request(id, |request| {
            request.check_expiry(now);
            request.clone()
        })
    }

    /// Requests `account` takes part in as `role`, newest first.
    pub fn list(
        &self,
        account: &AccountId,
        role: RequestRole,
        now: DateTime<Utc>,
    ) -> Result<Vec<PaymentRequest>, RequestError> {
        let cells: Vec<(RequestId, RequestCell)> = self
            .requests
            .read()
            .iter()
            .map(|(id, cell)| (id.clone(), cell.clone()))
            .collect();
        let mut found = Vec::new();
        for (id, cell) in &cells {
            let mut request = self.lock(id, cell)?;
            if request.involves(account, role) {
                request.check_expiry(now);
                found.push(request.clone());
            }
        }
        found.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| b.id.cmp(&a.id))
        });
        Ok(found)
    }

    /// Expires every pending request past its deadline. Requests busy with
    /// another command are left for the next sweep.
    pub fn sweep_expired(&self, now: DateTime<Utc>) -> usize {
        let requests = self.requests.read();
        requests
            .values()
            .filter_map(|cell| cell.try_lock())
            .filter_map(|mut request| request.check_expiry(now).then_some(()))
            .count()
    }

    pub fn len(&self) -> usize {
        self.requests.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
