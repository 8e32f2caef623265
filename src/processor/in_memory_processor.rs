use std::{
    sync::{
        Arc,
        mpsc::{self, RecvTimeoutError},
    },
    thread::{self, JoinHandle},
};

use rust_decimal::Decimal;
use tracing::{debug, info, warn};

use crate::{
    account::{Account, AccountError, LedgerStore},
    clock::{Clock, SystemClock},
    command::{
        AccountRef, CreateRequestCommand, FulfillRequestCommand, OpenAccountCommand, SendCommand,
    },
    config::LedgerConfig,
    id::{AccountId, IdempotencyKey, RequestId, TransactionId},
    link::{LinkResolver, PublicHandle},
    log::{
        Appended, NewTransaction, Outcome, Transaction, TransactionKind, TransactionLog,
        TransactionStatus,
    },
    money::Amount,
    query::{AccountSummary, HistoryEntry, Page, QueryEngine, TransactionFilter},
    request::{PaymentRequest, RequestBook, RequestRole, RequestStatus, Settlement},
};

use super::{LedgerError, PaymentProcessor};

/// Ledger core kept in process memory. Every component enforces the same
/// locking and uniqueness rules a durable store would.
pub struct InMemoryPaymentProcessor {
    config: LedgerConfig,
    clock: Arc<dyn Clock>,
    accounts: LedgerStore,
    log: TransactionLog,
    requests: RequestBook,
    links: LinkResolver,
}

impl InMemoryPaymentProcessor {
    pub fn new(config: LedgerConfig) -> Self {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    pub fn with_clock(config: LedgerConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            accounts: LedgerStore::new(config.lock_timeout()),
            log: TransactionLog::new(),
            requests: RequestBook::new(config.lock_timeout()),
            links: LinkResolver::new(config.handle_length, config.link_base_url.clone()),
            config,
            clock,
        }
    }

    pub fn config(&self) -> &LedgerConfig {
        &self.config
    }

    /// Onboarding is someone else's job; this only registers the account, its
    /// opening balance and its public handle.
    pub fn open_account(&self, command: OpenAccountCommand) -> Result<AccountId, LedgerError> {
        let id = command.id.unwrap_or_else(AccountId::generate);
        if self.accounts.contains(&id) {
            return Err(AccountError::DuplicateAccount(id).into());
        }
        // a chosen handle is reserved before the account exists
        let claimed = command
            .handle
            .as_deref()
            .map(|handle| self.links.claim(&id, handle))
            .transpose()?;
        let opened = self.accounts.open_account(
            id.clone(),
            command.display_name,
            command.currency,
            command.opening_balance,
        );
        if let Err(err) = opened {
            if let Some(handle) = &claimed {
                self.links.release(&id, handle);
            }
            return Err(err.into());
        }
        if claimed.is_none() {
            self.links.issue(&id);
        }
        Ok(id)
    }

    /// Profile edits leave the public handle untouched.
    pub fn rename_account(&self, account: &AccountId, display_name: &str) -> Result<(), LedgerError> {
        Ok(self.accounts.rename(account, display_name.trim().to_owned())?)
    }

    pub fn deactivate_account(&self, account: &AccountId) -> Result<(), LedgerError> {
        Ok(self.accounts.deactivate(account)?)
    }

    pub fn account(&self, account: &AccountId) -> Result<Account, LedgerError> {
        self.with_retry(|| Ok(self.accounts.account(account)?))
    }

    /// All accounts ordered by id.
    pub fn accounts(&self) -> Result<Vec<Account>, LedgerError> {
        self.with_retry(|| Ok(self.accounts.accounts()?))
    }

    pub fn handle_of(&self, account: &AccountId) -> Option<PublicHandle> {
        self.links.handle_of(account)
    }

    pub fn claim_link(&self, account: &AccountId, handle: &str) -> Result<PublicHandle, LedgerError> {
        self.account(account)?;
        Ok(self.links.claim(account, handle)?)
    }

    /// Shareable link that pays `account`.
    pub fn payment_url(&self, account: &AccountId) -> Result<String, LedgerError> {
        let handle = self.issue_link(account)?;
        Ok(self.links.payment_url(&handle))
    }

    pub fn transaction(&self, id: &TransactionId) -> Option<Transaction> {
        self.log.get(id)
    }

    pub fn request(&self, id: &RequestId) -> Result<PaymentRequest, LedgerError> {
        self.with_retry(|| Ok(self.requests.get(id, self.clock.now())?))
    }

    pub fn list_requests(
        &self,
        account: &AccountId,
        role: RequestRole,
    ) -> Result<Vec<PaymentRequest>, LedgerError> {
        self.with_retry(|| Ok(self.requests.list(account, role, self.clock.now())?))
    }

    pub fn account_summary(&self, account: &AccountId) -> Result<AccountSummary, LedgerError> {
        let snapshot = self.account(account)?;
        let pending = self.list_requests(account, RequestRole::Any)?;
        let pending = pending
            .iter()
            .filter(|request| request.status() == RequestStatus::Pending);
        let (to_pay, to_collect): (Vec<_>, Vec<_>) =
            pending.partition(|request| request.payer() == account);
        let engine = self.query_engine();
        Ok(AccountSummary {
            handle: self.links.handle_of(account),
            totals: engine.totals(account)?,
            pending_to_pay: to_pay.len(),
            pending_to_collect: to_collect.len(),
            recent: engine.recent(account, self.config.recent_activity_len),
            account: snapshot,
        })
    }

    /// Expires overdue requests now. Returns how many changed state.
    pub fn sweep_expired(&self) -> usize {
        let expired = self.requests.sweep_expired(self.clock.now());
        if expired > 0 {
            debug!(expired, "expiry sweep");
        }
        expired
    }

    /// Checks that balances still add up to the funded total.
    pub fn audit(&self) -> Result<Decimal, LedgerError> {
        Ok(self.accounts.audit()?)
    }

    /// Runs [`Self::sweep_expired`] every `sweep_interval` until the
    /// returned handle is stopped or dropped.
    pub fn spawn_expiry_sweeper(self: &Arc<Self>) -> ExpirySweeper {
        let (stop, stopped) = mpsc::channel::<()>();
        let processor = Arc::clone(self);
        let interval = self.config.sweep_interval();
        let handle = thread::spawn(move || {
            while let Err(RecvTimeoutError::Timeout) = stopped.recv_timeout(interval) {
                processor.sweep_expired();
            }
        });
        ExpirySweeper {
            stop: Some(stop),
            handle: Some(handle),
        }
    }

    fn query_engine(&self) -> QueryEngine<'_> {
        QueryEngine::new(&self.log, &self.links, self.config.max_page_size)
    }

    fn resolve(&self, account: &AccountRef) -> Result<AccountId, LedgerError> {
        match account {
            AccountRef::Id(id) => Ok(id.clone()),
            AccountRef::Handle(handle) => Ok(self.links.resolve(handle)?),
        }
    }

    /// Retries lock timeouts with exponential backoff.
    fn with_retry<T>(
        &self,
        mut operation: impl FnMut() -> Result<T, LedgerError>,
    ) -> Result<T, LedgerError> {
        let mut backoff = self.config.retry_backoff();
        let mut attempt = 0;
        loop {
            match operation() {
                Err(err) if err.is_retryable() && attempt < self.config.max_transient_retries => {
                    attempt += 1;
                    debug!(attempt, %err, "retrying after transient failure");
                    thread::sleep(backoff);
                    backoff = backoff.saturating_mul(2);
                }
                result => return result,
            }
        }
    }

    /// Answers a command whose idempotency key is already in the log.
    fn replay(entry: &NewTransaction, existing: Transaction) -> Result<TransactionId, LedgerError> {
        if !existing.matches(entry) {
            return Err(LedgerError::Conflict {
                key: entry.idempotency_key.clone(),
                existing: existing.id().clone(),
            });
        }
        debug!(transaction = %existing.id(), key = %entry.idempotency_key, "idempotent replay");
        match (existing.status(), existing.failure()) {
            (TransactionStatus::Failed, Some(reason)) => Err(reason.clone().into()),
            _ => Ok(existing.id().clone()),
        }
    }

    /// Pays `request` unless this exact fulfilment already did. Runs with the
    /// request locked.
    fn settle(
        &self,
        request: &mut PaymentRequest,
        payer: &AccountId,
        key: &IdempotencyKey,
    ) -> Result<TransactionId, LedgerError> {
        match request.settlement(payer, key, self.clock.now())? {
            Settlement::Settled(transaction) => Ok(transaction),
            Settlement::Due => {
                let entry = NewTransaction {
                    kind: TransactionKind::RequestFulfillment,
                    from: payer.clone(),
                    to: request.requester().clone(),
                    amount: request.amount(),
                    currency: request.currency().clone(),
                    memo: request.memo().map(str::to_owned),
                    idempotency_key: key.clone(),
                    request_id: Some(request.id().clone()),
                };
                let transaction = self.transfer(&entry)?;
                request.fulfill(transaction.clone(), key.clone(), self.clock.now())?;
                info!(request = %request.id(), %transaction, "payment request fulfilled");
                Ok(transaction)
            }
        }
    }

    /// The send pathway: one attempt at moving funds and logging it, with
    /// both accounts locked throughout.
    fn transfer(&self, entry: &NewTransaction) -> Result<TransactionId, LedgerError> {
        let pair = self.accounts.pair(&entry.from, &entry.to)?;
        let mut locked = pair.lock(self.accounts.lock_timeout())?;

        if let Some(existing) = self.log.find_by_idempotency_key(&entry.idempotency_key) {
            return Self::replay(entry, existing);
        }

        let plan = locked.prepare(entry.amount, &entry.currency);
        let transaction = match self.log.append(entry.clone(), self.clock.now()) {
            Appended::New(transaction) => transaction,
            // lost a race against the same key on another account pair
            Appended::Existing(existing) => return Self::replay(entry, existing),
        };

        let sequence = transaction.sequence_number();
        match plan.and_then(|plan| locked.commit(plan)) {
            Ok(balances) => {
                self.log
                    .finalize(sequence, Outcome::Completed(self.clock.now()))?;
                info!(
                    transaction = %transaction.id(),
                    sequence,
                    kind = ?entry.kind,
                    from = %balances.from,
                    to = %balances.to,
                    amount = %entry.amount,
                    "transfer completed"
                );
                Ok(transaction.id().clone())
            }
            Err(reason) => {
                self.log
                    .finalize(sequence, Outcome::Failed(reason.clone()))?;
                warn!(
                    transaction = %transaction.id(),
                    sequence,
                    from = %entry.from,
                    to = %entry.to,
                    %reason,
                    "transfer failed"
                );
                Err(reason.into())
            }
        }
    }
}

impl PaymentProcessor for InMemoryPaymentProcessor {
    fn get_balance(&self, account: &AccountId) -> Result<Amount, LedgerError> {
        self.with_retry(|| Ok(self.accounts.balance(account)?))
    }

    fn send(&self, command: SendCommand) -> Result<TransactionId, LedgerError> {
        let entry = NewTransaction {
            kind: TransactionKind::Send,
            from: self.resolve(&command.from)?,
            to: self.resolve(&command.to)?,
            amount: command.amount,
            currency: command.currency,
            memo: command.memo,
            idempotency_key: command.idempotency_key,
            request_id: None,
        };
        self.with_retry(|| self.transfer(&entry))
    }

    fn create_request(&self, command: CreateRequestCommand) -> Result<RequestId, LedgerError> {
        let requester = self.accounts.account(&self.resolve(&command.requester)?)?;
        let payer = self.accounts.account(&self.resolve(&command.payer)?)?;
        // both sides must be able to settle it later
        requester.ensure_writable(requester.currency())?;
        payer.ensure_writable(requester.currency())?;

        let request = PaymentRequest::new(
            requester.id().clone(),
            payer.id().clone(),
            command.amount,
            requester.currency().clone(),
            command.memo,
            self.clock.now(),
            command
                .ttl
                .unwrap_or_else(|| self.config.default_request_ttl()),
        )?;
        info!(
            request = %request.id(),
            requester = %request.requester(),
            payer = %request.payer(),
            amount = %request.amount(),
            expires_at = %request.expires_at(),
            "payment request created"
        );
        Ok(self.requests.insert(request))
    }

    fn cancel_request(
        &self,
        request: &RequestId,
        requester: &AccountRef,
    ) -> Result<(), LedgerError> {
        let requester = self.resolve(requester)?;
        self.with_retry(|| {
            self.requests
                .with_request(request, |payment| payment.cancel(&requester, self.clock.now()))??;
            Ok(())
        })?;
        info!(%request, "payment request cancelled");
        Ok(())
    }

    fn fulfill_request(
        &self,
        command: FulfillRequestCommand,
    ) -> Result<TransactionId, LedgerError> {
        let payer = self.resolve(&command.payer)?;
        let key = &command.idempotency_key;
        self.with_retry(|| {
            self.requests
                .with_request(&command.request_id, |request| self.settle(request, &payer, key))?
        })
    }

    fn list_transactions(
        &self,
        account: &AccountId,
        filter: &TransactionFilter,
    ) -> Result<Page<HistoryEntry>, LedgerError> {
        if !self.accounts.contains(account) {
            return Err(AccountError::UnknownAccount(account.clone()).into());
        }
        Ok(self.query_engine().history(account, filter)?)
    }

    fn resolve_link(&self, handle: &str) -> Result<AccountId, LedgerError> {
        Ok(self.links.resolve(handle)?)
    }

    fn issue_link(&self, account: &AccountId) -> Result<PublicHandle, LedgerError> {
        if !self.accounts.contains(account) {
            return Err(AccountError::UnknownAccount(account.clone()).into());
        }
        Ok(self.links.issue(account))
    }
}

/// Background expiry sweep. Stops when dropped.
pub struct ExpirySweeper {
    stop: Option<mpsc::Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl ExpirySweeper {
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        // dropping the sender wakes the thread up
        self.stop.take();
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!("expiry sweeper panicked");
            }
        }
    }
}

impl Drop for ExpirySweeper {
    fn drop(&mut self) {
        self.shutdown();
    }
}
