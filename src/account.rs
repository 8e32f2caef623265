use std::{collections::HashMap, sync::Arc, time::Duration};

use parking_lot::{Mutex, MutexGuard, RwLock};
use rust_decimal::Decimal;
use thiserror::Error;
use tracing::{error, info};

use crate::{
    id::AccountId,
    money::{Amount, Currency},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccountEventKind {
    Debited,
    Credited,
}

/// A validated balance change.
#[derive(Debug, Clone)]
pub struct AccountEvent {
    amount: Amount,
    kind: AccountEventKind,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AccountError {
    #[error("Account `{0}` does not exist")]
    UnknownAccount(AccountId),
    #[error("Account `{0}` already exists")]
    DuplicateAccount(AccountId),
    #[error("Account `{0}` is deactivated")]
    Inactive(AccountId),
    #[error("Account `{0}` is frozen until it is reconciled")]
    Frozen(AccountId),
    #[error("Account `{account}` holds {expected}, got {actual}")]
    CurrencyMismatch {
        account: AccountId,
        expected: Currency,
        actual: Currency,
    },
    #[error("Insufficient funds on `{account}`: balance {balance}, requested {requested}")]
    InsufficientFunds {
        account: AccountId,
        balance: Amount,
        requested: Amount,
    },
    #[error("Transfer amount must be positive, got {0}")]
    InvalidAmount(Amount),
    #[error("Cannot transfer from `{0}` to itself")]
    SelfTransfer(AccountId),
    #[error("Balance of `{0}` would overflow")]
    Overflow(AccountId),
    #[error("Opening balance of `{0}` would overflow the funded total")]
    FundingOverflow(AccountId),
    #[error("Timed out waiting for the lock on `{0}`")]
    LockTimeout(AccountId),
    #[error("Transfer {from} -> {to} would debit {debited} but credit {credited}")]
    ConservationViolated {
        from: AccountId,
        to: AccountId,
        debited: Decimal,
        credited: Decimal,
    },
    #[error("Ledger holds {actual}, but {expected} was funded")]
    AuditMismatch { expected: Decimal, actual: Decimal },
}

#[derive(Debug, Clone)]
pub struct Account {
    id: AccountId,
    display_name: String,
    balance: Amount,
    currency: Currency,
    active: bool,
    frozen: bool,
}

impl Account {
    pub fn new(id: AccountId, display_name: String, currency: Currency, balance: Amount) -> Self {
        Self {
            id,
            display_name,
            balance,
            currency,
            active: true,
            frozen: false,
        }
    }

    pub fn id(&self) -> &AccountId {
        &self.id
    }

    pub fn display_name(&self) -> &str {
        &self.display_name
    }

    pub fn balance(&self) -> Amount {
        self.balance
    }

    pub fn currency(&self) -> &Currency {
        &self.currency
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen
    }

    /// Events are validated when handled. One that no longer fits the
    /// balance leaves it untouched, which [`LockedPair::commit`] reports as a
    /// conservation violation.
    pub fn apply(&mut self, event: &AccountEvent) {
        let balance = match event.kind {
            AccountEventKind::Debited => self.balance.checked_sub(&event.amount),
            AccountEventKind::Credited => self.balance.checked_add(&event.amount),
        };
        if let Some(balance) = balance {
            self.balance = balance;
        }
    }

    /// Checks the account may take part in a transfer in `currency`.
    pub fn ensure_writable(&self, currency: &Currency) -> Result<(), AccountError> {
        if self.frozen {
            return Err(AccountError::Frozen(self.id.clone()));
        }
        if !self.active {
            return Err(AccountError::Inactive(self.id.clone()));
        }
        if &self.currency != currency {
            return Err(AccountError::CurrencyMismatch {
                account: self.id.clone(),
                expected: self.currency.clone(),
                actual: currency.clone(),
            });
        }
        Ok(())
    }

    pub fn handle_debit(
        &self,
        amount: Amount,
        currency: &Currency,
    ) -> Result<AccountEvent, AccountError> {
        self.ensure_writable(currency)?;
        if self.balance.checked_sub(&amount).is_none() {
            return Err(AccountError::InsufficientFunds {
                account: self.id.clone(),
                balance: self.balance,
                requested: amount,
            });
        }
        Ok(AccountEvent {
            amount,
            kind: AccountEventKind::Debited,
        })
    }

    pub fn handle_credit(
        &self,
        amount: Amount,
        currency: &Currency,
    ) -> Result<AccountEvent, AccountError> {
        self.ensure_writable(currency)?;
        if self.balance.checked_add(&amount).is_none() {
            return Err(AccountError::Overflow(self.id.clone()));
        }
        Ok(AccountEvent {
            amount,
            kind: AccountEventKind::Credited,
        })
    }
}

/// Post-transfer balances of both sides.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BalanceSnapshot {
    pub from: AccountId,
    pub from_balance: Amount,
    pub to: AccountId,
    pub to_balance: Amount,
}

/// Debit and credit of one transfer, validated together.
#[derive(Debug)]
pub struct TransferPlan {
    debit: AccountEvent,
    credit: AccountEvent,
}

type AccountCell = Arc<Mutex<Account>>;

/// The two accounts of a transfer, resolved but not yet locked.
pub struct AccountPair {
    from: AccountCell,
    to: AccountCell,
    from_id: AccountId,
    to_id: AccountId,
}

impl AccountPair {
    /// Locks both accounts, lower id first, so that two transfers over the
    /// same pair in opposite directions cannot deadlock.
    pub fn lock(&self, timeout: Duration) -> Result<LockedPair<'_>, AccountError> {
        let (from, to) = if self.from_id < self.to_id {
            let from = lock_cell(&self.from, &self.from_id, timeout)?;
            (from, lock_cell(&self.to, &self.to_id, timeout)?)
        } else {
            let to = lock_cell(&self.to, &self.to_id, timeout)?;
            (lock_cell(&self.from, &self.from_id, timeout)?, to)
        };
        Ok(LockedPair { from, to })
    }
}

fn lock_cell<'a>(
    cell: &'a AccountCell,
    id: &AccountId,
    timeout: Duration,
) -> Result<MutexGuard<'a, Account>, AccountError> {
    cell.try_lock_for(timeout)
        .ok_or_else(|| AccountError::LockTimeout(id.clone()))
}

/// Both sides of a transfer held exclusively. Dropping it releases the locks.
pub struct LockedPair<'a> {
    from: MutexGuard<'a, Account>,
    to: MutexGuard<'a, Account>,
}

impl LockedPair<'_> {
    pub fn from(&self) -> &Account {
        &self.from
    }

    pub fn to(&self) -> &Account {
        &self.to
    }

    pub fn prepare(
        &self,
        amount: Amount,
        currency: &Currency,
    ) -> Result<TransferPlan, AccountError> {
        if amount.is_zero() {
            return Err(AccountError::InvalidAmount(amount));
        }
        let debit = self.from.handle_debit(amount, currency)?;
        let credit = self.to.handle_credit(amount, currency)?;
        Ok(TransferPlan { debit, credit })
    }

    /// Applies both sides or neither. A plan that would create or destroy
    /// value freezes both accounts instead.
    pub fn commit(&mut self, plan: TransferPlan) -> Result<BalanceSnapshot, AccountError> {
        let mut from = self.from.clone();
        let mut to = self.to.clone();
        from.apply(&plan.debit);
        to.apply(&plan.credit);
        // both sides are non-negative, so neither difference can overflow
        let debited = self.from.balance.value() - from.balance.value();
        let credited = to.balance.value() - self.to.balance.value();

        if debited != credited || debited != plan.debit.amount.value() {
            self.from.frozen = true;
            self.to.frozen = true;
            error!(
                from = %self.from.id,
                to = %self.to.id,
                %debited,
                %credited,
                "conservation violated, accounts frozen"
            );
            return Err(AccountError::ConservationViolated {
                from: self.from.id.clone(),
                to: self.to.id.clone(),
                debited,
                credited,
            });
        }

        *self.from = from;
        *self.to = to;
        Ok(BalanceSnapshot {
            from: self.from.id.clone(),
            from_balance: self.from.balance,
            to: self.to.id.clone(),
            to_balance: self.to.balance,
        })
    }
}

/// Account balances, one lock per account.
pub struct LedgerStore {
    accounts: RwLock<HashMap<AccountId, AccountCell>>,
    /// total brought in through opening balances
    funded: Mutex<Decimal>,
    lock_timeout: Duration,
}

impl LedgerStore {
    pub fn new(lock_timeout: Duration) -> Self {
        Self {
            accounts: RwLock::new(HashMap::new()),
            funded: Mutex::new(Decimal::ZERO),
            lock_timeout,
        }
    }

    pub fn open_account(
        &self,
        id: AccountId,
        display_name: String,
        currency: Currency,
        opening_balance: Amount,
    ) -> Result<AccountId, AccountError> {
        let mut accounts = self.accounts.write();
        if accounts.contains_key(&id) {
            return Err(AccountError::DuplicateAccount(id));
        }
        let mut funded = self.funded.lock();
        *funded = funded
            .checked_add(opening_balance.value())
            .ok_or_else(|| AccountError::FundingOverflow(id.clone()))?;
        info!(account = %id, %currency, balance = %opening_balance, "account opened");
        let account = Account::new(id.clone(), display_name, currency, opening_balance);
        accounts.insert(id.clone(), Arc::new(Mutex::new(account)));
        Ok(id)
    }

    fn cell(&self, id: &AccountId) -> Result<AccountCell, AccountError> {
        self.accounts
            .read()
            .get(id)
            .cloned()
            .ok_or_else(|| AccountError::UnknownAccount(id.clone()))
    }

    fn with_account<T>(
        &self,
        id: &AccountId,
        f: impl FnOnce(&mut Account) -> T,
    ) -> Result<T, AccountError> {
        let cell = self.cell(id)?;
        let mut account = lock_cell(&cell, id, self.lock_timeout)?;
        Ok(f(&mut account))
    }

    pub fn contains(&self, id: &AccountId) -> bool {
        self.accounts.read().contains_key(id)
    }

    pub fn account(&self, id: &AccountId) -> Result<Account, AccountError> {
        self.with_account(id, |account| account.clone())
    }

    pub fn balance(&self, id: &AccountId) -> Result<Amount, AccountError> {
        self.with_account(id, |account| account.balance)
    }

    /// Snapshot of every account, ordered by id.
    pub fn accounts(&self) -> Result<Vec<Account>, AccountError> {
        let mut ids: Vec<AccountId> = self.accounts.read().keys().cloned().collect();
        ids.sort();
        ids.iter().map(|id| self.account(id)).collect()
    }

    pub fn rename(&self, id: &AccountId, display_name: String) -> Result<(), AccountError> {
        self.with_account(id, |account| account.display_name = display_name)
    }

    pub fn deactivate(&self, id: &AccountId) -> Result<(), AccountError> {
        self.with_account(id, |account| account.active = false)?;
        info!(account = %id, "account deactivated");
        Ok(())
    }

    pub fn pair(&self, from: &AccountId, to: &AccountId) -> Result<AccountPair, AccountError> {
        if from == to {
            return Err(AccountError::SelfTransfer(from.clone()));
        }
        Ok(AccountPair {
            from: self.cell(from)?,
            to: self.cell(to)?,
            from_id: from.clone(),
            to_id: to.clone(),
        })
    }

    pub fn lock_timeout(&self) -> Duration {
        self.lock_timeout
    }

    /// Moves `amount` from one account to the other in a single step.
    pub fn apply_transfer(
        &self,
        from: &AccountId,
        to: &AccountId,
        amount: Amount,
        currency: &Currency,
    ) -> Result<BalanceSnapshot, AccountError> {
        let pair = self.pair(from, to)?;
        let mut locked = pair.lock(self.lock_timeout)?;
        let plan = locked.prepare(amount, currency)?;
        locked.commit(plan)
    }

    /// Sums every balance under a consistent view and compares it with what
    /// was funded. Returns the total.
    pub fn audit(&self) -> Result<Decimal, AccountError> {
        let accounts = self.accounts.read();
        let mut cells: Vec<(&AccountId, &AccountCell)> = accounts.iter().collect();
        cells.sort_by(|a, b| a.0.cmp(b.0));
        let mut guards = Vec::with_capacity(cells.len());
        for (id, cell) in cells {
            guards.push(lock_cell(cell, id, self.lock_timeout)?);
        }
        let actual = guards.iter().try_fold(Decimal::ZERO, |total, account| {
            total
                .checked_add(account.balance.value())
                .ok_or_else(|| AccountError::Overflow(account.id.clone()))
        })?;
        let expected = *self.funded.lock();
        if actual != expected {
            error!(%expected, %actual, "ledger audit failed");
            return Err(AccountError::AuditMismatch { expected, actual });
        }
        Ok(actual)
    }
}

#[cfg(test)]
mod tests {
    use rust_decimal_macros::dec;

    use super::*;

    fn usd() -> Currency {
        "USD".parse().unwrap()
    }

    fn amount(value: Decimal) -> Amount {
        Amount::new(value).unwrap()
    }

    fn store() -> LedgerStore {
        let store = LedgerStore::new(Duration::from_millis(50));
        store
            .open_account("a".into(), "A".into(), usd(), amount(dec!(100)))
            .unwrap();
        store
            .open_account("b".into(), "B".into(), usd(), amount(dec!(5)))
            .unwrap();
        store
    }

    #[test]
    fn apply_events() {
        let mut acc = Account::new("a".into(), "A".into(), usd(), amount(dec!(10)));
        let debit = acc.handle_debit(amount(dec!(3)), &usd()).unwrap();
        assert_eq!(debit.kind, AccountEventKind::Debited);
        // nothing changes until the event is applied
        assert_eq!(acc.balance(), amount(dec!(10)));
        acc.apply(&debit);
        assert_eq!(acc.balance(), amount(dec!(7)));

        let credit = acc.handle_credit(amount(dec!(0.5)), &usd()).unwrap();
        acc.apply(&credit);
        assert_eq!(acc.balance(), amount(dec!(7.5)));
    }

    #[test]
    fn handle_debit_rejections() {
        let mut acc = Account::new("a".into(), "A".into(), usd(), amount(dec!(10)));
        let err = acc.handle_debit(amount(dec!(10.01)), &usd()).unwrap_err();
        assert!(matches!(err, AccountError::InsufficientFunds { .. }));
        assert_eq!(
            err.to_string(),
            "Insufficient funds on `a`: balance 10.00, requested 10.01"
        );

        let err = acc
            .handle_debit(amount(dec!(1)), &"EUR".parse().unwrap())
            .unwrap_err();
        assert!(matches!(err, AccountError::CurrencyMismatch { .. }));

        acc.active = false;
        let err = acc.handle_credit(amount(dec!(1)), &usd()).unwrap_err();
        assert_eq!(err, AccountError::Inactive("a".into()));

        acc.frozen = true;
        let err = acc.handle_debit(amount(dec!(1)), &usd()).unwrap_err();
        assert_eq!(err, AccountError::Frozen("a".into()));
    }

    #[test]
    fn transfer_moves_funds_on_both_sides() {
        let store = store();
        let snapshot = store
            .apply_transfer(&"a".into(), &"b".into(), amount(dec!(40)), &usd())
            .unwrap();
        assert_eq!(snapshot.from_balance, amount(dec!(60)));
        assert_eq!(snapshot.to_balance, amount(dec!(45)));
        assert_eq!(store.balance(&"a".into()).unwrap(), amount(dec!(60)));
        assert_eq!(store.balance(&"b".into()).unwrap(), amount(dec!(45)));
        assert_eq!(store.audit().unwrap(), dec!(105));
    }

    #[test]
    fn failed_transfer_changes_nothing() {
        let store = store();
        let err = store
            .apply_transfer(&"b".into(), &"a".into(), amount(dec!(6)), &usd())
            .unwrap_err();
        assert!(matches!(err, AccountError::InsufficientFunds { .. }));
        let err = store
            .apply_transfer(&"a".into(), &"b".into(), Amount::ZERO, &usd())
            .unwrap_err();
        assert_eq!(err, AccountError::InvalidAmount(Amount::ZERO));
        let err = store
            .apply_transfer(&"a".into(), &"a".into(), amount(dec!(1)), &usd())
            .unwrap_err();
        assert_eq!(err, AccountError::SelfTransfer("a".into()));
        let err = store
            .apply_transfer(&"a".into(), &"zed".into(), amount(dec!(1)), &usd())
            .unwrap_err();
        assert_eq!(err, AccountError::UnknownAccount("zed".into()));

        assert_eq!(store.balance(&"a".into()).unwrap(), amount(dec!(100)));
        assert_eq!(store.balance(&"b".into()).unwrap(), amount(dec!(5)));
    }

    #[test]
    fn unbalanced_plan_freezes_the_pair() {
        let store = store();
        let pair = store.pair(&"a".into(), &"b".into()).unwrap();
        let mut locked = pair.lock(store.lock_timeout()).unwrap();
        let mut plan = locked.prepare(amount(dec!(10)), &usd()).unwrap();
        plan.credit.amount = amount(dec!(20));
        let err = locked.commit(plan).unwrap_err();
        assert!(matches!(err, AccountError::ConservationViolated { .. }));
        assert!(locked.from().is_frozen());
        assert!(locked.to().is_frozen());
        drop(locked);

        assert_eq!(store.balance(&"a".into()).unwrap(), amount(dec!(100)));
        let err = store
            .apply_transfer(&"a".into(), &"b".into(), amount(dec!(1)), &usd())
            .unwrap_err();
        assert_eq!(err, AccountError::Frozen("a".into()));
    }

    #[test]
    fn funded_total_overflow_rejects_the_account() {
        let store = LedgerStore::new(Duration::from_millis(50));
        store
            .open_account("a".into(), "A".into(), usd(), amount(Decimal::MAX - dec!(1)))
            .unwrap();
        let err = store
            .open_account("b".into(), "B".into(), usd(), amount(dec!(2)))
            .unwrap_err();
        assert_eq!(err, AccountError::FundingOverflow("b".into()));
        assert!(!store.contains(&"b".into()));
        assert_eq!(store.accounts().unwrap().len(), 1);
        assert_eq!(store.audit().unwrap(), Decimal::MAX - dec!(1));
    }

    #[test]
    fn busy_account_times_out() {
        let store = store();
        let pair = store.pair(&"a".into(), &"b".into()).unwrap();
        let _held = pair.lock(store.lock_timeout()).unwrap();
        let err = store
            .apply_transfer(&"b".into(), &"a".into(), amount(dec!(1)), &usd())
            .unwrap_err();
        assert!(matches!(err, AccountError::LockTimeout(_)));
    }

    #[test]
    fn deactivate_and_rename() {
        let store = store();
        store.rename(&"a".into(), "Alice".into()).unwrap();
        assert_eq!(store.account(&"a".into()).unwrap().display_name(), "Alice");
        store.deactivate(&"b".into()).unwrap();
        let err = store
            .apply_transfer(&"a".into(), &"b".into(), amount(dec!(1)), &usd())
            .unwrap_err();
        assert_eq!(err, AccountError::Inactive("b".into()));
        let err = store
            .open_account("a".into(), "again".into(), usd(), Amount::ZERO)
            .unwrap_err();
        assert_eq!(err, AccountError::DuplicateAccount("a".into()));
        let ids: Vec<_> = store
            .accounts()
            .unwrap()
            .iter()
            .map(|acc| acc.id().to_string())
            .collect();
        assert_eq!(ids, ["a", "b"]);
    }
}
