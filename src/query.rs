use std::cmp::Reverse;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{
    account::Account,
    id::AccountId,
    link::{LinkResolver, PublicHandle},
    log::{Transaction, TransactionLog, TransactionStatus},
    money::Amount,
};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortKey {
    /// newest first
    #[default]
    Date,
    /// largest first, newest first among equal amounts
    Amount,
}

#[derive(Debug, Clone)]
pub struct TransactionFilter {
    /// matched against counterparty handle and memo, ignoring case
    pub text: Option<String>,
    pub status: Option<TransactionStatus>,
    pub sort: SortKey,
    /// zero-based
    pub page: usize,
    pub page_size: usize,
}

impl Default for TransactionFilter {
    fn default() -> Self {
        Self {
            text: None,
            status: None,
            sort: SortKey::Date,
            page: 0,
            page_size: 20,
        }
    }
}

#[derive(Debug, Error)]
pub enum QueryError {
    #[error("Page size must be between 1 and {max}, got {page_size}")]
    InvalidPageSize { page_size: usize, max: usize },
    #[error("Transaction totals of `{0}` exceed the representable amount")]
    TotalsOverflow(AccountId),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Sent,
    Received,
}

/// A transaction as seen by one of its parties.
#[derive(Debug, Clone)]
pub struct HistoryEntry {
    pub transaction: Transaction,
    pub direction: Direction,
    pub counterparty: AccountId,
    pub counterparty_handle: Option<PublicHandle>,
}

#[derive(Debug, Clone)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub total_count: usize,
    pub page: usize,
    pub page_size: usize,
}

impl<T> Page<T> {
    pub fn page_count(&self) -> usize {
        self.total_count.div_ceil(self.page_size)
    }
}

/// Completed totals of an account.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Totals {
    pub sent: Amount,
    pub received: Amount,
}

/// Dashboard view of one account.
#[derive(Debug, Clone)]
pub struct AccountSummary {
    pub account: Account,
    pub handle: Option<PublicHandle>,
    pub totals: Totals,
    /// pending requests the account was asked to pay
    pub pending_to_pay: usize,
    /// pending requests the account is waiting on
    pub pending_to_collect: usize,
    pub recent: Vec<HistoryEntry>,
}

/// Read-only views over the transaction log. Never writes to anything.
pub struct QueryEngine<'a> {
    log: &'a TransactionLog,
    links: &'a LinkResolver,
    max_page_size: usize,
}

impl<'a> QueryEngine<'a> {
    pub fn new(log: &'a TransactionLog, links: &'a LinkResolver, max_page_size: usize) -> Self {
        Self {
            log,
            links,
            max_page_size,
        }
    }

    fn entries(&self, account: &AccountId) -> impl Iterator<Item = HistoryEntry> + '_ {
        let involved = account.clone();
        let account = account.clone();
        self.log
            .iterate(move |tx| tx.involves(&involved))
            .filter_map(move |transaction| {
                let (direction, counterparty) = if transaction.from() == &account {
                    (Direction::Sent, transaction.to().clone())
                } else {
                    (Direction::Received, transaction.counterparty(&account)?.clone())
                };
                Some(HistoryEntry {
                    counterparty_handle: self.links.handle_of(&counterparty),
                    transaction,
                    direction,
                    counterparty,
                })
            })
    }

    pub fn history(
        &self,
        account: &AccountId,
        filter: &TransactionFilter,
    ) -> Result<Page<HistoryEntry>, QueryError> {
        if filter.page_size == 0 || filter.page_size > self.max_page_size {
            return Err(QueryError::InvalidPageSize {
                page_size: filter.page_size,
                max: self.max_page_size,
            });
        }
        let needle = filter
            .text
            .as_deref()
            .map(str::trim)
            .filter(|text| !text.is_empty())
            .map(str::to_lowercase);

        let mut matching: Vec<HistoryEntry> = self
            .entries(account)
            .filter(|entry| {
                filter
                    .status
                    .is_none_or(|status| entry.transaction.status() == status)
            })
            .filter(|entry| needle.as_deref().is_none_or(|needle| entry.matches_text(needle)))
            .collect();

        match filter.sort {
            SortKey::Date => {
                matching.sort_by_key(|entry| Reverse(entry.transaction.sequence_number()))
            }
            SortKey::Amount => matching.sort_by_key(|entry| {
                (
                    Reverse(entry.transaction.amount()),
                    Reverse(entry.transaction.sequence_number()),
                )
            }),
        }

        let total_count = matching.len();
        let items = matching
            .into_iter()
            .skip(filter.page.saturating_mul(filter.page_size))
            .take(filter.page_size)
            .collect();
        Ok(Page {
            items,
            total_count,
            page: filter.page,
            page_size: filter.page_size,
        })
    }

    /// The `count` newest transactions of `account`.
    pub fn recent(&self, account: &AccountId, count: usize) -> Vec<HistoryEntry> {
        let mut entries: Vec<HistoryEntry> = self.entries(account).collect();
        entries.reverse();
        entries.truncate(count);
        entries
    }

    pub fn totals(&self, account: &AccountId) -> Result<Totals, QueryError> {
        self.entries(account)
            .filter(|entry| entry.transaction.status() == TransactionStatus::Completed)
            .try_fold(Totals::default(), |mut totals, entry| {
                let side = match entry.direction {
                    Direction::Sent => &mut totals.sent,
                    Direction::Received => &mut totals.received,
                };
                *side = side
                    .checked_add(&entry.transaction.amount())
                    .ok_or_else(|| QueryError::TotalsOverflow(account.clone()))?;
                Ok(totals)
            })
    }
}

impl HistoryEntry {
    /// `needle` must already be lowercase.
    fn matches_text(&self, needle: &str) -> bool {
        let handle_matches = self
            .counterparty_handle
            .as_ref()
            .is_some_and(|handle| handle.as_str().contains(needle));
        let memo_matches = self
            .transaction
            .memo()
            .is_some_and(|memo| memo.to_lowercase().contains(needle));
        handle_matches || memo_matches
    }
}
