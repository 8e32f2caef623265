//! Replays a CSV file of ledger commands against [`InMemoryPaymentProcessor`]
//! and prints the outcome as CSV. Used by the binary and the integration tests.

use std::{
    collections::HashMap,
    io::{Read, Write},
};

use crate::{
    command::{
        AccountRef, CommandError, CommandKind, CreateRequestCommand, FulfillRequestCommand,
        OpenAccountCommand, SendCommand,
    },
    config::LedgerConfig,
    id::{AccountId, RequestId},
    processor::{
        LedgerError, PaymentProcessor, in_memory_processor::InMemoryPaymentProcessor,
    },
    query::TransactionFilter,
};
use anyhow::{Context, Result};
use chrono::TimeDelta;
use csv_parser::{CommandRow, CsvCommandParser};
use csv_printer::{AccountRow, HistoryRow, print_rows};
use thiserror::Error;
use tracing::debug;
pub mod csv_parser;
pub mod csv_printer;

/// Reasons a single row was not applied.
#[derive(Debug, Error)]
pub enum RowError {
    #[error("Malformed row: {0}")]
    Malformed(#[from] csv::Error),
    #[error("Unknown request alias `{0}`")]
    UnknownRequest(String),
    #[error(transparent)]
    Ledger(#[from] LedgerError),
}

impl From<CommandError> for RowError {
    fn from(err: CommandError) -> Self {
        RowError::Ledger(err.into())
    }
}

pub struct Service<'w, R, W: 'w> {
    pub input: R,
    pub output: &'w mut W,
    pub config: LedgerConfig,
    /// print this account's history instead of the balances
    pub history: Option<AccountId>,
    pub error_printer: Box<dyn FnMut(u64, RowError)>,
}

impl<'w, R, W> Service<'w, R, W>
where
    R: Read,
    W: Write + 'w,
{
    pub fn run(mut self) -> Result<()> {
        let parser = CsvCommandParser::new(self.input);

        let processor = InMemoryPaymentProcessor::new(self.config);
        let mut runner = Runner {
            processor: &processor,
            requests: HashMap::new(),
        };

        for (line, row) in parser {
            if let Err(err) = row.map_err(RowError::from).and_then(|row| runner.apply(row)) {
                (self.error_printer)(line, err);
            }
        }

        match &self.history {
            Some(account) => {
                let filter = TransactionFilter {
                    page_size: processor.config().max_page_size,
                    ..Default::default()
                };
                let mut rows = Vec::new();
                for page in 0.. {
                    let found = processor
                        .list_transactions(account, &TransactionFilter { page, ..filter.clone() })
                        .with_context(|| format!("Failed to read history of `{account}`"))?;
                    let last = (page + 1) >= found.page_count();
                    rows.extend(found.items.into_iter().map(|entry| HistoryRow {
                        sequence: entry.transaction.sequence_number(),
                        transaction: entry.transaction.id().clone(),
                        direction: entry.direction,
                        counterparty: entry.counterparty,
                        amount: entry.transaction.amount(),
                        currency: entry.transaction.currency().clone(),
                        status: entry.transaction.status(),
                        memo: entry.transaction.memo().map(str::to_owned),
                    }));
                    if last {
                        break;
                    }
                }
                print_rows(self.output, rows.into_iter())
            }
            None => {
                let accounts = processor.accounts().context("Failed to read accounts")?;
                print_rows(
                    self.output,
                    accounts.into_iter().map(|acc| AccountRow {
                        handle: processor.handle_of(acc.id()),
                        account: acc.id().clone(),
                        name: acc.display_name().to_owned(),
                        balance: acc.balance(),
                        currency: acc.currency().clone(),
                        active: acc.is_active(),
                    }),
                )
            }
        }
    }
}

struct Runner<'p> {
    processor: &'p InMemoryPaymentProcessor,
    /// request aliases from the `key` column of `request` rows
    requests: HashMap<String, RequestId>,
}

impl Runner<'_> {
    fn apply(&mut self, row: CommandRow) -> Result<(), RowError> {
        let kind = row.kind;
        let key = row.key.as_deref().unwrap_or_default();
        match kind {
            CommandKind::Open => {
                let id = self.processor.open_account(OpenAccountCommand::new(
                    Some(row.account.as_str().into()),
                    row.memo.as_deref().unwrap_or(&row.account),
                    row.currency.as_deref().unwrap_or_default(),
                    row.amount,
                    row.counterparty.as_deref(),
                )?)?;
                debug!(account = %id, "row applied");
            }
            CommandKind::Send => {
                let to = required(kind, "counterparty", row.counterparty.as_deref())?;
                self.processor.send(SendCommand::new(
                    row.account.as_str(),
                    to,
                    row.amount,
                    row.currency.as_deref().unwrap_or_default(),
                    row.memo.as_deref(),
                    key,
                )?)?;
            }
            CommandKind::Request => {
                let payer = required(kind, "counterparty", row.counterparty.as_deref())?;
                let id = self.processor.create_request(CreateRequestCommand::new(
                    row.account.as_str(),
                    payer,
                    row.amount,
                    row.memo.as_deref(),
                    row.ttl_secs.map(TimeDelta::seconds),
                )?)?;
                let alias = row.key.clone().unwrap_or_else(|| id.to_string());
                self.requests.insert(alias, id);
            }
            CommandKind::Fulfill => {
                let request = self.request(kind, row.request.as_deref())?;
                self.processor.fulfill_request(FulfillRequestCommand::new(
                    request,
                    row.account.as_str(),
                    key,
                )?)?;
            }
            CommandKind::Cancel => {
                let request = self.request(kind, row.request.as_deref())?;
                self.processor
                    .cancel_request(&request, &AccountRef::from(row.account.as_str()))?;
            }
            CommandKind::Deactivate => {
                self.processor
                    .deactivate_account(&row.account.as_str().into())?;
            }
        }
        Ok(())
    }

    /// Looks up a request by alias, falling back to treating it as an id.
    fn request(&self, kind: CommandKind, alias: Option<&str>) -> Result<RequestId, RowError> {
        let alias = required(kind, "request", alias)?;
        match self.requests.get(alias) {
            Some(id) => Ok(id.clone()),
            None if self.processor.request(&alias.into()).is_ok() => Ok(alias.into()),
            None => Err(RowError::UnknownRequest(alias.to_owned())),
        }
    }
}

fn required<'a>(
    kind: CommandKind,
    field: &'static str,
    value: Option<&'a str>,
) -> Result<&'a str, CommandError> {
    value.ok_or(CommandError::MissingField { kind, field })
}
