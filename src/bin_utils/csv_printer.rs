use std::io::Write;

use crate::{
    id::{AccountId, TransactionId},
    link::PublicHandle,
    log::TransactionStatus,
    money::{Amount, Currency},
    query::Direction,
};
use csv::Writer;
use serde::Serialize;

#[derive(Debug, Serialize)]
pub struct AccountRow {
    pub account: AccountId,
    pub handle: Option<PublicHandle>,
    pub name: String,
    pub balance: Amount,
    pub currency: Currency,
    pub active: bool,
}

#[derive(Debug, Serialize)]
pub struct HistoryRow {
    pub sequence: u64,
    pub transaction: TransactionId,
    pub direction: Direction,
    pub counterparty: AccountId,
    pub amount: Amount,
    pub currency: Currency,
    pub status: TransactionStatus,
    pub memo: Option<String>,
}

pub fn print_rows<W, T>(output: &mut W, rows: impl Iterator<Item = T>) -> anyhow::Result<()>
where
    W: Write,
    T: Serialize,
{
    let mut writer = Writer::from_writer(output);
    for row in rows {
        if let Err(err) = writer.serialize(row) {
            anyhow::bail!("Failed to write to CSV: {err}")
        }
    }
    // Ensure all data is flushed to the output
    if let Err(err) = writer.flush() {
        anyhow::bail!("Failed to flush CSV writer: {err}")
    }
    Ok(())
}
