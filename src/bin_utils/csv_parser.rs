use std::io::Read;

use crate::command::CommandKind;
use csv::{DeserializeRecordsIntoIter, Trim};
use rust_decimal::Decimal;
use serde::Deserialize;

/// One line of the command file. Which columns matter depends on `kind`.
#[derive(Debug, Deserialize)]
pub struct CommandRow {
    #[serde(rename = "type")]
    pub kind: CommandKind,
    pub account: String,
    pub counterparty: Option<String>,
    pub amount: Option<Decimal>,
    pub currency: Option<String>,
    pub memo: Option<String>,
    pub key: Option<String>,
    pub request: Option<String>,
    pub ttl_secs: Option<i64>,
}

/// Parses a command list in CSV format
pub struct CsvCommandParser<R> {
    iter: DeserializeRecordsIntoIter<R, CommandRow>,
}

impl<R> CsvCommandParser<R>
where
    R: Read,
{
    pub fn new(source: R) -> Self {
        let reader = csv::ReaderBuilder::new()
            .trim(Trim::All)
            .flexible(true)
            .from_reader(source);

        Self {
            iter: reader.into_deserialize(),
        }
    }
}

impl<R> Iterator for CsvCommandParser<R>
where
    R: Read,
{
    type Item = (u64, csv::Result<CommandRow>);

    fn next(&mut self) -> Option<Self::Item> {
        let curr_line = self.iter.reader().position().line();
        self.iter.next().map(|row| (curr_line, row))
    }
}

#[cfg(test)]
mod tests {
    use rust_decimal_macros::dec;

    use super::*;

    #[test]
    fn parses_rows_and_keeps_going_after_bad_ones() {
        let input = "type,account,counterparty,amount,currency,memo,key,request,ttl_secs\n\
                     send, alice ,@bob,50.00,USD,Lunch split,k1,,\n\
                     transfer,alice,bob,1,USD,,k2,,\n\
                     fulfill,bob,,,,,k3,r1,\n";
        let rows: Vec<_> = CsvCommandParser::new(input.as_bytes()).collect();
        assert_eq!(rows.len(), 3);

        let send = rows[0].1.as_ref().unwrap();
        assert_eq!(send.kind, CommandKind::Send);
        assert_eq!(send.account, "alice");
        assert_eq!(send.counterparty.as_deref(), Some("@bob"));
        assert_eq!(send.amount, Some(dec!(50.00)));

        assert!(rows[1].1.is_err());
        assert!(rows[0].0 < rows[1].0 && rows[1].0 < rows[2].0);

        let fulfill = rows[2].1.as_ref().unwrap();
        assert_eq!(fulfill.kind, CommandKind::Fulfill);
        assert!(fulfill.amount.is_none());
        assert_eq!(fulfill.request.as_deref(), Some("r1"));
    }
}
