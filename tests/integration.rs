use std::{cell::RefCell, rc::Rc, str::from_utf8, sync::Arc, thread};

use peer_ledger::{
    bin_utils::{RowError, Service},
    command::{CreateRequestCommand, FulfillRequestCommand, OpenAccountCommand, SendCommand},
    config::LedgerConfig,
    processor::{
        ErrorKind, PaymentProcessor, in_memory_processor::InMemoryPaymentProcessor,
    },
    query::TransactionFilter,
};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;

const TEST_FILE: &str = include_str!("commands.csv");

type Errors = Rc<RefCell<Vec<(u64, String, Option<ErrorKind>)>>>;

fn run(history: Option<&str>) -> (String, Errors) {
    let errors: Errors = Rc::default();
    let sink = errors.clone();
    let mut output = Vec::new();
    let service = Service {
        input: TEST_FILE.as_bytes(),
        output: &mut output,
        config: LedgerConfig::default(),
        history: history.map(Into::into),
        error_printer: Box::new(move |line, err| {
            let kind = match &err {
                RowError::Ledger(err) => Some(err.kind()),
                _ => None,
            };
            sink.borrow_mut().push((line, err.to_string(), kind));
        }),
    };
    service.run().unwrap();
    (from_utf8(&output).unwrap().to_owned(), errors)
}

#[test]
fn process_commands() {
    let (output, errors) = run(None);
    let lines: Vec<&str> = output.lines().collect();
    assert_eq!(lines.len(), 4);
    assert_eq!(lines[0], "account,handle,name,balance,currency,active");
    assert_eq!(lines[1], "alice,alice.pay,Alice,50.00,USD,true");
    assert_eq!(lines[2], "bob,bob.pay,Bob,55.00,USD,true");
    // carol got a generated handle
    assert!(lines[3].starts_with("carol,"));
    assert!(lines[3].ends_with(",Carol,15.00,USD,true"));

    let kinds: Vec<Option<ErrorKind>> = errors.borrow().iter().map(|(_, _, kind)| *kind).collect();
    assert_eq!(
        kinds,
        [
            Some(ErrorKind::InsufficientFunds),
            Some(ErrorKind::Expired),
            Some(ErrorKind::Validation),
            None,
        ]
    );
    let lines: Vec<u64> = errors.borrow().iter().map(|(line, _, _)| *line).collect();
    assert!(lines.windows(2).all(|pair| pair[0] < pair[1]));
    assert!(errors.borrow()[3].1.contains("r9"));
}

#[test]
fn print_history() {
    let (output, errors) = run(Some("bob"));
    assert_eq!(errors.borrow().len(), 4);
    let rows: Vec<Vec<&str>> = output.lines().map(|line| line.split(',').collect()).collect();
    assert_eq!(
        rows[0],
        [
            "sequence",
            "transaction",
            "direction",
            "counterparty",
            "amount",
            "currency",
            "status",
            "memo"
        ]
    );
    let summary: Vec<[&str; 5]> = rows[1..]
        .iter()
        .map(|row| [row[0], row[2], row[3], row[4], row[6]])
        .collect();
    assert_eq!(
        summary,
        [
            ["3", "sent", "carol", "15.00", "completed"],
            ["2", "sent", "carol", "500.00", "failed"],
            ["1", "received", "alice", "50.00", "completed"],
        ]
    );
    assert_eq!(rows[1][7], "Movie tickets");
    assert_eq!(rows[3][7], "Lunch split");
}

fn processor(accounts: &[(&str, Decimal)]) -> InMemoryPaymentProcessor {
    let processor = InMemoryPaymentProcessor::new(LedgerConfig::default());
    for (id, balance) in accounts {
        processor
            .open_account(
                OpenAccountCommand::new(Some((*id).into()), id, "USD", Some(*balance), None)
                    .unwrap(),
            )
            .unwrap();
    }
    processor
}

#[test]
fn memo_search() {
    let processor = processor(&[("me", dec!(100)), ("sarah", dec!(100))]);
    processor
        .send(SendCommand::new("sarah", "me", Some(dec!(50)), "USD", Some("Lunch split"), "k1").unwrap())
        .unwrap();
    let search = |text: &str| {
        processor
            .list_transactions(
                &"me".into(),
                &TransactionFilter {
                    text: Some(text.to_owned()),
                    ..Default::default()
                },
            )
            .unwrap()
            .total_count
    };
    assert_eq!(search("lunch"), 1);
    assert_eq!(search("dinner"), 0);
}

#[test]
fn parallel_retries_move_funds_once() {
    let processor = processor(&[("a", dec!(100)), ("b", dec!(0))]);
    let ids: Vec<_> = thread::scope(|scope| {
        let handles: Vec<_> = (0..8)
            .map(|_| {
                scope.spawn(|| {
                    processor.send(
                        SendCommand::new("a", "b", Some(dec!(10)), "USD", None, "same-key").unwrap(),
                    )
                })
            })
            .collect();
        handles
            .into_iter()
            .map(|handle| handle.join().unwrap().unwrap())
            .collect()
    });
    assert!(ids.windows(2).all(|pair| pair[0] == pair[1]));
    assert_eq!(processor.get_balance(&"a".into()).unwrap().value(), dec!(90));
    assert_eq!(processor.get_balance(&"b".into()).unwrap().value(), dec!(10));
    let history = processor
        .list_transactions(&"a".into(), &TransactionFilter::default())
        .unwrap();
    assert_eq!(history.total_count, 1);
}

#[test]
fn parallel_fulfilments_settle_once() {
    let processor = processor(&[("a", dec!(100)), ("b", dec!(0))]);
    let request = processor
        .create_request(CreateRequestCommand::new("b", "a", Some(dec!(10)), None, None).unwrap())
        .unwrap();
    let results: Vec<_> = thread::scope(|scope| {
        let handles: Vec<_> = ["pay-1", "pay-2"]
            .map(|key| {
                let (processor, request) = (&processor, request.clone());
                scope.spawn(move || {
                    processor
                        .fulfill_request(FulfillRequestCommand::new(request, "a", key).unwrap())
                })
            })
            .into_iter()
            .collect();
        handles.into_iter().map(|handle| handle.join().unwrap()).collect()
    });
    assert_eq!(results.iter().filter(|result| result.is_ok()).count(), 1);
    let err = results.iter().find_map(|result| result.as_ref().err()).unwrap();
    assert_eq!(err.kind(), ErrorKind::Conflict);

    assert_eq!(processor.get_balance(&"a".into()).unwrap().value(), dec!(90));
    assert_eq!(processor.get_balance(&"b".into()).unwrap().value(), dec!(10));
    let history = processor
        .list_transactions(&"a".into(), &TransactionFilter::default())
        .unwrap();
    assert_eq!(history.total_count, 1);
}

#[test]
fn overlapping_transfers_conserve_funds() {
    let ids = ["w", "x", "y", "z"];
    let processor = Arc::new(processor(&[
        ("w", dec!(100)),
        ("x", dec!(100)),
        ("y", dec!(100)),
        ("z", dec!(100)),
    ]));
    let workers: Vec<_> = (0..4)
        .map(|worker| {
            let processor = Arc::clone(&processor);
            thread::spawn(move || {
                for round in 0..50 {
                    let from = ids[(worker + round) % ids.len()];
                    let to = ids[(worker + round + 1 + worker % 2) % ids.len()];
                    let key = format!("{worker}-{round}");
                    let command =
                        SendCommand::new(from, to, Some(dec!(7.25)), "USD", None, &key).unwrap();
                    if let Err(err) = processor.send(command) {
                        assert_ne!(err.kind(), ErrorKind::Fatal, "{err}");
                    }
                }
            })
        })
        .collect();
    for worker in workers {
        worker.join().unwrap();
    }

    assert_eq!(processor.audit().unwrap(), dec!(400));
    let total: Decimal = ids
        .iter()
        .map(|id| processor.get_balance(&(*id).into()).unwrap().value())
        .sum();
    assert_eq!(total, dec!(400));
}
