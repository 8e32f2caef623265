/// Opaque identifiers for accounts, transactions, requests and idempotency keys.
pub mod id;

/// Fixed-scale amounts and ISO currency codes.
pub mod money;

/// Time source, swappable so expiry can be tested.
pub mod clock;

pub mod config;

/// Account balances and the atomic two-sided transfer.
/// Balances are modified using events, which are created by handling
/// debit and credit attempts against a locked account.
pub mod account;

/// Append-only record of every accepted transfer attempt.
pub mod log;

/// Payment requests and their lifecycle.
pub mod request;

/// Public handles used in shareable payment links.
pub mod link;

/// Read-only history views: filtering, sorting, pagination, totals.
pub mod query;

/// Create commands that later are executed by [`processor`].
pub mod command;

/// Payment processor interface, plus "in memory" implementation.
/// Coordinates the ledger store, transaction log, request workflow and
/// link resolver behind one set of operations.
pub mod processor;

/// Drives the processor from a CSV command file. Used by the binary and by
/// the integration tests.
pub mod bin_utils;
