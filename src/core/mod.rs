/// Class attendance: recording and reversing check-ins
pub mod checkin;

/// Entitlement ledger: concession blocks, balances and the expiry sweep
pub mod ledger;

/// Folding duplicate student records into one
pub mod merge;

/// Concession package catalog
pub mod package;

/// Refunds and refund history
pub mod refund;

/// Statements, takings summaries and attendance lists
pub mod report;

/// Backoff for transient store failures
pub mod retry;

/// Payment gateway and identity provider seams
pub mod services;

/// Student registry and portal accounts
pub mod student;

/// Purchases, gifts, reversal and restoration of transactions
pub mod transaction;
