//! Entity module - SeaORM entity definitions for every table of the studio ledger.
//! Each entity has a Model struct for data and an Entity struct for operations.

pub mod checkin;
pub mod concession_block;
pub mod concession_package;
pub mod merge_operation;
pub mod refund_entry;
pub mod student;
pub mod system_state;
pub mod transaction;
pub mod user;

// Re-export specific types to avoid conflicts
pub use checkin::{Column as CheckinColumn, Entity as Checkin, Model as CheckinModel};
pub use concession_block::{
    Column as ConcessionBlockColumn, Entity as ConcessionBlock, Model as ConcessionBlockModel,
};
pub use concession_package::{
    Column as ConcessionPackageColumn, Entity as ConcessionPackage,
    Model as ConcessionPackageModel,
};
pub use merge_operation::{
    Column as MergeOperationColumn, Entity as MergeOperation, Model as MergeOperationModel,
};
pub use refund_entry::{
    Column as RefundEntryColumn, Entity as RefundEntry, Model as RefundEntryModel,
};
pub use student::{Column as StudentColumn, Entity as Student, Model as StudentModel};
pub use system_state::{
    Column as SystemStateColumn, Entity as SystemState, Model as SystemStateModel,
};
pub use transaction::{
    Column as TransactionColumn, Entity as Transaction, Model as TransactionModel,
};
pub use user::{Column as UserColumn, Entity as User, Model as UserModel};
