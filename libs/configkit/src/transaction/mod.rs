//! One configuration transaction: its status machine and its controller.

mod controller;
mod status;

pub(crate) use controller::TransactionParts;
pub use controller::ConfigTransactionController;
pub use status::{TransactionState, TransactionStatus};
