pub mod ledger;
pub mod message;

pub use ledger::{DeliveryFailure, DeliveryLedger};
pub use message::{
    GroupMessage, GroupOperation, MessageAction, PrivateMessage, SYSTEM_SENDER, StoredMessage,
    VideoSignal,
};
