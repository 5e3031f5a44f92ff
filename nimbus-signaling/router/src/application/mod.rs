pub mod services;

pub use services::{DeliveryReceipt, DeliveryService};
