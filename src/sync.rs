//! Turns raw pushes from a live query into note snapshots and manages the
//! lifecycle of that query.

pub mod subscription;
pub mod transform;

pub use subscription::{SubscriptionManager, SubscriptionState, Unsubscribe};
pub use transform::{parse_document, transform_snapshot};
