//! Query Lifecycle
//!
//! - **manager**: registration, consent, sweep, processing, retrieval
//! - **pin**: PIN-addressed queries that skip user selection
//! - **payment**: settlement hand-off for completed queries

pub mod manager;
pub mod payment;
pub mod pin;

#[cfg(test)]
mod fixtures;

pub use manager::{
    generate_query_id, now_millis, NewQuery, QueryLifecycleManager, SweepReport, UserQueryView,
};
pub use payment::{gateway_for, DummyPayment, NoPayment, PaymentGateway, PaymentOutcome};
pub use pin::{derive_pin, NewPinQuery, PinQueryView};
