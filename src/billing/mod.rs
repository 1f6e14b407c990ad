//! Billing provider integration: outbound usage reporting, inbound
//! webhook processing, and the daily reconciliation pass.

pub mod reconciliation;
pub mod stripe;
pub mod webhook;

pub use stripe::StripeClient;
