//! Payment Hand-off
//!
//! Settling a completed query is delegated to a gateway. Balances and
//! transfers live behind the gateway; the lifecycle only records the outcome.

use crate::config::PaymentMethod;
use crate::error::CoreResult;
use crate::storage::{QueryRecord, UserId};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PaymentOutcome {
    Paid,
    Unpaid,
}

/// Settles the price of a completed query with its participants
#[async_trait]
pub trait PaymentGateway: Send + Sync {
    fn name(&self) -> &str;

    async fn settle(&self, query: &QueryRecord, participants: &[UserId])
        -> CoreResult<PaymentOutcome>;
}

/// Every query counts as paid
pub struct NoPayment;

#[async_trait]
impl PaymentGateway for NoPayment {
    fn name(&self) -> &str {
        "none"
    }

    async fn settle(&self, _query: &QueryRecord, _participants: &[UserId])
        -> CoreResult<PaymentOutcome> {
        Ok(PaymentOutcome::Paid)
    }
}

/// Pays whenever the price is not negative
pub struct DummyPayment;

#[async_trait]
impl PaymentGateway for DummyPayment {
    fn name(&self) -> &str {
        "dummy"
    }

    async fn settle(&self, query: &QueryRecord, participants: &[UserId])
        -> CoreResult<PaymentOutcome> {
        if query.price < 0.0 {
            return Ok(PaymentOutcome::Unpaid);
        }

        let share = if participants.is_empty() {
            0.0
        } else {
            query.price / participants.len() as f64
        };
        tracing::info!(
            processor_id = query.processor_id,
            query_id = query.query_id,
            participants = participants.len(),
            share,
            "Dummy payment settled"
        );
        Ok(PaymentOutcome::Paid)
    }
}

/// Gateway for the configured method
pub fn gateway_for(method: PaymentMethod) -> Arc<dyn PaymentGateway> {
    match method {
        PaymentMethod::None => Arc::new(NoPayment),
        PaymentMethod::Dummy => Arc::new(DummyPayment),
    }
}
