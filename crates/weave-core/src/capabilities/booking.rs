//! Booking and payment capabilities.
//!
//! Confirmation identifiers are derived from the prepared inputs, so a
//! retried `run` observes the same booking instead of creating a second
//! one.

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::capability::{Capability, CapabilityError, PreparedInputs, RunContext, RunValue};

fn confirmation_code(prefix: &str, prepared: &PreparedInputs) -> String {
    let payload: Vec<String> = prepared
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect();
    let digest = md5::compute(payload.join("&").as_bytes());
    format!("{prefix}-{}", &format!("{digest:x}")[..8].to_uppercase())
}

/// Books a selected flight.
pub struct FlightBooking;

#[async_trait]
impl Capability for FlightBooking {
    async fn run(
        &self,
        prepared: &PreparedInputs,
        _ctx: &RunContext,
    ) -> Result<RunValue, CapabilityError> {
        let flight = prepared.require("selected_flight")?;
        if flight.is_null() {
            return Err(CapabilityError::InvalidInput(
                "selected_flight is null".into(),
            ));
        }
        let confirmation = json!({
            "confirmation_number": confirmation_code("BK", prepared),
            "status": "confirmed",
            "flight": flight,
        });
        Ok(RunValue::data([("booking_confirmation", confirmation)]))
    }

    fn summarize(&self, value: &RunValue) -> Option<String> {
        match value {
            RunValue::Data(outputs) => outputs
                .get("booking_confirmation")
                .and_then(|c| c.get("confirmation_number"))
                .and_then(Value::as_str)
                .map(|n| format!("Booking confirmed ({n})")),
            RunValue::AwaitUser { .. } => None,
        }
    }
}

/// Processes a payment.
pub struct PaymentProcessing;

#[async_trait]
impl Capability for PaymentProcessing {
    async fn run(
        &self,
        prepared: &PreparedInputs,
        _ctx: &RunContext,
    ) -> Result<RunValue, CapabilityError> {
        let amount = prepared
            .require("amount")?
            .as_f64()
            .or_else(|| {
                prepared
                    .get("amount")
                    .and_then(Value::as_str)
                    .and_then(|s| s.trim_start_matches('$').parse().ok())
            })
            .ok_or_else(|| CapabilityError::InvalidInput("amount must be numeric".into()))?;
        if amount <= 0.0 {
            return Err(CapabilityError::InvalidInput(
                "amount must be positive".into(),
            ));
        }
        let method = prepared
            .get("payment_method")
            .and_then(Value::as_str)
            .unwrap_or("credit_card");

        let confirmation = json!({
            "transaction_id": confirmation_code("PAY", prepared),
            "status": "completed",
            "amount": amount,
            "payment_method": method,
        });
        Ok(RunValue::data([("payment_confirmation", confirmation)]))
    }

    fn summarize(&self, value: &RunValue) -> Option<String> {
        match value {
            RunValue::Data(outputs) => outputs
                .get("payment_confirmation")
                .map(|c| format!("Payment of ${} completed", c["amount"])),
            RunValue::AwaitUser { .. } => None,
        }
    }
}
