//! User interaction capability.

use async_trait::async_trait;
use serde_json::Value;

use crate::capability::{Capability, CapabilityError, PreparedInputs, RunContext, RunValue};

/// Asks the user for additional information.
///
/// `run` does not block: it signals the executor to suspend the step with
/// [`RunValue::AwaitUser`]; the interaction stage delivers the question and
/// the reply is committed under the step's declared outputs.
pub struct UserQuery;

#[async_trait]
impl Capability for UserQuery {
    async fn run(
        &self,
        prepared: &PreparedInputs,
        _ctx: &RunContext,
    ) -> Result<RunValue, CapabilityError> {
        let question = prepared
            .get("question")
            .and_then(Value::as_str)
            .unwrap_or("Please provide additional information")
            .to_string();
        Ok(RunValue::AwaitUser {
            question,
            fields: Vec::new(),
        })
    }
}
