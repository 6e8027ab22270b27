//! Documentation-generation workflow.
//!
//! Gathers product information, then iterates a generate/proofread loop
//! against model-backed activities until the proofreader is satisfied
//! or the attempt bound is hit. A human approver then gets one timed
//! window to approve before the result is published. Every model call
//! retries with exponential backoff on durable timers, so the whole
//! schedule replays deterministically.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::runtime::OrchestrationRegistryBuilder;
use crate::{durable_info, BackoffStrategy, OrchestrationContext, RetryPolicy};

pub const ORCHESTRATION_NAME: &str = "GenerateDocumentation";
pub const APPROVAL_EVENT: &str = "ApproveDocumentation";
pub const MAX_PROOFREADING_ATTEMPTS: u32 = 10;
pub const DEFAULT_APPROVAL_TIMEOUT_MS: u64 = 60 * 60 * 1000;

/// Backoff for the model-backed activities: 5 attempts, 10s first
/// delay, doubling, capped at an hour.
pub fn language_model_retry_policy() -> RetryPolicy {
    RetryPolicy::new(5).with_backoff(BackoffStrategy::Exponential {
        first_delay_ms: 10_000,
        coefficient: 2.0,
        max_delay_ms: 3_600_000,
    })
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocGenerationInput {
    pub product_name: String,
    #[serde(default = "default_approval_timeout_ms")]
    pub approval_timeout_ms: u64,
}

fn default_approval_timeout_ms() -> u64 {
    DEFAULT_APPROVAL_TIMEOUT_MS
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerateDocumentationRequest {
    pub product_info: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplySuggestionsRequest {
    pub product_info: String,
    pub documentation: String,
    pub suggestions: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProofreadRequest {
    pub documentation: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProofreadingResponse {
    pub meets_expectations: bool,
    pub explanation: String,
    pub suggestions: Vec<String>,
}

/// Register the workflow under [`ORCHESTRATION_NAME`].
pub fn register(builder: OrchestrationRegistryBuilder) -> OrchestrationRegistryBuilder {
    builder.register(ORCHESTRATION_NAME, generate_documentation)
}

pub async fn generate_documentation(ctx: OrchestrationContext, input: String) -> Result<String, String> {
    let request: DocGenerationInput = crate::codec::decode(&input)?;
    let retry = language_model_retry_policy();

    let product_info = ctx
        .call_activity("GatherProductInfo", request.product_name.clone())
        .await?;
    durable_info!(ctx, product = %request.product_name, "gathered product info");

    let mut documentation = String::new();
    let mut suggestions: Vec<String> = Vec::new();
    let mut meets_expectations = false;
    for attempt in 1..=MAX_PROOFREADING_ATTEMPTS {
        // First attempt generates from scratch; later attempts rework
        // the previous draft with the proofreader's suggestions.
        documentation = if attempt == 1 {
            ctx.call_activity_with_retry_typed(
                "GenerateDocumentation",
                &GenerateDocumentationRequest {
                    product_info: product_info.clone(),
                },
                &retry,
            )
            .await?
        } else {
            ctx.call_activity_with_retry_typed(
                "ApplySuggestions",
                &ApplySuggestionsRequest {
                    product_info: product_info.clone(),
                    documentation,
                    suggestions: std::mem::take(&mut suggestions),
                },
                &retry,
            )
            .await?
        };

        let review: ProofreadingResponse = ctx
            .call_activity_with_retry_typed(
                "Proofread",
                &ProofreadRequest {
                    documentation: documentation.clone(),
                },
                &retry,
            )
            .await?;
        durable_info!(
            ctx,
            attempt,
            meets_expectations = review.meets_expectations,
            explanation = %review.explanation,
            "proofreading verdict"
        );
        if review.meets_expectations {
            meets_expectations = true;
            break;
        }
        suggestions = review.suggestions;
    }
    if !meets_expectations {
        return Err(format!(
            "documentation still does not meet expectations after {MAX_PROOFREADING_ATTEMPTS} attempts"
        ));
    }

    ctx.call_activity("RequestHumanApproval", documentation.clone()).await?;
    let approver = ctx
        .wait_external_with_timeout(
            APPROVAL_EVENT,
            Duration::from_millis(request.approval_timeout_ms),
        )
        .await
        .map_err(|e| e.to_string())?;
    durable_info!(ctx, approver = %approver, "documentation approved");

    ctx.call_activity("PublishDocumentation", documentation.clone()).await?;
    Ok(documentation)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{run_turn, Action, Event};

    #[test]
    fn first_turn_gathers_product_info() {
        let input = crate::codec::encode(&DocGenerationInput {
            product_name: "widget".into(),
            approval_timeout_ms: 1_000,
        })
        .unwrap();
        let history = vec![Event::OrchestrationStarted {
            name: ORCHESTRATION_NAME.into(),
            version: "1.0.0".into(),
            input: input.clone(),
        }];
        let result = run_turn(history, |ctx| generate_documentation(ctx, input));
        assert!(result.output.is_none());
        assert!(result.nondeterminism.is_none());
        assert_eq!(
            result.actions,
            vec![Action::CallActivity {
                id: 1,
                name: "GatherProductInfo".into(),
                input: "widget".into(),
            }]
        );
    }

    #[test]
    fn approval_timeout_defaults_to_an_hour() {
        let decoded: DocGenerationInput = crate::codec::decode(r#"{"product_name":"widget"}"#).unwrap();
        assert_eq!(decoded.approval_timeout_ms, DEFAULT_APPROVAL_TIMEOUT_MS);
    }
}
