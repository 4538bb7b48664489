//! Step planning: turns an execution request into a finite, lazily produced
//! sequence of step specs.
//!
//! [`DefaultPlanner`] picks the first applicable strategy:
//! 1. explicit `params.steps` (parsed one at a time as the engine pulls them),
//! 2. `params.tool`, routed through the [`SourceRouter`]; one step per
//!    returned protocol record,
//! 3. a synthetic procedure of `params.stepCount` steps.

use std::sync::Arc;

use ptexec_core::types::{Direction, StepSpec};
use ptexec_gateway::router::SourceRouter;
use ptexec_gateway::sources::MESSAGES_KIND;
use serde_json::Value;

use crate::error::ExecutionError;

/// Upper bound on synthetic procedure length.
pub const MAX_SYNTHETIC_STEPS: u32 = 10_000;

const SYNTHETIC_LAYERS: [(&str, &str); 6] = [
    ("PHY", "RandomAccessPreamble"),
    ("MAC", "RandomAccessResponse"),
    ("RLC", "StatusPDU"),
    ("PDCP", "DataPDU"),
    ("RRC", "RRCSetupRequest"),
    ("NAS", "RegistrationRequest"),
];

pub type StepIter = Box<dyn Iterator<Item = Result<StepSpec, ExecutionError>> + Send>;

/// Finite step sequence with its length known up front.
pub struct StepPlan {
    pub total: u32,
    pub steps: StepIter,
}

impl StepPlan {
    pub fn from_specs(specs: Vec<StepSpec>) -> Self {
        Self {
            total: u32::try_from(specs.len()).unwrap_or(u32::MAX),
            steps: Box::new(specs.into_iter().map(Ok)),
        }
    }
}

/// What the planner sees of an execution.
#[derive(Debug, Clone, Copy)]
pub struct PlanRequest<'a> {
    pub execution_id: &'a str,
    pub test_case_id: &'a str,
    pub params: &'a Value,
}

pub trait StepPlanner: Send + Sync {
    fn plan(&self, request: &PlanRequest<'_>) -> Result<StepPlan, ExecutionError>;
}

// ---------------------------------------------------------------------------
// DefaultPlanner
// ---------------------------------------------------------------------------

pub struct DefaultPlanner {
    router: Option<Arc<SourceRouter>>,
    default_step_count: u32,
}

impl DefaultPlanner {
    pub fn new(default_step_count: u32) -> Self {
        Self {
            router: None,
            default_step_count,
        }
    }

    pub fn with_router(mut self, router: Arc<SourceRouter>) -> Self {
        self.router = Some(router);
        self
    }

    fn explicit(steps: &[Value]) -> StepPlan {
        let owned = steps.to_vec();
        StepPlan {
            total: u32::try_from(owned.len()).unwrap_or(u32::MAX),
            steps: Box::new(owned.into_iter().enumerate().map(|(i, raw)| {
                serde_json::from_value::<StepSpec>(raw).map_err(|e| ExecutionError::Step {
                    order: u32::try_from(i + 1).unwrap_or(u32::MAX),
                    message: format!("invalid step definition: {e}"),
                })
            })),
        }
    }

    fn routed(&self, request: &PlanRequest<'_>, tool: &str) -> Result<StepPlan, ExecutionError> {
        let Some(router) = &self.router else {
            return Err(ExecutionError::Plan(format!(
                "tool {tool} requested but no source router is configured"
            )));
        };
        let kind = request
            .params
            .get("requestKind")
            .and_then(Value::as_str)
            .unwrap_or(MESSAGES_KIND);

        let routed = router.route_request(tool, kind);
        tracing::info!(
            execution_id = request.execution_id,
            tool,
            request_kind = kind,
            source = %routed.decision.source,
            served_by = %routed.served_by,
            confidence = routed.decision.confidence,
            "step data routed"
        );

        let records = routed
            .data
            .get("records")
            .and_then(Value::as_array)
            .filter(|records| !records.is_empty())
            .ok_or_else(|| {
                ExecutionError::Plan(format!(
                    "tool {tool} returned no protocol records (served by {})",
                    routed.served_by
                ))
            })?;

        let specs = records
            .iter()
            .enumerate()
            .map(|(i, record)| record_to_spec(i, record.get("payload").unwrap_or(record)))
            .collect();
        Ok(StepPlan::from_specs(specs))
    }

    fn synthetic(count: u32) -> StepPlan {
        StepPlan {
            total: count,
            steps: Box::new((0..count).map(|i| Ok(synthetic_step(i)))),
        }
    }
}

fn alternating(i: usize) -> Direction {
    if i % 2 == 0 { Direction::Ul } else { Direction::Dl }
}

fn synthetic_step(i: u32) -> StepSpec {
    let (layer, message) = SYNTHETIC_LAYERS[i as usize % SYNTHETIC_LAYERS.len()];
    StepSpec::new(layer, alternating(i as usize), message)
}

/// Map a protocol record payload to a step. Missing descriptors fall back to
/// neutral values rather than failing the plan.
fn record_to_spec(i: usize, payload: &Value) -> StepSpec {
    let field = |name: &str| payload.get(name).and_then(Value::as_str);
    let layer = field("layer").unwrap_or("UNKNOWN");
    let direction = field("direction")
        .and_then(|d| d.parse().ok())
        .unwrap_or_else(|| alternating(i));
    let message_type = field("messageType")
        .or_else(|| field("message"))
        .unwrap_or("Unknown");
    let mut spec = StepSpec::new(layer, direction, message_type);
    if let Some(verdict) = field("verdict").and_then(|v| v.parse().ok()) {
        spec = spec.with_verdict(verdict);
    }
    spec
}

impl StepPlanner for DefaultPlanner {
    fn plan(&self, request: &PlanRequest<'_>) -> Result<StepPlan, ExecutionError> {
        let params = request.params;
        if let Some(steps) = params.get("steps") {
            return match steps.as_array() {
                Some(steps) => Ok(Self::explicit(steps)),
                None => Err(ExecutionError::Plan("params.steps must be an array".into())),
            };
        }
        if let Some(tool) = params.get("tool").and_then(Value::as_str) {
            return self.routed(request, tool);
        }
        let count = match params.get("stepCount") {
            None | Some(Value::Null) => self.default_step_count,
            Some(raw) => raw
                .as_u64()
                .and_then(|n| u32::try_from(n).ok())
                .ok_or_else(|| {
                    ExecutionError::Plan(format!("stepCount must be a non-negative integer, got {raw}"))
                })?,
        };
        if count > MAX_SYNTHETIC_STEPS {
            return Err(ExecutionError::Plan(format!(
                "stepCount {count} exceeds the limit of {MAX_SYNTHETIC_STEPS}"
            )));
        }
        Ok(Self::synthetic(count))
    }
}
