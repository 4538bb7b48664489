//! ExecutionEngine: admits execution requests and drives each one through
//! `QUEUED -> RUNNING -> {PASSED | FAILED | CANCELLED}` on its own task.
//!
//! The execution table is the only shared state. A running task appends
//! steps under the table lock and only while the record is still `RUNNING`,
//! so once any terminal status is written the record is never touched
//! again by its task. Cancellation is cooperative: `cancel` writes
//! `CANCELLED` and the task notices at its next check, after the in-flight
//! step has been appended and its service delay has elapsed.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use ptexec_core::execution::Execution;
use ptexec_core::types::{ExecutionStatus, Progress};
use serde::Serialize;
use serde_json::Value;

use crate::error::ExecutionError;
use crate::faults::FaultSource;
use crate::planner::{PlanRequest, StepPlanner};
use crate::protocol::ServerMessage;
use crate::publisher::EventPublisher;

// ---------------------------------------------------------------------------
// Configuration and requests
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Simulated service time after each step.
    pub step_delay: Duration,
    /// Window for [`ExecutionStats::last_window`].
    pub stats_window: chrono::Duration,
    /// Terminal executions retained before the oldest-finished are evicted.
    pub retention: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            step_delay: Duration::from_millis(500),
            stats_window: chrono::Duration::hours(24),
            retention: 1_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionRequest {
    pub test_case_id: String,
    pub user_id: String,
    pub params: Value,
    pub fault_injection: bool,
}

impl ExecutionRequest {
    pub fn new(test_case_id: impl Into<String>, user_id: impl Into<String>) -> Self {
        Self {
            test_case_id: test_case_id.into(),
            user_id: user_id.into(),
            params: Value::Null,
            fault_injection: false,
        }
    }

    pub fn with_params(mut self, params: Value) -> Self {
        self.params = params;
        self
    }

    pub fn with_fault_injection(mut self, enabled: bool) -> Self {
        self.fault_injection = enabled;
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionStats {
    pub total: usize,
    pub queued: usize,
    pub running: usize,
    pub passed: usize,
    pub failed: usize,
    pub cancelled: usize,
    pub terminal: usize,
    /// Executions started within the configured window.
    pub last_window: usize,
    /// Mean start-to-finish time of terminal executions.
    pub average_duration_ms: f64,
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

struct Shared {
    config: EngineConfig,
    publisher: EventPublisher,
    planner: Arc<dyn StepPlanner>,
    faults: Arc<dyn FaultSource>,
    executions: Mutex<HashMap<String, Execution>>,
}

/// Cheap to clone; clones share one execution table.
#[derive(Clone)]
pub struct ExecutionEngine {
    shared: Arc<Shared>,
}

enum LoopExit {
    Completed,
    Cancelled,
}

impl ExecutionEngine {
    pub fn new(
        config: EngineConfig,
        publisher: EventPublisher,
        planner: Arc<dyn StepPlanner>,
        faults: Arc<dyn FaultSource>,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                config,
                publisher,
                planner,
                faults,
                executions: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Admit a request and start it in the background. Returns at once with
    /// the new execution id; nothing that happens to the execution afterwards
    /// is reported back through this call.
    pub fn submit(&self, request: ExecutionRequest) -> String {
        let id = uuid::Uuid::new_v4().to_string();
        let now = Utc::now();
        let execution = Execution::new(
            id.clone(),
            request.test_case_id.clone(),
            request.user_id.clone(),
            request.params,
            request.fault_injection,
            now,
        );
        self.shared.table().insert(id.clone(), execution);

        tracing::info!(
            execution_id = %id,
            test_case_id = %request.test_case_id,
            user_id = %request.user_id,
            fault_injection = request.fault_injection,
            "execution queued"
        );
        self.shared.publish(
            &request.user_id,
            &id,
            ServerMessage::ExecutionQueued {
                execution_id: id.clone(),
                test_case_id: request.test_case_id,
                timestamp: now,
                status: ExecutionStatus::Queued,
            },
        );

        tokio::spawn(supervise(Arc::clone(&self.shared), id.clone()));
        id
    }

    /// Request cancellation. Returns `true` only if the execution was
    /// `RUNNING` at call time.
    pub fn cancel(&self, execution_id: &str) -> bool {
        let mut table = self.shared.table();
        let Some(execution) = table.get_mut(execution_id) else {
            return false;
        };
        if execution.status != ExecutionStatus::Running {
            return false;
        }
        match execution.transition(ExecutionStatus::Cancelled, Utc::now()) {
            Ok(()) => {
                tracing::info!(execution_id, steps = execution.steps.len(), "execution cancel requested");
                true
            }
            Err(e) => {
                tracing::warn!(execution_id, error = %e, "cancel rejected");
                false
            }
        }
    }

    pub fn get(&self, execution_id: &str) -> Option<Execution> {
        self.shared.table().get(execution_id).cloned()
    }

    /// Newest first.
    pub fn list_by_user(&self, user_id: &str) -> Vec<Execution> {
        let mut list: Vec<Execution> = self
            .shared
            .table()
            .values()
            .filter(|e| e.user_id == user_id)
            .cloned()
            .collect();
        list.sort_by(|a, b| b.started_at.cmp(&a.started_at).then_with(|| a.id.cmp(&b.id)));
        list
    }

    pub fn stats(&self) -> ExecutionStats {
        self.stats_at(Utc::now())
    }

    pub fn stats_at(&self, now: DateTime<Utc>) -> ExecutionStats {
        let table = self.shared.table();
        let window_start = now
            .checked_sub_signed(self.shared.config.stats_window)
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        let mut stats = ExecutionStats {
            total: table.len(),
            ..ExecutionStats::default()
        };
        let mut duration_sum = 0i64;
        for execution in table.values() {
            match execution.status {
                ExecutionStatus::Queued => stats.queued += 1,
                ExecutionStatus::Running => stats.running += 1,
                ExecutionStatus::Passed => stats.passed += 1,
                ExecutionStatus::Failed => stats.failed += 1,
                ExecutionStatus::Cancelled => stats.cancelled += 1,
            }
            if execution.started_at >= window_start {
                stats.last_window += 1;
            }
            if let Some(finished) = execution.finished_at {
                stats.terminal += 1;
                duration_sum += (finished - execution.started_at).num_milliseconds();
            }
        }
        if stats.terminal > 0 {
            stats.average_duration_ms = duration_sum as f64 / stats.terminal as f64;
        }
        stats
    }

    pub fn len(&self) -> usize {
        self.shared.table().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// ---------------------------------------------------------------------------
// Execution task
// ---------------------------------------------------------------------------

impl Shared {
    fn table(&self) -> MutexGuard<'_, HashMap<String, Execution>> {
        self.executions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn publish(&self, owner: &str, execution_id: &str, msg: ServerMessage) {
        self.publisher.publish_execution(owner, execution_id, &msg);
    }

    /// Drop the oldest-finished terminal executions beyond the retention cap.
    fn enforce_retention(&self) {
        let mut table = self.table();
        let mut terminal: Vec<(DateTime<Utc>, String)> = table
            .values()
            .filter_map(|e| e.finished_at.filter(|_| e.is_terminal()).map(|f| (f, e.id.clone())))
            .collect();
        let excess = terminal.len().saturating_sub(self.config.retention);
        if excess == 0 {
            return;
        }
        terminal.sort();
        for (_, id) in terminal.into_iter().take(excess) {
            table.remove(&id);
        }
        tracing::debug!(evicted = excess, "terminal executions evicted");
    }

    /// Record a fault: `FAILED` plus `execution_failed`, unless the execution
    /// already reached a terminal status.
    fn fail(&self, execution_id: &str, error: &ExecutionError) {
        let now = Utc::now();
        let message = error.to_string();
        let (owner, test_case_id, started) = {
            let mut table = self.table();
            let Some(execution) = table.get_mut(execution_id) else {
                return;
            };
            if execution.is_terminal() {
                tracing::warn!(
                    execution_id,
                    status = %execution.status,
                    error = %message,
                    "fault after terminal status ignored"
                );
                return;
            }
            let started = execution.status == ExecutionStatus::Queued;
            let moved = if started {
                execution.transition(ExecutionStatus::Running, now)
            } else {
                Ok(())
            }
            .and_then(|()| execution.transition(ExecutionStatus::Failed, now));
            if let Err(e) = moved {
                tracing::warn!(execution_id, error = %e, "fault transition rejected");
                return;
            }
            execution.error = Some(message.clone());
            (execution.user_id.clone(), execution.test_case_id.clone(), started)
        };

        if started {
            self.publish(
                &owner,
                execution_id,
                ServerMessage::ExecutionStarted {
                    execution_id: execution_id.to_string(),
                    test_case_id: test_case_id.clone(),
                    timestamp: now,
                    status: ExecutionStatus::Running,
                },
            );
        }
        tracing::error!(execution_id, error = %message, "execution failed");
        self.publish(
            &owner,
            execution_id,
            ServerMessage::ExecutionFailed {
                execution_id: execution_id.to_string(),
                test_case_id,
                timestamp: now,
                status: ExecutionStatus::Failed,
                error: message,
            },
        );
    }
}

/// Task boundary: runs the execution on an inner task so that a panic
/// surfaces here as a `JoinError` instead of unwinding into the runtime.
async fn supervise(shared: Arc<Shared>, execution_id: String) {
    let inner = tokio::spawn(drive(Arc::clone(&shared), execution_id.clone()));
    let fault = match inner.await {
        Ok(Ok(())) => None,
        Ok(Err(e)) => Some(e),
        Err(join) if join.is_panic() => {
            let payload = join.into_panic();
            let message = payload
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            Some(ExecutionError::Panicked(message))
        }
        Err(_) => Some(ExecutionError::Aborted),
    };
    if let Some(error) = fault {
        shared.fail(&execution_id, &error);
    }
    shared.enforce_retention();
}

async fn drive(shared: Arc<Shared>, execution_id: String) -> Result<(), ExecutionError> {
    let id = execution_id.as_str();

    // QUEUED -> RUNNING
    let now = Utc::now();
    let (owner, test_case_id, params, fault_injection) = {
        let mut table = shared.table();
        let Some(execution) = table.get_mut(id) else {
            return Ok(());
        };
        execution.transition(ExecutionStatus::Running, now)?;
        (
            execution.user_id.clone(),
            execution.test_case_id.clone(),
            execution.params.clone(),
            execution.fault_injection,
        )
    };
    tracing::info!(execution_id = id, "execution started");
    shared.publish(
        &owner,
        id,
        ServerMessage::ExecutionStarted {
            execution_id: execution_id.clone(),
            test_case_id: test_case_id.clone(),
            timestamp: now,
            status: ExecutionStatus::Running,
        },
    );

    let plan = shared.planner.plan(&PlanRequest {
        execution_id: id,
        test_case_id: &test_case_id,
        params: &params,
    })?;
    let total = plan.total;

    let mut exit = LoopExit::Completed;
    for (index, spec) in plan.steps.enumerate() {
        let mut spec = spec?;
        let order = u32::try_from(index + 1).unwrap_or(u32::MAX);
        if fault_injection {
            if let Some(fault) = shared.faults.fault_for(id, order) {
                spec = spec.with_fault(fault);
            }
        }

        let now = Utc::now();
        let step = {
            let mut table = shared.table();
            let Some(execution) = table.get_mut(id) else {
                return Ok(());
            };
            if execution.status != ExecutionStatus::Running {
                exit = LoopExit::Cancelled;
                break;
            }
            execution
                .append_step(uuid::Uuid::new_v4().to_string(), spec, now)?
                .clone()
        };

        tracing::debug!(
            execution_id = id,
            step_order = step.step_order,
            verdict = step.verdict.as_str(),
            "step appended"
        );
        shared.publish(
            &owner,
            id,
            ServerMessage::ExecutionStep {
                execution_id: execution_id.clone(),
                test_case_id: test_case_id.clone(),
                timestamp: now,
                step,
                progress: Progress::new(order, total.max(order)),
            },
        );

        tokio::time::sleep(shared.config.step_delay).await;

        let cancelled = shared
            .table()
            .get(id)
            .is_none_or(|e| e.status == ExecutionStatus::Cancelled);
        if cancelled {
            exit = LoopExit::Cancelled;
            break;
        }
    }

    let now = Utc::now();
    let outcome = {
        let mut table = shared.table();
        let Some(execution) = table.get_mut(id) else {
            return Ok(());
        };
        match (exit, execution.status) {
            (_, ExecutionStatus::Cancelled) | (LoopExit::Cancelled, _) => None,
            (LoopExit::Completed, _) => {
                let status = execution.verdict_status();
                let summary = execution.summarize(now);
                execution.transition(status, now)?;
                execution.summary = Some(summary.clone());
                Some((status, summary))
            }
        }
    };

    match outcome {
        Some((status, summary)) => {
            tracing::info!(
                execution_id = id,
                status = %status,
                steps = summary.total_steps,
                success_rate = summary.success_rate,
                "execution completed"
            );
            shared.publish(
                &owner,
                id,
                ServerMessage::ExecutionCompleted {
                    execution_id: execution_id.clone(),
                    test_case_id,
                    timestamp: now,
                    status,
                    summary,
                },
            );
        }
        None => {
            tracing::info!(execution_id = id, "execution cancelled");
            shared.publish(
                &owner,
                id,
                ServerMessage::ExecutionCancelled {
                    execution_id: execution_id.clone(),
                    test_case_id,
                    timestamp: now,
                    status: ExecutionStatus::Cancelled,
                },
            );
        }
    }
    Ok(())
}
