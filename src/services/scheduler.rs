//! 波次调度
//!
//! 波次严格顺序执行；波次内目标并行（受信号量限制），
//! 每个目标独立完成 凭证 → 下发 → 轮询 → 校验，失败被捕获为 `TargetOutcome`。
//! 波次全部结束后汇总问题实例数，再决定继续、审批或中止。

use chrono::Utc;
use dashmap::{mapref::entry::Entry, DashMap};
use futures::future::join_all;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::instrument;
use uuid::Uuid;

use super::approval_gate::ApprovalGate;
use super::audit_service::AuditService;
use super::credential_broker::CredentialBroker;
use super::dispatcher::{CommandDispatcher, DispatchParams};
use super::poller::CompletionPoller;
use super::verification::VerificationService;
use crate::cloud::InProcessContinuations;
use crate::config::AppConfig;
use crate::context::CorrelationContext;
use crate::error::{AppError, Result};
use crate::models::approval::{ApprovalRequest, ContinuationOutcome};
use crate::models::execution::{
    AbortPolicy, Execution, ExecutionResult, ExecutionStatus, TargetOutcome, WaveResult, WaveStatus,
};
use crate::models::target::Target;

#[derive(Debug, Clone)]
pub struct SchedulerSettings {
    pub max_parallel_targets: usize,
    /// 超过此时长的波次间隔不在本次调用内等待
    pub max_inline_pause: Duration,
    pub abort_policy: AbortPolicy,
    pub external_id: Option<String>,
}

impl SchedulerSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            max_parallel_targets: config.scheduler.max_parallel_targets.max(1),
            max_inline_pause: Duration::from_secs(config.scheduler.max_inline_pause_secs),
            abort_policy: config.scheduler.abort_policy,
            external_id: config.dispatch.external_id.clone(),
        }
    }
}

/// 问题波次之后的决定
enum GateVerdict {
    Continue,
    Stop(ExecutionStatus),
}

pub struct WaveScheduler {
    broker: Arc<CredentialBroker>,
    dispatcher: Arc<CommandDispatcher>,
    poller: Arc<CompletionPoller>,
    verification: Arc<VerificationService>,
    gate: Option<Arc<ApprovalGate>>,
    continuations: Arc<InProcessContinuations>,
    audit: Arc<AuditService>,
    settings: SchedulerSettings,
    executions: DashMap<String, Execution>,
    statuses: DashMap<String, ExecutionStatus>,
    results: DashMap<String, ExecutionResult>,
}

impl WaveScheduler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        broker: Arc<CredentialBroker>,
        dispatcher: Arc<CommandDispatcher>,
        poller: Arc<CompletionPoller>,
        verification: Arc<VerificationService>,
        gate: Option<Arc<ApprovalGate>>,
        continuations: Arc<InProcessContinuations>,
        audit: Arc<AuditService>,
        settings: SchedulerSettings,
    ) -> Self {
        Self {
            broker,
            dispatcher,
            poller,
            verification,
            gate,
            continuations,
            audit,
            settings,
            executions: DashMap::new(),
            statuses: DashMap::new(),
            results: DashMap::new(),
        }
    }

    pub fn status(&self, execution_id: &str) -> Option<ExecutionStatus> {
        self.statuses.get(execution_id).map(|s| s.value().clone())
    }

    pub fn result(&self, execution_id: &str) -> Option<ExecutionResult> {
        self.results.get(execution_id).map(|r| r.value().clone())
    }

    pub fn execution(&self, execution_id: &str) -> Option<Execution> {
        self.executions.get(execution_id).map(|e| e.value().clone())
    }

    /// 登记一个即将启动的执行；同 ID 未结束时拒绝
    ///
    /// 检查与置位在同一个 entry 锁内完成，并发的启动或恢复只有一个能成功。
    pub fn admit(&self, execution: &Execution) -> Result<()> {
        match self.statuses.entry(execution.id.clone()) {
            Entry::Occupied(mut entry) => {
                let status = entry.get();
                if !status.is_terminal() && !matches!(status, ExecutionStatus::Suspended { .. }) {
                    return Err(AppError::Validation(format!(
                        "execution {} is already running",
                        execution.id
                    )));
                }
                entry.insert(ExecutionStatus::Running { wave: 0 });
            }
            Entry::Vacant(entry) => {
                entry.insert(ExecutionStatus::Running { wave: 0 });
            }
        }
        self.executions.insert(execution.id.clone(), execution.clone());
        Ok(())
    }

    pub async fn run(&self, execution: &Execution) -> ExecutionResult {
        self.run_from(execution, 0).await
    }

    /// 从检查点重新进入
    pub async fn resume(&self, execution: &Execution, from_wave: usize) -> Result<ExecutionResult> {
        if from_wave >= execution.waves.len() {
            return Err(AppError::Validation(format!(
                "cannot resume from wave {}, execution has {} waves",
                from_wave,
                execution.waves.len()
            )));
        }
        Ok(self.run_from(execution, from_wave).await)
    }

    #[instrument(skip(self, execution), fields(execution_id = %execution.id, waves = execution.waves.len()))]
    async fn run_from(&self, execution: &Execution, from_wave: usize) -> ExecutionResult {
        let ctx = CorrelationContext::for_execution(&execution.id);
        let started_at = Utc::now();
        let mut waves = Vec::new();
        let mut status = ExecutionStatus::Completed;

        tracing::info!(from_wave, "Execution started");

        for wave in execution.waves.iter().skip(from_wave) {
            self.set_status(&execution.id, ExecutionStatus::Running { wave: wave.index });

            let result = self.run_wave(&ctx, wave.index, &wave.targets).await;
            tracing::info!(
                wave = wave.index,
                status = ?result.status,
                problematic = result.problematic_instances,
                "Wave finished"
            );

            let wave_failed = result.status == WaveStatus::Failed;
            let has_issues = execution.abort_on_issues && result.problematic_instances > 0;
            let verdict = if wave_failed {
                GateVerdict::Stop(ExecutionStatus::Failed {
                    reason: format!("every target in wave {} failed", wave.index),
                })
            } else if has_issues {
                self.decide(&ctx, execution, &result).await
            } else {
                GateVerdict::Continue
            };
            waves.push(result);

            if let GateVerdict::Stop(stop) = verdict {
                status = stop;
                break;
            }

            let is_last = wave.index + 1 >= execution.waves.len();
            if is_last || wave.pause.is_zero() {
                continue;
            }
            if wave.pause > self.settings.max_inline_pause {
                tracing::info!(
                    pause_secs = wave.pause.as_secs(),
                    resume_from_wave = wave.index + 1,
                    "Pause exceeds inline budget, suspending"
                );
                status = ExecutionStatus::Suspended {
                    resume_from_wave: wave.index + 1,
                };
                break;
            }
            tokio::time::sleep(wave.pause).await;
        }

        let result = ExecutionResult {
            execution_id: execution.id.clone(),
            status: status.clone(),
            waves,
            started_at,
            finished_at: Utc::now(),
        };

        self.set_status(&execution.id, status);
        self.results.insert(execution.id.clone(), result.clone());
        if let Err(e) = self.audit.record_execution_finished(&ctx, &result).await {
            tracing::warn!(error = %e, "Failed to audit execution result");
        }
        tracing::info!(status = ?result.status, "Execution finished");
        result
    }

    /// 并行处理一个波次的全部目标，全部结束后汇总
    async fn run_wave(&self, ctx: &CorrelationContext, index: usize, targets: &[Target]) -> WaveResult {
        let semaphore = Semaphore::new(self.settings.max_parallel_targets);

        let outcomes = join_all(targets.iter().map(|target| {
            let semaphore = &semaphore;
            async move {
                let outcome = match semaphore.acquire().await {
                    Ok(_permit) => self.run_target(ctx, index, target).await,
                    Err(_) => failed_outcome(target, None, &AppError::internal_error("semaphore closed")),
                };
                if let Err(e) = self.audit.record_target_completion(ctx, &outcome).await {
                    tracing::warn!(target = %target, error = %e, "Failed to audit target completion");
                }
                outcome
            }
        }))
        .await;

        WaveResult::aggregate(index, outcomes)
    }

    /// 单目标流水线，凭证只在本流水线内使用
    #[instrument(skip(self, ctx), fields(target = %target, correlation_id = %ctx.correlation_id))]
    async fn run_target(&self, ctx: &CorrelationContext, wave: usize, target: &Target) -> TargetOutcome {
        let mut session = match self
            .broker
            .open_session(ctx, &target.account_id, self.settings.external_id.as_deref())
            .await
        {
            Ok(session) => session,
            Err(e) => return failed_outcome(target, None, &e),
        };

        let params = DispatchParams {
            wave: Some(wave),
            ..DispatchParams::default()
        };
        let command_id = match self
            .dispatcher
            .dispatch(ctx, session.credentials(), target, params)
            .await
        {
            Ok(command_id) => command_id,
            Err(e) => return failed_outcome(target, None, &e),
        };

        let poll = match self
            .poller
            .poll_until_complete(ctx, &mut session, &target.region, &command_id)
            .await
        {
            Ok(poll) => poll,
            Err(e) => return failed_outcome(target, Some(command_id), &e),
        };

        let verified = match session.fresh(ctx).await {
            Ok(credentials) => self.verification.verify_target(ctx, credentials, target).await,
            Err(e) => Err(e),
        };
        match verified {
            Ok((report, _key)) => TargetOutcome {
                target: target.clone(),
                command_id: Some(command_id),
                command_status: Some(poll.summary.overall_status),
                report: Some(report),
                error: None,
                error_type: None,
            },
            Err(e) => {
                let mut outcome = failed_outcome(target, Some(command_id), &e);
                outcome.command_status = Some(poll.summary.overall_status);
                outcome
            }
        }
    }

    /// 波次出现问题实例后的决定
    async fn decide(&self, ctx: &CorrelationContext, execution: &Execution, wave: &WaveResult) -> GateVerdict {
        let reason = format!(
            "{} problematic instances in wave {}",
            wave.problematic_instances, wave.index
        );

        let gate = match (&self.gate, self.settings.abort_policy) {
            (Some(gate), AbortPolicy::RequireApproval) => gate,
            _ => {
                tracing::warn!(wave = wave.index, %reason, "Halting execution");
                return GateVerdict::Stop(ExecutionStatus::Aborted { reason });
            }
        };

        let token = format!("{}:wave-{}:{}", execution.id, wave.index, Uuid::new_v4().simple());
        let receiver = self.continuations.register(&token);
        self.set_status(&execution.id, ExecutionStatus::AwaitingApproval { wave: wave.index });

        let request = ApprovalRequest {
            execution_id: execution.id.clone(),
            continuation_token: token.clone(),
            subject: None,
            details: Some(issue_details(wave)),
            estimated_duration_minutes: None,
        };
        if let Err(e) = gate.request_approval(ctx, request).await {
            self.continuations.cancel(&token);
            tracing::error!(error = %e, "Failed to request approval");
            return GateVerdict::Stop(ExecutionStatus::Failed {
                reason: format!("approval request failed: {}", e),
            });
        }

        tracing::info!(wave = wave.index, "Awaiting approval");
        match tokio::time::timeout(gate.expiry(), receiver).await {
            Ok(Ok(ContinuationOutcome::Success { .. })) => {
                tracing::info!(wave = wave.index, "Approval granted, continuing");
                GateVerdict::Continue
            }
            Ok(Ok(ContinuationOutcome::Failure { error, cause })) => {
                tracing::warn!(wave = wave.index, %error, "Approval rejected");
                GateVerdict::Stop(ExecutionStatus::Aborted { reason: cause })
            }
            Ok(Err(_)) => GateVerdict::Stop(ExecutionStatus::Aborted {
                reason: "approval channel closed".to_string(),
            }),
            Err(_) => {
                self.continuations.cancel(&token);
                tracing::warn!(wave = wave.index, "Approval window elapsed");
                GateVerdict::Stop(ExecutionStatus::Aborted {
                    reason: "approval expired".to_string(),
                })
            }
        }
    }

    fn set_status(&self, execution_id: &str, status: ExecutionStatus) {
        self.statuses.insert(execution_id.to_string(), status);
    }
}

fn failed_outcome(target: &Target, command_id: Option<String>, error: &AppError) -> TargetOutcome {
    tracing::error!(target = %target, error = %error, "Target pipeline failed");
    TargetOutcome {
        target: target.clone(),
        command_id,
        command_status: None,
        report: None,
        error: Some(error.to_string()),
        error_type: Some(error.error_type().to_string()),
    }
}

fn issue_details(wave: &WaveResult) -> String {
    let mut lines = vec![format!(
        "Wave {}: {} problematic instances",
        wave.index, wave.problematic_instances
    )];
    for outcome in &wave.outcomes {
        if let Some(report) = outcome.report.as_ref().filter(|r| r.has_issues()) {
            lines.push(format!("- {}: {}", outcome.target, report.analysis));
        }
    }
    lines.join("\n")
}
