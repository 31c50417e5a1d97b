//! 凭证、下发与轮询集成测试

use patch_orchestrator::{
    cloud::memory::{RoleSetup, SendFailure},
    cloud::SimulatedCloud,
    config::{DispatchConfig, PollerConfig},
    context::CorrelationContext,
    error::AppError,
    models::command::{InvocationStatus, OverallStatus},
    models::target::Target,
    repository::{MemoryBlobStore, MemoryRecordStore},
    retry::RetryPolicy,
    services::{CommandDispatcher, CompletionPoller, CredentialBroker, DispatchParams, VerificationService},
};
use std::sync::Arc;

mod common;
use common::patch_state;

fn dispatch_config() -> DispatchConfig {
    DispatchConfig {
        document_name: "AWS-RunPatchBaseline".to_string(),
        max_concurrency: "10%".to_string(),
        max_errors: "1".to_string(),
        role_name: "PatchExecRole".to_string(),
        external_id: None,
        session_duration_secs: 3600,
    }
}

struct Harness {
    cloud: Arc<SimulatedCloud>,
    broker: CredentialBroker,
    dispatcher: CommandDispatcher,
    poller: CompletionPoller,
}

fn harness(cloud: SimulatedCloud) -> Harness {
    let cloud = Arc::new(cloud);
    let retry = RetryPolicy::immediate(3);
    Harness {
        broker: CredentialBroker::new(cloud.clone(), retry.clone(), &dispatch_config()),
        dispatcher: CommandDispatcher::new(cloud.clone(), retry.clone(), dispatch_config()),
        poller: CompletionPoller::new(
            cloud.clone(),
            retry,
            &PollerConfig {
                interval_secs: 0,
                max_polls: 3,
            },
        ),
        cloud,
    }
}

#[tokio::test]
async fn test_lost_response_does_not_duplicate_command() {
    let h = harness(SimulatedCloud::new());
    let ctx = CorrelationContext::for_execution("exec-idem");
    let target = Target::parse("123456789012", "us-east-1").unwrap();
    h.cloud.assign_command_id(&target, "cmd-1");
    h.cloud.fail_next_send(
        &target,
        SendFailure::CreatedButLost {
            code: "ServiceUnavailable".into(),
        },
    );

    let credentials = h.broker.assume_for_account(&ctx, &target.account_id, None).await.unwrap();
    let command_id = h
        .dispatcher
        .dispatch(&ctx, &credentials, &target, DispatchParams::default())
        .await
        .unwrap();

    assert_eq!(command_id, "cmd-1");
    assert_eq!(h.cloud.send_calls(&target), 1);
    assert_eq!(h.cloud.command_count(&target), 1);
}

#[tokio::test]
async fn test_rejected_send_is_retried() {
    let h = harness(SimulatedCloud::new());
    let ctx = CorrelationContext::for_execution("exec-retry");
    let target = Target::parse("123456789012", "us-east-1").unwrap();
    h.cloud.fail_next_send(
        &target,
        SendFailure::Rejected {
            code: "ThrottlingException".into(),
        },
    );

    let credentials = h.broker.assume_for_account(&ctx, &target.account_id, None).await.unwrap();
    h.dispatcher
        .dispatch(&ctx, &credentials, &target, DispatchParams::default())
        .await
        .unwrap();

    assert_eq!(h.cloud.send_calls(&target), 2);
    assert_eq!(h.cloud.command_count(&target), 1);
}

#[tokio::test]
async fn test_invalid_parameter_is_not_retried() {
    let h = harness(SimulatedCloud::new());
    let ctx = CorrelationContext::new();
    let target = Target::parse("123456789012", "us-east-1").unwrap();
    h.cloud.fail_next_send(
        &target,
        SendFailure::Rejected {
            code: "InvalidParameterValue".into(),
        },
    );

    let credentials = h.broker.assume_for_account(&ctx, &target.account_id, None).await.unwrap();
    let err = h
        .dispatcher
        .dispatch(&ctx, &credentials, &target, DispatchParams::default())
        .await
        .unwrap_err();

    assert!(matches!(err, AppError::Remote { ref code, .. } if code == "InvalidParameterValue"));
    assert_eq!(h.cloud.send_calls(&target), 1);
}

#[tokio::test]
async fn test_credentials_bound_to_their_account() {
    let h = harness(SimulatedCloud::new());
    let ctx = CorrelationContext::new();
    let mine = Target::parse("111111111111", "us-east-1").unwrap();
    let other = Target::parse("222222222222", "us-east-1").unwrap();

    let credentials = h.broker.assume_for_account(&ctx, &mine.account_id, None).await.unwrap();
    let err = h
        .dispatcher
        .dispatch(&ctx, &credentials, &other, DispatchParams::default())
        .await
        .unwrap_err();

    assert!(matches!(err, AppError::Validation(_)));
    assert_eq!(h.cloud.send_calls(&other), 0);
}

#[tokio::test]
async fn test_untrusted_role_fails_fast() {
    let h = harness(SimulatedCloud::new());
    h.cloud.set_role("123456789012", RoleSetup::Untrusted);
    let target = Target::parse("123456789012", "us-east-1").unwrap();

    let err = h
        .broker
        .assume_for_account(&CorrelationContext::new(), &target.account_id, None)
        .await
        .unwrap_err();

    assert!(matches!(err, AppError::AccessDenied(_)));
    assert_eq!(h.cloud.assume_calls(), 1);
}

#[tokio::test]
async fn test_poll_aggregates_across_pages() {
    let h = harness(SimulatedCloud::new().with_page_size(2));
    let ctx = CorrelationContext::new();
    let target = Target::parse("123456789012", "us-east-1").unwrap();
    h.cloud.script_invocations(
        &target,
        vec![vec![
            ("i-1", InvocationStatus::Success),
            ("i-2", InvocationStatus::Success),
            ("i-3", InvocationStatus::Failed),
            ("i-4", InvocationStatus::Success),
            ("i-5", InvocationStatus::InProgress),
        ]],
    );

    let credentials = h.broker.assume_for_account(&ctx, &target.account_id, None).await.unwrap();
    let command_id = h
        .dispatcher
        .dispatch(&ctx, &credentials, &target, DispatchParams::default())
        .await
        .unwrap();
    let result = h
        .poller
        .poll(&ctx, &credentials, &target.region, &command_id)
        .await
        .unwrap();

    assert!(!result.all_done);
    assert_eq!(result.summary.total, 5);
    assert_eq!(result.summary.completed, 4);
    assert_eq!(result.summary.failed, 1);
    assert_eq!(result.per_instance.len(), 5);
}

#[tokio::test]
async fn test_repeated_poll_of_terminal_command_is_stable() {
    let h = harness(SimulatedCloud::new());
    let ctx = CorrelationContext::new();
    let target = Target::parse("123456789012", "us-east-1").unwrap();
    h.cloud.script_invocations(
        &target,
        vec![vec![("i-1", InvocationStatus::Success), ("i-2", InvocationStatus::Success)]],
    );

    let credentials = h.broker.assume_for_account(&ctx, &target.account_id, None).await.unwrap();
    let command_id = h
        .dispatcher
        .dispatch(&ctx, &credentials, &target, DispatchParams::default())
        .await
        .unwrap();

    let first = h.poller.poll(&ctx, &credentials, &target.region, &command_id).await.unwrap();
    let second = h.poller.poll(&ctx, &credentials, &target.region, &command_id).await.unwrap();

    assert!(first.all_done);
    assert_eq!(first.summary.overall_status, OverallStatus::AllSuccess);
    assert_eq!(first.summary.success_rate, second.summary.success_rate);
    assert_eq!(first.summary.overall_status, second.summary.overall_status);
}

#[tokio::test]
async fn test_poll_budget_exhaustion_times_out() {
    let h = harness(SimulatedCloud::new());
    let ctx = CorrelationContext::new();
    let target = Target::parse("123456789012", "us-east-1").unwrap();
    h.cloud
        .script_invocations(&target, vec![vec![("i-1", InvocationStatus::InProgress)]]);

    let mut session = h.broker.open_session(&ctx, &target.account_id, None).await.unwrap();
    let command_id = h
        .dispatcher
        .dispatch(&ctx, session.credentials(), &target, DispatchParams::default())
        .await
        .unwrap();
    let err = h
        .poller
        .poll_until_complete(&ctx, &mut session, &target.region, &command_id)
        .await
        .unwrap_err();

    assert!(matches!(err, AppError::Timeout(_)));
}

fn verification_service(cloud: Arc<SimulatedCloud>) -> VerificationService {
    let broker = Arc::new(CredentialBroker::new(
        cloud.clone(),
        RetryPolicy::immediate(1),
        &dispatch_config(),
    ));
    VerificationService::new(
        broker,
        cloud,
        RetryPolicy::immediate(1),
        Arc::new(MemoryBlobStore::new()),
        Arc::new(MemoryRecordStore::new()),
        90,
    )
}

#[tokio::test]
async fn test_patch_states_gathered_across_pages() {
    let h = harness(SimulatedCloud::new().with_page_size(2));
    let ctx = CorrelationContext::new();
    let target = Target::parse("123456789012", "us-east-1").unwrap();
    h.cloud.set_patch_states(
        &target,
        (1..=5).map(|i| patch_state(&format!("i-{}", i), 0, 0)).collect(),
    );

    let credentials = h.broker.assume_for_account(&ctx, &target.account_id, None).await.unwrap();
    let states = verification_service(h.cloud.clone())
        .fetch_patch_states(&ctx, &credentials, &target.region)
        .await
        .unwrap();

    assert_eq!(states.len(), 5);
    assert_eq!(states[4].instance_id, "i-5");
}

#[tokio::test]
async fn test_endless_patch_state_pages_are_cut_off() {
    let h = harness(SimulatedCloud::new().with_page_size(1));
    let ctx = CorrelationContext::new();
    let target = Target::parse("123456789012", "us-east-1").unwrap();
    h.cloud.set_patch_states(
        &target,
        (0..1001).map(|i| patch_state(&format!("i-{}", i), 0, 0)).collect(),
    );

    let credentials = h.broker.assume_for_account(&ctx, &target.account_id, None).await.unwrap();
    let err = verification_service(h.cloud.clone())
        .fetch_patch_states(&ctx, &credentials, &target.region)
        .await
        .unwrap_err();

    assert!(matches!(err, AppError::Remote { ref code, .. } if code == "PaginationLimitExceeded"));
}
