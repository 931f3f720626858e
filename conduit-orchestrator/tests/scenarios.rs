//! End-to-end scenarios driven through the public orchestrator API

mod common;

use common::{FakeProvider, dispatch, harness, harness_with, request, status, test_config};
use conduit_core::domain::execution::{Execution, ExecutionState, FailureCategory};
use conduit_core::domain::provider::{ConnectionState, HealthStatus, PipelineType};
use conduit_core::domain::stage::{Stage, StageState};
use conduit_core::domain::template::PipelineConfig;
use conduit_core::dto::execution::{ExecutionFilter, Pagination, PipelineSource};
use conduit_core::dto::provider::{CancelAck, ProviderStatus, RemoteState};
use conduit_core::dto::statistics::TimeRange;
use conduit_orchestrator::provider::ProviderSettings;
use conduit_orchestrator::store::{ExecutionStore, MemoryStore};
use conduit_orchestrator::{OrchestratorError, ProviderError, Recovery};
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

fn stage(name: &str, state: StageState) -> Stage {
    Stage {
        state,
        ..Stage::pending(name)
    }
}

fn report(stages: Vec<Stage>, overall: RemoteState) -> ProviderStatus {
    ProviderStatus { stages, overall }
}

#[tokio::test]
async fn test_dispatches_to_healthy_capable_provider() {
    let jenkins = FakeProvider::new("jenkins", &[PipelineType::FullCicd]);
    let gitlab = FakeProvider::new("gitlab", &[PipelineType::FullCicd]);
    gitlab.set_healthy(false);

    let h = harness(&[
        (jenkins.clone(), ProviderSettings::default()),
        (gitlab.clone(), ProviderSettings::default()),
    ]);
    let results = h.orchestrator.check_providers_health().await;
    assert_eq!(results.len(), 2);

    let mut req = request(PipelineType::FullCicd);
    req.priority = Some(1);
    let response = h.orchestrator.execute_pipeline(req).await.unwrap();
    assert_eq!(response.state, ExecutionState::Queued);
    assert!(response.warnings.is_empty());

    dispatch(&h.orchestrator).await;

    let execution = status(&h.orchestrator, response.execution_id).await;
    assert_eq!(execution.state, ExecutionState::Assigned);
    assert_eq!(execution.priority, 1);
    assert_eq!(execution.provider.as_deref(), Some("jenkins"));
    assert_eq!(execution.dispatch_attempts, 1);
    assert_eq!(gitlab.submits(), 0);

    let providers = h.orchestrator.get_providers();
    let gitlab_summary = providers.iter().find(|p| p.name == "gitlab").unwrap();
    assert_eq!(gitlab_summary.health, HealthStatus::Unhealthy);
    assert_eq!(gitlab_summary.connection, ConnectionState::Connected);
}

#[tokio::test]
async fn test_default_threshold_tolerates_two_failed_checks() {
    let mut config = test_config();
    config.health_failure_threshold = conduit_orchestrator::Config::new("test".to_string())
        .health_failure_threshold;
    assert_eq!(config.health_failure_threshold, 3);

    let jenkins = FakeProvider::new("jenkins", &[PipelineType::FullCicd]);
    let h = harness_with(
        config,
        &[(jenkins.clone(), ProviderSettings::default())],
        Arc::new(MemoryStore::new()),
    );
    h.orchestrator.check_providers_health().await;

    jenkins.set_reachable(false);
    h.orchestrator.check_providers_health().await;
    h.orchestrator.check_providers_health().await;

    let summary = h.orchestrator.get_providers().remove(0);
    assert_eq!(summary.health, HealthStatus::Healthy);
    assert_eq!(summary.connection, ConnectionState::Connected);

    let first = h
        .orchestrator
        .execute_pipeline(request(PipelineType::FullCicd))
        .await
        .unwrap()
        .execution_id;
    dispatch(&h.orchestrator).await;
    assert_eq!(status(&h.orchestrator, first).await.state, ExecutionState::Assigned);

    // Third consecutive failure crosses the threshold
    h.orchestrator.check_providers_health().await;
    let summary = h.orchestrator.get_providers().remove(0);
    assert_eq!(summary.health, HealthStatus::Unhealthy);
    assert_eq!(summary.connection, ConnectionState::Disconnected);

    let second = h
        .orchestrator
        .execute_pipeline(request(PipelineType::FullCicd))
        .await
        .unwrap()
        .execution_id;
    dispatch(&h.orchestrator).await;
    assert_eq!(status(&h.orchestrator, second).await.state, ExecutionState::Queued);
    assert_eq!(jenkins.submits(), 1);
}

#[tokio::test]
async fn test_invalid_template_parameters_create_nothing() {
    let h = harness(&[]);

    let mut req = request(PipelineType::FullCicd);
    req.pipeline = PipelineSource::Template("nodejs-basic".to_string());
    req.parameters = HashMap::from([("branch".to_string(), json!("main"))]);

    let err = h.orchestrator.execute_pipeline(req).await.unwrap_err();
    match err {
        OrchestratorError::ParameterValidation(message) => assert!(message.contains("language")),
        other => panic!("unexpected error: {other:?}"),
    }

    let page = h
        .orchestrator
        .list_executions(&ExecutionFilter::default(), Pagination::default())
        .await
        .unwrap();
    assert_eq!(page.total, 0);
    assert!(h.orchestrator.queued().is_empty());
}

#[tokio::test]
async fn test_template_resolution_reaches_provider() {
    let jenkins = FakeProvider::new("jenkins", &[PipelineType::FullCicd]);
    let h = harness(&[(jenkins, ProviderSettings::default())]);
    h.orchestrator.check_providers_health().await;

    let mut req = request(PipelineType::BuildOnly);
    req.pipeline = PipelineSource::Template("nodejs-basic".to_string());
    req.parameters = HashMap::from([("language".to_string(), json!("typescript"))]);

    let response = h.orchestrator.execute_pipeline(req).await.unwrap();
    dispatch(&h.orchestrator).await;

    let execution = status(&h.orchestrator, response.execution_id).await;
    assert_eq!(execution.template_id.as_deref(), Some("nodejs-basic"));
    assert_eq!(execution.config.template_version, Some(1));
    assert_eq!(execution.config.settings["lint"], json!("typescript"));
    assert_eq!(execution.state, ExecutionState::Assigned);
}

#[tokio::test]
async fn test_request_validation() {
    let h = harness(&[]);

    let mut req = request(PipelineType::FullCicd);
    req.repository = "  ".to_string();
    assert!(matches!(
        h.orchestrator.execute_pipeline(req).await,
        Err(OrchestratorError::Validation(_))
    ));

    let mut req = request(PipelineType::FullCicd);
    req.priority = Some(101);
    assert!(matches!(
        h.orchestrator.execute_pipeline(req).await,
        Err(OrchestratorError::Validation(_))
    ));

    let mut req = request(PipelineType::FullCicd);
    req.pipeline = PipelineSource::Template("missing".to_string());
    assert!(matches!(
        h.orchestrator.execute_pipeline(req).await,
        Err(OrchestratorError::TemplateNotFound(_))
    ));
}

#[tokio::test]
async fn test_no_capable_provider_stays_queued_with_warning() {
    let jenkins = FakeProvider::new("jenkins", &[PipelineType::BuildOnly]);
    let h = harness(&[(jenkins.clone(), ProviderSettings::default())]);
    h.orchestrator.check_providers_health().await;

    let response = h
        .orchestrator
        .execute_pipeline(request(PipelineType::DeployOnly))
        .await
        .unwrap();
    assert_eq!(response.warnings.len(), 1);

    dispatch(&h.orchestrator).await;

    let execution = status(&h.orchestrator, response.execution_id).await;
    assert_eq!(execution.state, ExecutionState::Queued);
    assert_eq!(jenkins.submits(), 0);
    assert_eq!(h.orchestrator.queued().len(), 1);
}

#[tokio::test]
async fn test_transient_submit_failures_are_retried() {
    let jenkins = FakeProvider::new("jenkins", &[PipelineType::FullCicd]);
    jenkins.script_submits(vec![
        Err(ProviderError::Unreachable("connection refused".to_string())),
        Err(ProviderError::Unreachable("connection refused".to_string())),
        Ok("build-42".to_string()),
    ]);
    let h = harness(&[(jenkins.clone(), ProviderSettings::default())]);
    h.orchestrator.check_providers_health().await;

    let response = h
        .orchestrator
        .execute_pipeline(request(PipelineType::FullCicd))
        .await
        .unwrap();
    dispatch(&h.orchestrator).await;

    let execution = status(&h.orchestrator, response.execution_id).await;
    assert_eq!(execution.state, ExecutionState::Assigned);
    assert_eq!(execution.provider_ref.as_deref(), Some("build-42"));
    assert_eq!(execution.dispatch_attempts, 3);
    assert_eq!(jenkins.submits(), 3);

    let stored = h
        .store
        .get_execution(response.execution_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored.dispatch_attempts, 3);
}

#[tokio::test]
async fn test_exhausted_dispatch_fails_with_rejection() {
    let jenkins = FakeProvider::new("jenkins", &[PipelineType::FullCicd]);
    jenkins.fail_submits_with(ProviderError::Rejected("quota exceeded".to_string()));
    let h = harness(&[(jenkins.clone(), ProviderSettings::default())]);
    h.orchestrator.check_providers_health().await;

    let response = h
        .orchestrator
        .execute_pipeline(request(PipelineType::FullCicd))
        .await
        .unwrap();
    dispatch(&h.orchestrator).await;

    let execution = status(&h.orchestrator, response.execution_id).await;
    assert_eq!(execution.state, ExecutionState::Failed);
    assert_eq!(execution.provider, None);
    assert_eq!(execution.dispatch_attempts, 4);
    assert_eq!(jenkins.submits(), 4);

    let failure = execution.failure.unwrap();
    assert_eq!(failure.category, FailureCategory::ProviderRejected);
    assert!(failure.reason.contains("jenkins"));

    // The slot is released again
    let summary = h.orchestrator.registry().summary("jenkins").unwrap();
    assert_eq!(summary.in_flight, 0);
}

#[tokio::test]
async fn test_stages_drive_execution_to_completion() {
    let jenkins = FakeProvider::new("jenkins", &[PipelineType::FullCicd]);
    let h = harness(&[(jenkins.clone(), ProviderSettings::default())]);
    h.orchestrator.check_providers_health().await;

    let id = h
        .orchestrator
        .execute_pipeline(request(PipelineType::FullCicd))
        .await
        .unwrap()
        .execution_id;
    dispatch(&h.orchestrator).await;

    jenkins.set_status(Ok(report(
        vec![stage("build", StageState::Running), stage("deploy", StageState::Pending)],
        RemoteState::Running,
    )));
    h.orchestrator.poll_executions().await;
    assert_eq!(status(&h.orchestrator, id).await.state, ExecutionState::Running);

    let state = h
        .orchestrator
        .report_stage_update(
            id,
            report(
                vec![
                    stage("build", StageState::Completed),
                    stage("deploy", StageState::Completed),
                ],
                RemoteState::Completed,
            ),
        )
        .await
        .unwrap();
    assert_eq!(state, ExecutionState::Completed);

    let execution = status(&h.orchestrator, id).await;
    assert_eq!(execution.state, ExecutionState::Completed);
    let names: Vec<_> = execution.stages.iter().map(|s| s.name.as_str()).collect();
    assert_eq!(names, vec!["build", "deploy"]);
    assert!(execution.completed_at.is_some());

    let summary = h.orchestrator.registry().summary("jenkins").unwrap();
    assert_eq!(summary.in_flight, 0);
    assert_eq!(summary.counters.successful, 1);

    let stats = h
        .orchestrator
        .get_statistics(TimeRange::last(chrono::Duration::hours(1)))
        .await
        .unwrap();
    assert_eq!(stats.overview.completed, 1);
    assert_eq!(stats.overview.success_rate, Some(1.0));
    assert_eq!(stats.by_provider.len(), 1);
    assert_eq!(stats.by_provider[0].key.as_deref(), Some("jenkins"));
}

#[tokio::test]
async fn test_repeated_identical_status_changes_nothing() {
    let jenkins = FakeProvider::new("jenkins", &[PipelineType::FullCicd]);
    let h = harness(&[(jenkins.clone(), ProviderSettings::default())]);
    h.orchestrator.check_providers_health().await;

    let id = h
        .orchestrator
        .execute_pipeline(request(PipelineType::FullCicd))
        .await
        .unwrap()
        .execution_id;
    dispatch(&h.orchestrator).await;

    jenkins.set_status(Ok(report(
        vec![stage("build", StageState::Running)],
        RemoteState::Running,
    )));
    h.orchestrator.poll_executions().await;
    let first = status(&h.orchestrator, id).await;
    let logged = h.store.stage_log_len(id).await;

    h.orchestrator.poll_executions().await;
    let second = status(&h.orchestrator, id).await;

    assert_eq!(first.state, second.state);
    assert_eq!(first.stages, second.stages);
    assert_eq!(h.store.stage_log_len(id).await, logged);
}

#[tokio::test]
async fn test_provider_failure_is_reported_verbatim() {
    let jenkins = FakeProvider::new("jenkins", &[PipelineType::FullCicd]);
    let h = harness(&[(jenkins.clone(), ProviderSettings::default())]);
    h.orchestrator.check_providers_health().await;

    let id = h
        .orchestrator
        .execute_pipeline(request(PipelineType::FullCicd))
        .await
        .unwrap()
        .execution_id;
    dispatch(&h.orchestrator).await;

    jenkins.set_status(Ok(report(
        vec![stage("test", StageState::Failed)],
        RemoteState::Failed {
            reason: "3 tests failed".to_string(),
        },
    )));
    h.orchestrator.poll_executions().await;

    let execution = status(&h.orchestrator, id).await;
    assert_eq!(execution.state, ExecutionState::Failed);
    let failure = execution.failure.unwrap();
    assert_eq!(failure.category, FailureCategory::ProviderReportedFailure);
    assert_eq!(failure.reason, "3 tests failed");
}

#[tokio::test]
async fn test_stop_running_then_late_completion_is_discarded() {
    let jenkins = FakeProvider::new("jenkins", &[PipelineType::FullCicd]);
    jenkins.set_cancel(Ok(CancelAck::NotRunning));
    let h = harness(&[(jenkins.clone(), ProviderSettings::default())]);
    h.orchestrator.check_providers_health().await;

    let id = h
        .orchestrator
        .execute_pipeline(request(PipelineType::FullCicd))
        .await
        .unwrap()
        .execution_id;
    dispatch(&h.orchestrator).await;
    h.orchestrator
        .report_stage_update(id, report(vec![stage("build", StageState::Running)], RemoteState::Running))
        .await
        .unwrap();

    let ack = h.orchestrator.stop_execution(id).await.unwrap();
    assert_eq!(ack.state, ExecutionState::Cancelled);
    assert_eq!(ack.provider_ack, Some(CancelAck::NotRunning));
    assert_eq!(jenkins.cancels(), 1);

    let state = h
        .orchestrator
        .report_stage_update(
            id,
            report(vec![stage("build", StageState::Completed)], RemoteState::Completed),
        )
        .await
        .unwrap();
    assert_eq!(state, ExecutionState::Cancelled);

    let execution = status(&h.orchestrator, id).await;
    assert_eq!(execution.state, ExecutionState::Cancelled);
    assert_eq!(execution.stages[0].state, StageState::Running);

    assert!(matches!(
        h.orchestrator.stop_execution(id).await,
        Err(OrchestratorError::AlreadyTerminal {
            state: ExecutionState::Cancelled,
            ..
        })
    ));
}

#[tokio::test]
async fn test_stop_tolerates_provider_without_cancel() {
    let jenkins = FakeProvider::new("jenkins", &[PipelineType::FullCicd]);
    jenkins.set_cancel(Err(ProviderError::CancelUnsupported(
        "read-only backend".to_string(),
    )));
    let h = harness(&[(jenkins.clone(), ProviderSettings::default())]);
    h.orchestrator.check_providers_health().await;

    let id = h
        .orchestrator
        .execute_pipeline(request(PipelineType::FullCicd))
        .await
        .unwrap()
        .execution_id;
    dispatch(&h.orchestrator).await;

    let ack = h.orchestrator.stop_execution(id).await.unwrap();
    assert_eq!(ack.state, ExecutionState::Cancelled);
    assert_eq!(ack.provider_ack, None);
}

#[tokio::test]
async fn test_stop_during_submit_cancels_accepted_job_once() {
    let jenkins = FakeProvider::new("jenkins", &[PipelineType::FullCicd]);
    let h = harness(&[(jenkins.clone(), ProviderSettings::default())]);
    h.orchestrator.check_providers_health().await;
    let gate = jenkins.hold_submits();

    let id = h
        .orchestrator
        .execute_pipeline(request(PipelineType::FullCicd))
        .await
        .unwrap()
        .execution_id;
    let handles = h.orchestrator.dispatch_cycle();
    jenkins.submit_started().await;

    let ack = h.orchestrator.stop_execution(id).await.unwrap();
    assert_eq!(ack.state, ExecutionState::Queued);
    assert_eq!(ack.provider_ack, None);

    // The provider accepts after the stop arrived
    gate.notify_one();
    for handle in handles {
        handle.await.unwrap();
    }

    let execution = status(&h.orchestrator, id).await;
    assert_eq!(execution.state, ExecutionState::Cancelled);
    assert_eq!(jenkins.submits(), 1);
    assert_eq!(jenkins.cancels(), 1);
    assert_eq!(h.orchestrator.get_providers()[0].in_flight, 0);

    assert!(matches!(
        h.orchestrator.stop_execution(id).await,
        Err(OrchestratorError::AlreadyTerminal { .. })
    ));
    assert_eq!(jenkins.cancels(), 1);
}

#[tokio::test]
async fn test_stop_between_submit_attempts_skips_retry() {
    let jenkins = FakeProvider::new("jenkins", &[PipelineType::FullCicd]);
    jenkins.script_submits(vec![Err(ProviderError::Unreachable(
        "connection reset".to_string(),
    ))]);
    let h = harness(&[(jenkins.clone(), ProviderSettings::default())]);
    h.orchestrator.check_providers_health().await;
    let gate = jenkins.hold_submits();

    let id = h
        .orchestrator
        .execute_pipeline(request(PipelineType::FullCicd))
        .await
        .unwrap()
        .execution_id;
    let handles = h.orchestrator.dispatch_cycle();
    jenkins.submit_started().await;

    let ack = h.orchestrator.stop_execution(id).await.unwrap();
    assert_eq!(ack.state, ExecutionState::Queued);

    gate.notify_one();
    for handle in handles {
        handle.await.unwrap();
    }

    let execution = status(&h.orchestrator, id).await;
    assert_eq!(execution.state, ExecutionState::Cancelled);
    assert!(execution.failure.is_none());
    assert_eq!(execution.dispatch_attempts, 1);
    assert_eq!(jenkins.submits(), 1);
    assert_eq!(jenkins.cancels(), 0);
    assert_eq!(h.orchestrator.get_providers()[0].in_flight, 0);
}

#[tokio::test]
async fn test_stop_queued_and_unknown() {
    let h = harness(&[]);

    let id = h
        .orchestrator
        .execute_pipeline(request(PipelineType::FullCicd))
        .await
        .unwrap()
        .execution_id;

    let ack = h.orchestrator.stop_execution(id).await.unwrap();
    assert_eq!(ack.state, ExecutionState::Cancelled);
    assert_eq!(ack.provider_ack, None);
    assert!(h.orchestrator.queued().is_empty());

    let stored = h.store.get_execution(id).await.unwrap().unwrap();
    assert_eq!(stored.state, ExecutionState::Cancelled);

    assert!(matches!(
        h.orchestrator.stop_execution(Uuid::new_v4()).await,
        Err(OrchestratorError::ExecutionNotFound(_))
    ));
    assert!(matches!(
        h.orchestrator.get_execution_status(Uuid::new_v4()).await,
        Err(OrchestratorError::ExecutionNotFound(_))
    ));
}

#[tokio::test]
async fn test_priority_then_fifo_order() {
    let h = harness(&[]);

    let mut ids = Vec::new();
    for priority in [50, 10, 50, 10] {
        let mut req = request(PipelineType::FullCicd);
        req.priority = Some(priority);
        ids.push(h.orchestrator.execute_pipeline(req).await.unwrap().execution_id);
    }

    let order: Vec<_> = h
        .orchestrator
        .queued()
        .iter()
        .map(|q| q.execution_id)
        .collect();
    assert_eq!(order, vec![ids[1], ids[3], ids[0], ids[2]]);
}

#[tokio::test]
async fn test_concurrency_cap_limits_dispatch() {
    let jenkins = FakeProvider::new("jenkins", &[PipelineType::FullCicd]);
    let h = harness(&[(
        jenkins.clone(),
        ProviderSettings {
            enabled: true,
            max_concurrent: Some(1),
        },
    )]);
    h.orchestrator.check_providers_health().await;

    let mut first = request(PipelineType::FullCicd);
    first.priority = Some(5);
    let first = h.orchestrator.execute_pipeline(first).await.unwrap().execution_id;
    let second = h
        .orchestrator
        .execute_pipeline(request(PipelineType::FullCicd))
        .await
        .unwrap()
        .execution_id;

    dispatch(&h.orchestrator).await;
    assert_eq!(status(&h.orchestrator, first).await.state, ExecutionState::Assigned);
    assert_eq!(status(&h.orchestrator, second).await.state, ExecutionState::Queued);

    h.orchestrator.stop_execution(first).await.unwrap();
    dispatch(&h.orchestrator).await;
    assert_eq!(status(&h.orchestrator, second).await.state, ExecutionState::Assigned);
}

#[tokio::test]
async fn test_preference_and_disabled_providers() {
    let jenkins = FakeProvider::new("jenkins", &[PipelineType::FullCicd]);
    let gitlab = FakeProvider::new("gitlab", &[PipelineType::FullCicd]);
    let h = harness(&[
        (jenkins.clone(), ProviderSettings::default()),
        (gitlab.clone(), ProviderSettings::default()),
    ]);
    h.orchestrator.check_providers_health().await;

    let mut req = request(PipelineType::FullCicd);
    req.provider_preference = Some("jenkins".to_string());
    let preferred = h.orchestrator.execute_pipeline(req).await.unwrap().execution_id;
    dispatch(&h.orchestrator).await;
    assert_eq!(
        status(&h.orchestrator, preferred).await.provider.as_deref(),
        Some("jenkins")
    );

    h.orchestrator.disable_provider("gitlab").unwrap();
    let next = h
        .orchestrator
        .execute_pipeline(request(PipelineType::FullCicd))
        .await
        .unwrap()
        .execution_id;
    dispatch(&h.orchestrator).await;
    assert_eq!(status(&h.orchestrator, next).await.provider.as_deref(), Some("jenkins"));
    assert_eq!(gitlab.submits(), 0);

    h.orchestrator.enable_provider("gitlab").unwrap();
    assert!(h.orchestrator.get_providers().iter().all(|p| p.enabled));
    assert!(matches!(
        h.orchestrator.enable_provider("circleci"),
        Err(OrchestratorError::ProviderNotFound(_))
    ));
}

#[tokio::test]
async fn test_recover_reloads_unfinished_executions() {
    let store = Arc::new(MemoryStore::new());
    let now = chrono::Utc::now();
    let base = Execution {
        id: Uuid::new_v4(),
        template_id: None,
        repository: "org/api".to_string(),
        branch: "main".to_string(),
        environment: "prod".to_string(),
        config: PipelineConfig::new(PipelineType::FullCicd),
        parameters: HashMap::new(),
        priority: 50,
        provider_preference: None,
        provider: None,
        provider_ref: None,
        state: ExecutionState::Queued,
        created_at: now,
        queued_at: now,
        started_at: None,
        completed_at: None,
        stages: Vec::new(),
        failure: None,
        dispatch_attempts: 0,
    };
    let queued = base.clone();
    let running = Execution {
        id: Uuid::new_v4(),
        provider: Some("jenkins".to_string()),
        provider_ref: Some("build-7".to_string()),
        state: ExecutionState::Running,
        started_at: Some(now),
        dispatch_attempts: 1,
        ..base.clone()
    };
    let done = Execution {
        id: Uuid::new_v4(),
        state: ExecutionState::Completed,
        ..base.clone()
    };
    for execution in [&queued, &running, &done] {
        store.create_execution(execution).await.unwrap();
    }

    let jenkins = FakeProvider::new("jenkins", &[PipelineType::FullCicd]);
    let h = harness_with(
        test_config(),
        &[(jenkins.clone(), ProviderSettings::default())],
        store,
    );

    let recovery = h.orchestrator.recover().await.unwrap();
    assert_eq!(
        recovery,
        Recovery {
            queued: 1,
            in_flight: 1
        }
    );
    assert_eq!(h.orchestrator.queued()[0].execution_id, queued.id);
    assert_eq!(
        h.orchestrator.registry().summary("jenkins").unwrap().in_flight,
        1
    );

    // Recovering twice does not duplicate anything
    assert_eq!(h.orchestrator.recover().await.unwrap(), Recovery::default());

    jenkins.set_status(Ok(report(
        vec![stage("build", StageState::Completed)],
        RemoteState::Completed,
    )));
    h.orchestrator.poll_executions().await;
    assert_eq!(
        status(&h.orchestrator, running.id).await.state,
        ExecutionState::Completed
    );
}

#[tokio::test]
async fn test_store_outage_does_not_lose_transitions() {
    let jenkins = FakeProvider::new("jenkins", &[PipelineType::FullCicd]);
    let h = harness(&[(jenkins.clone(), ProviderSettings::default())]);
    h.orchestrator.check_providers_health().await;

    let id = h
        .orchestrator
        .execute_pipeline(request(PipelineType::FullCicd))
        .await
        .unwrap()
        .execution_id;

    h.store.set_available(false);
    dispatch(&h.orchestrator).await;
    assert_eq!(status(&h.orchestrator, id).await.state, ExecutionState::Assigned);
    assert!(h.orchestrator.poll_executions().await > 0);

    h.store.set_available(true);
    assert_eq!(h.orchestrator.poll_executions().await, 0);
    let stored = h.store.get_execution(id).await.unwrap().unwrap();
    assert_eq!(stored.state, ExecutionState::Assigned);

    // Creating a record while the store is down is an internal error
    h.store.set_available(false);
    assert!(matches!(
        h.orchestrator.execute_pipeline(request(PipelineType::FullCicd)).await,
        Err(OrchestratorError::Internal(_))
    ));
}

#[tokio::test]
async fn test_background_loops_dispatch_and_finish() {
    let jenkins = FakeProvider::new("jenkins", &[PipelineType::FullCicd]);
    jenkins.set_status(Ok(report(
        vec![stage("build", StageState::Completed)],
        RemoteState::Completed,
    )));
    let h = harness(&[(jenkins.clone(), ProviderSettings::default())]);
    h.orchestrator.start();

    let id = h
        .orchestrator
        .execute_pipeline(request(PipelineType::FullCicd))
        .await
        .unwrap()
        .execution_id;

    let finished = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let execution = status(&h.orchestrator, id).await;
            if execution.is_terminal() {
                return execution;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("execution did not finish");

    h.orchestrator.shutdown().await;

    assert_eq!(finished.state, ExecutionState::Completed);
    assert_eq!(finished.provider.as_deref(), Some("jenkins"));
    assert!(h.store.health_log_len().await > 0);
}
