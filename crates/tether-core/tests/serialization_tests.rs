//! Wire format tests for tether-core types.

use chrono::Utc;
use pretty_assertions::assert_eq;
use serde_json::json;
use tether_core::agent::*;
use tether_core::ids::*;
use tether_core::task::*;

#[test]
fn test_task_event_wire_names() {
    let event = TaskEvent::assign("task-1", "acc-1");
    let value = serde_json::to_value(&event).expect("serialize");
    assert_eq!(
        value,
        json!({
            "eventType": "DelegateTaskEvent",
            "delegateTaskId": "task-1",
            "accountId": "acc-1"
        })
    );

    let abort: TaskEvent = serde_json::from_str(
        r#"{"eventType":"DelegateTaskAbortEvent","delegateTaskId":"task-2","accountId":"acc-1"}"#,
    )
    .expect("deserialize");
    assert_eq!(abort.kind, TaskEventKind::Abort);
    assert_eq!(abort.task_id, TaskId::from("task-2"));
}

#[test]
fn test_task_events_response_defaults_to_empty() {
    let response: TaskEventsResponse = serde_json::from_str("{}").expect("deserialize");
    assert!(response.events.is_empty());
}

#[test]
fn test_task_package_minimal_payload() {
    let package: TaskPackage = serde_json::from_value(json!({
        "delegateTaskId": "task-9",
        "accountId": "acc-1",
        "data": {
            "taskType": "SHELL_SCRIPT_TASK_NG",
            "parameters": { "script": "echo hi" }
        }
    }))
    .expect("deserialize");

    let data = package.data.expect("data");
    assert_eq!(data.task_type, "SHELL_SCRIPT_TASK_NG");
    assert_eq!(data.timeout_ms, 600_000);
    assert!(!data.is_async);
    assert!(package.secrets.is_empty());
    assert!(package.target_instance_id.is_none());

    let params: ScriptParameters = serde_json::from_value(data.parameters).expect("params");
    assert_eq!(params.script, "echo hi");
    assert!(params.working_directory.is_none());
}

#[test]
fn test_task_package_targeted_instance() {
    let instance = InstanceId::new();
    let package: TaskPackage = serde_json::from_value(json!({
        "delegateTaskId": "task-9",
        "accountId": "acc-1",
        "data": null,
        "delegateInstanceId": instance.as_uuid().to_string(),
    }))
    .expect("deserialize");
    assert_eq!(
        package.target_instance_id.as_deref(),
        Some(instance.as_uuid().to_string().as_str())
    );
    assert!(package.is_for_instance(&instance));
}

#[test]
fn test_task_package_blank_instance_is_unset() {
    let package: TaskPackage = serde_json::from_value(json!({
        "delegateTaskId": "task-9",
        "accountId": "acc-1",
        "data": null,
        "delegateInstanceId": "",
    }))
    .expect("deserialize");
    assert_eq!(package.target_instance_id, None);
    assert!(package.is_for_instance(&InstanceId::new()));
}

#[test]
fn test_task_package_foreign_instance_is_kept_opaque() {
    let package: TaskPackage = serde_json::from_value(json!({
        "delegateTaskId": "task-9",
        "accountId": "acc-1",
        "data": null,
        "delegateInstanceId": "delegate-host-2",
    }))
    .expect("deserialize");
    assert_eq!(package.target_instance_id.as_deref(), Some("delegate-host-2"));
    assert!(!package.is_for_instance(&InstanceId::new()));
}

#[test]
fn test_task_outcome_is_tagged() {
    let outcome = TaskOutcome::StepException {
        message: "exit status 2".to_string(),
        exit_code: Some(2),
    };
    let value = serde_json::to_value(&outcome).expect("serialize");
    assert_eq!(
        value,
        json!({ "type": "step_exception", "message": "exit status 2", "exit_code": 2 })
    );
    assert_eq!(outcome.kind(), "step_exception");
    assert!(!outcome.is_success());
}

#[test]
fn test_task_result_carries_outcome() {
    let result = TaskResult {
        task_id: TaskId::from("task-1"),
        account_id: AccountId::from("acc-1"),
        outcome: TaskOutcome::TimedOut { timeout_ms: 1000 },
        duration_ms: 31_000,
        completed_at: Utc::now(),
    };
    let value = serde_json::to_value(&result).expect("serialize");
    assert_eq!(value["taskId"], "task-1");
    assert_eq!(value["outcome"]["type"], "timed_out");
    assert_eq!(value["durationMs"], 31_000);
}

#[test]
fn test_heartbeat_response_status() {
    let response: HeartbeatResponse =
        serde_json::from_str(r#"{"agentId":"agent-1","status":"DELETED"}"#).expect("deserialize");
    assert_eq!(response.status, InstanceStatus::Deleted);

    let waiting: HeartbeatResponse =
        serde_json::from_str(r#"{"agentId":"agent-1","status":"WAITING_FOR_APPROVAL"}"#)
            .expect("deserialize");
    assert_eq!(waiting.status, InstanceStatus::WaitingForApproval);
}

#[test]
fn test_registration_draft_becomes_identity() {
    let draft = RegistrationDraft {
        account_id: AccountId::from("acc-1"),
        name: "runner-a".to_string(),
        host_name: "host-a".to_string(),
        ip: "10.0.0.4".to_string(),
        group_name: None,
        group_id: Some(GroupId::from("grp-1")),
        org_identifier: None,
        project_identifier: None,
        tags: vec!["linux".to_string()],
        agent_type: "DOCKER".to_string(),
        version: "1.0.0".to_string(),
        instance_id: InstanceId::new(),
        connection_id: ConnectionId::new(),
        supported_task_types: vec![TaskType::Script, TaskType::ShellScriptTaskNg],
        polling_mode_enabled: true,
        token_name: None,
    };

    let value = serde_json::to_value(&draft).expect("serialize");
    assert_eq!(value["supportedTaskTypes"], json!(["SCRIPT", "SHELL_SCRIPT_TASK_NG"]));
    assert_eq!(value["pollingModeEnabled"], true);

    let instance = draft.instance_id;
    let identity = draft.into_identity(AgentId::from("agent-7"));
    assert_eq!(identity.agent_id.as_str(), "agent-7");
    assert_eq!(identity.instance_id, instance);
    assert_eq!(identity.capabilities.len(), 2);
    assert_eq!(identity.group_id, Some(GroupId::from("grp-1")));
}
