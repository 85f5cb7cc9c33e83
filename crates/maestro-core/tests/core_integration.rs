#![allow(clippy::unwrap_used, clippy::expect_used)]

use maestro_core::*;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// 1. Error Display
// ---------------------------------------------------------------------------

#[test]
fn error_display() {
    let id = Uuid::new_v4();
    assert_eq!(
        MaestroError::DuplicateTask(id).to_string(),
        format!("Duplicate task id: {id}")
    );
    assert_eq!(
        MaestroError::WorkflowNotFound("etl".into()).to_string(),
        "Workflow not found: etl"
    );
    assert_eq!(
        MaestroError::Agent("connector down".into()).to_string(),
        "Agent error: connector down"
    );

    let transition = MaestroError::InvalidTransition {
        id,
        from: "completed".into(),
        to: "running".into(),
    };
    assert!(transition.to_string().ends_with("completed -> running"));

    let started = MaestroError::AlreadyStarted {
        id,
        status: "running".into(),
    };
    assert_eq!(
        started.to_string(),
        format!("Execution {id} already started (status: running)")
    );
}

// ---------------------------------------------------------------------------
// 2. From impls
// ---------------------------------------------------------------------------

#[test]
fn error_from_impls() {
    let serde_err = serde_json::from_str::<serde_json::Value>("not json").unwrap_err();
    let err: MaestroError = serde_err.into();
    assert!(err.to_string().starts_with("JSON error:"));

    let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "workflow.toml");
    let err: MaestroError = io_err.into();
    assert!(err.to_string().starts_with("IO error:"));

    let err: MaestroError = ValidationError::NoEntryNodes.into();
    match err {
        MaestroError::Validation(errors) => assert_eq!(errors, vec![ValidationError::NoEntryNodes]),
        other => panic!("expected validation error, got {other:?}"),
    }
}

// ---------------------------------------------------------------------------
// 3. Validation messages name the offending nodes
// ---------------------------------------------------------------------------

#[test]
fn validation_messages() {
    let dangling = ValidationError::DanglingConnection {
        from: "a".into(),
        to: "ghost".into(),
        missing: "ghost".into(),
    };
    assert!(dangling.to_string().contains("'ghost'"));

    let orphans = ValidationError::DisconnectedNodes(vec!["x".into(), "y".into()]);
    assert_eq!(orphans.to_string(), "Multiple disconnected nodes: x, y");

    let config = ValidationError::InvalidNodeConfig {
        node: "check".into(),
        reason: "unexpected token".into(),
    };
    assert_eq!(
        config.to_string(),
        "Invalid config for node 'check': unexpected token"
    );
}
