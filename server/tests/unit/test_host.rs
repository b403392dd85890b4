//! Host deploy pipeline tests

use std::sync::atomic::Ordering;
use std::time::Duration;

use axum::http::StatusCode;
use swaphost::deploy::fsm::DeployState;
use swaphost::errors::HostError;
use swaphost::srvman::Color;

use crate::support::{Fixture, EMPTY_CONFIG};

#[tokio::test]
async fn test_no_project_loaded() {
    let fixture = Fixture::new().await;

    let (status, body) = fixture.body().await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(body, "No project loaded");
    assert!(!fixture.host.boot().await.unwrap());
    assert_eq!(fixture.host.color().await, None);
}

#[tokio::test]
async fn test_deploy_and_rotate() {
    let fixture = Fixture::new().await;

    fixture.deploy("v1", EMPTY_CONFIG).await.unwrap();
    assert_eq!(fixture.body().await, (StatusCode::OK, "v1".to_string()));
    assert_eq!(fixture.host.color().await, Some(Color::Blue));
    assert!(fixture.app_dir("current").join("sql/schema.sql").exists());
    assert!(!fixture.app_dir("next").exists());
    assert!(!fixture.app_dir("previous").exists());

    fixture.deploy("v2", EMPTY_CONFIG).await.unwrap();
    assert_eq!(fixture.body().await, (StatusCode::OK, "v2".to_string()));
    assert_eq!(fixture.host.color().await, Some(Color::Green));
    assert_eq!(
        std::fs::read_to_string(fixture.app_dir("previous").join("VERSION")).unwrap(),
        "v1"
    );

    fixture.deploy("v3", EMPTY_CONFIG).await.unwrap();
    assert_eq!(fixture.host.color().await, Some(Color::Blue));
    assert_eq!(
        std::fs::read_to_string(fixture.app_dir("previous").join("VERSION")).unwrap(),
        "v2"
    );

    assert_eq!(
        fixture.schemas.calls(),
        vec![
            "install app_next",
            "promote app_next -> app",
            "install app_next",
            "promote app_next -> app",
            "install app_next",
            "promote app_next -> app",
        ]
    );

    let status = fixture.host.status().await;
    assert_eq!(status.deploy.state, DeployState::Idle);
    assert_eq!(status.deploy.succeeded, 3);
    assert_eq!(status.deploy.failed, 0);
}

#[tokio::test]
async fn test_bad_signature_changes_nothing() {
    let fixture = Fixture::new().await;
    fixture.deploy("v1", EMPTY_CONFIG).await.unwrap();

    let project = fixture.project("v2", EMPTY_CONFIG);
    let (file, mut signature) = fixture.signed_package(&project);
    signature[0] ^= 0x01;

    let err = fixture
        .host
        .deploy(file, signature, vec![fixture.signing_key.verifying_key()])
        .await
        .unwrap_err();
    assert!(matches!(err, HostError::InvalidSignature));
    assert_eq!(err.status_code(), StatusCode::BAD_REQUEST);

    assert_eq!(fixture.body().await, (StatusCode::OK, "v1".to_string()));
    assert_eq!(fixture.host.color().await, Some(Color::Blue));
    assert!(!fixture.app_dir("next").exists());
    assert_eq!(fixture.schemas.calls().len(), 2);

    let status = fixture.host.deploy_status().await;
    assert_eq!(status.state, DeployState::Idle);
    assert_eq!(status.failed, 1);
    assert!(status.last_error.is_some());
}

#[tokio::test]
async fn test_untrusted_key_is_rejected() {
    let fixture = Fixture::new().await;
    let project = fixture.project("v1", EMPTY_CONFIG);
    let (file, signature) = fixture.signed_package(&project);

    let other = ed25519_dalek::SigningKey::from_bytes(&[9u8; 32]);
    let err = fixture
        .host
        .deploy(file, signature, vec![other.verifying_key()])
        .await
        .unwrap_err();
    assert!(matches!(err, HostError::InvalidSignature));
    assert!(!fixture.app_dir("current").exists());
}

#[tokio::test]
async fn test_install_failure_keeps_serving_version() {
    let fixture = Fixture::new().await;
    fixture.deploy("v1", EMPTY_CONFIG).await.unwrap();

    fixture.schemas.fail_install.store(true, Ordering::SeqCst);
    let err = fixture.deploy("v2", EMPTY_CONFIG).await.unwrap_err();
    assert!(matches!(err, HostError::InstallFailure(_)));
    assert!(err.is_recoverable());

    assert_eq!(fixture.body().await, (StatusCode::OK, "v1".to_string()));
    assert_eq!(fixture.host.color().await, Some(Color::Blue));
    assert_eq!(
        std::fs::read_to_string(fixture.app_dir("current").join("VERSION")).unwrap(),
        "v1"
    );

    // A later deploy still goes through
    fixture.schemas.fail_install.store(false, Ordering::SeqCst);
    fixture.deploy("v3", EMPTY_CONFIG).await.unwrap();
    assert_eq!(fixture.body().await, (StatusCode::OK, "v3".to_string()));
    assert_eq!(fixture.host.color().await, Some(Color::Green));
}

#[tokio::test]
async fn test_promote_failure_is_not_rolled_back() {
    let fixture = Fixture::new().await;
    fixture.deploy("v1", EMPTY_CONFIG).await.unwrap();

    fixture.schemas.fail_promote.store(true, Ordering::SeqCst);
    let err = fixture.deploy("v2", EMPTY_CONFIG).await.unwrap_err();
    assert!(matches!(err, HostError::SwapFailure(_)));
    assert!(!err.is_recoverable());
    assert_eq!(err.status_code(), StatusCode::INTERNAL_SERVER_ERROR);

    // The new version went live, the directories were left as they were
    assert_eq!(fixture.host.color().await, Some(Color::Green));
    assert_eq!(
        std::fs::read_to_string(fixture.app_dir("next").join("VERSION")).unwrap(),
        "v2"
    );
    assert_eq!(
        std::fs::read_to_string(fixture.app_dir("current").join("VERSION")).unwrap(),
        "v1"
    );
    assert!(!fixture.app_dir("previous").exists());

    let status = fixture.host.deploy_status().await;
    assert_eq!(status.state, DeployState::Idle);
    assert_eq!(status.succeeded, 1);
    assert_eq!(status.failed, 1);
    assert!(status.last_error.unwrap().contains("schema promotion failed"));
}

#[tokio::test]
async fn test_abandoned_boot_still_completes() {
    let fixture = Fixture::new().await;
    let project = fixture.project("v1", EMPTY_CONFIG);
    std::fs::rename(&project, fixture.app_dir("current")).unwrap();
    fixture.schemas.promote_delay_ms.store(500, Ordering::SeqCst);

    let abandoned = tokio::time::timeout(Duration::from_millis(100), fixture.host.boot()).await;
    assert!(abandoned.is_err());

    let served = tokio::time::timeout(Duration::from_secs(5), fixture.body())
        .await
        .expect("requests blocked after an abandoned boot");
    assert_eq!(served, (StatusCode::OK, "v1".to_string()));

    // Later swaps can still take the reload lock
    fixture.schemas.promote_delay_ms.store(0, Ordering::SeqCst);
    fixture.deploy("v2", EMPTY_CONFIG).await.unwrap();
    assert_eq!(fixture.body().await, (StatusCode::OK, "v2".to_string()));
    assert_eq!(fixture.host.color().await, Some(Color::Green));
}

#[tokio::test]
async fn test_abandoned_deploy_still_completes() {
    let fixture = Fixture::new().await;
    fixture.deploy("v1", EMPTY_CONFIG).await.unwrap();
    fixture.schemas.promote_delay_ms.store(500, Ordering::SeqCst);

    let abandoned =
        tokio::time::timeout(Duration::from_millis(100), fixture.deploy("v2", EMPTY_CONFIG)).await;
    assert!(abandoned.is_err());

    let served = tokio::time::timeout(Duration::from_secs(5), fixture.body())
        .await
        .expect("requests blocked after an abandoned deploy");
    assert_eq!(served.0, StatusCode::OK);

    // The next deploy waits for the abandoned one and then goes through
    fixture.schemas.promote_delay_ms.store(0, Ordering::SeqCst);
    fixture.deploy("v3", EMPTY_CONFIG).await.unwrap();
    assert_eq!(fixture.body().await, (StatusCode::OK, "v3".to_string()));
    assert_eq!(fixture.host.color().await, Some(Color::Blue));
    assert_eq!(fixture.host.deploy_status().await.succeeded, 3);
}

#[tokio::test]
async fn test_invalid_config_is_an_install_failure() {
    let fixture = Fixture::new().await;

    let err = fixture
        .deploy("v1", "services: []\nnot-a-key: true\n")
        .await
        .unwrap_err();
    assert!(matches!(err, HostError::InstallFailure(_)));
    assert!(fixture.schemas.calls().is_empty());
    assert_eq!(fixture.body().await.0, StatusCode::INTERNAL_SERVER_ERROR);
}

#[tokio::test]
async fn test_boot_loads_current_without_rotating() {
    let fixture = Fixture::new().await;
    let project = fixture.project("v1", EMPTY_CONFIG);
    std::fs::rename(&project, fixture.app_dir("current")).unwrap();

    assert!(fixture.host.boot().await.unwrap());
    assert_eq!(fixture.body().await, (StatusCode::OK, "v1".to_string()));
    assert_eq!(fixture.host.color().await, Some(Color::Blue));
    assert!(fixture.app_dir("current").exists());
    assert!(!fixture.app_dir("previous").exists());
    assert_eq!(fixture.host.deploy_status().await.succeeded, 1);
}

#[cfg(unix)]
#[tokio::test]
async fn test_exec_remote_runs_in_staged_tree() {
    let fixture = Fixture::new().await;
    let config = r#"
deploy:
  exec-remote:
    cmd: sh
    args: ["-c", "echo built > BUILT"]
"#;

    fixture.deploy("v1", config).await.unwrap();
    assert!(fixture.app_dir("current").join("BUILT").exists());
}

#[cfg(unix)]
#[tokio::test]
async fn test_failing_exec_remote_aborts() {
    let fixture = Fixture::new().await;
    let config = r#"
deploy:
  exec-remote:
    cmd: "false"
"#;

    let err = fixture.deploy("v1", config).await.unwrap_err();
    assert!(matches!(err, HostError::InstallFailure(_)));
    assert!(!fixture.app_dir("current").exists());
    assert_eq!(fixture.host.color().await, None);
}

#[cfg(unix)]
#[tokio::test]
async fn test_deploy_timeout() {
    let fixture = Fixture::with_deploy_timeout(Duration::from_millis(200)).await;
    let config = r#"
deploy:
  exec-remote:
    cmd: sleep
    args: ["5"]
"#;

    let err = fixture.deploy("v1", config).await.unwrap_err();
    assert!(matches!(err, HostError::InstallFailure(ref msg) if msg.contains("did not finish")));
    assert_eq!(fixture.host.color().await, None);
}

#[cfg(unix)]
#[tokio::test]
async fn test_service_groups_alternate_colors() {
    let fixture = Fixture::new().await;
    let config = r#"
services:
  - name: worker
    cmd: sleep
    args: ["[[bluegreen.duration]]"]
    http-address: "127.0.0.1:[[bluegreen.port]]"
    blue:
      duration: 30
      port: 7001
    green:
      duration: 31
      port: 7002
"#;

    fixture.deploy("v1", config).await.unwrap();
    let status = fixture.host.status().await;
    assert_eq!(status.color, Some(Color::Blue));
    assert_eq!(status.services.len(), 1);
    assert_eq!(status.services[0].http_address, "127.0.0.1:7001");
    let blue_pid = status.services[0].pid;
    assert!(blue_pid.is_some());

    fixture.deploy("v2", config).await.unwrap();
    let status = fixture.host.status().await;
    assert_eq!(status.color, Some(Color::Green));
    assert_eq!(status.services[0].http_address, "127.0.0.1:7002");
    assert_ne!(status.services[0].pid, blue_pid);

    fixture.host.shutdown().await.unwrap();
}

#[cfg(unix)]
#[tokio::test]
async fn test_failed_service_start_keeps_serving_version() {
    let fixture = Fixture::new().await;
    fixture.deploy("v1", EMPTY_CONFIG).await.unwrap();

    let config = r#"
services:
  - name: never-ready
    cmd: sleep
    args: ["30"]
    health-check:
      tcp-connect: "127.0.0.1:1"
    max-startup-duration-secs: 1
"#;
    let err = fixture.deploy("v2", config).await.unwrap_err();
    assert!(matches!(err, HostError::StartupFailure(_)));
    assert_eq!(fixture.body().await, (StatusCode::OK, "v1".to_string()));
    assert_eq!(fixture.host.color().await, Some(Color::Blue));
}
