//! FSM unit tests

use swaphost::deploy::fsm::{DeployEvent, DeployFsm, DeployState};

#[test]
fn test_fsm_initial_state() {
    let fsm = DeployFsm::new();
    assert_eq!(fsm.state(), DeployState::Idle);
    assert!(fsm.last_error().is_none());
    assert_eq!(fsm.succeeded(), 0);
    assert_eq!(fsm.failed(), 0);
}

#[test]
fn test_fsm_deploy_success_flow() {
    let mut fsm = DeployFsm::new();

    fsm.process(DeployEvent::Begin).unwrap();
    assert_eq!(fsm.state(), DeployState::Verifying);

    fsm.process(DeployEvent::Verified).unwrap();
    assert_eq!(fsm.state(), DeployState::Staging);

    fsm.process(DeployEvent::Staged).unwrap();
    assert_eq!(fsm.state(), DeployState::Installing);

    fsm.process(DeployEvent::Installed).unwrap();
    assert_eq!(fsm.state(), DeployState::Swapping);

    fsm.process(DeployEvent::Swapped).unwrap();
    assert_eq!(fsm.state(), DeployState::DrainingOld);

    fsm.process(DeployEvent::Drained).unwrap();
    assert_eq!(fsm.state(), DeployState::Idle);
    assert_eq!(fsm.succeeded(), 1);
}

#[test]
fn test_fsm_failure_from_every_phase() {
    let steps = [
        DeployEvent::Verified,
        DeployEvent::Staged,
        DeployEvent::Installed,
        DeployEvent::Swapped,
    ];

    for failing_at in 0..=steps.len() {
        let mut fsm = DeployFsm::new();
        fsm.process(DeployEvent::Begin).unwrap();
        for step in steps.iter().take(failing_at) {
            fsm.process(step.clone()).unwrap();
        }

        fsm.process(DeployEvent::Fail(format!("error {}", failing_at)))
            .unwrap();
        assert_eq!(fsm.state(), DeployState::Idle);
        assert_eq!(fsm.last_error(), Some(format!("error {}", failing_at).as_str()));
        assert_eq!(fsm.failed(), 1);
    }
}

#[test]
fn test_fsm_success_clears_last_error() {
    let mut fsm = DeployFsm::new();

    fsm.process(DeployEvent::Begin).unwrap();
    fsm.process(DeployEvent::Fail("bad signature".to_string())).unwrap();
    assert_eq!(fsm.last_error(), Some("bad signature"));

    fsm.process(DeployEvent::Load).unwrap();
    assert_eq!(fsm.state(), DeployState::Installing);
    fsm.process(DeployEvent::Installed).unwrap();
    fsm.process(DeployEvent::Swapped).unwrap();
    fsm.process(DeployEvent::Drained).unwrap();

    let status = fsm.status();
    assert_eq!(status.state, DeployState::Idle);
    assert!(status.last_error.is_none());
    assert_eq!(status.succeeded, 1);
    assert_eq!(status.failed, 1);
}

#[test]
fn test_fsm_invalid_transition() {
    let mut fsm = DeployFsm::new();

    // Cannot install before verifying
    assert!(fsm.process(DeployEvent::Installed).is_err());

    // Nothing to fail while idle
    assert!(fsm.process(DeployEvent::Fail("x".to_string())).is_err());
    assert_eq!(fsm.failed(), 0);

    // Only one deploy at a time
    fsm.process(DeployEvent::Begin).unwrap();
    assert!(fsm.process(DeployEvent::Begin).is_err());
}
