use deploy_core::error::DeployError;
use deploy_core::operation::{HostState, Operation, OperationKind, OperationState};
use deploy_core::persistence::{HostRecord, HostUpdate, OperationUpdate, PersistenceGateway, RoleRecord, RoleUpdate};
use deploy_core::store::FileGateway;
use deploy_core::target::{Credential, TargetSet};

fn gateway() -> (tempfile::TempDir, FileGateway) {
    let dir = tempfile::tempdir().unwrap();
    let gateway = FileGateway::open(dir.path().join("state")).unwrap();
    gateway.upsert_role(RoleRecord::new("compute").in_cluster("east")).unwrap();
    gateway.upsert_role(RoleRecord::new("storage").in_cluster("west")).unwrap();
    gateway
        .upsert_host(HostRecord::new("n1", "10.0.0.1", Credential::agent("root")).with_roles(&["compute"]))
        .unwrap();
    gateway
        .upsert_host(HostRecord::new("n2", "10.0.0.2", Credential::agent("root")).with_roles(&["compute", "storage"]))
        .unwrap();
    (dir, gateway)
}

#[test]
fn test_host_update_persists_to_disk() {
    let (dir, gateway) = gateway();
    gateway
        .update_host("n1", &HostUpdate::state(HostState::Done).progress(100.0).message("ok"))
        .unwrap();

    let reopened = FileGateway::open(dir.path().join("state")).unwrap();
    let host = reopened.get_host("n1").unwrap();
    assert_eq!(host.state, HostState::Done);
    assert_eq!(host.progress, 100.0);
    assert!(host.updated_at.is_some());
}

#[test]
fn test_upsert_keeps_recorded_status() {
    let (_dir, gateway) = gateway();
    gateway
        .update_host("n1", &HostUpdate::state(HostState::Failed).message("boom"))
        .unwrap();
    gateway
        .upsert_host(HostRecord::new("n1", "10.0.0.9", Credential::agent("admin")))
        .unwrap();

    let host = gateway.get_host("n1").unwrap();
    assert_eq!(host.address, "10.0.0.9");
    assert_eq!(host.credential.user, "admin");
    assert_eq!(host.state, HostState::Failed);
    assert_eq!(host.message, "boom");
}

#[test]
fn test_role_and_cluster_queries() {
    let (_dir, gateway) = gateway();
    let compute: Vec<String> = gateway.get_hosts_of_role("compute").unwrap().into_iter().map(|h| h.id).collect();
    assert_eq!(compute, vec!["n1", "n2"]);
    assert_eq!(gateway.get_hosts_of_role("storage").unwrap().len(), 1);
    assert!(matches!(gateway.get_hosts_of_role("db"), Err(DeployError::NotFound(_))));

    let roles = gateway.get_roles_of_cluster("west").unwrap();
    assert_eq!(roles.len(), 1);
    assert_eq!(roles[0].id, "storage");
}

#[test]
fn test_progress_outside_range_is_invalid() {
    let (_dir, gateway) = gateway();
    assert!(matches!(
        gateway.update_role("compute", &RoleUpdate::progress(101.0)),
        Err(DeployError::Invalid(_))
    ));
    assert!(matches!(
        gateway.update_host("n1", &HostUpdate::state(HostState::Executing).progress(f64::NAN)),
        Err(DeployError::Invalid(_))
    ));
    assert_eq!(gateway.get_role("compute").unwrap().progress, 0.0);
}

#[test]
fn test_operations_round_trip_and_list_newest_first() {
    let (_dir, gateway) = gateway();
    let first = Operation::new(OperationKind::Install, TargetSet::Role("compute".into()));
    gateway.save_operation(&first).unwrap();
    std::thread::sleep(std::time::Duration::from_millis(5));
    let mut second = Operation::new(OperationKind::Upgrade, TargetSet::Cluster("east".into()));
    second.mark_running("upgrading");
    gateway.save_operation(&second).unwrap();

    let updated = gateway
        .update_operation(&first.id, &OperationUpdate::progress(42.0))
        .unwrap();
    assert_eq!(updated.progress, 42.0);

    let listed = gateway.list_operations().unwrap();
    assert_eq!(listed.len(), 2);
    assert_eq!(listed[0].id, second.id);
    assert_eq!(listed[0].state, OperationState::Running);
    assert_eq!(gateway.get_operation(&first.id).unwrap().targets, TargetSet::Role("compute".into()));
}

#[test]
fn test_rejects_path_like_ids() {
    let (_dir, gateway) = gateway();
    for id in ["", "../escape", "a/b"] {
        let err = gateway
            .upsert_host(HostRecord::new(id, "10.0.0.1", Credential::agent("root")))
            .unwrap_err();
        assert!(matches!(err, DeployError::Invalid(_)), "id {:?} accepted", id);
    }
}
