use crate::dispatch;
use anyhow::anyhow;
use deploy_core::config::Config;
use deploy_core::{
    DeployError, OperationKind, OperationReport, OperationRequest, PersistenceGateway, SystemClock,
    TargetSet, TaskController,
};
use std::sync::Arc;
use tracing::warn;

/// Run one operation to completion. Ctrl-C stops the workers at their next
/// step boundary or poll.
pub async fn run(
    config: Config,
    kind: OperationKind,
    targets: TargetSet,
    backend: Option<String>,
    json: bool,
) -> anyhow::Result<bool> {
    let backend = match backend {
        Some(backend) => backend,
        None => config
            .backend_for(&targets)
            .ok_or_else(|| anyhow!("no backend configured for {}; pass --backend", targets))?
            .to_string(),
    };
    let plan = config.plan(kind, &backend)?;

    let gateway: Arc<dyn PersistenceGateway> = Arc::new(dispatch::open_gateway(&config)?);
    let controller = Arc::new(TaskController::new(
        gateway,
        dispatch::create_transport(&config),
        dispatch::create_probe(&config),
        Arc::new(SystemClock),
        config.controller_settings(),
    ));
    let cancel = controller.cancel_token();

    let request = OperationRequest {
        kind,
        targets,
        plan,
    };
    let mut task = {
        let controller = Arc::clone(&controller);
        tokio::task::spawn_blocking(move || controller.run(request))
    };

    let finished = tokio::select! {
        joined = &mut task => Some(joined?),
        _ = tokio::signal::ctrl_c() => None,
    };
    let result = match finished {
        Some(result) => result,
        None => {
            warn!("Interrupted, stopping workers");
            cancel.cancel();
            task.await?
        }
    };

    match result {
        Ok(report) => {
            if json {
                let doc = serde_json::json!({
                    "operation": report.operation,
                    "hosts": report.hosts,
                });
                println!("{}", serde_json::to_string_pretty(&doc)?);
            } else {
                print_report(&report, &controller);
            }
            Ok(report.is_success())
        }
        Err(DeployError::UnreachableTarget { hosts }) => {
            eprintln!("Precheck failed, nothing was changed.");
            eprintln!("Unreachable: {}", hosts.join(", "));
            Ok(false)
        }
        Err(e) => Err(e.into()),
    }
}

fn print_report(report: &OperationReport, controller: &TaskController) {
    let op = &report.operation;
    println!("Operation: {}", op.id);
    println!("  Kind:     {}", op.kind);
    println!("  Backend:  {}", op.backend.as_deref().unwrap_or("-"));
    println!("  Targets:  {}", op.targets);
    println!("  State:    {}", op.state);
    println!("  Progress: {:.0}%", op.progress);
    println!("  Message:  {}", op.message);
    println!();
    println!("{:<20} {:<10} {:>8}  {}", "HOST", "STATE", "PROGRESS", "DETAIL");
    println!("{}", "-".repeat(72));
    for host in &report.hosts {
        let detail = host
            .failure
            .as_ref()
            .map(|f| f.reason())
            .unwrap_or_default();
        println!(
            "{:<20} {:<10} {:>7.0}%  {}",
            host.host_id,
            host.state,
            host.progress,
            first_line(&detail)
        );
    }
    println!();
    println!(
        "Logs: {}",
        controller.settings().log_dir.join(&op.id.0).display()
    );
}

fn first_line(text: &str) -> &str {
    text.lines().next().unwrap_or("")
}
