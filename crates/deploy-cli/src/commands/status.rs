use crate::dispatch;
use deploy_core::config::Config;
use deploy_core::{Operation, OperationId, PersistenceGateway};

pub async fn run(config: &Config, operation_id: Option<&str>, json: bool) -> anyhow::Result<()> {
    let gateway = dispatch::open_gateway(config)?;

    let Some(id) = operation_id else {
        let operations = gateway.list_operations()?;
        if json {
            println!("{}", serde_json::to_string_pretty(&operations)?);
        } else {
            print_list(&operations);
        }
        return Ok(());
    };

    let operation = gateway.get_operation(&OperationId::from_string(id.to_string()))?;
    if json {
        println!("{}", serde_json::to_string_pretty(&operation)?);
        return Ok(());
    }

    println!("Operation: {}", operation.id);
    println!("  Kind:     {}", operation.kind);
    println!("  Targets:  {}", operation.targets);
    println!("  State:    {}", operation.state);
    println!("  Progress: {:.0}%", operation.progress);
    println!("  Started:  {}", operation.started_at);
    if let Some(finished) = operation.finished_at {
        println!("  Finished: {}", finished);
    }
    if !operation.message.is_empty() {
        println!("  Message:  {}", operation.message);
    }
    if !operation.hosts.is_empty() {
        println!("  Hosts:");
        for host_id in &operation.hosts {
            match gateway.get_host(host_id) {
                Ok(host) => println!(
                    "    {:<20} {:<12} {:>4.0}%  {}",
                    host.id, host.state, host.progress, host.message
                ),
                Err(_) => println!("    {:<20} (no longer in inventory)", host_id),
            }
        }
    }
    Ok(())
}

fn print_list(operations: &[Operation]) {
    if operations.is_empty() {
        println!("No operations found.");
        return;
    }
    println!(
        "{:<38} {:<10} {:<10} {:>8}  {}",
        "OPERATION ID", "KIND", "STATE", "PROGRESS", "TARGETS"
    );
    println!("{}", "-".repeat(90));
    for op in operations {
        println!(
            "{:<38} {:<10} {:<10} {:>7.0}%  {}",
            op.id, op.kind, op.state, op.progress, op.targets
        );
    }
}
