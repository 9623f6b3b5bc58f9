use crate::dispatch;
use deploy_core::config::Config;

pub async fn run(config: &Config, json: bool) -> anyhow::Result<()> {
    let gateway = dispatch::open_gateway(config)?;
    let hosts = gateway.list_hosts()?;

    if json {
        // credentials stay out of the output
        let doc: Vec<_> = hosts
            .iter()
            .map(|h| {
                serde_json::json!({
                    "id": h.id,
                    "address": h.address,
                    "user": h.credential.user,
                    "roles": h.roles,
                    "state": h.state,
                    "progress": h.progress,
                    "message": h.message,
                    "updated_at": h.updated_at,
                })
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&doc)?);
        return Ok(());
    }

    if hosts.is_empty() {
        println!("No hosts in inventory.");
        return Ok(());
    }
    println!(
        "{:<20} {:<22} {:<20} {:<12} {:>8}",
        "HOST", "ADDRESS", "ROLES", "STATE", "PROGRESS"
    );
    println!("{}", "-".repeat(86));
    for host in &hosts {
        println!(
            "{:<20} {:<22} {:<20} {:<12} {:>7.0}%",
            host.id,
            host.address,
            host.roles.join(","),
            host.state,
            host.progress
        );
    }
    Ok(())
}
