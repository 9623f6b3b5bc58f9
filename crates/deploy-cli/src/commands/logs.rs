use deploy_core::config::Config;
use deploy_core::executor::OperationLog;
use deploy_core::operation::OperationId;

pub async fn run(config: &Config, operation_id: &str, host_id: &str, lines: usize) -> anyhow::Result<()> {
    let log_dir = config.controller_settings().log_dir;
    let id = OperationId::from_string(operation_id.to_string());
    let path = OperationLog::find(&log_dir, &id, host_id).ok_or_else(|| {
        anyhow::anyhow!(
            "No log for host {} in operation {} under {}",
            host_id,
            operation_id,
            log_dir.display()
        )
    })?;

    let contents = std::fs::read_to_string(&path)?;
    let all: Vec<&str> = contents.lines().collect();
    for line in &all[all.len().saturating_sub(lines)..] {
        println!("{}", line);
    }
    Ok(())
}
