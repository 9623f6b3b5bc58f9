use crate::dispatch;
use deploy_core::config::Config;
use deploy_core::{Credential, HostTarget, ReachabilityProber, SystemClock};
use std::sync::Arc;

pub async fn run(config: &Config, hosts: &[String], rounds: Option<u32>) -> anyhow::Result<bool> {
    // unknown names are probed as plain addresses
    let targets: Vec<HostTarget> = hosts
        .iter()
        .map(|name| match config.find_host(name) {
            Some(host) => HostTarget::new(&host.id, &host.address, host.credential()),
            None => HostTarget::new(name, name, Credential::agent("root")),
        })
        .collect();

    let settings = config.controller_settings();
    let rounds = rounds.unwrap_or(settings.probe_rounds);
    let prober = ReachabilityProber::new(dispatch::create_probe(config), Arc::new(SystemClock));
    let interval = settings.probe_interval;
    let result = tokio::task::spawn_blocking(move || prober.check_reachable(targets, rounds, interval)).await?;

    for target in &result.reachable {
        println!("  up    {:<20} {}", target.host_id, target.address);
    }
    for target in &result.unreachable {
        println!("  down  {:<20} {}", target.host_id, target.address);
    }
    Ok(result.all_reachable())
}
