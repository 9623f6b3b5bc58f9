use deploy_core::config::{Config, ProbeType, TransportType};
use deploy_core::prober::{PingProbe, TcpProbe};
use deploy_core::{FileGateway, Probe, RemoteTransport};
use std::path::Path;
use std::sync::Arc;
use tracing::debug;

/// Load the config from `path`, or from the default location.
pub fn load_config(path: Option<&Path>) -> anyhow::Result<Config> {
    let config = match path {
        Some(path) => Config::load_from(path)?,
        None => Config::load_default()?,
    };
    Ok(config)
}

/// Open the state store and sync the config inventory into it. Recorded
/// host and role status survives the sync.
pub fn open_gateway(config: &Config) -> anyhow::Result<FileGateway> {
    let gateway = FileGateway::open(config.state_dir())?;
    for host in &config.hosts {
        gateway.upsert_host(host.to_record())?;
    }
    for role in &config.roles {
        gateway.upsert_role(role.to_record())?;
    }
    debug!(
        "Synced {} host(s) and {} role(s) into {}",
        config.hosts.len(),
        config.roles.len(),
        gateway.root().display()
    );
    Ok(gateway)
}

pub fn create_transport(config: &Config) -> Arc<dyn RemoteTransport> {
    match config.defaults.transport {
        TransportType::Ssh => Arc::new(deploy_ssh::SshTransport::new()),
        TransportType::Shell => Arc::new(deploy_local::ShellTransport::new()),
    }
}

pub fn create_probe(config: &Config) -> Arc<dyn Probe> {
    match config.defaults.probe {
        ProbeType::Tcp => Arc::new(TcpProbe::default()),
        ProbeType::Ping => Arc::new(PingProbe::default()),
    }
}
