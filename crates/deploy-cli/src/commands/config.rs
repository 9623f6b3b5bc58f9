use deploy_core::config::{Config, SAMPLE_CONFIG};
use std::path::Path;

pub async fn run(config_path: Option<&Path>, path: bool, init: bool) -> anyhow::Result<()> {
    let config_path = config_path
        .map(Path::to_path_buf)
        .unwrap_or_else(Config::default_path);

    if path {
        println!("{}", config_path.display());
        return Ok(());
    }

    if init {
        if config_path.exists() {
            println!("Config already exists at: {}", config_path.display());
            println!("Remove it first if you want to reinitialize.");
            return Ok(());
        }
        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&config_path, SAMPLE_CONFIG)?;
        println!("Sample config written to: {}", config_path.display());
        return Ok(());
    }

    println!("Config path: {}", config_path.display());
    if config_path.exists() {
        let config = Config::load_from(&config_path)?;
        println!("Transport:   {}", config.defaults.transport);
        println!("Hosts:       {}", config.hosts.len());
        println!("Roles:       {}", config.roles.len());
        for role in &config.roles {
            println!(
                "  - {} (cluster {}, backend {})",
                role.id,
                role.cluster.as_deref().unwrap_or("-"),
                role.backend.as_deref().unwrap_or("-")
            );
        }
        println!("Backends:    {}", config.backends.len());
        for backend in &config.backends {
            println!("  - {}", backend.name);
        }
    } else {
        println!("Status:      not found");
        println!("Run `stackdeploy config --init` to create one.");
    }
    Ok(())
}
