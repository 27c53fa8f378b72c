//! Cassandra node bootstrap helper.
//!
//! `bootstrap init` runs as an init container and decides whether the node replaces its
//! previous IP. `bootstrap wait` runs alongside Cassandra and commits the new IP once the node
//! rejoined the ring.

use cassandra_ops::{
    bootstrap::Bootstrapper, config::BootstrapConfig, errors::*, nodetool::NodetoolConnector,
    registry::KubeRegistryStore,
};
use error_chain::{bail, ChainedError};
use kube::Client;
use log::{error, info};

enum Mode {
    Init,
    Wait,
}

fn parse_mode(arg: Option<&str>) -> Result<Mode> {
    match arg {
        Some("init") => Ok(Mode::Init),
        Some("wait") => Ok(Mode::Wait),
        other => bail!(ErrorKind::Usage(other.unwrap_or_default().to_string())),
    }
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let arg = std::env::args().nth(1);
    if let Err(e) = run(arg.as_deref()).await {
        error!("{}", e.display_chain());
        std::process::exit(1);
    }
}

async fn run(arg: Option<&str>) -> Result<()> {
    let mode = parse_mode(arg)?;
    let config = BootstrapConfig::new()?;
    let client = Client::try_default()
        .await
        .chain_err(|| "failed to create kubernetes client")?;

    let store = KubeRegistryStore::new(client, &config.pod_namespace);
    let connector = NodetoolConnector::new(&config);
    let bootstrapper = Bootstrapper::new(config, store, connector);

    match mode {
        Mode::Init => {
            let replacing = bootstrapper.set_replace_ip_with_retry().await?;
            info!("bootstrap init done, replacing: {}", replacing);
        }
        Mode::Wait => {
            bootstrapper.run_wait().await?;
            info!("bootstrap wait done");
        }
    }
    Ok(())
}
