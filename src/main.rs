use cassandra_ops::{config::RecoveryConfig, errors::*, recovery::Manager};
use error_chain::ChainedError;
use kube::Client;
use log::{error, info};

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    if let Err(e) = run().await {
        error!("{}", e.display_chain());
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    let config = RecoveryConfig::new()?;

    // Read the environment to find config for kube client.
    // Note that this tries an in-cluster configuration first,
    // then falls back on a kubeconfig file.
    let client = Client::try_default()
        .await
        .chain_err(|| "failed to create kubernetes client")?;

    let (_manager, drainer) = Manager::new(client, config);
    info!("pod recovery controller started");
    drainer.await;
    info!("pod recovery controller stopped");
    Ok(())
}
