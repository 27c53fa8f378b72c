//! Node bootstrap: decide whether a restarting Cassandra node has to replace its previous
//! incarnation, and commit the new IP once it rejoined the ring.

use std::io::ErrorKind as IoErrorKind;
use std::time::Duration;

use log::{error, info, warn};
use tokio::io::AsyncWriteExt;

use crate::config::BootstrapConfig;
use crate::errors::*;
use crate::nodetool::AdminConnector;
use crate::registry::{IpRegistry, RegistryStore};
use crate::retry::RetryPolicy;

const POLL_INTERVAL: Duration = Duration::from_secs(10);

pub struct Bootstrapper<S, C> {
    config: BootstrapConfig,
    registry: IpRegistry<S>,
    admin: C,
    retry: RetryPolicy,
    poll_interval: Duration,
}

impl<S: RegistryStore, C: AdminConnector> Bootstrapper<S, C> {
    pub fn new(config: BootstrapConfig, store: S, admin: C) -> Self {
        let registry = IpRegistry::new(store, config.registry_name.clone());
        Bootstrapper {
            config,
            registry,
            admin,
            retry: RetryPolicy::default(),
            poll_interval: POLL_INTERVAL,
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// `init`: write the replace marker if needed, retrying transient failures.
    pub async fn set_replace_ip_with_retry(&self) -> Result<bool> {
        self.retry.retry("set replace ip", || self.decide_replace()).await
    }

    /// Write the replace marker if this node must replace its previous IP.
    ///
    /// Returns whether the marker now holds an IP.
    pub async fn decide_replace(&self) -> Result<bool> {
        let pod = &self.config.pod_name;
        let current_ip = &self.config.pod_ip;
        let old_ip = match self.registry.entry(pod).await {
            Ok(ip) => ip,
            Err(err) => {
                if let ErrorKind::RegistryNotFound(_) = err.kind() {
                    error!("topology configmap {} could not be found", self.registry.name());
                }
                return Err(err);
            }
        };
        info!("got old IP {:?} for pod {}, current IP is {}", old_ip, pod, current_ip);

        let old_ip = match old_ip {
            Some(ip) if &ip != current_ip => ip,
            _ => return Ok(false),
        };

        if self.config.shutdown_old_reachable_node && self.is_old_node_reachable_and_up(&old_ip).await {
            info!("old node {} is still reachable and UP, trying to shut it down", old_ip);
            self.try_old_node_shutdown(&old_ip).await;
            bail!(ErrorKind::OldNodeStillRunning(old_ip));
        }

        if self.is_bootstrapped().await {
            info!("node is already bootstrapped, no need for replace IP");
            return Ok(false);
        }

        info!("node is not bootstrapped, adding replace IP {} to startup", old_ip);
        self.write_replace_ip(&old_ip).await?;
        Ok(true)
    }

    async fn is_old_node_reachable_and_up(&self, old_ip: &str) -> bool {
        let nodetool = match self.admin.remote(old_ip) {
            Ok(nodetool) => nodetool,
            Err(_) => return false,
        };
        let status = match nodetool.status().await {
            Ok(status) => status,
            Err(err) => {
                info!("old node {} seems to be unreachable: {}", old_ip, err);
                return false;
            }
        };
        if !status.has_up_node(old_ip) {
            info!("could connect to old node {}, but it is not UN anymore", old_ip);
            return false;
        }
        match nodetool.has_active_gossip().await {
            Ok(active) => active,
            Err(err) => {
                info!("failed to get gossip state of {}: {}", old_ip, err);
                false
            }
        }
    }

    /// Best effort: errors are logged only.
    async fn try_old_node_shutdown(&self, old_ip: &str) {
        let nodetool = match self.admin.remote(old_ip) {
            Ok(nodetool) => nodetool,
            Err(_) => return,
        };
        info!("draining old node {}", old_ip);
        if let Err(err) = nodetool.run_command("drain").await {
            error!("nodetool drain on {} failed: {}", old_ip, err);
        }
        // `stopdaemon` would be preferable but fails; disabling gossip removes the node from
        // the ring as well.
        info!("stopping gossip on old node {}", old_ip);
        if let Err(err) = nodetool.run_command("disablegossip").await {
            error!("nodetool disablegossip on {} failed: {}", old_ip, err);
        }
    }

    async fn is_bootstrapped(&self) -> bool {
        let dir = &self.config.system_data_dir;
        match tokio::fs::metadata(dir).await {
            Ok(_) => true,
            Err(err) if err.kind() == IoErrorKind::NotFound => false,
            Err(err) => {
                error!("error checking for {}: {}", dir.display(), err);
                false
            }
        }
    }

    async fn write_replace_ip(&self, ip: &str) -> Result<()> {
        let path = &self.config.replace_ip_file;
        let mut file = tokio::fs::File::create(path)
            .await
            .chain_err(|| format!("failed to open {}", path.display()))?;
        file.write_all(ip.as_bytes()).await?;
        file.sync_all().await?;
        info!("replace IP in {} set to {:?}", path.display(), ip);
        Ok(())
    }

    /// `wait`: wait for the rejoin using the configured timeout, then commit.
    pub async fn run_wait(&self) -> Result<()> {
        self.wait_for_rejoin(self.config.bootstrap_timeout).await
    }

    /// Wait until this node is UP in the ring, then record its IP and clear the marker.
    pub async fn wait_for_rejoin(&self, timeout: Duration) -> Result<()> {
        let ip = &self.config.pod_ip;
        if tokio::time::timeout(timeout, self.poll_until_up()).await.is_err() {
            error!("node {} did not rejoin the cluster within {:?}", ip, timeout);
            bail!(ErrorKind::RejoinTimeout(ip.clone()));
        }

        info!("node {} joined, updating configmap {}", ip, self.registry.name());
        let pod = &self.config.pod_name;
        self.retry
            .retry("update registry", || self.registry.update_entry(pod, ip))
            .await
            .chain_err(|| "error updating the configmap with the new IP")?;

        info!("resetting replace IP");
        self.write_replace_ip("").await
    }

    async fn poll_until_up(&self) {
        let ip = &self.config.pod_ip;
        let nodetool = self.admin.local();
        let mut ticker = tokio::time::interval(self.poll_interval);
        loop {
            ticker.tick().await;
            match nodetool.status().await {
                Ok(status) => match status.find_node(ip) {
                    Some(node) if node.is_up() => return,
                    Some(node) => info!("node {} is {}, waiting", ip, node.state),
                    None => info!("node {} not in the ring yet", ip),
                },
                Err(err) => warn!("nodetool status failed: {}", err),
            }
        }
    }
}
