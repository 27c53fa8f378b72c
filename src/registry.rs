//! The topology registry: a configmap mapping pod names to their last known IP, guarded by
//! an advisory lock stored in one of its annotations.
//!
//! The lock has no lease. Every write carries the resource version it read, so two pods
//! racing for an unlocked registry cannot both win: the loser's update is rejected by the API
//! server with a conflict. A pod that crashes while holding the lock keeps it until the same
//! pod retries (re-acquiring is idempotent) or an operator clears the annotation.

use std::collections::BTreeMap;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ConfigMap;
use kube::api::{Api, PostParams};
use kube::Client;
use log::{error, info, warn};

use crate::errors::*;

/// Annotation holding the name of the pod which currently holds the lock.
pub const LOCK_ANNOTATION: &str = "cassandra.kudo.dev/annotationLock";
/// Data key recording the last pod which wrote to the registry.
pub const LAST_UPDATED_BY: &str = "last-updated-by";

/// Storage for the registry configmap.
#[async_trait]
pub trait RegistryStore: Send + Sync {
    /// Fetch the configmap. Fails with `RegistryNotFound` when it does not exist.
    async fn get(&self, name: &str) -> Result<ConfigMap>;
    /// Replace the configmap. Fails with `Conflict` when its resource version is stale.
    async fn replace(&self, cm: &ConfigMap) -> Result<ConfigMap>;
}

pub struct KubeRegistryStore {
    api: Api<ConfigMap>,
}

impl KubeRegistryStore {
    pub fn new(client: Client, namespace: &str) -> Self {
        KubeRegistryStore {
            api: Api::namespaced(client, namespace),
        }
    }
}

#[async_trait]
impl RegistryStore for KubeRegistryStore {
    async fn get(&self, name: &str) -> Result<ConfigMap> {
        match self.api.get(name).await {
            Ok(cm) => Ok(cm),
            Err(kube::Error::Api(resp)) if resp.code == 404 => bail!(ErrorKind::RegistryNotFound(name.to_string())),
            Err(err) => Err(err.into()),
        }
    }

    async fn replace(&self, cm: &ConfigMap) -> Result<ConfigMap> {
        let name = cm.metadata.name.clone().unwrap_or_default();
        match self.api.replace(&name, &PostParams::default(), cm).await {
            Ok(cm) => Ok(cm),
            Err(kube::Error::Api(resp)) if resp.code == 404 => bail!(ErrorKind::RegistryNotFound(name)),
            Err(kube::Error::Api(resp)) if resp.code == 409 => bail!(ErrorKind::Conflict(name)),
            Err(err) => Err(err.into()),
        }
    }
}

fn lock_holder(cm: &ConfigMap) -> &str {
    cm.metadata
        .annotations
        .as_ref()
        .and_then(|a| a.get(LOCK_ANNOTATION))
        .map(|s| s.as_str())
        .unwrap_or("")
}

fn set_lock_holder(cm: &mut ConfigMap, holder: &str) {
    cm.metadata
        .annotations
        .get_or_insert_with(BTreeMap::new)
        .insert(LOCK_ANNOTATION.to_string(), holder.to_string());
}

/// The registry of the cluster, identified by the configmap's name.
pub struct IpRegistry<S> {
    store: S,
    name: String,
}

impl<S: RegistryStore> IpRegistry<S> {
    pub fn new(store: S, name: impl Into<String>) -> Self {
        IpRegistry { store, name: name.into() }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    #[cfg(test)]
    pub(crate) fn store(&self) -> &S {
        &self.store
    }

    pub async fn get(&self) -> Result<ConfigMap> {
        self.store.get(&self.name).await
    }

    /// The IP recorded for `pod`, if any.
    pub async fn entry(&self, pod: &str) -> Result<Option<String>> {
        let cm = self.get().await?;
        Ok(cm
            .data
            .as_ref()
            .and_then(|d| d.get(pod))
            .filter(|ip| !ip.is_empty())
            .cloned())
    }

    /// Take the lock for `holder`.
    ///
    /// Succeeds if the registry is unlocked or already locked by `holder`. The returned guard
    /// must be released with [`LockGuard::release`]. Losing a race for the lock fails with
    /// `LockHeld` naming the winner; `Conflict` means the configmap changed but is still free.
    pub async fn acquire<'a>(&'a self, holder: &str) -> Result<LockGuard<'a, S>> {
        let mut cm = self.get().await?;
        let current = lock_holder(&cm);
        if !current.is_empty() && current != holder {
            bail!(ErrorKind::LockHeld(self.name.clone(), current.to_string()));
        }

        info!("acquiring lock of configmap {} for {}", self.name, holder);
        set_lock_holder(&mut cm, holder);
        match self.store.replace(&cm).await {
            Ok(_) => (),
            Err(Error(ErrorKind::Conflict(_), _)) => {
                // Lost a race with another writer. Report who won if it took the lock.
                let cm = self.get().await?;
                let winner = lock_holder(&cm);
                if !winner.is_empty() && winner != holder {
                    bail!(ErrorKind::LockHeld(self.name.clone(), winner.to_string()));
                }
                bail!(ErrorKind::Conflict(self.name.clone()));
            }
            Err(err) => return Err(err),
        }
        Ok(LockGuard {
            registry: self,
            holder: holder.to_string(),
            released: false,
        })
    }

    /// Clear the lock if `holder` has it.
    ///
    /// Returns `true` when the lock is no longer held by `holder`, including when it never was.
    pub async fn release(&self, holder: &str) -> bool {
        let mut cm = match self.get().await {
            Ok(cm) => cm,
            Err(Error(ErrorKind::RegistryNotFound(_), _)) => return true,
            Err(err) => {
                error!("failed to read configmap {} while releasing lock: {}", self.name, err);
                return false;
            }
        };
        if lock_holder(&cm) != holder {
            return true;
        }

        set_lock_holder(&mut cm, "");
        match self.store.replace(&cm).await {
            Ok(_) => {
                info!("released lock of configmap {} held by {}", self.name, holder);
                true
            }
            Err(err) => {
                error!("failed to release lock of configmap {} held by {}: {}", self.name, holder, err);
                false
            }
        }
    }

    /// Record `ip` as the address of `holder`, under the lock.
    ///
    /// The lock is released whether or not the write succeeds.
    pub async fn update_entry(&self, holder: &str, ip: &str) -> Result<()> {
        let guard = self.acquire(holder).await?;
        let res = self.write_entry(holder, ip).await;
        guard.release().await;
        res
    }

    async fn write_entry(&self, holder: &str, ip: &str) -> Result<()> {
        let mut cm = self.get().await?;
        let data = cm.data.get_or_insert_with(BTreeMap::new);
        data.insert(holder.to_string(), ip.to_string());
        data.insert(LAST_UPDATED_BY.to_string(), holder.to_string());
        info!("updating configmap {} with IP {} for pod {}", self.name, ip, holder);
        self.store.replace(&cm).await?;
        Ok(())
    }
}

/// A held registry lock.
#[must_use = "the lock must be released"]
pub struct LockGuard<'a, S: RegistryStore> {
    registry: &'a IpRegistry<S>,
    holder: String,
    released: bool,
}

impl<'a, S: RegistryStore> LockGuard<'a, S> {
    pub fn holder(&self) -> &str {
        &self.holder
    }

    pub async fn release(mut self) -> bool {
        self.released = true;
        self.registry.release(&self.holder).await
    }
}

impl<'a, S: RegistryStore> Drop for LockGuard<'a, S> {
    fn drop(&mut self) {
        if !self.released {
            warn!("lock of configmap {} held by {} dropped without release", self.registry.name, self.holder);
        }
    }
}
