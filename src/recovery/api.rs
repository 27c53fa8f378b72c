use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Node, PersistentVolume, PersistentVolumeClaim, Pod};
use kube::api::{Api, DeleteParams, PostParams};
use kube::Client;
use log::info;

#[cfg(test)]
use mockall::automock;

use crate::errors::*;

/// The Kubernetes calls made while recovering a pod.
///
/// Lookups return `None` for objects which do not exist; deletions of objects which do not
/// exist succeed.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait RecoveryApi: Send + Sync {
    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Option<Pod>>;
    async fn get_pvc(&self, namespace: &str, name: &str) -> Result<Option<PersistentVolumeClaim>>;
    async fn get_pv(&self, name: &str) -> Result<Option<PersistentVolume>>;
    async fn node_exists(&self, name: &str) -> Result<bool>;
    /// Replace a PV, guarded by the resource version it carries.
    async fn replace_pv(&self, pv: &PersistentVolume) -> Result<()>;
    async fn delete_pvc(&self, namespace: &str, name: &str) -> Result<()>;
    async fn delete_pod(&self, namespace: &str, name: &str) -> Result<()>;
}

pub struct KubeRecoveryApi {
    client: Client,
}

impl KubeRecoveryApi {
    pub fn new(client: Client) -> Self {
        KubeRecoveryApi { client }
    }
}

fn is_not_found(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(resp) if resp.code == 404)
}

#[async_trait]
impl RecoveryApi for KubeRecoveryApi {
    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Option<Pod>> {
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        pods.get_opt(name)
            .await
            .chain_err(|| format!("failed to get pod {}/{}", namespace, name))
    }

    async fn get_pvc(&self, namespace: &str, name: &str) -> Result<Option<PersistentVolumeClaim>> {
        let pvcs: Api<PersistentVolumeClaim> = Api::namespaced(self.client.clone(), namespace);
        pvcs.get_opt(name)
            .await
            .chain_err(|| format!("failed to get PVC {}/{}", namespace, name))
    }

    async fn get_pv(&self, name: &str) -> Result<Option<PersistentVolume>> {
        let pvs: Api<PersistentVolume> = Api::all(self.client.clone());
        pvs.get_opt(name).await.chain_err(|| format!("failed to get PV {}", name))
    }

    async fn node_exists(&self, name: &str) -> Result<bool> {
        let nodes: Api<Node> = Api::all(self.client.clone());
        let node = nodes.get_opt(name).await.chain_err(|| format!("failed to get node {}", name))?;
        Ok(node.is_some())
    }

    async fn replace_pv(&self, pv: &PersistentVolume) -> Result<()> {
        let pvs: Api<PersistentVolume> = Api::all(self.client.clone());
        let name = pv.metadata.name.clone().unwrap_or_default();
        pvs.replace(&name, &PostParams::default(), pv)
            .await
            .chain_err(|| format!("failed to update PV {}", name))?;
        Ok(())
    }

    async fn delete_pvc(&self, namespace: &str, name: &str) -> Result<()> {
        let pvcs: Api<PersistentVolumeClaim> = Api::namespaced(self.client.clone(), namespace);
        match pvcs.delete(name, &DeleteParams::default()).await {
            Ok(_) => Ok(()),
            Err(err) if is_not_found(&err) => {
                info!("PVC {}/{} already deleted", namespace, name);
                Ok(())
            }
            Err(err) => Err(err).chain_err(|| format!("failed to delete PVC {}/{}", namespace, name)),
        }
    }

    async fn delete_pod(&self, namespace: &str, name: &str) -> Result<()> {
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        match pods.delete(name, &DeleteParams::default()).await {
            Ok(_) => Ok(()),
            Err(err) if is_not_found(&err) => {
                info!("pod {}/{} already deleted", namespace, name);
                Ok(())
            }
            Err(err) => Err(err).chain_err(|| format!("failed to delete pod {}/{} for rescheduling", namespace, name)),
        }
    }
}
