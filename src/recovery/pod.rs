//! Detection of pods which cannot recover on their own, and the clean restart which fixes them.

use std::fmt;

use k8s_openapi::api::core::v1::{PersistentVolume, PersistentVolumeClaim, Pod};
use log::{info, warn};

use super::api::RecoveryApi;
use crate::errors::*;

const HOSTNAME_LABEL: &str = "kubernetes.io/hostname";

/// Why a pod needs to be recovered, if it does.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Verdict {
    Healthy,
    /// The pod carries the eviction label.
    Evicted,
    /// Unschedulable and the named PVC does not exist.
    PvcMissing(String),
    /// Unschedulable and the named PVC is neither bound nor pending.
    PvcLost(String),
    /// Unschedulable and the named PV backing a bound PVC does not exist.
    PvMissing(String),
    /// Unschedulable and the node the PV is pinned to does not exist anymore.
    NodeGone(String),
}

impl Verdict {
    pub fn needs_recovery(&self) -> bool {
        *self != Verdict::Healthy
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Verdict::Healthy => write!(f, "healthy"),
            Verdict::Evicted => write!(f, "eviction label set"),
            Verdict::PvcMissing(pvc) => write!(f, "PVC {} is missing", pvc),
            Verdict::PvcLost(pvc) => write!(f, "PVC {} is neither bound nor pending", pvc),
            Verdict::PvMissing(pv) => write!(f, "PV {} is missing", pv),
            Verdict::NodeGone(node) => write!(f, "node {} is gone", node),
        }
    }
}

fn pod_name(pod: &Pod) -> (&str, &str) {
    (
        pod.metadata.namespace.as_deref().unwrap_or_default(),
        pod.metadata.name.as_deref().unwrap_or_default(),
    )
}

/// Names of the PVCs mounted by the pod.
pub fn claim_names(pod: &Pod) -> Vec<&str> {
    pod.spec
        .as_ref()
        .and_then(|s| s.volumes.as_ref())
        .map(|vols| {
            vols.iter()
                .filter_map(|v| v.persistent_volume_claim.as_ref())
                .map(|src| src.claim_name.as_str())
                .collect()
        })
        .unwrap_or_default()
}

pub fn has_eviction_label(pod: &Pod, label: &str) -> bool {
    pod.metadata
        .labels
        .as_ref()
        .and_then(|l| l.get(label))
        .map(|v| v == "true")
        .unwrap_or(false)
}

/// Whether the scheduler gave up on the pod (`PodScheduled=False`, reason `Unschedulable`).
pub fn is_unschedulable(pod: &Pod) -> bool {
    pod.status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .map(|conds| {
            conds.iter().any(|c| {
                c.type_ == "PodScheduled" && c.status == "False" && c.reason.as_deref() == Some("Unschedulable")
            })
        })
        .unwrap_or(false)
}

fn pvc_phase(pvc: &PersistentVolumeClaim) -> &str {
    pvc.status.as_ref().and_then(|s| s.phase.as_deref()).unwrap_or_default()
}

fn pvc_volume(pvc: &PersistentVolumeClaim) -> Option<&str> {
    pvc.spec.as_ref().and_then(|s| s.volume_name.as_deref()).filter(|v| !v.is_empty())
}

/// The hostname a PV is required to be mounted on, if it is pinned to one.
pub fn required_hostname(pv: &PersistentVolume) -> Option<&str> {
    let terms = &pv.spec.as_ref()?.node_affinity.as_ref()?.required.as_ref()?.node_selector_terms;
    let values = terms
        .iter()
        .filter_map(|t| t.match_expressions.as_ref())
        .flatten()
        .find(|expr| expr.key == HOSTNAME_LABEL)?
        .values
        .as_ref()?;
    if values.len() > 1 {
        warn!(
            "required node affinity of PV {} has more than one hostname: {:?}",
            pv.metadata.name.as_deref().unwrap_or_default(),
            values
        );
    }
    values.first().map(|v| v.as_str())
}

/// Decide whether `pod` needs a clean restart.
pub async fn classify<A: RecoveryApi + ?Sized>(api: &A, pod: &Pod, eviction_label: Option<&str>) -> Result<Verdict> {
    let (ns, name) = pod_name(pod);
    if let Some(label) = eviction_label.filter(|l| !l.is_empty()) {
        if has_eviction_label(pod, label) {
            info!("pod {}/{} has eviction label {} set", ns, name, label);
            return Ok(Verdict::Evicted);
        }
    }
    if !is_unschedulable(pod) {
        return Ok(Verdict::Healthy);
    }

    info!("failed scheduling detected for {}/{}", ns, name);
    for claim in claim_names(pod) {
        let pvc = match api.get_pvc(ns, claim).await? {
            Some(pvc) => pvc,
            None => return Ok(Verdict::PvcMissing(claim.to_string())),
        };
        let phase = pvc_phase(&pvc);
        if phase != "Bound" {
            if phase != "Pending" {
                return Ok(Verdict::PvcLost(claim.to_string()));
            }
            continue;
        }
        let volume = match pvc_volume(&pvc) {
            Some(volume) => volume,
            None => continue,
        };
        let pv = match api.get_pv(volume).await? {
            Some(pv) => pv,
            None => return Ok(Verdict::PvMissing(volume.to_string())),
        };
        if let Some(host) = required_hostname(&pv) {
            if !api.node_exists(host).await? {
                return Ok(Verdict::NodeGone(host.to_string()));
            }
        }
    }
    Ok(Verdict::Healthy)
}

/// Detach the pod's PVs, delete its PVCs, then delete the pod so its StatefulSet recreates it.
///
/// Every step tolerates having been done before, so a failed recovery can simply be retried.
pub async fn clean_start<A: RecoveryApi + ?Sized>(api: &A, pod: &Pod) -> Result<()> {
    let (ns, name) = pod_name(pod);

    let mut pvcs = Vec::new();
    for claim in claim_names(pod) {
        match api.get_pvc(ns, claim).await? {
            Some(pvc) => pvcs.push(pvc),
            None => info!("unable to find PVC {}/{}, assuming it was deleted previously", ns, claim),
        }
    }

    for pvc in &pvcs {
        if let Some(volume) = pvc_volume(pvc) {
            detach_pv(api, volume).await?;
        }
    }

    for pvc in &pvcs {
        let claim = pvc.metadata.name.as_deref().unwrap_or_default();
        api.delete_pvc(ns, claim).await?;
        info!("deleted PVC {}/{}", ns, claim);
    }

    api.delete_pod(ns, name).await?;
    info!("deleted pod {}/{} for rescheduling", ns, name);
    Ok(())
}

async fn detach_pv<A: RecoveryApi + ?Sized>(api: &A, volume: &str) -> Result<()> {
    let mut pv = match api.get_pv(volume).await? {
        Some(pv) => pv,
        None => return Ok(()),
    };
    let spec = match pv.spec.as_mut() {
        Some(spec) if spec.claim_ref.is_some() => spec,
        _ => return Ok(()),
    };
    spec.claim_ref = None;
    api.replace_pv(&pv).await?;
    info!("cleared claimRef of PV {}", volume);
    Ok(())
}


#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use mockall::predicate::eq;
    use serde_json::json;

    use super::fixtures::*;
    use super::*;
    use crate::recovery::api::MockRecoveryApi;

    const EVICT: Option<&str> = Some("cassandra.kudo.dev/evict");

    #[tokio::test]
    async fn eviction_label_needs_recovery() {
        let api = MockRecoveryApi::new();
        let p = pod(json!({ "cassandra.kudo.dev/evict": "true" }), false, &["data"]);
        assert_eq!(classify(&api, &p, EVICT).await.unwrap(), Verdict::Evicted);

        let p = pod(json!({ "cassandra.kudo.dev/evict": "false" }), false, &["data"]);
        assert_eq!(classify(&api, &p, EVICT).await.unwrap(), Verdict::Healthy);

        let p = pod(json!({ "cassandra.kudo.dev/evict": "true" }), false, &["data"]);
        assert_eq!(classify(&api, &p, None).await.unwrap(), Verdict::Healthy);
    }

    #[tokio::test]
    async fn scheduled_pods_are_not_inspected() {
        // No expectations: any API call fails the test.
        let api = MockRecoveryApi::new();
        let p = pod(json!({}), false, &["data"]);
        assert_eq!(classify(&api, &p, EVICT).await.unwrap(), Verdict::Healthy);
    }

    #[tokio::test]
    async fn unschedulable_with_missing_pvc() {
        let mut api = MockRecoveryApi::new();
        api.expect_get_pvc()
            .with(eq("cassandra"), eq("data"))
            .returning(|_, _| Ok(None));
        let p = pod(json!({}), true, &["data"]);
        assert_eq!(classify(&api, &p, EVICT).await.unwrap(), Verdict::PvcMissing("data".into()));
    }

    #[tokio::test]
    async fn unschedulable_with_lost_pvc() {
        let mut api = MockRecoveryApi::new();
        api.expect_get_pvc().returning(|_, name| Ok(Some(pvc(name, "Lost", Some("pv-1")))));
        let p = pod(json!({}), true, &["data"]);
        assert_eq!(classify(&api, &p, EVICT).await.unwrap(), Verdict::PvcLost("data".into()));
    }

    #[tokio::test]
    async fn unschedulable_with_pending_pvc_is_left_alone() {
        let mut api = MockRecoveryApi::new();
        api.expect_get_pvc().returning(|_, name| Ok(Some(pvc(name, "Pending", None))));
        let p = pod(json!({}), true, &["data"]);
        assert_eq!(classify(&api, &p, EVICT).await.unwrap(), Verdict::Healthy);
    }

    #[tokio::test]
    async fn unschedulable_with_gone_node() {
        let mut api = MockRecoveryApi::new();
        api.expect_get_pvc().returning(|_, name| Ok(Some(pvc(name, "Bound", Some("pv-1")))));
        api.expect_get_pv()
            .with(eq("pv-1"))
            .returning(|name| Ok(Some(pv(name, Some("node-x"), true))));
        api.expect_node_exists().with(eq("node-x")).returning(|_| Ok(false));
        let p = pod(json!({}), true, &["data"]);
        assert_eq!(classify(&api, &p, EVICT).await.unwrap(), Verdict::NodeGone("node-x".into()));
    }

    #[tokio::test]
    async fn unschedulable_with_live_node_is_left_alone() {
        let mut api = MockRecoveryApi::new();
        api.expect_get_pvc().returning(|_, name| Ok(Some(pvc(name, "Bound", Some("pv-1")))));
        api.expect_get_pv().returning(|name| Ok(Some(pv(name, Some("node-a"), true))));
        api.expect_node_exists().returning(|_| Ok(true));
        let p = pod(json!({}), true, &["data"]);
        assert_eq!(classify(&api, &p, EVICT).await.unwrap(), Verdict::Healthy);
    }

    #[tokio::test]
    async fn unschedulable_with_missing_pv() {
        let mut api = MockRecoveryApi::new();
        api.expect_get_pvc().returning(|_, name| Ok(Some(pvc(name, "Bound", Some("pv-1")))));
        api.expect_get_pv().returning(|_| Ok(None));
        let p = pod(json!({}), true, &["data"]);
        assert_eq!(classify(&api, &p, EVICT).await.unwrap(), Verdict::PvMissing("pv-1".into()));
    }

    #[test]
    fn hostname_affinity() {
        assert_eq!(required_hostname(&pv("pv-1", Some("node-x"), true)), Some("node-x"));
        assert_eq!(required_hostname(&pv("pv-1", None, true)), None);
    }

    #[tokio::test]
    async fn clean_start_detaches_deletes_and_reschedules() {
        let mut api = MockRecoveryApi::new();
        let mut seq = mockall::Sequence::new();
        api.expect_get_pvc()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, name| Ok(Some(pvc(name, "Bound", Some("pv-1")))));
        api.expect_get_pv()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|name| Ok(Some(pv(name, Some("node-x"), true))));
        api.expect_replace_pv()
            .withf(|pv| pv.spec.as_ref().unwrap().claim_ref.is_none())
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(()));
        api.expect_delete_pvc()
            .with(eq("cassandra"), eq("data"))
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Ok(()));
        api.expect_delete_pod()
            .with(eq("cassandra"), eq("cassandra-node-0"))
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Ok(()));

        clean_start(&api, &pod(json!({}), true, &["data"])).await.unwrap();
    }

    #[tokio::test]
    async fn clean_start_twice_tolerates_deleted_pvc() {
        let mut api = MockRecoveryApi::new();
        let lookups = Arc::new(AtomicUsize::new(0));
        let l = lookups.clone();
        api.expect_get_pvc().times(2).returning(move |_, name| {
            if l.fetch_add(1, Ordering::SeqCst) == 0 {
                Ok(Some(pvc(name, "Bound", Some("pv-1"))))
            } else {
                Ok(None)
            }
        });
        api.expect_get_pv().times(1).returning(|name| Ok(Some(pv(name, None, true))));
        api.expect_replace_pv().times(1).returning(|_| Ok(()));
        api.expect_delete_pvc().times(1).returning(|_, _| Ok(()));
        api.expect_delete_pod().times(2).returning(|_, _| Ok(()));

        let p = pod(json!({}), true, &["data"]);
        clean_start(&api, &p).await.unwrap();
        clean_start(&api, &p).await.unwrap();
        assert_eq!(lookups.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn detached_pv_is_not_rewritten() {
        let mut api = MockRecoveryApi::new();
        api.expect_get_pvc().returning(|_, name| Ok(Some(pvc(name, "Bound", Some("pv-1")))));
        api.expect_get_pv().returning(|name| Ok(Some(pv(name, None, false))));
        api.expect_replace_pv().never();
        api.expect_delete_pvc().times(1).returning(|_, _| Ok(()));
        api.expect_delete_pod().times(1).returning(|_, _| Ok(()));

        clean_start(&api, &pod(json!({}), true, &["data"])).await.unwrap();
    }

    #[tokio::test]
    async fn failed_pvc_delete_aborts_before_pod_delete() {
        let mut api = MockRecoveryApi::new();
        api.expect_get_pvc().returning(|_, name| Ok(Some(pvc(name, "Bound", Some("pv-1")))));
        api.expect_get_pv().returning(|name| Ok(Some(pv(name, None, true))));
        api.expect_replace_pv().returning(|_| Ok(()));
        api.expect_delete_pvc()
            .returning(|_, _| Err(ErrorKind::Msg("the server is currently unable to handle the request".into()).into()));
        api.expect_delete_pod().never();

        assert!(clean_start(&api, &pod(json!({}), true, &["data"])).await.is_err());
    }
}
