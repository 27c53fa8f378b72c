//! The pod recovery controller.
//!
//! Watches pods and force-reschedules the ones which cannot recover on their own: pods marked
//! for eviction, and unschedulable pods whose local volume is gone or pinned to a node that no
//! longer exists.

pub mod api;
mod backoff;
pub mod pod;

use std::sync::Arc;

use error_chain::ChainedError;
use futures::{future::BoxFuture, FutureExt, StreamExt};
use k8s_openapi::api::core::v1::Pod;
use kube::{api::Api, client::Client, ResourceExt};
use kube_runtime::controller::{Action, Controller};
use kube_runtime::watcher;
use log::{debug, error, info, warn};

use self::api::{KubeRecoveryApi, RecoveryApi};
pub use self::backoff::FailureBackoff;
use self::pod::{classify, clean_start, Verdict};
use crate::config::RecoveryConfig;
use crate::errors::*;

// Shared by every reconcile and error_policy call.
pub struct Data<A> {
    api: A,
    config: RecoveryConfig,
    backoff: FailureBackoff,
}

fn key(namespace: &str, name: &str) -> String {
    format!("{}/{}", namespace, name)
}

impl<A: RecoveryApi> Data<A> {
    pub fn new(api: A, config: RecoveryConfig) -> Self {
        Data {
            api,
            config,
            backoff: FailureBackoff::default(),
        }
    }

    /// Inspect the current state of the pod and recover it if needed.
    ///
    /// The pod is fetched again rather than trusting the watch event, which may be stale. A pod
    /// which no longer exists needs nothing.
    pub async fn recover(&self, namespace: &str, name: &str) -> Result<Verdict> {
        let pod = match self.api.get_pod(namespace, name).await? {
            Some(pod) => pod,
            None => {
                debug!("pod {}/{} is gone, nothing to do", namespace, name);
                return Ok(Verdict::Healthy);
            }
        };

        let verdict = classify(&self.api, &pod, self.config.eviction_label.as_deref())
            .await
            .chain_err(|| format!("failed to detect recovery condition of {}/{}", namespace, name))?;
        if verdict.needs_recovery() {
            info!("pod {}/{} meets the recovery conditions: {}", namespace, name, verdict);
            clean_start(&self.api, &pod)
                .await
                .chain_err(|| format!("failed to clean start pod {}/{}", namespace, name))?;
        }
        Ok(verdict)
    }

    /// Requeue a failed key with backoff, or drop it once it exhausted its retries.
    pub fn on_error(&self, key: &str, error: &Error) -> Action {
        let requeues = self.backoff.num_requeues(key);
        if requeues < self.config.max_retries {
            let delay = self.backoff.when(key);
            warn!("error processing {} (will retry in {:?}): {}", key, delay, error.display_chain());
            Action::requeue(delay)
        } else {
            error!("error processing {} (giving up after {} retries): {}", key, requeues, error.display_chain());
            self.backoff.forget(key);
            Action::await_change()
        }
    }
}

async fn reconcile<A: RecoveryApi>(pod: Arc<Pod>, ctx: Arc<Data<A>>) -> Result<Action> {
    let ns = pod.namespace().unwrap_or_default();
    let name = pod.name_any();
    debug!("reconcile pod {}/{}", ns, name);

    ctx.recover(&ns, &name).await?;
    ctx.backoff.forget(&key(&ns, &name));
    Ok(Action::await_change())
}

fn error_policy<A: RecoveryApi>(pod: Arc<Pod>, error: &Error, ctx: Arc<Data<A>>) -> Action {
    let ns = pod.namespace().unwrap_or_default();
    ctx.on_error(&key(&ns, &pod.name_any()), error)
}

pub struct Manager {}

/// Manager that owns the pod recovery Controller
impl Manager {
    /// Lifecycle initialization interface for app
    ///
    /// This returns a `Manager` that drives a `Controller` + a future to be awaited
    /// It is up to `main` to wait for the controller stream.
    pub fn new(client: Client, config: RecoveryConfig) -> (Self, BoxFuture<'static, ()>) {
        let pods: Api<Pod> = match &config.watch_namespace {
            Some(ns) if !ns.is_empty() => Api::namespaced(client.clone(), ns),
            _ => Api::all(client.clone()),
        };
        let mut watch = watcher::Config::default();
        if let Some(selector) = config.label_selector() {
            watch = watch.labels(&selector);
        }
        info!(
            "watching pods in {} matching {:?}",
            config.watch_namespace.as_deref().unwrap_or("all namespaces"),
            config.label_selector()
        );

        let context = Arc::new(Data::new(KubeRecoveryApi::new(client), config));
        let drainer = Controller::new(pods, watch)
            .shutdown_on_signal()
            .run(reconcile, error_policy, context)
            .for_each(|res| {
                match res {
                    Ok((pod, _)) => debug!("reconciled {}", pod),
                    Err(err) => warn!("reconcile failed: {}", err),
                }
                futures::future::ready(())
            })
            .boxed();
        // The stream only reports outcomes, but it has to be polled for the controller to run.

        (Self {}, drainer)
    }
}

#[cfg(test)]
mod tests {
    use mockall::predicate::eq;
    use serde_json::json;

    use super::api::MockRecoveryApi;
    use super::pod::fixtures::*;
    use super::*;

    fn config(max_retries: u32) -> RecoveryConfig {
        RecoveryConfig {
            eviction_label: Some("cassandra.kudo.dev/evict".into()),
            max_retries,
            ..RecoveryConfig::default()
        }
    }

    #[tokio::test]
    async fn deleted_pod_is_a_noop() {
        let mut api = MockRecoveryApi::new();
        api.expect_get_pod().returning(|_, _| Ok(None));
        let data = Data::new(api, config(5));
        assert_eq!(data.recover("cassandra", "cassandra-node-0").await.unwrap(), Verdict::Healthy);
    }

    #[tokio::test]
    async fn pod_on_gone_node_is_rescheduled() {
        let mut api = MockRecoveryApi::new();
        api.expect_get_pod()
            .with(eq("cassandra"), eq("cassandra-node-0"))
            .returning(|_, _| Ok(Some(pod(json!({}), true, &["data"]))));
        api.expect_get_pvc().returning(|_, name| Ok(Some(pvc(name, "Bound", Some("pv-1")))));
        api.expect_get_pv().returning(|name| Ok(Some(pv(name, Some("node-x"), true))));
        api.expect_node_exists().with(eq("node-x")).returning(|_| Ok(false));
        api.expect_replace_pv()
            .withf(|pv| pv.metadata.name.as_deref() == Some("pv-1") && pv.spec.as_ref().unwrap().claim_ref.is_none())
            .times(1)
            .returning(|_| Ok(()));
        api.expect_delete_pvc()
            .with(eq("cassandra"), eq("data"))
            .times(1)
            .returning(|_, _| Ok(()));
        api.expect_delete_pod()
            .with(eq("cassandra"), eq("cassandra-node-0"))
            .times(1)
            .returning(|_, _| Ok(()));

        let ctx = Arc::new(Data::new(api, config(5)));
        let verdict = ctx.recover("cassandra", "cassandra-node-0").await.unwrap();
        assert_eq!(verdict, Verdict::NodeGone("node-x".into()));
    }

    #[tokio::test]
    async fn healthy_pod_is_left_alone() {
        let mut api = MockRecoveryApi::new();
        api.expect_get_pod().returning(|_, _| Ok(Some(pod(json!({}), false, &["data"]))));
        api.expect_delete_pod().never();

        let ctx = Arc::new(Data::new(api, config(5)));
        let p = Arc::new(pod(json!({}), false, &["data"]));
        assert_eq!(reconcile(p, ctx).await.unwrap(), Action::await_change());
    }

    #[tokio::test]
    async fn failures_are_retried_then_dropped() {
        let mut api = MockRecoveryApi::new();
        api.expect_get_pod()
            .returning(|_, _| Err(ErrorKind::Msg("connection reset".into()).into()));
        let ctx = Arc::new(Data::new(api, config(2)));
        let p = Arc::new(pod(json!({}), true, &["data"]));
        let key = "cassandra/cassandra-node-0";

        for _ in 0..2 {
            let err = reconcile(p.clone(), ctx.clone()).await.unwrap_err();
            assert_ne!(error_policy(p.clone(), &err, ctx.clone()), Action::await_change());
        }
        assert_eq!(ctx.backoff.num_requeues(key), 2);

        let err = reconcile(p.clone(), ctx.clone()).await.unwrap_err();
        assert_eq!(error_policy(p.clone(), &err, ctx.clone()), Action::await_change());
        assert_eq!(ctx.backoff.num_requeues(key), 0);
    }

    #[tokio::test]
    async fn success_resets_retries() {
        let mut api = MockRecoveryApi::new();
        let mut seq = mockall::Sequence::new();
        api.expect_get_pod()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Err(ErrorKind::Msg("connection reset".into()).into()));
        api.expect_get_pod()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Ok(None));
        let ctx = Arc::new(Data::new(api, config(5)));
        let p = Arc::new(pod(json!({}), true, &["data"]));

        let err = reconcile(p.clone(), ctx.clone()).await.unwrap_err();
        error_policy(p.clone(), &err, ctx.clone());
        assert_eq!(ctx.backoff.num_requeues("cassandra/cassandra-node-0"), 1);

        reconcile(p, ctx.clone()).await.unwrap();
        assert_eq!(ctx.backoff.num_requeues("cassandra/cassandra-node-0"), 0);
    }
}
