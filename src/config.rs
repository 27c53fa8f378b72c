//! Runtime configuration.
//!
//! Both binaries build their configuration once from the environment at process entry and
//! pass it down explicitly.

use std::path::PathBuf;
use std::time::Duration;

use lazy_static::lazy_static;
use regex::Regex;
use serde::de::Error as DeError;
use serde::{Deserialize, Deserializer};

use crate::errors::*;

lazy_static! {
    static ref DURATION_PART: Regex = Regex::new(r"([0-9]+)(h|ms|m|s)").unwrap();
}

/// Configuration of the bootstrap helper running inside a Cassandra pod.
#[derive(Clone, Debug, Deserialize)]
pub struct BootstrapConfig {
    /// The Kubernetes namespace of this pod.
    pub pod_namespace: String,
    /// The name of this pod, also its key in the topology registry.
    pub pod_name: String,
    /// The current IP address of this pod.
    pub pod_ip: String,
    /// The name of the topology registry configmap.
    #[serde(rename = "cassandra_ip_lock_cm")]
    pub registry_name: String,
    /// How long `wait` waits for the node to rejoin the ring.
    #[serde(deserialize_with = "deserialize_duration")]
    pub bootstrap_timeout: Duration,
    /// The JMX port used when talking to a remote node.
    #[serde(default = "default_jmx_port")]
    pub jmx_port: u16,
    #[serde(default)]
    pub use_ssl: bool,
    /// Probe the old IP and shut it down if it still runs a live node.
    ///
    /// This is guarded by a flag, as the probe can take quite a while and delays node startup.
    #[serde(default)]
    pub shutdown_old_reachable_node: bool,

    #[serde(default = "default_replace_ip_file")]
    pub replace_ip_file: PathBuf,
    /// Exists once Cassandra has bootstrapped on this volume.
    #[serde(default = "default_system_data_dir")]
    pub system_data_dir: PathBuf,
    #[serde(default = "default_auth_username_file")]
    pub auth_username_file: PathBuf,
    #[serde(default = "default_auth_password_file")]
    pub auth_password_file: PathBuf,
    #[serde(default = "default_nodetool_path")]
    pub nodetool_path: String,
}

impl BootstrapConfig {
    pub fn new() -> Result<Self> {
        Ok(envy::from_env()?)
    }
}

/// Configuration of the pod recovery controller.
#[derive(Clone, Debug, Deserialize)]
pub struct RecoveryConfig {
    /// Restrict the controller to a single namespace. All namespaces when unset.
    #[serde(default)]
    pub watch_namespace: Option<String>,
    /// Only watch pods labelled `app.kubernetes.io/instance=<instance_name>`.
    #[serde(default)]
    pub instance_name: Option<String>,
    /// A pod carrying this label with value `"true"` is recovered unconditionally.
    #[serde(default)]
    pub eviction_label: Option<String>,
    /// Number of requeues of a failing pod before it is dropped.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

impl RecoveryConfig {
    pub fn new() -> Result<Self> {
        Ok(envy::from_env()?)
    }

    pub fn label_selector(&self) -> Option<String> {
        self.instance_name
            .as_ref()
            .filter(|i| !i.is_empty())
            .map(|i| format!("app.kubernetes.io/instance={}", i))
    }
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        RecoveryConfig {
            watch_namespace: None,
            instance_name: None,
            eviction_label: None,
            max_retries: default_max_retries(),
        }
    }
}

/// Parse durations of the form `1h30m`, `12m`, `90s` or `500ms`.
pub fn parse_duration(raw: &str) -> Result<Duration> {
    let trimmed = raw.trim();
    let mut total = Duration::from_secs(0);
    let mut consumed = 0;
    for caps in DURATION_PART.captures_iter(trimmed) {
        let whole = caps.get(0).map(|m| m.as_str()).unwrap_or_default();
        consumed += whole.len();
        let value: u64 = caps[1].parse().chain_err(|| ErrorKind::InvalidDuration(raw.to_string()))?;
        let part = match &caps[2] {
            "h" => value.checked_mul(3600).map(Duration::from_secs),
            "m" => value.checked_mul(60).map(Duration::from_secs),
            "s" => Some(Duration::from_secs(value)),
            _ => Some(Duration::from_millis(value)),
        };
        total = match part.and_then(|part| total.checked_add(part)) {
            Some(total) => total,
            None => bail!(ErrorKind::InvalidDuration(raw.to_string())),
        };
    }
    if consumed == 0 || consumed != trimmed.len() {
        bail!(ErrorKind::InvalidDuration(raw.to_string()));
    }
    Ok(total)
}

fn deserialize_duration<'de, D: Deserializer<'de>>(val: D) -> std::result::Result<Duration, D::Error> {
    let raw: String = Deserialize::deserialize(val)?;
    parse_duration(&raw).map_err(|err| DeError::custom(format!("error parsing BOOTSTRAP_TIMEOUT: {}", err)))
}

fn default_jmx_port() -> u16 {
    7199
}

fn default_replace_ip_file() -> PathBuf {
    PathBuf::from("/var/lib/cassandra/replace.ip")
}

fn default_system_data_dir() -> PathBuf {
    PathBuf::from("/var/lib/cassandra/data/system")
}

fn default_auth_username_file() -> PathBuf {
    PathBuf::from("/etc/cassandra/authentication/username")
}

fn default_auth_password_file() -> PathBuf {
    PathBuf::from("/etc/cassandra/authentication/password")
}

fn default_nodetool_path() -> String {
    "nodetool".to_string()
}

fn default_max_retries() -> u32 {
    5
}
