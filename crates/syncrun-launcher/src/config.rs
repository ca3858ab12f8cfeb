// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration for syncrun-launcher.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Which container runtime processes are launched on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backend {
    /// Local docker daemon.
    Docker,
    /// Kubernetes cluster reached through kubectl.
    Kube,
}

impl FromStr for Backend {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "docker" => Ok(Backend::Docker),
            "kube" | "kubernetes" => Ok(Backend::Kube),
            _ => Err(ConfigError::InvalidValue {
                var: "SYNCRUN_BACKEND",
                value: s.to_string(),
            }),
        }
    }
}

/// How cluster pods relate to the launching process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KubeMode {
    /// The launcher owns the pod for its whole life and relays stdio over sockets.
    Sync,
    /// The pod outlives the launcher; status is read from the document store.
    Async,
}

impl FromStr for KubeMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "sync" => Ok(KubeMode::Sync),
            "async" => Ok(KubeMode::Async),
            _ => Err(ConfigError::InvalidValue {
                var: "SYNCRUN_KUBE_MODE",
                value: s.to_string(),
            }),
        }
    }
}

/// Launcher configuration loaded from environment variables.
///
/// Every process handle receives the values it needs from this struct at
/// construction time; nothing reads the environment after startup.
#[derive(Debug, Clone)]
pub struct LauncherConfig {
    /// Container runtime backend.
    pub backend: Backend,
    /// Cluster process flavor when `backend` is `Kube`.
    pub kube_mode: KubeMode,
    /// Namespace pods are created in.
    pub namespace: String,
    /// kubectl binary.
    pub kubectl_bin: String,
    /// docker binary.
    pub docker_bin: String,
    /// Host directory where docker jobs get their input files.
    pub workspace_root: PathBuf,
    /// Mount source for `workspace_root` inside containers (volume name or host path).
    pub workspace_mount: String,
    /// Docker network containers join.
    pub docker_network: String,
    /// Local directory used to stage files before `kubectl cp`.
    pub staging_dir: PathBuf,
    /// Root of the filesystem status document store.
    pub doc_store_root: PathBuf,
    /// Image for the init container.
    pub init_image: String,
    /// Image for the stdio relay sidecars.
    pub socat_image: String,
    /// Image for the heartbeat sidecar.
    pub curl_image: String,
    /// Pull policy for the main container.
    pub image_pull_policy: String,
    /// Run the socat relays inside the main container instead of as sidecars.
    pub socat_in_main_container: bool,
    /// Address pods use to reach this launcher for stdout/stderr relays.
    pub relay_host: String,
    /// First port of the stdout/stderr relay range.
    pub relay_port_start: u16,
    /// Number of ports in the relay range. Zero means ephemeral ports.
    pub relay_port_count: u16,
    /// Port the stdin relay listens on inside the pod.
    pub stdin_remote_port: u16,
    /// Address the heartbeat server binds to.
    pub heartbeat_addr: SocketAddr,
    /// URL the heartbeat sidecar polls.
    pub heartbeat_url: String,
    /// Status poll interval for cluster and document store checks.
    pub poll_interval: Duration,
    /// How long to wait for the init container to start running.
    pub init_ready_timeout: Duration,
    /// Number of trailing log lines inspected for out-of-memory markers.
    pub oom_log_lines: usize,
    /// Node selector applied to pods from the isolated pool (`key=value`).
    pub isolated_node_selector: Option<(String, String)>,
}

impl Default for LauncherConfig {
    fn default() -> Self {
        Self {
            backend: Backend::Docker,
            kube_mode: KubeMode::Sync,
            namespace: "default".to_string(),
            kubectl_bin: "kubectl".to_string(),
            docker_bin: "docker".to_string(),
            workspace_root: PathBuf::from("/tmp/syncrun/workspace"),
            workspace_mount: "syncrun_workspace".to_string(),
            docker_network: "host".to_string(),
            staging_dir: PathBuf::from("/tmp/syncrun/staging"),
            doc_store_root: PathBuf::from("/tmp/syncrun/documents"),
            init_image: "busybox:1.35".to_string(),
            socat_image: "alpine/socat:1.7.4.4-r0".to_string(),
            curl_image: "curlimages/curl:7.87.0".to_string(),
            image_pull_policy: "IfNotPresent".to_string(),
            socat_in_main_container: false,
            relay_host: "127.0.0.1".to_string(),
            relay_port_start: 9877,
            relay_port_count: 40,
            stdin_remote_port: 9001,
            heartbeat_addr: SocketAddr::from(([0, 0, 0, 0], 9000)),
            heartbeat_url: "http://127.0.0.1:9000".to_string(),
            poll_interval: Duration::from_secs(5),
            init_ready_timeout: Duration::from_secs(5 * 60),
            oom_log_lines: 5,
            isolated_node_selector: None,
        }
    }
}

fn env_or(var: &str, default: String) -> String {
    std::env::var(var).unwrap_or(default)
}

fn parse_env_bool(var: &str, default: bool) -> bool {
    std::env::var(var)
        .map(|v| v == "true" || v == "1")
        .unwrap_or(default)
}

fn parse_env<T: FromStr>(var: &'static str, default: T) -> Result<T, ConfigError> {
    match std::env::var(var) {
        Ok(value) => value
            .parse()
            .map_err(|_| ConfigError::InvalidValue { var, value }),
        Err(_) => Ok(default),
    }
}

impl LauncherConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let backend = parse_env("SYNCRUN_BACKEND", defaults.backend)?;
        let kube_mode = parse_env("SYNCRUN_KUBE_MODE", defaults.kube_mode)?;

        let heartbeat_port: u16 = parse_env("SYNCRUN_HEARTBEAT_PORT", 9000)?;
        let heartbeat_addr = SocketAddr::from(([0, 0, 0, 0], heartbeat_port));
        let relay_host = env_or("SYNCRUN_RELAY_HOST", defaults.relay_host);
        let heartbeat_url = std::env::var("SYNCRUN_HEARTBEAT_URL")
            .unwrap_or_else(|_| format!("http://{}:{}", relay_host, heartbeat_port));

        let poll_interval =
            Duration::from_millis(parse_env("SYNCRUN_POLL_INTERVAL_MS", 5_000u64)?);
        let init_ready_timeout =
            Duration::from_secs(parse_env("SYNCRUN_INIT_READY_TIMEOUT_SECS", 300u64)?);

        let isolated_node_selector = match std::env::var("SYNCRUN_ISOLATED_NODE_SELECTOR") {
            Ok(value) => Some(parse_selector(&value)?),
            Err(_) => None,
        };

        let workspace_root = PathBuf::from(env_or(
            "SYNCRUN_WORKSPACE_ROOT",
            defaults.workspace_root.display().to_string(),
        ));
        let staging_dir = PathBuf::from(env_or(
            "SYNCRUN_STAGING_DIR",
            defaults.staging_dir.display().to_string(),
        ));
        let doc_store_root = PathBuf::from(env_or(
            "SYNCRUN_DOC_STORE_ROOT",
            defaults.doc_store_root.display().to_string(),
        ));

        Ok(Self {
            backend,
            kube_mode,
            namespace: env_or("SYNCRUN_NAMESPACE", defaults.namespace),
            kubectl_bin: env_or("SYNCRUN_KUBECTL_BIN", defaults.kubectl_bin),
            docker_bin: env_or("SYNCRUN_DOCKER_BIN", defaults.docker_bin),
            workspace_root,
            workspace_mount: env_or("SYNCRUN_WORKSPACE_MOUNT", defaults.workspace_mount),
            docker_network: env_or("SYNCRUN_DOCKER_NETWORK", defaults.docker_network),
            staging_dir,
            doc_store_root,
            init_image: env_or("SYNCRUN_INIT_IMAGE", defaults.init_image),
            socat_image: env_or("SYNCRUN_SOCAT_IMAGE", defaults.socat_image),
            curl_image: env_or("SYNCRUN_CURL_IMAGE", defaults.curl_image),
            image_pull_policy: env_or("SYNCRUN_IMAGE_PULL_POLICY", defaults.image_pull_policy),
            socat_in_main_container: parse_env_bool("SYNCRUN_SOCAT_IN_MAIN_CONTAINER", false),
            relay_host,
            relay_port_start: parse_env("SYNCRUN_RELAY_PORT_START", defaults.relay_port_start)?,
            relay_port_count: parse_env("SYNCRUN_RELAY_PORT_COUNT", defaults.relay_port_count)?,
            stdin_remote_port: parse_env("SYNCRUN_STDIN_REMOTE_PORT", defaults.stdin_remote_port)?,
            heartbeat_addr,
            heartbeat_url,
            poll_interval,
            init_ready_timeout,
            oom_log_lines: parse_env("SYNCRUN_OOM_LOG_LINES", defaults.oom_log_lines)?,
            isolated_node_selector,
        })
    }

    /// Longest process name the configured backend accepts.
    pub fn name_limit(&self) -> usize {
        match self.backend {
            Backend::Docker => crate::descriptor::DOCKER_NAME_LIMIT,
            Backend::Kube => crate::descriptor::KUBE_NAME_LIMIT,
        }
    }
}

fn parse_selector(value: &str) -> Result<(String, String), ConfigError> {
    match value.split_once('=') {
        Some((k, v)) if !k.is_empty() => Ok((k.to_string(), v.to_string())),
        _ => Err(ConfigError::InvalidValue {
            var: "SYNCRUN_ISOLATED_NODE_SELECTOR",
            value: value.to_string(),
        }),
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A variable is set but cannot be parsed.
    #[error("Invalid value for {var}: {value}")]
    InvalidValue {
        /// Variable name.
        var: &'static str,
        /// Offending value.
        value: String,
    },
}
