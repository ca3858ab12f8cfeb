// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Synchronous cluster process.
//!
//! Runs one connector pod and makes it look like a local process for as long
//! as the launcher lives:
//!
//! 1. Two relay ports are leased and bound; accept tasks wait for the pod's
//!    stdout and stderr relays to connect back.
//! 2. The pod is created. A watch task polls it and completes the exit code
//!    the moment the main container terminates, falling back to 143 if the
//!    pod disappears or cannot be observed.
//! 3. Once the init container runs, input files are copied in, the sentinel
//!    last.
//! 4. After the main container is ready, stdin is connected to the pod's
//!    relay port.
//!
//! Any failure during these steps deletes the pod and releases local
//! resources before the error is returned.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::traits::*;
use crate::cluster::manifest::{
    CONFIG_DIR, INIT_CONTAINER, MAIN_CONTAINER, POD_INFO_FILE, RelayPorts, SUCCESS_FILE,
    sync_pod_manifest,
};
use crate::cluster::{ClusterApi, ClusterError, PodPhase, PodStatus};
use crate::config::LauncherConfig;
use crate::descriptor::LaunchDescriptor;
use crate::error::LaunchError;
use crate::ports::PortPool;

/// Poll interval while the pod is starting up.
const STARTUP_POLL: Duration = Duration::from_millis(100);

/// Consecutive failed status reads before the watch gives up.
const MAX_WATCH_FAILURES: u32 = 5;

/// Attempts to connect to the pod's stdin relay.
const STDIN_CONNECT_ATTEMPTS: u32 = 20;

fn take_slot<T>(slot: &Mutex<Option<T>>) -> Option<T> {
    slot.lock().unwrap_or_else(|e| e.into_inner()).take()
}

/// Exit code for a pod that reached a terminal state, if it has.
///
/// A non-zero main container exit, or a terminal phase without a main
/// container status, is checked for out-of-memory evidence before being
/// reported as-is.
pub(crate) async fn terminal_exit_code(
    cluster: &dyn ClusterApi,
    namespace: &str,
    name: &str,
    status: &PodStatus,
    oom_lines: usize,
) -> Option<i32> {
    if let Some(main) = status.container(MAIN_CONTAINER)
        && let Some(code) = main.exit_code
    {
        if main.reason.as_deref() == Some("OOMKilled") {
            return Some(EXIT_OOM);
        }
        if code != EXIT_SUCCESS && oom_in_logs(cluster, namespace, name, oom_lines).await {
            return Some(EXIT_OOM);
        }
        return Some(code);
    }

    if !status.is_terminal() {
        return None;
    }

    if oom_in_logs(cluster, namespace, name, oom_lines).await {
        return Some(EXIT_OOM);
    }
    Some(if status.phase == PodPhase::Succeeded {
        EXIT_SUCCESS
    } else {
        EXIT_FAILED
    })
}

/// Whether the main container's last `lines` log lines mention running out of memory.
pub(crate) async fn oom_in_logs(
    cluster: &dyn ClusterApi,
    namespace: &str,
    name: &str,
    lines: usize,
) -> bool {
    match cluster
        .tail_logs(namespace, name, MAIN_CONTAINER, lines)
        .await
    {
        Ok(tail) => has_oom_marker(&tail),
        Err(e) => {
            debug!(pod = %name, error = %e, "Could not read logs for OOM check");
            false
        }
    }
}

async fn watch_pod(
    cluster: Arc<dyn ClusterApi>,
    namespace: String,
    name: String,
    exit: Arc<ExitCodeCell>,
    poll_interval: Duration,
    oom_lines: usize,
    shutdown: CancellationToken,
) {
    let mut failures = 0u32;

    loop {
        match cluster.get_pod(&namespace, &name).await {
            Ok(Some(status)) => {
                failures = 0;
                if let Some(code) =
                    terminal_exit_code(cluster.as_ref(), &namespace, &name, &status, oom_lines)
                        .await
                {
                    if exit.complete(code) {
                        info!(pod = %name, exit_code = code, "Pod terminated");
                    }
                    return;
                }
            }
            Ok(None) => {
                if exit.complete(EXIT_KILLED) {
                    warn!(pod = %name, "Pod disappeared, reporting as killed");
                }
                return;
            }
            Err(e) => {
                failures += 1;
                warn!(pod = %name, error = %e, failures, "Failed to read pod status");
                if failures >= MAX_WATCH_FAILURES {
                    if exit.complete(EXIT_KILLED) {
                        error!(pod = %name, "Lost track of pod, reporting as killed");
                    }
                    return;
                }
            }
        }

        tokio::select! {
            biased;

            _ = shutdown.cancelled() => {
                debug!(pod = %name, "Pod watch stopped");
                return;
            }

            _ = tokio::time::sleep(poll_interval) => {}
        }
    }
}

fn spawn_accept(
    listener: TcpListener,
    tx: oneshot::Sender<TcpStream>,
    pod: String,
    stream: &'static str,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        match listener.accept().await {
            Ok((socket, peer)) => {
                debug!(pod = %pod, stream, peer = %peer, "Relay connected");
                let _ = tx.send(socket);
            }
            Err(e) => warn!(pod = %pod, stream, error = %e, "Relay accept failed"),
        }
    })
}

/// Pod-backed process owned by the launcher for its whole life.
pub struct KubePodProcess {
    info: ProcessInfo,
    namespace: String,
    cluster: Arc<dyn ClusterApi>,
    ports: Arc<PortPool>,
    leased: Vec<u16>,
    relay: RelayPorts,
    exit: Arc<ExitCodeCell>,
    closed: AtomicBool,
    shutdown: CancellationToken,
    stdin: Mutex<Option<TcpStream>>,
    stdout: Mutex<Option<oneshot::Receiver<TcpStream>>>,
    stderr: Mutex<Option<oneshot::Receiver<TcpStream>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl KubePodProcess {
    /// Launch `descriptor` as pod `name`.
    pub async fn create(
        cluster: Arc<dyn ClusterApi>,
        ports: Arc<PortPool>,
        config: &LauncherConfig,
        descriptor: &LaunchDescriptor,
        name: String,
    ) -> std::result::Result<Self, LaunchError> {
        let stdout_port = ports.take().ok_or(LaunchError::NoPortsAvailable)?;
        let Some(stderr_port) = ports.take() else {
            ports.offer(stdout_port);
            return Err(LaunchError::NoPortsAvailable);
        };
        let leased = vec![stdout_port, stderr_port];

        let bound = async {
            let out = TcpListener::bind(("0.0.0.0", stdout_port)).await?;
            let err = TcpListener::bind(("0.0.0.0", stderr_port)).await?;
            let relay = RelayPorts {
                stdout: out.local_addr()?.port(),
                stderr: err.local_addr()?.port(),
            };
            Ok::<_, std::io::Error>((out, err, relay))
        }
        .await;

        let (out_listener, err_listener, relay) = match bound {
            Ok(bound) => bound,
            Err(e) => {
                for port in leased {
                    ports.offer(port);
                }
                return Err(e.into());
            }
        };

        let (out_tx, out_rx) = oneshot::channel();
        let (err_tx, err_rx) = oneshot::channel();
        let tasks = vec![
            spawn_accept(out_listener, out_tx, name.clone(), "stdout"),
            spawn_accept(err_listener, err_tx, name.clone(), "stderr"),
        ];

        let process = Self {
            info: ProcessInfo {
                namespace: Some(config.namespace.clone()),
                name,
                image: descriptor.image().to_string(),
                pull_policy: Some(config.image_pull_policy.clone()),
            },
            namespace: config.namespace.clone(),
            cluster,
            ports,
            leased,
            relay,
            exit: Arc::new(ExitCodeCell::new()),
            closed: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
            stdin: Mutex::new(None),
            stdout: Mutex::new(Some(out_rx)),
            stderr: Mutex::new(Some(err_rx)),
            tasks: Mutex::new(tasks),
        };

        match process.start(config, descriptor).await {
            Ok(()) => {
                info!(pod = %process.info.name, image = %process.info.image, "Pod started");
                Ok(process)
            }
            Err(e) => {
                error!(pod = %process.info.name, error = %e, "Pod startup failed, cleaning up");
                if let Err(delete_err) = process
                    .cluster
                    .delete_pod(&process.namespace, &process.info.name)
                    .await
                {
                    warn!(pod = %process.info.name, error = %delete_err, "Failed to delete pod after startup failure");
                }
                process.close();
                Err(e)
            }
        }
    }

    async fn start(
        &self,
        config: &LauncherConfig,
        descriptor: &LaunchDescriptor,
    ) -> std::result::Result<(), LaunchError> {
        let name = &self.info.name;
        let manifest = sync_pod_manifest(name, descriptor, config, self.relay);

        self.cluster
            .create_pod(&self.namespace, &manifest)
            .await
            .map_err(|e| match e {
                ClusterError::Rejected(msg) => LaunchError::PodRejected(msg),
                other => LaunchError::Cluster(other),
            })?;
        debug!(pod = %name, "Pod created");

        let watch = tokio::spawn(watch_pod(
            self.cluster.clone(),
            self.namespace.clone(),
            name.clone(),
            self.exit.clone(),
            config.poll_interval,
            config.oom_log_lines,
            self.shutdown.clone(),
        ));
        self.tasks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(watch);

        self.wait_until(config.init_ready_timeout, |status| {
            status.init_container(INIT_CONTAINER).is_some_and(|c| c.running)
        })
        .await?;
        debug!(pod = %name, "Init container running");

        self.copy_files(descriptor).await?;

        let status = self
            .wait_until(config.init_ready_timeout, |status| {
                status.is_ready(MAIN_CONTAINER) || status.is_terminal()
            })
            .await;
        let status = match status {
            Ok(status) => status,
            // A fast connector may finish and be cleaned up before we look.
            Err(LaunchError::TerminatedDuringStartup(_)) if self.exit.get().is_some() => {
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        if descriptor.uses_stdin() && !status.is_terminal() {
            let ip = status.pod_ip.clone().ok_or_else(|| {
                LaunchError::StartFailed(format!("pod {} has no IP", name))
            })?;
            let stream = self.connect_stdin(&ip, config.stdin_remote_port).await?;
            *self.stdin.lock().unwrap_or_else(|e| e.into_inner()) = Some(stream);
        }

        Ok(())
    }

    async fn wait_until<F>(&self, timeout: Duration, ready: F) -> std::result::Result<PodStatus, LaunchError>
    where
        F: Fn(&PodStatus) -> bool,
    {
        let name = &self.info.name;
        let deadline = Instant::now() + timeout;

        loop {
            match self.cluster.get_pod(&self.namespace, name).await? {
                Some(status) if ready(&status) => return Ok(status),
                Some(status) if status.is_terminal() => {
                    return Err(LaunchError::TerminatedDuringStartup(name.clone()));
                }
                Some(_) => {}
                None => return Err(LaunchError::TerminatedDuringStartup(name.clone())),
            }

            if Instant::now() >= deadline {
                return Err(LaunchError::InitTimeout {
                    pod: name.clone(),
                    timeout_secs: timeout.as_secs(),
                });
            }
            tokio::time::sleep(STARTUP_POLL).await;
        }
    }

    async fn copy_files(&self, descriptor: &LaunchDescriptor) -> std::result::Result<(), LaunchError> {
        let name = &self.info.name;
        let pod_info = serde_json::to_vec(&self.info)?;

        let files = descriptor
            .files()
            .iter()
            .map(|(file, contents)| (file.as_str(), contents.as_bytes()))
            .chain(std::iter::once((POD_INFO_FILE, pod_info.as_slice())))
            .chain(std::iter::once((SUCCESS_FILE, b"".as_slice())));

        for (file, contents) in files {
            let remote = format!("{}/{}", CONFIG_DIR, file);
            self.cluster
                .copy_to_pod(&self.namespace, name, INIT_CONTAINER, &remote, contents)
                .await?;
        }

        debug!(pod = %name, files = descriptor.files().len(), "Input files copied");
        Ok(())
    }

    async fn connect_stdin(&self, ip: &str, port: u16) -> std::result::Result<TcpStream, LaunchError> {
        let mut last_err = None;
        for attempt in 1..=STDIN_CONNECT_ATTEMPTS {
            match TcpStream::connect((ip, port)).await {
                Ok(stream) => {
                    debug!(pod = %self.info.name, attempt, "Connected to stdin relay");
                    return Ok(stream);
                }
                Err(e) => {
                    last_err = Some(e);
                    tokio::time::sleep(STARTUP_POLL).await;
                }
            }
        }
        Err(last_err
            .map(LaunchError::Io)
            .unwrap_or_else(|| LaunchError::StartFailed("stdin relay unreachable".into())))
    }

    /// Ports the pod's stdout/stderr relays connect to.
    pub fn relay_ports(&self) -> RelayPorts {
        self.relay
    }

    /// Release sockets, background tasks and leased ports.
    ///
    /// Runs at most once; returns true for the call that did the work.
    pub fn close(&self) -> bool {
        if self.closed.swap(true, Ordering::SeqCst) {
            return false;
        }

        self.shutdown.cancel();
        for task in self
            .tasks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain(..)
        {
            task.abort();
        }
        drop(take_slot(&self.stdin));
        drop(take_slot(&self.stdout));
        drop(take_slot(&self.stderr));

        for port in &self.leased {
            self.ports.offer(*port);
        }

        debug!(pod = %self.info.name, "Process resources released");
        true
    }

    /// Whether local resources have been released.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Wait for a relay connection, giving up once the pod is terminal.
    ///
    /// A relay that connected before the exit was observed is still returned.
    async fn take_relay(
        &self,
        slot: &Mutex<Option<oneshot::Receiver<TcpStream>>>,
        stream: &'static str,
    ) -> Option<ProcessReader> {
        let mut rx = take_slot(slot)?;
        let connected = tokio::select! {
            biased;
            connected = &mut rx => connected.ok(),
            code = self.exit.wait() => {
                let late = rx.try_recv().ok();
                if late.is_none() {
                    debug!(pod = %self.info.name, stream, exit_code = code, "Pod exited before its relay connected");
                }
                late
            }
        };
        connected.map(|s| Box::new(s) as ProcessReader)
    }
}

#[async_trait]
impl ProcessHandle for KubePodProcess {
    fn info(&self) -> &ProcessInfo {
        &self.info
    }

    async fn exit_value(&self) -> Result<i32> {
        match self.exit.get() {
            Some(code) => {
                self.close();
                Ok(code)
            }
            None => Err(ProcessError::NotTerminated),
        }
    }

    async fn wait_for(&self) -> Result<i32> {
        let code = self.exit.wait().await;
        self.close();
        Ok(code)
    }

    async fn wait_for_timeout(&self, timeout: Duration) -> Result<bool> {
        match tokio::time::timeout(timeout, self.exit.wait()).await {
            Ok(_) => {
                self.close();
                Ok(true)
            }
            Err(_) => Ok(false),
        }
    }

    async fn destroy(&self) -> Result<()> {
        let name = &self.info.name;
        info!(pod = %name, "Destroying pod");

        match self.cluster.delete_pod(&self.namespace, name).await {
            Ok(true) => debug!(pod = %name, "Pod deleted"),
            Ok(false) => debug!(pod = %name, "Pod already gone"),
            Err(e) => warn!(pod = %name, error = %e, "Failed to delete pod"),
        }

        self.exit.complete(EXIT_KILLED);
        self.close();
        Ok(())
    }

    async fn take_stdin(&self) -> Option<ProcessWriter> {
        take_slot(&self.stdin).map(|s| Box::new(s) as ProcessWriter)
    }

    async fn take_stdout(&self) -> Option<ProcessReader> {
        self.take_relay(&self.stdout, "stdout").await
    }

    async fn take_stderr(&self) -> Option<ProcessReader> {
        self.take_relay(&self.stderr, "stderr").await
    }
}
