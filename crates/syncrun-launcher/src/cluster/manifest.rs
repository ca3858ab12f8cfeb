// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Pod manifests for connector workloads.
//!
//! Both pod flavors share the same skeleton: an init container that creates
//! the stdio pipes and waits for the input files, and a main container that
//! runs the connector against a shared in-memory config volume. The
//! synchronous flavor adds stdio relays and a heartbeat sidecar.

use serde_json::{Map, Value, json};

use crate::config::LauncherConfig;
use crate::descriptor::{LaunchDescriptor, ResourceRequirements};

/// Main container name.
pub const MAIN_CONTAINER: &str = "main";
/// Init container name.
pub const INIT_CONTAINER: &str = "init";
/// Heartbeat sidecar name.
pub const HEARTBEAT_CONTAINER: &str = "call-heartbeat-server";

/// Directory holding the stdio named pipes.
pub const PIPES_DIR: &str = "/pipes";
/// Directory holding the input files.
pub const CONFIG_DIR: &str = "/config";
/// Directory holding termination markers shared between containers.
pub const TERMINATION_DIR: &str = "/termination";
/// Sentinel copied last; its presence releases the init container.
pub const SUCCESS_FILE: &str = "FINISHED_UPLOADING";
/// File describing the pod to the workload.
pub const POD_INFO_FILE: &str = "KUBE_POD_INFO";
/// How long the init container waits for the sentinel.
pub const INIT_WAIT_SECS: u32 = 60;

const STDIN_PIPE: &str = "/pipes/stdin";
const STDOUT_PIPE: &str = "/pipes/stdout";
const STDERR_PIPE: &str = "/pipes/stderr";
const TERMINATION_MAIN: &str = "/termination/main";
const TERMINATION_CHECK: &str = "/termination/check";

/// Local ports the relays connect back to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelayPorts {
    /// Port receiving the workload's stdout.
    pub stdout: u16,
    /// Port receiving the workload's stderr.
    pub stderr: u16,
}

/// Quote `arg` for a POSIX shell.
pub fn shell_quote(arg: &str) -> String {
    format!("'{}'", arg.replace('\'', r"'\''"))
}

fn resources_json(resources: &ResourceRequirements) -> Value {
    let mut requests = Map::new();
    let mut limits = Map::new();
    if let Some(cpu) = &resources.cpu_request {
        requests.insert("cpu".into(), json!(cpu));
    }
    if let Some(mem) = &resources.memory_request {
        requests.insert("memory".into(), json!(mem));
    }
    if let Some(cpu) = &resources.cpu_limit {
        limits.insert("cpu".into(), json!(cpu));
    }
    if let Some(mem) = &resources.memory_limit {
        limits.insert("memory".into(), json!(mem));
    }

    let mut out = Map::new();
    if !requests.is_empty() {
        out.insert("requests".into(), Value::Object(requests));
    }
    if !limits.is_empty() {
        out.insert("limits".into(), Value::Object(limits));
    }
    Value::Object(out)
}

fn labels(descriptor: &LaunchDescriptor) -> Value {
    let mut labels = Map::new();
    labels.insert("syncrun/job-id".into(), json!(descriptor.job_id()));
    labels.insert(
        "syncrun/attempt".into(),
        json!(descriptor.attempt().to_string()),
    );
    labels.insert("syncrun/step".into(), json!(descriptor.step().as_str()));
    if let Some(id) = descriptor.connection_id() {
        labels.insert("syncrun/connection-id".into(), json!(id.to_string()));
    }
    if let Some(id) = descriptor.workspace_id() {
        labels.insert("syncrun/workspace-id".into(), json!(id.to_string()));
    }
    Value::Object(labels)
}

fn env_json(descriptor: &LaunchDescriptor, extra: &[(&str, String)]) -> Value {
    let mut env: Vec<Value> = vec![
        json!({"name": "JOB_ID", "value": descriptor.job_id()}),
        json!({"name": "ATTEMPT_ID", "value": descriptor.attempt().to_string()}),
    ];
    for (k, v) in extra {
        env.push(json!({"name": k, "value": v}));
    }
    for (k, v) in descriptor.env() {
        env.push(json!({"name": k, "value": v}));
    }
    Value::Array(env)
}

fn init_script(make_pipes: bool, uses_stdin: bool) -> String {
    let mut script = String::from("set -e\n");
    if make_pipes {
        if uses_stdin {
            script.push_str(&format!("mkfifo {}\n", STDIN_PIPE));
        }
        script.push_str(&format!("mkfifo {} {}\n", STDOUT_PIPE, STDERR_PIPE));
    }
    script.push_str(&format!(
        "ITERATION=0\n\
         MAX_ITERATION={max}\n\
         until [ -f {dir}/{file} -o $ITERATION -ge $MAX_ITERATION ]; do\n\
         \x20 ITERATION=$((ITERATION+1))\n\
         \x20 sleep 0.1\n\
         done\n\
         if [ -f {dir}/{file} ]; then\n\
         \x20 echo \"All files copied successfully, exiting with code 0...\"\n\
         \x20 exit 0\n\
         else\n\
         \x20 echo \"Timeout while attempting to copy to init container, exiting with code 1...\"\n\
         \x20 exit 1\n\
         fi\n",
        max = INIT_WAIT_SECS * 10,
        dir = CONFIG_DIR,
        file = SUCCESS_FILE,
    ));
    script
}

fn relay_commands(config: &LauncherConfig, ports: RelayPorts, uses_stdin: bool) -> Vec<String> {
    let mut commands = Vec::new();
    if uses_stdin {
        commands.push(format!(
            "socat -d -d TCP-L:{} STDOUT > {}",
            config.stdin_remote_port, STDIN_PIPE
        ));
    }
    commands.push(format!(
        "cat {} | socat -d -d -t 60 - TCP:{}:{}",
        STDOUT_PIPE, config.relay_host, ports.stdout
    ));
    commands.push(format!(
        "cat {} | socat -d -d -t 60 - TCP:{}:{}",
        STDERR_PIPE, config.relay_host, ports.stderr
    ));
    commands
}

fn main_script(descriptor: &LaunchDescriptor, background: &[String]) -> String {
    let args: Vec<String> = descriptor.args().iter().map(|a| shell_quote(a)).collect();
    let stdin = if descriptor.uses_stdin() {
        format!(" < {}", STDIN_PIPE)
    } else {
        String::new()
    };

    let mut script = format!("trap \"touch {}\" EXIT\n", TERMINATION_MAIN);
    for command in background {
        script.push_str(&format!("({}) &\n", command));
    }
    script.push_str(&format!(
        "cd {dir}\n\
         set -- {args}\n\
         ($CONNECTOR_ENTRYPOINT \"$@\"{stdin} > {out} 2> {err}) &\n\
         CHILD_PID=$!\n\
         (while true; do if [ -f {check} ]; then echo \"Heartbeat to launcher failed, exiting...\"; kill -9 $CHILD_PID; exit 1; fi; sleep 1; done) &\n\
         wait $CHILD_PID\n\
         exit $?\n",
        dir = CONFIG_DIR,
        args = args.join(" "),
        stdin = stdin,
        out = STDOUT_PIPE,
        err = STDERR_PIPE,
        check = TERMINATION_CHECK,
    ));
    script
}

fn sidecar_script(command: &str) -> String {
    format!(
        "({command}) &\n\
         CHILD_PID=$!\n\
         (while true; do if [ -f {main} ] || [ -f {check} ]; then kill $CHILD_PID 2>/dev/null; exit 0; fi; sleep 1; done) &\n\
         wait $CHILD_PID\n",
        command = command,
        main = TERMINATION_MAIN,
        check = TERMINATION_CHECK,
    )
}

fn heartbeat_script(url: &str) -> String {
    format!(
        "FAILS=0\n\
         while true; do\n\
         \x20 if [ -f {main} ]; then exit 0; fi\n\
         \x20 if curl -s --max-time 10 --fail {url} > /dev/null; then FAILS=0; else FAILS=$((FAILS+1)); fi\n\
         \x20 if [ $FAILS -ge 3 ]; then echo \"Launcher heartbeat lost\"; touch {check}; exit 1; fi\n\
         \x20 sleep 1\n\
         done\n",
        main = TERMINATION_MAIN,
        check = TERMINATION_CHECK,
        url = shell_quote(url),
    )
}

fn volume_mount(name: &str, path: &str) -> Value {
    json!({"name": name, "mountPath": path})
}

fn base_pod(name: &str, descriptor: &LaunchDescriptor, config: &LauncherConfig) -> Map<String, Value> {
    let mut metadata = Map::new();
    metadata.insert("name".into(), json!(name));
    metadata.insert("namespace".into(), json!(config.namespace));
    metadata.insert("labels".into(), labels(descriptor));
    if !descriptor.allowed_hosts().is_empty() {
        metadata.insert(
            "annotations".into(),
            json!({"syncrun/allowed-hosts": descriptor.allowed_hosts().join(",")}),
        );
    }

    let mut pod = Map::new();
    pod.insert("apiVersion".into(), json!("v1"));
    pod.insert("kind".into(), json!("Pod"));
    pod.insert("metadata".into(), Value::Object(metadata));
    pod
}

fn node_selector(descriptor: &LaunchDescriptor, config: &LauncherConfig) -> Option<Value> {
    if !descriptor.is_isolated() {
        return None;
    }
    config.isolated_node_selector.as_ref().map(|(k, v)| {
        let mut selector = Map::new();
        selector.insert(k.clone(), json!(v));
        Value::Object(selector)
    })
}

/// Manifest for a pod owned by a live launcher, with stdio relayed to `ports`.
pub fn sync_pod_manifest(
    name: &str,
    descriptor: &LaunchDescriptor,
    config: &LauncherConfig,
    ports: RelayPorts,
) -> Value {
    let uses_stdin = descriptor.uses_stdin();
    let relays = relay_commands(config, ports, uses_stdin);
    let resources = resources_json(descriptor.resources());

    let pipes = volume_mount("syncrun-pipes", PIPES_DIR);
    let cfg = volume_mount("syncrun-config", CONFIG_DIR);
    let term = volume_mount("syncrun-termination", TERMINATION_DIR);
    let tmp = volume_mount("syncrun-tmp", "/tmp");

    let background: &[String] = if config.socat_in_main_container {
        &relays
    } else {
        &[]
    };

    let init = json!({
        "name": INIT_CONTAINER,
        "image": config.init_image,
        "imagePullPolicy": "IfNotPresent",
        "command": ["sh", "-c", init_script(true, uses_stdin)],
        "workingDir": CONFIG_DIR,
        "volumeMounts": [pipes, cfg],
        "resources": resources,
    });

    let main = json!({
        "name": MAIN_CONTAINER,
        "image": descriptor.image(),
        "imagePullPolicy": config.image_pull_policy,
        "command": ["sh", "-c", main_script(descriptor, background)],
        "workingDir": CONFIG_DIR,
        "env": env_json(descriptor, &[]),
        "resources": resources,
        "volumeMounts": [pipes, cfg, term, tmp],
    });

    let heartbeat = json!({
        "name": HEARTBEAT_CONTAINER,
        "image": config.curl_image,
        "command": ["sh"],
        "args": ["-c", heartbeat_script(&config.heartbeat_url)],
        "volumeMounts": [term],
    });

    let mut containers = vec![main, heartbeat];
    if !config.socat_in_main_container {
        let names = if uses_stdin {
            vec!["remote-stdin", "relay-stdout", "relay-stderr"]
        } else {
            vec!["relay-stdout", "relay-stderr"]
        };
        for (name, command) in names.into_iter().zip(relays.iter()) {
            containers.push(json!({
                "name": name,
                "image": config.socat_image,
                "command": ["sh", "-c", sidecar_script(command)],
                "volumeMounts": [pipes, term],
            }));
        }
    }

    let mut spec = Map::new();
    spec.insert("restartPolicy".into(), json!("Never"));
    spec.insert("initContainers".into(), json!([init]));
    spec.insert("containers".into(), Value::Array(containers));
    spec.insert(
        "volumes".into(),
        json!([
            {"name": "syncrun-pipes", "emptyDir": {}},
            {"name": "syncrun-config", "emptyDir": {"medium": "Memory"}},
            {"name": "syncrun-termination", "emptyDir": {}},
            {"name": "syncrun-tmp", "emptyDir": {}},
        ]),
    );
    if let Some(selector) = node_selector(descriptor, config) {
        spec.insert("nodeSelector".into(), selector);
    }

    let mut pod = base_pod(name, descriptor, config);
    pod.insert("spec".into(), Value::Object(spec));
    Value::Object(pod)
}

/// Manifest for a detached pod that reports status through the document store.
pub fn async_pod_manifest(
    name: &str,
    descriptor: &LaunchDescriptor,
    config: &LauncherConfig,
) -> Value {
    let cfg = volume_mount("syncrun-config", CONFIG_DIR);
    let resources = resources_json(descriptor.resources());
    let status_prefix = format!("{}/{}", config.namespace, name);

    let init = json!({
        "name": INIT_CONTAINER,
        "image": config.init_image,
        "imagePullPolicy": "IfNotPresent",
        "command": ["sh", "-c", init_script(false, false)],
        "workingDir": CONFIG_DIR,
        "volumeMounts": [cfg],
        "resources": resources,
    });

    let main = json!({
        "name": MAIN_CONTAINER,
        "image": descriptor.image(),
        "imagePullPolicy": config.image_pull_policy,
        "args": descriptor.args(),
        "workingDir": CONFIG_DIR,
        "env": env_json(
            descriptor,
            &[
                ("STATUS_DOCUMENT_PREFIX", status_prefix),
                ("WORKLOAD_ID", descriptor.workload_id()),
            ],
        ),
        "resources": resources,
        "volumeMounts": [cfg],
    });

    let mut spec = Map::new();
    spec.insert("restartPolicy".into(), json!("Never"));
    spec.insert("initContainers".into(), json!([init]));
    spec.insert("containers".into(), json!([main]));
    spec.insert(
        "volumes".into(),
        json!([{"name": "syncrun-config", "emptyDir": {"medium": "Memory"}}]),
    );
    if let Some(selector) = node_selector(descriptor, config) {
        spec.insert("nodeSelector".into(), selector);
    }

    let mut pod = base_pod(name, descriptor, config);
    pod.insert("spec".into(), Value::Object(spec));
    Value::Object(pod)
}
