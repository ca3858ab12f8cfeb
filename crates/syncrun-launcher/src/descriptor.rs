// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Launch descriptors.
//!
//! A [`LaunchDescriptor`] is everything a backend needs to start one connector
//! step: image, arguments, input files, environment and resource constraints.
//! It is built once per attempt per step through [`LaunchDescriptorBuilder`]
//! and never mutated afterwards.

use std::collections::BTreeMap;
use std::fmt;

use rand::Rng;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Maximum pod name length accepted by Kubernetes.
pub const KUBE_NAME_LIMIT: usize = 63;

/// Maximum container name length we allow for docker.
pub const DOCKER_NAME_LIMIT: usize = 128;

/// Length of the random name suffix.
const SUFFIX_LEN: usize = 5;

/// Connector config file name.
pub const CONFIG_FILE: &str = "connector_config.json";
/// Configured catalog file name.
pub const CATALOG_FILE: &str = "connector_catalog.json";
/// Input state file name.
pub const STATE_FILE: &str = "input_state.json";

/// Connector protocol step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepKind {
    /// Print the connector specification.
    Spec,
    /// Check connectivity with the supplied config.
    Check,
    /// Discover the available catalog.
    Discover,
    /// Read records from a source.
    Read,
    /// Write records to a destination.
    Write,
}

impl StepKind {
    /// Protocol verb for this step.
    pub fn as_str(&self) -> &'static str {
        match self {
            StepKind::Spec => "spec",
            StepKind::Check => "check",
            StepKind::Discover => "discover",
            StepKind::Read => "read",
            StepKind::Write => "write",
        }
    }

    /// Whether the connector consumes records on stdin for this step.
    pub fn uses_stdin(&self) -> bool {
        matches!(self, StepKind::Write)
    }
}

impl fmt::Display for StepKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// CPU and memory requests/limits in Kubernetes quantity notation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceRequirements {
    /// CPU request, e.g. `500m`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu_request: Option<String>,
    /// CPU limit, e.g. `2`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu_limit: Option<String>,
    /// Memory request, e.g. `512Mi`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_request: Option<String>,
    /// Memory limit, e.g. `2Gi`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_limit: Option<String>,
}

impl ResourceRequirements {
    /// Returns a copy where each request is at most its limit.
    pub fn clamped(&self) -> Self {
        Self {
            cpu_request: clamp_request(&self.cpu_request, &self.cpu_limit),
            cpu_limit: self.cpu_limit.clone(),
            memory_request: clamp_request(&self.memory_request, &self.memory_limit),
            memory_limit: self.memory_limit.clone(),
        }
    }

    /// True when no request or limit is set.
    pub fn is_empty(&self) -> bool {
        self.cpu_request.is_none()
            && self.cpu_limit.is_none()
            && self.memory_request.is_none()
            && self.memory_limit.is_none()
    }
}

fn clamp_request(request: &Option<String>, limit: &Option<String>) -> Option<String> {
    match (request, limit) {
        (Some(req), Some(lim)) => match (parse_quantity(req), parse_quantity(lim)) {
            (Some(r), Some(l)) if r > l => Some(lim.clone()),
            _ => Some(req.clone()),
        },
        (req, _) => req.clone(),
    }
}

/// Parses a Kubernetes quantity (`250m`, `1.5`, `512Mi`, `2G`) into base units.
pub fn parse_quantity(quantity: &str) -> Option<f64> {
    const SUFFIXES: &[(&str, f64)] = &[
        ("Ki", 1024.0),
        ("Mi", 1024.0 * 1024.0),
        ("Gi", 1024.0 * 1024.0 * 1024.0),
        ("Ti", 1024.0 * 1024.0 * 1024.0 * 1024.0),
        ("m", 0.001),
        ("k", 1e3),
        ("K", 1e3),
        ("M", 1e6),
        ("G", 1e9),
        ("T", 1e12),
    ];

    let quantity = quantity.trim();
    for (suffix, factor) in SUFFIXES {
        if let Some(number) = quantity.strip_suffix(suffix) {
            return number.parse::<f64>().ok().map(|n| n * factor);
        }
    }
    quantity.parse::<f64>().ok()
}

/// Immutable description of one connector execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LaunchDescriptor {
    job_id: String,
    attempt: u32,
    #[serde(default)]
    connection_id: Option<Uuid>,
    #[serde(default)]
    workspace_id: Option<Uuid>,
    image: String,
    step: StepKind,
    #[serde(default)]
    args: Vec<String>,
    #[serde(default)]
    files: BTreeMap<String, String>,
    #[serde(default)]
    resources: ResourceRequirements,
    #[serde(default)]
    allowed_hosts: Vec<String>,
    #[serde(default)]
    env: BTreeMap<String, String>,
    #[serde(default)]
    isolated: bool,
}

impl LaunchDescriptor {
    /// Start building a descriptor for `step` of `image`.
    pub fn builder(
        image: impl Into<String>,
        step: StepKind,
        job_id: impl Into<String>,
        attempt: u32,
    ) -> LaunchDescriptorBuilder {
        LaunchDescriptorBuilder {
            descriptor: LaunchDescriptor {
                job_id: job_id.into(),
                attempt,
                connection_id: None,
                workspace_id: None,
                image: image.into(),
                step,
                args: Vec::new(),
                files: BTreeMap::new(),
                resources: ResourceRequirements::default(),
                allowed_hosts: Vec::new(),
                env: BTreeMap::new(),
                isolated: false,
            },
            config: None,
            catalog: None,
            state: None,
            extra_args: Vec::new(),
        }
    }

    /// Job id.
    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    /// Attempt number within the job.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Connection the job belongs to.
    pub fn connection_id(&self) -> Option<Uuid> {
        self.connection_id
    }

    /// Workspace the connection belongs to.
    pub fn workspace_id(&self) -> Option<Uuid> {
        self.workspace_id
    }

    /// Full image reference.
    pub fn image(&self) -> &str {
        &self.image
    }

    /// Protocol step.
    pub fn step(&self) -> StepKind {
        self.step
    }

    /// Ordered connector arguments.
    pub fn args(&self) -> &[String] {
        &self.args
    }

    /// Input files keyed by file name.
    pub fn files(&self) -> &BTreeMap<String, String> {
        &self.files
    }

    /// Resource requests and limits, already clamped.
    pub fn resources(&self) -> &ResourceRequirements {
        &self.resources
    }

    /// Hosts the connector may reach.
    pub fn allowed_hosts(&self) -> &[String] {
        &self.allowed_hosts
    }

    /// Environment overlay.
    pub fn env(&self) -> &BTreeMap<String, String> {
        &self.env
    }

    /// Whether the workload must run on the isolated node pool.
    pub fn is_isolated(&self) -> bool {
        self.isolated
    }

    /// Whether the connector reads stdin.
    pub fn uses_stdin(&self) -> bool {
        self.step.uses_stdin()
    }

    /// Identifier for this step's structured output: `{job}_{attempt}_{step}`.
    pub fn workload_id(&self) -> String {
        format!("{}_{}_{}", self.job_id, self.attempt, self.step)
    }

    /// Derive a fresh process name within `limit` characters.
    pub fn process_name(&self, limit: usize) -> String {
        process_name(
            &self.image,
            self.step,
            &self.job_id,
            self.attempt,
            &random_suffix(),
            limit,
        )
    }
}

/// Builder for [`LaunchDescriptor`].
///
/// The protocol arguments are derived from the step and the payloads that were
/// supplied, so callers never assemble argument lists by hand.
#[derive(Debug, Clone)]
pub struct LaunchDescriptorBuilder {
    descriptor: LaunchDescriptor,
    config: Option<String>,
    catalog: Option<String>,
    state: Option<String>,
    extra_args: Vec<String>,
}

impl LaunchDescriptorBuilder {
    /// Set the connection id.
    pub fn connection_id(mut self, id: Uuid) -> Self {
        self.descriptor.connection_id = Some(id);
        self
    }

    /// Set the workspace id.
    pub fn workspace_id(mut self, id: Uuid) -> Self {
        self.descriptor.workspace_id = Some(id);
        self
    }

    /// Connector configuration payload.
    pub fn config(mut self, config: impl Into<String>) -> Self {
        self.config = Some(config.into());
        self
    }

    /// Configured catalog payload.
    pub fn catalog(mut self, catalog: impl Into<String>) -> Self {
        self.catalog = Some(catalog.into());
        self
    }

    /// Input state payload.
    pub fn state(mut self, state: impl Into<String>) -> Self {
        self.state = Some(state.into());
        self
    }

    /// Add an extra file that is shipped with the workload but not referenced by arguments.
    pub fn file(mut self, name: impl Into<String>, contents: impl Into<String>) -> Self {
        self.descriptor.files.insert(name.into(), contents.into());
        self
    }

    /// Append an argument after the protocol arguments.
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.extra_args.push(arg.into());
        self
    }

    /// Set an environment variable.
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.descriptor.env.insert(key.into(), value.into());
        self
    }

    /// Set resource requirements.
    pub fn resources(mut self, resources: ResourceRequirements) -> Self {
        self.descriptor.resources = resources;
        self
    }

    /// Hosts the workload may connect to.
    pub fn allowed_hosts<I, S>(mut self, hosts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.descriptor.allowed_hosts = hosts.into_iter().map(Into::into).collect();
        self
    }

    /// Run on the isolated node pool.
    pub fn isolated(mut self, isolated: bool) -> Self {
        self.descriptor.isolated = isolated;
        self
    }

    /// Finish the descriptor.
    pub fn build(self) -> LaunchDescriptor {
        let LaunchDescriptorBuilder {
            mut descriptor,
            config,
            catalog,
            state,
            extra_args,
        } = self;

        let mut args = vec![descriptor.step.as_str().to_string()];

        if descriptor.step != StepKind::Spec
            && let Some(config) = config
        {
            descriptor.files.insert(CONFIG_FILE.to_string(), config);
            args.push("--config".to_string());
            args.push(CONFIG_FILE.to_string());
        }

        if matches!(descriptor.step, StepKind::Read | StepKind::Write)
            && let Some(catalog) = catalog
        {
            descriptor.files.insert(CATALOG_FILE.to_string(), catalog);
            args.push("--catalog".to_string());
            args.push(CATALOG_FILE.to_string());
        }

        if descriptor.step == StepKind::Read
            && let Some(state) = state
        {
            descriptor.files.insert(STATE_FILE.to_string(), state);
            args.push("--state".to_string());
            args.push(STATE_FILE.to_string());
        }

        args.extend(extra_args);
        descriptor.args = args;
        descriptor.resources = descriptor.resources.clamped();
        descriptor
    }
}

/// Image name without registry, repository path or tag.
pub fn short_image_name(image: &str) -> &str {
    let last_segment = image.rsplit('/').next().unwrap_or(image);
    let without_digest = last_segment.split('@').next().unwrap_or(last_segment);
    without_digest.split(':').next().unwrap_or(without_digest)
}

/// Five lowercase letters.
pub fn random_suffix() -> String {
    let mut rng = rand::thread_rng();
    (0..SUFFIX_LEN)
        .map(|_| char::from(rng.gen_range(b'a'..=b'z')))
        .collect()
}

/// Build `{short-image}-{step}-{job}-{attempt}-{suffix}` within `limit` characters.
///
/// Overflow is cut from the front of the image name, then the result is
/// trimmed so it begins with a letter.
pub fn process_name(
    image: &str,
    step: StepKind,
    job_id: &str,
    attempt: u32,
    suffix: &str,
    limit: usize,
) -> String {
    let image_name = sanitize(short_image_name(image));
    let tail = sanitize(&format!("{}-{}-{}-{}", step, job_id, attempt, suffix));

    let mut name = format!("{}-{}", image_name, tail);
    if name.len() > limit {
        let extra = name.len() - limit;
        let kept = image_name.get(extra.min(image_name.len())..).unwrap_or("");
        name = format!("{}-{}", kept, tail);
    }
    if name.len() > limit {
        name = name[name.len() - limit..].to_string();
    }

    match name.find(|c: char| c.is_ascii_alphabetic()) {
        Some(start) => name[start..].to_string(),
        None => name,
    }
}

fn sanitize(raw: &str) -> String {
    raw.chars()
        .map(|c| match c {
            'a'..='z' | '0'..='9' | '-' => c,
            'A'..='Z' => c.to_ascii_lowercase(),
            _ => '-',
        })
        .collect()
}
