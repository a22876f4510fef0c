use std::time::Duration;

use config::{Config, ConfigError, Environment};
use log::debug;
use runqwatch_common::{ProbeConfig, TaskLayout};
use serde::Deserialize;

const DEFAULT_PROBE_INTERVAL_SECONDS: u32 = 60;
const DEFAULT_RATE_LIMIT_MS: u64 = 10;
const DEFAULT_MAX_LATENCY_MS: u64 = 10_000;
const NS_PER_MS: u64 = 1_000_000;

/// Scheduler probe configuration
#[derive(Debug, Deserialize, Clone, Default)]
#[allow(unused)]
pub struct SchedulerProbes {
    pub runqueue: Option<bool>,
    /// Minimum spacing between two samples of one cgroup on one CPU.
    pub runqueue_rate_limit_ms: Option<u64>,
    /// Samples above this are treated as clock anomalies.
    pub runqueue_max_latency_ms: Option<u64>,
}

#[derive(Debug, Deserialize, Clone, Default)]
#[allow(unused)]
pub struct BuiltinProbes {
    #[serde(default)]
    pub scheduler: SchedulerProbes,
    /// Drop counter poll period in seconds.
    pub interval: Option<u32>,
}

/// Byte offsets that take precedence over the ones found in kernel BTF.
#[derive(Debug, Deserialize, Clone, Default, PartialEq, Eq)]
pub struct TaskLayoutOverrides {
    pub task_pid: Option<u32>,
    pub task_cgroups: Option<u32>,
    pub css_set_dfl_cgrp: Option<u32>,
    pub cgroup_kn: Option<u32>,
    pub kernfs_node_id: Option<u32>,
}

impl TaskLayoutOverrides {
    pub fn is_complete(&self) -> bool {
        self.task_pid.is_some()
            && self.task_cgroups.is_some()
            && self.css_set_dfl_cgrp.is_some()
            && self.cgroup_kn.is_some()
            && self.kernfs_node_id.is_some()
    }

    pub fn apply(&self, discovered: TaskLayout) -> TaskLayout {
        TaskLayout {
            task_pid: self.task_pid.unwrap_or(discovered.task_pid),
            task_cgroups: self.task_cgroups.unwrap_or(discovered.task_cgroups),
            css_set_dfl_cgrp: self.css_set_dfl_cgrp.unwrap_or(discovered.css_set_dfl_cgrp),
            cgroup_kn: self.cgroup_kn.unwrap_or(discovered.cgroup_kn),
            kernfs_node_id: self.kernfs_node_id.unwrap_or(discovered.kernfs_node_id),
            _pad: 0,
        }
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
#[allow(unused)]
pub struct Settings {
    pub otel_exporter_otlp_endpoint: Option<String>,
    pub otel_exporter_otlp_protocol: Option<String>,
    #[serde(default)]
    pub builtin_probes: BuiltinProbes,
    #[serde(default)]
    pub task_layout: TaskLayoutOverrides,
    /// cgroup2 mount point; discovered from mountinfo when unset.
    pub cgroup_root: Option<String>,
    /// Kubernetes node whose pods are watched.
    pub node_name: Option<String>,
}

impl Settings {
    pub fn new() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();

        for (key, value) in std::env::vars() {
            if key.starts_with("BUILTIN") || key.starts_with("TASK_LAYOUT") {
                debug!("ENV: {}={}", key, value);
            }
        }

        let s = Config::builder()
            .add_source(
                Environment::default()
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let settings: Self = s.try_deserialize()?;
        debug!("Parsed settings: {:?}", settings);
        Ok(settings)
    }

    pub fn runqueue_enabled(&self) -> bool {
        self.builtin_probes.scheduler.runqueue.unwrap_or(true)
    }

    pub fn rate_limit_ns(&self) -> u64 {
        self.builtin_probes
            .scheduler
            .runqueue_rate_limit_ms
            .unwrap_or(DEFAULT_RATE_LIMIT_MS)
            .saturating_mul(NS_PER_MS)
    }

    pub fn max_latency_ns(&self) -> u64 {
        self.builtin_probes
            .scheduler
            .runqueue_max_latency_ms
            .unwrap_or(DEFAULT_MAX_LATENCY_MS)
            .saturating_mul(NS_PER_MS)
    }

    pub fn probe_interval(&self) -> Duration {
        let secs = self
            .builtin_probes
            .interval
            .unwrap_or(DEFAULT_PROBE_INTERVAL_SECONDS)
            .max(1);
        Duration::from_secs(secs as u64)
    }

    pub fn to_common_config(&self) -> ProbeConfig {
        ProbeConfig {
            enabled: self.runqueue_enabled() as u8,
            ..ProbeConfig::new(self.rate_limit_ns())
        }
    }
}
