//! Run queue latency probe.
//!
//! The kernel side publishes one `RunqEvent` per sample (rate limited per
//! cgroup and CPU). Here each sample is bounded, classified by what it
//! preempted, attributed to a workload and exported. Samples the kernel had
//! to drop are counted per reason in `RUNQ_DROPS` and exported as deltas.

use std::sync::atomic::Ordering;
use std::time::Duration;

use anyhow::{Context, Result};
use aya::maps::{Array, MapData, PerCpuArray};
use aya::{Btf, Ebpf};
use log::{debug, info, warn};
use runqwatch_common::{DropReason, ProbeConfig, RunqEvent, TaskLayout};

use crate::btf;
use crate::cgroup::PreemptionType;
use crate::probes::{
    IdentityResolver, Probe, attach_btf_tracepoint, shutdown_flag, spawn_ringbuf_handler,
};
use crate::settings::{Settings, TaskLayoutOverrides};
use crate::telemetry;

const DROP_REASONS: usize = DropReason::COUNT as usize;

/// (program, tracepoint)
const PROGRAMS: [(&str, &str); 3] = [
    ("runq_sched_wakeup", "sched_wakeup"),
    ("runq_sched_wakeup_new", "sched_wakeup_new"),
    ("runq_sched_switch", "sched_switch"),
];

pub struct RunqueueLatencyProbe {
    pub probe_config: ProbeConfig,
    pub layout_overrides: TaskLayoutOverrides,
    /// Samples above this are discarded; 0 disables the bound.
    pub max_latency_ns: u64,
    pub drop_poll_interval: Duration,
}

impl Default for RunqueueLatencyProbe {
    fn default() -> Self {
        Self::from_settings(&Settings::default())
    }
}

impl Probe for RunqueueLatencyProbe {
    fn attach(&self, bpf: &mut Ebpf, resolver: IdentityResolver) -> Result<()> {
        let layout = btf::resolve_task_layout(&self.layout_overrides);
        publish_task_layout(bpf, layout)?;

        let kernel_btf = Btf::from_sys_fs().context("Kernel BTF is required for tp_btf programs")?;
        for (program, function) in PROGRAMS {
            attach_btf_tracepoint(bpf, &kernel_btf, program, function)?;
        }

        let max_latency_ns = self.max_latency_ns;
        spawn_ringbuf_handler(bpf, "RUNQ_EVENTS", move |event: RunqEvent| {
            handle_event(&event, max_latency_ns, &resolver);
        })?;
        spawn_drop_poller(bpf, self.drop_poll_interval)?;

        // Programs stay inert until the config says otherwise.
        publish_probe_config(bpf, self.probe_config)?;

        telemetry::record_active_probe("runqueue", 1);
        info!(
            "RunqueueLatencyProbe attached (rate_limit={}ms, max_latency={}ms)",
            self.probe_config.rate_limit_ns / 1_000_000,
            self.max_latency_ns / 1_000_000
        );

        Ok(())
    }
}

impl RunqueueLatencyProbe {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            probe_config: settings.to_common_config(),
            layout_overrides: settings.task_layout.clone(),
            max_latency_ns: settings.max_latency_ns(),
            drop_poll_interval: settings.probe_interval(),
        }
    }
}

fn publish_task_layout(bpf: &mut Ebpf, layout: TaskLayout) -> Result<()> {
    let mut map: Array<_, TaskLayout> = Array::try_from(
        bpf.map_mut("TASK_LAYOUT")
            .context("Failed to find TASK_LAYOUT map")?,
    )?;
    map.set(0, layout, 0).context("Failed to publish task layout")?;
    Ok(())
}

fn publish_probe_config(bpf: &mut Ebpf, config: ProbeConfig) -> Result<()> {
    let mut map: Array<_, ProbeConfig> = Array::try_from(
        bpf.map_mut("RUNQ_CONFIG")
            .context("Failed to find RUNQ_CONFIG map")?,
    )?;
    map.set(0, config, 0).context("Failed to publish probe config")?;
    Ok(())
}

fn is_plausible(latency_ns: u64, max_latency_ns: u64) -> bool {
    max_latency_ns == 0 || latency_ns <= max_latency_ns
}

fn handle_event(event: &RunqEvent, max_latency_ns: u64, resolver: &IdentityResolver) {
    if !is_plausible(event.runq_lat_ns, max_latency_ns) {
        debug!(
            "Discarding implausible run queue latency {}ns (cgroup={})",
            event.runq_lat_ns, event.cgroup_id
        );
        telemetry::record_implausible_latency();
        return;
    }

    let preemption = PreemptionType::classify(event.prev_cgroup_id, event.cgroup_id);
    let workload = resolver.resolve(event.cgroup_id);

    debug!(
        "RUNQ_LATENCY cgroup={} prev_cgroup={} latency={}us preemption={} path={} pod={}",
        event.cgroup_id,
        event.prev_cgroup_id,
        event.runq_lat_ns / 1_000,
        preemption.as_str(),
        workload.cgroup_path.as_deref().unwrap_or("-"),
        workload.pod_name.as_deref().unwrap_or("-"),
    );

    telemetry::record_runq_latency(event.runq_lat_ns, preemption, &workload, event.cgroup_id);
}

/// Last seen per-reason totals, summed over CPUs.
#[derive(Debug, Default)]
struct DropTotals {
    last: [u64; DROP_REASONS],
}

impl DropTotals {
    /// Stores `current` and returns the increase since the previous call.
    fn advance(&mut self, current: [u64; DROP_REASONS]) -> [(DropReason, u64); DROP_REASONS] {
        let deltas = DropReason::ALL.map(|reason| {
            let i = reason.index() as usize;
            (reason, current[i].saturating_sub(self.last[i]))
        });
        self.last = current;
        deltas
    }
}

fn read_drop_totals(map: &PerCpuArray<MapData, u64>) -> Result<[u64; DROP_REASONS]> {
    let mut totals = [0u64; DROP_REASONS];
    for reason in DropReason::ALL {
        let per_cpu = map
            .get(&reason.index(), 0)
            .with_context(|| format!("Failed to read RUNQ_DROPS[{}]", reason.name()))?;
        totals[reason.index() as usize] = per_cpu.iter().sum();
    }
    Ok(totals)
}

fn spawn_drop_poller(bpf: &mut Ebpf, interval: Duration) -> Result<()> {
    let drops: PerCpuArray<MapData, u64> = PerCpuArray::try_from(
        bpf.take_map("RUNQ_DROPS")
            .context("Failed to get RUNQ_DROPS map")?,
    )?;
    let shutdown = shutdown_flag();

    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        let mut totals = DropTotals::default();
        loop {
            ticker.tick().await;
            if shutdown.load(Ordering::Relaxed) {
                break;
            }
            match read_drop_totals(&drops) {
                Ok(current) => {
                    for (reason, delta) in totals.advance(current) {
                        if delta > 0 {
                            debug!("{} run queue samples dropped: {}", delta, reason.name());
                            telemetry::record_dropped_samples(reason, delta);
                        }
                    }
                }
                Err(e) => warn!("{:#}", e),
            }
        }
    });

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cgroup::CgroupIndex;
    use crate::settings::{BuiltinProbes, SchedulerProbes};
    use std::sync::Arc;

    #[test]
    fn test_drop_deltas() {
        let mut totals = DropTotals::default();

        let first = totals.advance([3, 0, 10, 1]);
        assert_eq!(first[0], (DropReason::MissedEnqueue, 3));
        assert_eq!(first[2], (DropReason::RateLimited, 10));

        let second = totals.advance([5, 0, 10, 4]);
        assert_eq!(second[0].1, 2);
        assert_eq!(second[1].1, 0);
        assert_eq!(second[2].1, 0);
        assert_eq!(second[3], (DropReason::ChannelFull, 3));
    }

    #[test]
    fn test_drop_deltas_never_negative() {
        let mut totals = DropTotals::default();
        totals.advance([5, 5, 5, 5]);
        let after_reset = totals.advance([1, 0, 0, 0]);
        assert!(after_reset.iter().all(|(_, delta)| *delta == 0));
    }

    #[test]
    fn test_plausibility_bound() {
        let max = 10_000_000_000;
        assert!(is_plausible(50, max));
        assert!(is_plausible(max, max));
        assert!(!is_plausible(max + 1, max));
        // A clock anomaly on the kernel side wraps to a huge value.
        assert!(!is_plausible(u64::MAX - 49, max));
        assert!(is_plausible(u64::MAX, 0));
    }

    #[test]
    fn test_from_settings() {
        let settings = Settings {
            builtin_probes: BuiltinProbes {
                scheduler: SchedulerProbes {
                    runqueue: Some(true),
                    runqueue_rate_limit_ms: Some(20),
                    runqueue_max_latency_ms: Some(500),
                },
                interval: Some(15),
            },
            ..Settings::default()
        };

        let probe = RunqueueLatencyProbe::from_settings(&settings);
        assert_eq!(probe.probe_config.rate_limit_ns, 20_000_000);
        assert!(probe.probe_config.is_enabled());
        assert_eq!(probe.max_latency_ns, 500_000_000);
        assert_eq!(probe.drop_poll_interval, Duration::from_secs(15));
    }

    #[test]
    fn test_handle_event_without_exporter() {
        let resolver = IdentityResolver::new(Arc::new(CgroupIndex::new("/nonexistent")));
        let event = RunqEvent {
            prev_cgroup_id: 0xA,
            cgroup_id: 0xB,
            runq_lat_ns: 50,
            ts_ns: 150,
        };
        handle_event(&event, 1_000, &resolver);
        handle_event(
            &RunqEvent {
                runq_lat_ns: u64::MAX,
                ..event
            },
            1_000,
            &resolver,
        );
    }

    #[test]
    fn test_program_table_covers_wakeups_and_switch() {
        let functions: Vec<&str> = PROGRAMS.iter().map(|(_, f)| *f).collect();
        assert_eq!(functions, vec!["sched_wakeup", "sched_wakeup_new", "sched_switch"]);
    }
}
