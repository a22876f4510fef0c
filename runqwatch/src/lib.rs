pub mod btf;
pub mod cgroup;
#[cfg(feature = "k8s")]
pub mod k8s;
pub mod probes;
pub mod settings;
pub mod telemetry;

use std::sync::Arc;

use anyhow::{Context, Result};
use aya::Ebpf;
use aya_log::EbpfLogger;
use log::{info, warn};
use tokio::signal;

use crate::probes::{IdentityResolver, Probe, builtin::scheduler::runqueue::RunqueueLatencyProbe};
use crate::settings::Settings;

pub struct RunqWatchEngine {
    pub settings: Settings,
    bpf: Ebpf,
}

impl RunqWatchEngine {
    pub fn new(settings: Settings, bytecode: &[u8]) -> Result<Self> {
        bump_memlock_rlimit()?;
        let mut bpf = Ebpf::load(bytecode).context("Failed to load eBPF object")?;
        if let Err(e) = EbpfLogger::init(&mut bpf) {
            warn!("Failed to initialize eBPF logger: {}", e);
        }
        Ok(Self { settings, bpf })
    }

    pub async fn run(mut self) -> Result<()> {
        let resolver = self.identity_resolver().await;
        self.attach_probes(resolver)?;

        info!("Monitoring active. Press Ctrl-C to exit.");
        signal::ctrl_c().await?;
        info!("Exiting...");

        probes::request_shutdown();
        telemetry::shutdown_metrics();
        Ok(())
    }

    async fn identity_resolver(&self) -> IdentityResolver {
        let cgroups = Arc::new(cgroup::open_index(self.settings.cgroup_root.as_deref()));

        #[cfg(feature = "k8s")]
        {
            if let Some(node_name) = &self.settings.node_name {
                let pods = Arc::new(k8s::PodResolver::new());
                match pods.start_k8s_watcher(node_name.clone()).await {
                    Ok(_) => return IdentityResolver::with_pod_resolver(cgroups, pods),
                    Err(e) => warn!("Pod resolution disabled: {:#}", e),
                }
            }
        }

        IdentityResolver::new(cgroups)
    }

    fn attach_probes(&mut self, resolver: IdentityResolver) -> Result<()> {
        if !self.settings.runqueue_enabled() {
            warn!("Run queue probe disabled; nothing to do");
            return Ok(());
        }

        RunqueueLatencyProbe::from_settings(&self.settings).attach(&mut self.bpf, resolver)
    }
}

fn bump_memlock_rlimit() -> Result<()> {
    let rlim = libc::rlimit {
        rlim_cur: libc::RLIM_INFINITY,
        rlim_max: libc::RLIM_INFINITY,
    };
    let ret = unsafe { libc::setrlimit(libc::RLIMIT_MEMLOCK, &rlim) };
    if ret != 0 {
        warn!("Failed to increase rlimit");
    }
    Ok(())
}
