use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use anyhow::{Context, Result};
use aya::{Btf, Ebpf, maps::RingBuf, programs::BtfTracePoint};
use log::info;

use crate::cgroup::CgroupIndex;
#[cfg(feature = "k8s")]
use crate::k8s::PodResolver;

static SHUTDOWN: once_cell::sync::Lazy<Arc<AtomicBool>> =
    once_cell::sync::Lazy::new(|| Arc::new(AtomicBool::new(false)));

pub fn shutdown_flag() -> Arc<AtomicBool> {
    SHUTDOWN.clone()
}

pub fn request_shutdown() {
    SHUTDOWN.store(true, Ordering::Relaxed);
}

pub mod builtin;

/// What is known about the workload behind a cgroup id.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Workload {
    pub cgroup_path: Option<String>,
    pub container_id: Option<String>,
    pub pod_name: Option<String>,
    pub namespace: Option<String>,
    /// Workload name when owned by a controller, else the pod name.
    pub service: Option<String>,
}

/// Cgroup id -> workload identity. Wraps the cgroup index and, with the
/// `k8s` feature, an optional PodResolver.
#[derive(Clone)]
pub struct IdentityResolver {
    cgroups: Arc<CgroupIndex>,
    #[cfg(feature = "k8s")]
    pods: Option<Arc<PodResolver>>,
}

impl IdentityResolver {
    pub fn new(cgroups: Arc<CgroupIndex>) -> Self {
        Self {
            cgroups,
            #[cfg(feature = "k8s")]
            pods: None,
        }
    }

    #[cfg(feature = "k8s")]
    pub fn with_pod_resolver(cgroups: Arc<CgroupIndex>, pods: Arc<PodResolver>) -> Self {
        Self {
            cgroups,
            pods: Some(pods),
        }
    }

    pub fn resolve(&self, cgroup_id: u64) -> Workload {
        let Some(cgroup) = self.cgroups.lookup(cgroup_id) else {
            return Workload::default();
        };

        #[allow(unused_mut)]
        let mut workload = Workload {
            cgroup_path: Some(cgroup.path.clone()),
            container_id: cgroup.container_id.clone(),
            ..Workload::default()
        };

        #[cfg(feature = "k8s")]
        {
            if let (Some(pods), Some(cid)) = (&self.pods, &cgroup.container_id)
                && let Some(pod) = pods.resolve(cid)
            {
                workload.pod_name = Some(pod.pod_name.clone());
                workload.namespace = Some(pod.namespace.clone());
                workload.service = Some(pod.service_name().to_string());
            }
        }

        workload
    }
}

pub trait Probe {
    fn attach(&self, bpf: &mut Ebpf, resolver: IdentityResolver) -> Result<()>;
}

pub const POLL_INTERVAL_MS: u64 = 10;

/// Loads and attaches a `tp_btf` program to the tracepoint `function`.
pub fn attach_btf_tracepoint(
    bpf: &mut Ebpf,
    btf: &Btf,
    program_name: &str,
    function: &str,
) -> Result<()> {
    info!("Loading program {}", program_name);
    let program: &mut BtfTracePoint = bpf
        .program_mut(program_name)
        .with_context(|| format!("Failed to find {} program", program_name))?
        .try_into()?;
    program
        .load(function, btf)
        .with_context(|| format!("Failed to load {} for {}", program_name, function))?;
    program
        .attach()
        .with_context(|| format!("Failed to attach {}", function))?;
    info!("Attached tp_btf/{}", function);
    Ok(())
}

pub fn spawn_ringbuf_handler<T, F>(bpf: &mut Ebpf, map_name: &str, handler: F) -> Result<()>
where
    T: Copy + Send + 'static,
    F: Fn(T) + Send + 'static,
{
    let mut ring_buf = RingBuf::try_from(
        bpf.take_map(map_name)
            .with_context(|| format!("Failed to get {} map", map_name))?,
    )?;
    let shutdown = shutdown_flag();

    tokio::task::spawn_blocking(move || {
        while !shutdown.load(Ordering::Relaxed) {
            let mut has_work = false;
            while let Some(item) = ring_buf.next() {
                has_work = true;
                if item.len() >= std::mem::size_of::<T>() {
                    let event = unsafe { (item.as_ptr() as *const T).read_unaligned() };
                    handler(event);
                }
            }
            if !has_work {
                std::thread::sleep(Duration::from_millis(POLL_INTERVAL_MS));
            }
        }
    });
    Ok(())
}
