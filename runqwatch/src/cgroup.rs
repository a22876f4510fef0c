//! Cgroup id to workload identity.
//!
//! On cgroup v2 the id reported by the kernel is the inode number of the
//! cgroup's directory, so walking the cgroup2 mount yields the id -> path
//! mapping. Container ids are then parsed from the path.

use std::{
    collections::HashMap,
    fs,
    os::unix::fs::MetadataExt,
    path::{Path, PathBuf},
    sync::{Arc, Mutex, RwLock},
    time::{Duration, Instant},
};

use anyhow::{Context, Result};
use log::{debug, info, warn};
use runqwatch_common::UNKNOWN_CGROUP_ID;
use walkdir::WalkDir;

pub const DEFAULT_CGROUP_ROOT: &str = "/sys/fs/cgroup";

/// Minimum spacing between two walks triggered by unknown ids.
pub const CGROUP_RESCAN_INTERVAL: Duration = Duration::from_secs(5);

/// How the task that was switched out relates to the one switched in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PreemptionType {
    SameCgroup,
    /// One side has no readable cgroup (idle task, kernel threads).
    SystemService,
    OtherCgroup,
}

impl PreemptionType {
    pub fn classify(prev_cgroup_id: u64, cgroup_id: u64) -> Self {
        if prev_cgroup_id == cgroup_id {
            PreemptionType::SameCgroup
        } else if prev_cgroup_id == UNKNOWN_CGROUP_ID || cgroup_id == UNKNOWN_CGROUP_ID {
            PreemptionType::SystemService
        } else {
            PreemptionType::OtherCgroup
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PreemptionType::SameCgroup => "same_cgroup",
            PreemptionType::SystemService => "system_service",
            PreemptionType::OtherCgroup => "other_cgroup",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CgroupInfo {
    /// Path below the cgroup2 mount, starting with '/'.
    pub path: String,
    /// Short (12-char) container id, when the path belongs to a container.
    pub container_id: Option<String>,
}

/// First cgroup2 mount point of this process' mount namespace.
pub fn find_cgroup2_mount() -> Option<PathBuf> {
    let mounts = procfs::process::Process::myself().ok()?.mountinfo().ok()?;
    mounts
        .into_iter()
        .find(|m| m.fs_type == "cgroup2")
        .map(|m| m.mount_point)
}

pub struct CgroupIndex {
    root: PathBuf,
    by_id: RwLock<HashMap<u64, Arc<CgroupInfo>>>,
    last_scan: Mutex<Option<Instant>>,
}

impl CgroupIndex {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            by_id: RwLock::new(HashMap::new()),
            last_scan: Mutex::new(None),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.by_id.read().map(|m| m.len()).unwrap_or(0)
    }

    #[cfg(test)]
    pub(crate) fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Rebuilds the index from the cgroup tree. Returns the number of cgroups.
    pub fn rescan(&self) -> Result<usize> {
        if let Ok(mut last) = self.last_scan.lock() {
            *last = Some(Instant::now());
        }

        let root_meta = fs::metadata(&self.root)
            .with_context(|| format!("Failed to stat cgroup root {}", self.root.display()))?;

        let mut found = HashMap::new();
        found.insert(
            root_meta.ino(),
            Arc::new(CgroupInfo {
                path: "/".to_string(),
                container_id: None,
            }),
        );

        for entry in WalkDir::new(&self.root).min_depth(1) {
            // Cgroups can vanish while we walk.
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    debug!("Skipping cgroup entry: {}", e);
                    continue;
                }
            };
            if !entry.file_type().is_dir() {
                continue;
            }
            let meta = match entry.metadata() {
                Ok(meta) => meta,
                Err(e) => {
                    debug!("Skipping {}: {}", entry.path().display(), e);
                    continue;
                }
            };
            if let Some(rel) = relative_cgroup_path(&self.root, entry.path()) {
                let container_id = container_id_from_path(&rel);
                found.insert(
                    meta.ino(),
                    Arc::new(CgroupInfo {
                        path: rel,
                        container_id,
                    }),
                );
            }
        }

        let count = found.len();
        if let Ok(mut by_id) = self.by_id.write() {
            *by_id = found;
        }
        debug!("Indexed {} cgroups under {}", count, self.root.display());
        Ok(count)
    }

    fn cached(&self, cgroup_id: u64) -> Option<Arc<CgroupInfo>> {
        self.by_id.read().ok()?.get(&cgroup_id).cloned()
    }

    fn rescan_due(&self) -> bool {
        match self.last_scan.lock() {
            Ok(last) => last.is_none_or(|t| t.elapsed() >= CGROUP_RESCAN_INTERVAL),
            Err(_) => false,
        }
    }

    /// Looks up a cgroup id, rebuilding the index on a miss at most once
    /// per `CGROUP_RESCAN_INTERVAL`.
    pub fn lookup(&self, cgroup_id: u64) -> Option<Arc<CgroupInfo>> {
        if cgroup_id == UNKNOWN_CGROUP_ID {
            return None;
        }
        if let Some(info) = self.cached(cgroup_id) {
            return Some(info);
        }
        if !self.rescan_due() {
            return None;
        }
        if let Err(e) = self.rescan() {
            warn!("cgroup rescan failed: {:#}", e);
            return None;
        }
        self.cached(cgroup_id)
    }
}

/// Opens the index on the configured root, else the cgroup2 mount, else
/// `DEFAULT_CGROUP_ROOT`.
pub fn open_index(configured_root: Option<&str>) -> CgroupIndex {
    let root = configured_root
        .map(PathBuf::from)
        .or_else(find_cgroup2_mount)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CGROUP_ROOT));

    let index = CgroupIndex::new(root);
    match index.rescan() {
        Ok(count) => info!("Indexed {} cgroups under {}", count, index.root().display()),
        Err(e) => warn!("cgroup index unavailable: {:#}", e),
    }
    index
}

fn relative_cgroup_path(root: &Path, path: &Path) -> Option<String> {
    let rel = path.strip_prefix(root).ok()?;
    Some(format!("/{}", rel.to_str()?))
}

/// Extracts the container id from a cgroup path.
///
/// Handles plain container directories
/// (`/kubepods/besteffort/pod<uid>/<64hex>`) and systemd scopes
/// (`cri-containerd-<64hex>.scope`, `docker-<64hex>.scope`,
/// `crio-<64hex>.scope`). Returns the first 12 characters of the id.
pub fn container_id_from_path(path: &str) -> Option<String> {
    if !["kubepods", "docker", "containerd", "crio", "libpod"]
        .iter()
        .any(|marker| path.contains(marker))
    {
        return None;
    }

    let last_segment = path.rsplit('/').next()?;

    if let Some(inner) = last_segment.strip_suffix(".scope")
        && let Some(hex_id) = inner.rsplit('-').next()
        && is_container_id(hex_id)
    {
        return Some(hex_id[..12].to_string());
    }

    if is_container_id(last_segment) {
        return Some(last_segment[..12].to_string());
    }

    None
}

/// Check if a string looks like a 64-char hex container ID.
fn is_container_id(s: &str) -> bool {
    s.len() == 64 && s.chars().all(|c| c.is_ascii_hexdigit())
}
