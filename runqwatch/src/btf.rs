//! Kernel structure layout discovery from BTF.

use anyhow::{Context, Result};
use btf_rs::{Btf, Struct, Type};
use log::{info, warn};
use runqwatch_common::TaskLayout;

use crate::settings::TaskLayoutOverrides;

pub const VMLINUX_BTF: &str = "/sys/kernel/btf/vmlinux";

/// Anonymous struct/union nesting and typedef chains we are willing to follow.
const MAX_DEPTH: usize = 8;

pub fn load_kernel_btf() -> Result<Btf> {
    Btf::from_file(VMLINUX_BTF).with_context(|| format!("Failed to parse BTF in {}", VMLINUX_BTF))
}

/// The definition of `struct name`, skipping forward declarations.
fn struct_by_name(btf: &Btf, name: &str) -> Option<Struct> {
    btf.resolve_types_by_name(name)
        .ok()?
        .into_iter()
        .find_map(|ty| match ty {
            Type::Struct(s) if !s.members.is_empty() => Some(s),
            _ => None,
        })
}

/// Follows typedefs and qualifiers down to a struct or union.
fn composite_of(btf: &Btf, mut ty: Type) -> Option<Struct> {
    for _ in 0..MAX_DEPTH {
        ty = match ty {
            Type::Struct(s) | Type::Union(s) => return Some(s),
            Type::Typedef(t) => btf.resolve_chained_type(&t).ok()?,
            Type::Const(t) => btf.resolve_chained_type(&t).ok()?,
            Type::Volatile(t) => btf.resolve_chained_type(&t).ok()?,
            _ => return None,
        };
    }
    None
}

/// Bit offset of `member` in `ty`, looking through anonymous struct and
/// union members.
fn find_member_bits(btf: &Btf, ty: &Struct, member: &str, depth: usize) -> Option<u32> {
    if depth > MAX_DEPTH {
        return None;
    }
    for m in &ty.members {
        let name = btf.resolve_name(m).unwrap_or_default();
        if !name.is_empty() {
            if name == member {
                return Some(m.bit_offset());
            }
            continue;
        }
        let Some(inner) = btf
            .resolve_chained_type(m)
            .ok()
            .and_then(|t| composite_of(btf, t))
        else {
            continue;
        };
        if let Some(bits) = find_member_bits(btf, &inner, member, depth + 1) {
            return Some(m.bit_offset() + bits);
        }
    }
    None
}

/// Byte offset of `member` in `struct struct_name`.
pub fn member_offset(btf: &Btf, struct_name: &str, member: &str) -> Option<u32> {
    let ty = struct_by_name(btf, struct_name)?;
    let bits = find_member_bits(btf, &ty, member, 0)?;
    if bits % 8 != 0 {
        return None;
    }
    Some(bits / 8)
}

pub fn discover_task_layout(btf: &Btf) -> TaskLayout {
    TaskLayout {
        task_pid: member_offset(btf, "task_struct", "pid").unwrap_or(0),
        task_cgroups: member_offset(btf, "task_struct", "cgroups").unwrap_or(0),
        css_set_dfl_cgrp: member_offset(btf, "css_set", "dfl_cgrp").unwrap_or(0),
        cgroup_kn: member_offset(btf, "cgroup", "kn").unwrap_or(0),
        kernfs_node_id: member_offset(btf, "kernfs_node", "id").unwrap_or(0),
        _pad: 0,
    }
}

/// Kernel BTF offsets with configured overrides applied on top.
pub fn resolve_task_layout(overrides: &TaskLayoutOverrides) -> TaskLayout {
    if overrides.is_complete() {
        return overrides.apply(TaskLayout::zeroed());
    }

    let discovered = match load_kernel_btf() {
        Ok(btf) => discover_task_layout(&btf),
        Err(e) => {
            warn!("Kernel BTF unavailable ({:#}); relying on configured offsets", e);
            TaskLayout::zeroed()
        }
    };
    let layout = overrides.apply(discovered);

    info!(
        "Task layout: pid={} cgroups={} dfl_cgrp={} kn={} kn.id={}",
        layout.task_pid,
        layout.task_cgroups,
        layout.css_set_dfl_cgrp,
        layout.cgroup_kn,
        layout.kernfs_node_id
    );
    if !layout.has_pid() {
        warn!("task_struct.pid offset unknown; no run queue samples will be produced");
    } else if !layout.has_cgroup_chain() {
        warn!("cgroup offsets incomplete; every sample will carry cgroup id 0");
    }
    layout
}
