use std::{env, path::PathBuf, process::Command};

const EBPF_OBJECT: &str = "runqwatch";

fn bpf_target(arch: &str) -> &'static str {
    match arch {
        "x86_64" | "x86" | "aarch64" | "arm" | "riscv64" | "loongarch64" => "bpfel-unknown-none",
        "mips" | "mips64" | "powerpc" | "powerpc64" | "s390x" => "bpfeb-unknown-none",
        _ => {
            println!(
                "cargo:warning=Unknown architecture '{}', defaulting to bpfel-unknown-none",
                arch
            );
            "bpfel-unknown-none"
        }
    }
}

fn main() {
    let out_dir = PathBuf::from(env::var("OUT_DIR").expect("OUT_DIR is set by cargo"));

    println!("cargo:rerun-if-changed=../runqwatch-ebpf/src");
    println!("cargo:rerun-if-changed=../runqwatch-common/src");

    let arch = env::var("CARGO_CFG_TARGET_ARCH").expect("CARGO_CFG_TARGET_ARCH is set by cargo");
    let target = bpf_target(&arch);

    // Separate target dir: the nested cargo would otherwise block on the
    // outer build's lock.
    let ebpf_target_dir = PathBuf::from(env::var("OUT_DIR").expect("OUT_DIR is set by cargo"))
        .join("ebpf-target");
    let cargo = env::var("CARGO").unwrap_or_else(|_| "cargo".to_string());

    let status = Command::new(cargo)
        .current_dir("../runqwatch-ebpf")
        .env("RUSTUP_TOOLCHAIN", "nightly")
        .env("CARGO_TARGET_DIR", &ebpf_target_dir)
        .env_remove("RUSTC")
        .env_remove("RUSTC_WORKSPACE_WRAPPER")
        .args([
            "build",
            "--release",
            &format!("--target={}", target),
            "-Z",
            "build-std=core",
        ])
        .status()
        .expect("Failed to execute cargo for runqwatch-ebpf");

    if !status.success() {
        panic!("Failed to build runqwatch-ebpf for {}", target);
    }

    let object = ebpf_target_dir.join(format!("{}/release/{}", target, EBPF_OBJECT));
    std::fs::copy(&object, out_dir.join(EBPF_OBJECT)).unwrap_or_else(|e| {
        panic!("Failed to copy {} to OUT_DIR: {}", object.display(), e)
    });
}
