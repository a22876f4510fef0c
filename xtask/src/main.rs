use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};

const BINARY: &str = "runqwatch";

#[derive(Parser)]
#[command(name = "xtask")]
#[command(about = "Build and package runqwatch")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Build the complete binary (eBPF + userspace)
    Build {
        /// Build in release mode
        #[arg(long)]
        release: bool,

        /// Target triple for cross-compilation (e.g. aarch64-unknown-linux-gnu)
        #[arg(long)]
        target: Option<String>,

        /// Build without Kubernetes pod resolution
        #[arg(long)]
        no_k8s: bool,
    },

    /// Package the release binary with install scripts
    Package {
        /// Target triple
        #[arg(long)]
        target: Option<String>,

        /// Output directory
        #[arg(long, default_value = "dist")]
        output: String,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Build {
            release,
            target,
            no_k8s,
        } => {
            build(release, target.as_deref(), no_k8s)?;
        }
        Commands::Package { target, output } => {
            package(target.as_deref(), &output)?;
        }
    }

    Ok(())
}

fn project_root() -> Result<PathBuf> {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .parent()
        .map(Path::to_path_buf)
        .context("xtask must live inside the workspace")
}

fn binary_path(root: &Path, target: Option<&str>, profile: &str) -> PathBuf {
    match target {
        Some(t) => root.join("target").join(t).join(profile).join(BINARY),
        None => root.join("target").join(profile).join(BINARY),
    }
}

fn build(release: bool, target: Option<&str>, no_k8s: bool) -> Result<PathBuf> {
    let root = project_root()?;

    println!("Building {}...", BINARY);

    // The eBPF object only builds on Linux hosts; elsewhere go through `cross`.
    let is_cross_compile =
        target.map(|t| t.contains("linux")).unwrap_or(false) && !cfg!(target_os = "linux");

    let build_cmd = if is_cross_compile {
        if which::which("cross").is_ok() {
            println!("   Using 'cross' for cross-compilation");
            "cross"
        } else {
            bail!(
                "Cross-compilation to Linux requires 'cross' tool.\n\
                 Install with: cargo install cross\n\
                 Also requires Docker to be running."
            );
        }
    } else {
        "cargo"
    };

    if which::which("bpf-linker").is_err() {
        bail!("bpf-linker not found. Install with: cargo install bpf-linker");
    }

    let mut cmd = Command::new(build_cmd);
    cmd.current_dir(&root);
    cmd.arg("build");

    if release {
        cmd.arg("--release");
    }

    if let Some(t) = target {
        cmd.arg("--target").arg(t);
        println!("   Target: {}", t);
    }

    if no_k8s {
        cmd.arg("--no-default-features");
    }

    cmd.arg("-p").arg(BINARY);

    let status = cmd.status().context("Failed to run cargo build")?;
    if !status.success() {
        bail!("Build failed");
    }

    let profile = if release { "release" } else { "debug" };
    let binary = binary_path(&root, target, profile);
    println!("Build complete: {}", binary.display());

    Ok(binary)
}

fn systemd_unit(env_file: &str) -> String {
    format!(
        r#"[Unit]
Description=runqwatch run queue latency tracker
After=network.target

[Service]
Type=simple
ExecStart=/usr/local/bin/{bin}
Restart=on-failure
RestartSec=5
EnvironmentFile=-{env_file}

CapabilityBoundingSet=CAP_SYS_ADMIN CAP_BPF CAP_PERFMON
AmbientCapabilities=CAP_SYS_ADMIN CAP_BPF CAP_PERFMON

[Install]
WantedBy=multi-user.target
"#,
        bin = BINARY,
        env_file = env_file
    )
}

fn package(target: Option<&str>, output_dir: &str) -> Result<()> {
    let binary = build(true, target, false)?;
    if !binary.exists() {
        bail!("Binary not found at: {}", binary.display());
    }

    let root = project_root()?;
    let output_path = root.join(output_dir);
    fs::create_dir_all(&output_path).context("Failed to create output directory")?;

    let arch = target.unwrap_or(std::env::consts::ARCH);
    let version = env!("CARGO_PKG_VERSION");
    let package_name = format!("{}-{}-{}", BINARY, version, arch);

    let package_dir = output_path.join(&package_name);
    fs::create_dir_all(&package_dir)?;

    fs::copy(&binary, package_dir.join(BINARY))?;

    let env_example = root.join("example.env");
    if env_example.exists() {
        fs::copy(&env_example, package_dir.join("runqwatch.env.example"))?;
    }

    let install_script = format!(
        r#"#!/bin/bash
set -e

INSTALL_DIR="${{INSTALL_DIR:-/usr/local/bin}}"
CONFIG_DIR="${{CONFIG_DIR:-/etc/runqwatch}}"

sudo install -m 755 {bin} "$INSTALL_DIR/{bin}"

sudo mkdir -p "$CONFIG_DIR"
if [ -f runqwatch.env.example ] && [ ! -f "$CONFIG_DIR/runqwatch.env" ]; then
    sudo cp runqwatch.env.example "$CONFIG_DIR/runqwatch.env"
fi

cat > /tmp/{bin}.service << 'EOF'
{unit}
EOF
sudo mv /tmp/{bin}.service /etc/systemd/system/{bin}.service
sudo systemctl daemon-reload
sudo systemctl enable {bin}

echo "Installed. Start with: sudo systemctl start {bin}"
"#,
        bin = BINARY,
        unit = systemd_unit("/etc/runqwatch/runqwatch.env")
    );
    fs::write(package_dir.join("install.sh"), install_script)?;

    let tarball = output_path.join(format!("{}.tar.gz", package_name));
    let status = Command::new("tar")
        .current_dir(&output_path)
        .arg("-czf")
        .arg(&tarball)
        .arg(&package_name)
        .status()
        .context("Failed to create tarball")?;

    if !status.success() {
        bail!("Failed to create tarball");
    }

    fs::remove_dir_all(&package_dir)?;

    println!("Package created: {}", tarball.display());

    Ok(())
}
