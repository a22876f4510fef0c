use which::which;

/// Rebuild the eBPF object whenever bpf-linker changes, since cargo cannot
/// see it as a dependency.
fn main() {
    match which("bpf-linker") {
        Ok(path) => println!("cargo:rerun-if-changed={}", path.display()),
        Err(e) => println!("cargo:warning=bpf-linker not found: {}", e),
    }
}
