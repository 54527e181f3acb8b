use std::path::Path;
use std::process::Command;

fn main() {
    println!("cargo:rerun-if-changed=ebpf/rwnd.bpf.c");
    println!("cargo:rerun-if-changed=ebpf/rwnd.h");

    // The kernel-side object is built separately when the sources are not
    // checked out next to the crate.
    if !Path::new("ebpf/Makefile").exists() {
        println!("cargo:warning=ebpf/ not present, skipping datapath compilation");
        return;
    }

    let status = Command::new("make")
        .current_dir("ebpf")
        .status()
        .expect("Failed to run make in ebpf/");

    if !status.success() {
        panic!("eBPF compilation failed");
    }

    println!("cargo:warning=eBPF rwnd datapath compiled successfully");
}
