use std::env;
use std::path::{Path, PathBuf};
use std::process::Command;

/// BPF sources and the object names the tracer embeds.
const PROGRAMS: &[(&str, &str)] = &[
    ("bpf/blk_latency.c", "blk_latency.bpf.o"),
    ("bpf/syscall_latency.c", "syscall_latency.bpf.o"),
];

fn main() {
    println!("cargo:rerun-if-changed=bpf/");
    println!("cargo:rerun-if-changed=build.rs");

    // Kernel programs are only embedded with the `bpf` feature.
    if env::var_os("CARGO_FEATURE_BPF").is_none() {
        return;
    }

    // BPF compilation is Linux-only.
    if env::var("CARGO_CFG_TARGET_OS").unwrap_or_default() != "linux" {
        println!("cargo:warning=BPF compilation skipped on non-Linux target");
        return;
    }

    let out_dir = PathBuf::from(env::var("OUT_DIR").expect("OUT_DIR not set"));
    let manifest_dir =
        PathBuf::from(env::var("CARGO_MANIFEST_DIR").expect("CARGO_MANIFEST_DIR not set"));

    // Determine target architecture for BPF.
    let target_arch = match env::var("CARGO_CFG_TARGET_ARCH")
        .unwrap_or_default()
        .as_str()
    {
        "x86_64" => "x86",
        "aarch64" => "arm64",
        arch => {
            println!("cargo:warning=Unsupported BPF target arch: {arch}, defaulting to x86");
            "x86"
        }
    };

    let include_dir = vmlinux_include_dir(&manifest_dir, &out_dir);

    for (src, obj) in PROGRAMS {
        compile(
            &include_dir,
            &manifest_dir.join(src),
            &out_dir.join(obj),
            target_arch,
        );
    }
}

/// Directory holding `vmlinux.h`: the checked-in copy if present, otherwise
/// one dumped from the running kernel's BTF with bpftool.
fn vmlinux_include_dir(manifest_dir: &Path, out_dir: &Path) -> PathBuf {
    let vendored = manifest_dir.join("bpf/include");
    if vendored.join("vmlinux.h").exists() {
        return vendored;
    }

    let generated = out_dir.join("include");
    std::fs::create_dir_all(&generated).expect("creating include dir");
    let output = Command::new("bpftool")
        .args(["btf", "dump", "file", "/sys/kernel/btf/vmlinux", "format", "c"])
        .output()
        .expect("failed to execute bpftool - is it installed?");
    if !output.status.success() {
        eprintln!("bpftool btf dump failed with status: {}", output.status);
        std::process::exit(1);
    }
    std::fs::write(generated.join("vmlinux.h"), output.stdout).expect("writing vmlinux.h");
    generated
}

fn compile(include_dir: &Path, src: &Path, out: &Path, target_arch: &str) {
    let bpf_cflags = format!("-D__TARGET_ARCH_{target_arch}");

    let status = Command::new("clang")
        .args([
            "-O2",
            "-g",
            "-Wall",
            "-Werror",
            "-target",
            "bpf",
            &bpf_cflags,
            "-I",
            include_dir.to_str().expect("valid path"),
            "-c",
            src.to_str().expect("valid path"),
            "-o",
            out.to_str().expect("valid path"),
        ])
        .status()
        .expect("failed to execute clang - is it installed?");

    if !status.success() {
        eprintln!("BPF compilation of {} failed with status: {status}", src.display());
        std::process::exit(1);
    }
}
