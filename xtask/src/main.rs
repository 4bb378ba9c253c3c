//! Build automation for the slab-hash workspace.
//!
//! - `cargo xtask host [--release] [--cuda] [--test]`: host build of the
//!   workspace, optionally with the cust-backed facade enabled and the test
//!   suite run.
//! - `cargo xtask ptx [--release] [--arch compute_75] [--out PATH]`: device
//!   build of the kernels crate for `nvptx64-nvidia-cuda`, collecting the
//!   finished module at `--out` where `DeviceSlabHash` users load it from.
//!
//! The device build routes rustc through the NVVM codegen backend; set
//! `NVVM_BACKEND` to the path of a built `librustc_codegen_nvvm.so`.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::SystemTime;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};

const KERNELS_CRATE: &str = "slab-hash-kernels";
const PTX_TARGET: &str = "nvptx64-nvidia-cuda";
const MODULE_NAME: &str = "slab_hash_kernels.ptx";

#[derive(Parser)]
#[command(name = "xtask")]
#[command(about = "Build automation for slab-hash", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Host build (optionally with tests) of the workspace
    Host {
        #[arg(long)]
        release: bool,
        /// Enable the cust-backed device facade
        #[arg(long)]
        cuda: bool,
        /// Run the test suite after building
        #[arg(long)]
        test: bool,
    },
    /// Device build: compile the kernels crate to PTX and collect the module
    Ptx {
        #[arg(long)]
        release: bool,
        /// Device architecture the module targets
        #[arg(long, default_value = "compute_75")]
        arch: String,
        /// Where to place the finished module
        #[arg(long, default_value = "target/slab_hash_kernels.ptx")]
        out: PathBuf,
    },
}

fn main() -> Result<()> {
    match Cli::parse().command {
        Commands::Host {
            release,
            cuda,
            test,
        } => host(release, cuda, test),
        Commands::Ptx { release, arch, out } => ptx(release, &arch, &out),
    }
}

fn host(release: bool, cuda: bool, test: bool) -> Result<()> {
    let mut cmd = Command::new("cargo");
    cmd.arg(if test { "test" } else { "build" });
    if release {
        cmd.arg("--release");
    }
    if cuda {
        cmd.args(["--features", "cuda"]);
    }

    let status = cmd.status().context("failed to run cargo")?;
    if !status.success() {
        bail!("host {} failed", if test { "tests" } else { "build" });
    }
    Ok(())
}

fn ptx(release: bool, arch: &str, out: &Path) -> Result<()> {
    let backend = nvvm_backend()?;
    let target_dir = PathBuf::from("target").join("ptx");

    let mut flags = vec![
        format!("-Zcodegen-backend={}", backend.display()),
        "-Zcrate-attr=feature(register_tool)".to_string(),
        "-Zcrate-attr=register_tool(nvvm_internal)".to_string(),
        "-Zcrate-attr=no_std".to_string(),
        "-Cpanic=abort".to_string(),
        "-Coverflow-checks=off".to_string(),
        "-Cno-redzone=yes".to_string(),
        format!("-Cllvm-args=-arch={arch} --override-libm"),
        format!("-Ctarget-feature=+{arch}"),
    ];
    if release {
        flags.push("-Copt-level=3".to_string());
        flags.push("-Cdebuginfo=0".to_string());
    }

    let mut cmd = Command::new("cargo");
    cmd.args(["build", "-p", KERNELS_CRATE])
        .arg(format!("--target={PTX_TARGET}"))
        .arg("--target-dir")
        .arg(&target_dir)
        .args([
            "-Zbuild-std=core,alloc",
            "-Zbuild-std-features=panic_immediate_abort",
        ]);
    if release {
        cmd.arg("--release");
    }

    // Unit-separator encoding keeps backend paths with spaces intact.
    cmd.env("CARGO_ENCODED_RUSTFLAGS", flags.join("\u{1f}"));
    cmd.env(
        "LD_LIBRARY_PATH",
        prepend_ld_path(backend.parent().unwrap_or(Path::new("."))),
    );
    cmd.env("CUDA_ARCH", arch.strip_prefix("compute_").unwrap_or(arch));

    println!("device build: {KERNELS_CRATE} for {arch}");
    let status = cmd.status().context("failed to run the device build")?;
    if !status.success() {
        bail!("device build failed");
    }

    let profile = if release { "release" } else { "debug" };
    let module = find_module(&target_dir.join(PTX_TARGET).join(profile))?;
    if let Some(parent) = out.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::copy(&module, out)
        .with_context(|| format!("failed to copy {} to {}", module.display(), out.display()))?;
    println!("PTX module at {}", out.display());
    Ok(())
}

fn nvvm_backend() -> Result<PathBuf> {
    let backend = env::var_os("NVVM_BACKEND")
        .map(PathBuf::from)
        .context("set NVVM_BACKEND to the path of a built librustc_codegen_nvvm.so")?;
    if !backend.is_file() {
        bail!("NVVM_BACKEND does not exist: {}", backend.display());
    }
    Ok(backend)
}

fn prepend_ld_path(dir: &Path) -> String {
    match env::var("LD_LIBRARY_PATH") {
        Ok(old) if !old.is_empty() => format!("{}:{old}", dir.display()),
        _ => dir.display().to_string(),
    }
}

/// The backend drops the module next to the profile dir, or under `deps/`
/// with a disambiguating hash; prefer the former, else take the newest.
fn find_module(profile_dir: &Path) -> Result<PathBuf> {
    let direct = profile_dir.join(MODULE_NAME);
    if direct.is_file() {
        return Ok(direct);
    }

    let mut newest: Option<(SystemTime, PathBuf)> = None;
    let deps = profile_dir.join("deps");
    if deps.is_dir() {
        for entry in fs::read_dir(&deps)? {
            let entry = entry?;
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if name.starts_with("slab_hash_kernels") && name.ends_with(".ptx") {
                let modified = entry.metadata()?.modified()?;
                if newest.as_ref().map_or(true, |(t, _)| modified > *t) {
                    newest = Some((modified, entry.path()));
                }
            }
        }
    }
    newest
        .map(|(_, path)| path)
        .with_context(|| format!("no {MODULE_NAME} under {}", profile_dir.display()))
}
