use anyhow::{anyhow, Context as _};
use std::{env, fs, path::PathBuf};

// Kernel objects staged into OUT_DIR and embedded by `loader.rs`.
// The objects are built outside of this workspace; point NETFLOW_EBPF_DIR
// at the directory containing them. Without it empty blobs are embedded and
// the default loaders report a missing object at attach time.
const OBJECTS: [&str; 2] = ["firewall.o", "nat.o"];

fn main() -> anyhow::Result<()> {
    let out_dir = env::var_os("OUT_DIR").ok_or(anyhow!("OUT_DIR not set"))?;
    let out_dir = PathBuf::from(out_dir);

    println!("cargo:rerun-if-env-changed=NETFLOW_EBPF_DIR");
    let src_dir = env::var_os("NETFLOW_EBPF_DIR").map(PathBuf::from);

    for name in OBJECTS {
        let dst = out_dir.join(name);
        match &src_dir {
            Some(dir) => {
                let src = dir.join(name);
                println!("cargo:rerun-if-changed={}", src.display());
                fs::copy(&src, &dst)
                    .with_context(|| format!("failed to copy {src:?} to {dst:?}"))?;
            }
            None => {
                fs::write(&dst, [])
                    .with_context(|| format!("failed to write placeholder {dst:?}"))?;
            }
        }
    }

    Ok(())
}
