use anyhow::{anyhow, Context as _};
use aya_build::cargo_metadata;

// 在 build 阶段把 proctrace-ebpf 编译成 BPF 目标文件，放到 OUT_DIR 下供 include_bytes_aligned! 使用
fn main() -> anyhow::Result<()> {
    let cargo_metadata::Metadata { packages, .. } = cargo_metadata::MetadataCommand::new()
        .no_deps()
        .exec()
        .context("MetadataCommand::exec")?;
    let ebpf_package = packages
        .into_iter()
        .find(|cargo_metadata::Package { name, .. }| name == "proctrace-ebpf")
        .ok_or_else(|| anyhow!("proctrace-ebpf package not found"))?;
    aya_build::build_ebpf([ebpf_package])
}
