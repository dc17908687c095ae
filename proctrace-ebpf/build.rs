use which::which;

// 构建依赖 bpf-linker，但 cargo 无法声明二进制依赖；
// 这里让 bpf-linker 变化时触发重新构建。
fn main() {
    match which("bpf-linker") {
        Ok(bpf_linker) => {
            println!("cargo:rerun-if-changed={}", bpf_linker.display());
        }
        Err(e) => {
            println!("cargo:warning=bpf-linker not found in PATH: {e}");
        }
    }
}
