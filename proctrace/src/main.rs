use clap::Parser;
use proctrace::config::{AppConfig, OutputMode};
use proctrace::{core_logic, logger};
use std::env;
use std::path::PathBuf;

/// Command line options for proctrace
#[derive(Debug, Parser)]
#[command(author, version, about = "Trace process exec, fork and exit events with eBPF", long_about = None)]
struct Cli {
    /// Path to configuration file (YAML). If not provided, search order applies.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Event output format, overrides `output` from the configuration file
    #[arg(long, value_enum)]
    output: Option<OutputMode>,

    /// Forward finished process trees to HOST:PORT as JSON lines
    #[arg(long, value_name = "HOST:PORT")]
    forward: Option<String>,

    /// Print the path that was selected for configuration and exit
    #[arg(long)]
    print_config_path: bool,
}

fn candidate_config_paths() -> Vec<PathBuf> {
    let mut cands = Vec::new();
    // 1. Environment variable
    if let Ok(p) = env::var("PROCTRACE_CONFIG") {
        cands.push(PathBuf::from(p));
    }
    // 2. Current working directory
    cands.push(PathBuf::from("./proctrace.yaml"));
    // 3. /etc/proctrace/
    cands.push(PathBuf::from("/etc/proctrace/config.yaml"));
    // 4. XDG config home if set
    if let Ok(home) = env::var("XDG_CONFIG_HOME") {
        cands.push(PathBuf::from(home).join("proctrace/config.yaml"));
    }
    // 5. ~/.config/proctrace/config.yaml
    if let Some(home_dir) = dirs_next::home_dir() {
        cands.push(home_dir.join(".config/proctrace/config.yaml"));
    }
    cands
}

/// 显式指定和环境变量指定的路径必须存在；其余候选都不存在时使用默认配置
fn resolve_config_path(cli: &Cli) -> Option<PathBuf> {
    if let Some(explicit) = &cli.config {
        return Some(explicit.clone());
    }
    if let Ok(env_path) = env::var("PROCTRACE_CONFIG") {
        return Some(PathBuf::from(env_path));
    }
    candidate_config_paths().into_iter().find(|cand| cand.exists())
}

fn main() {
    let cli = Cli::parse();

    let config_path = resolve_config_path(&cli);
    if cli.print_config_path {
        match &config_path {
            Some(path) => println!("{}", path.display()),
            None => println!("(built-in defaults)"),
        }
        return;
    }

    let mut config = match &config_path {
        Some(path) => match AppConfig::load_from_file(path) {
            Ok(config) => config,
            Err(e) => {
                eprintln!("Error: cannot load config {:?}: {}", path, e);
                std::process::exit(1);
            }
        },
        None => AppConfig::default(),
    };

    // 命令行参数覆盖配置文件
    if let Some(output) = cli.output {
        config.output = output;
    }
    if let Some(address) = cli.forward {
        config.forward.address = Some(address);
    }
    if let Err(e) = config.validate() {
        eprintln!("Error: invalid configuration: {}", e);
        std::process::exit(1);
    }

    let _log_guard = match logger::init_logging(&config) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("Error: {}", e);
            std::process::exit(1);
        }
    };
    match &config_path {
        Some(path) => tracing::info!("Config resolution: using {}", path.display()),
        None => tracing::info!("Config resolution: no configuration file found, using defaults"),
    }

    if let Err(e) = core_logic::async_runtime(config) {
        tracing::error!("Core logic error: {:#}", e);
        // 先刷新日志再退出
        drop(_log_guard);
        std::process::exit(1);
    }
}
