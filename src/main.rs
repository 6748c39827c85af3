#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

use admission_core::server;
use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "admission-core", about = "Request admission and account-selection core")]
struct Cli {
    /// Path to admission config file
    #[arg(short, long, default_value = "config.toml")]
    config: PathBuf,

    /// Redis URL override (defaults to config file / ADMISSION_REDIS_URL)
    #[arg(long)]
    redis_url: Option<String>,

    /// Admin API listen address (health/readyz/metrics/debug)
    #[arg(long)]
    admin_listen: Option<String>,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let worker_threads = server::runtime::get_container_cpu_limit();

    let rt = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(worker_threads)
        .enable_all()
        .build()?;

    rt.block_on(server::bootstrap::run(server::bootstrap::BootstrapArgs {
        config_path: cli.config,
        redis_url: cli.redis_url,
        admin_listen: cli.admin_listen,
    }))
}
