//! confine supervisor
//!
//! Spawned by a client with one end of a unix stream socketpair as its only argument.
//! Everything it has to say goes to stderr, which the client reads when the
//! supervisor dies.

use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use confine::config::Config;
use confine::sandbox::SandboxContext;
use confine::sandbox::cgroup::CgroupTree;
use confine::supervisor;
use tracing::debug;
use tracing_subscriber::EnvFilter;

/// Variable holding the supervisor's log filter
const LOG_ENV: &str = "CONFINE_LOG";

fn main() -> ExitCode {
    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("{err:#}");
            ExitCode::FAILURE
        }
    }
}

fn run() -> Result<()> {
    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    supervisor::check_not_root()?;
    let args: Vec<String> = std::env::args().collect();
    let socket = supervisor::socket_from_args(&args)?;
    supervisor::set_no_new_privs()?;

    let config = Config::from_env().context("supervisor: invalid configuration")?;
    let root = config
        .effective_cgroup_root()
        .context("supervisor: cannot determine cgroup root")?;
    let cgroups = CgroupTree::setup(&root).context("supervisor: cannot set up cgroups")?;
    debug!(base = %cgroups.base().display(), "cgroup tree ready");
    let ctx = Arc::new(SandboxContext::new(cgroups));

    // Sandboxes are cloned from the runtime's thread, which must stay the only one
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("supervisor: cannot start runtime")?;
    runtime.block_on(supervisor::serve(socket, ctx, config.max_parallel_sandboxes))?;
    Ok(())
}
