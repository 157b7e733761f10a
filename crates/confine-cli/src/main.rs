//! confine CLI
//!
//! A command-line tool for running a single program inside a confine sandbox.

use std::fs::File;
use std::io;
use std::os::fd::AsFd;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use confine::{
    BindMount, Config, CreateDir, CreateFile, EXAMPLE_CONFIG, MountOp, MountProc, MountTmpfs,
    RequestOptions, SandboxResult, SiCode, SupervisorConnection,
};
use tracing::{Level, debug, info};
use tracing_subscriber::EnvFilter;

/// Host directories bind-mounted read-only into a `--root` sandbox when present
const SYSTEM_DIRS: &[&str] = &["/bin", "/lib", "/lib64", "/usr"];

#[derive(Parser)]
#[command(name = "confine")]
#[command(about = "Run programs inside an isolated sandbox")]
#[command(version)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize a new configuration file
    Init {
        /// Output path (default: confine.toml)
        #[arg(short, long, default_value = "confine.toml")]
        output: PathBuf,

        /// Overwrite existing file
        #[arg(short, long)]
        force: bool,
    },

    /// Run a program in a sandbox with the terminal's stdin, stdout and stderr
    Run(RunArgs),

    /// Show effective configuration
    ShowConfig,
}

#[derive(clap::Args)]
struct RunArgs {
    /// Wall time limit in seconds
    #[arg(short, long, value_name = "SECS")]
    time_limit: Option<f64>,

    /// CPU time limit in seconds, summed over every process of the sandbox
    #[arg(long, value_name = "SECS")]
    cpu_time_limit: Option<f64>,

    /// Memory limit in bytes
    #[arg(short, long, value_name = "BYTES")]
    memory_limit: Option<u64>,

    /// Maximum number of processes
    #[arg(long, value_name = "N")]
    pids: Option<u32>,

    /// Build a tmpfs root at DIR with the system directories and /proc in it
    #[arg(long, value_name = "DIR")]
    root: Option<PathBuf>,

    /// Bind mount SRC at DEST, read-only and no-exec unless :rw or :exec is given
    #[arg(long, value_name = "SRC:DEST[:rw][:exec]", value_parser = parse_bind)]
    bind: Vec<BindSpec>,

    /// Environment variable for the program
    #[arg(short, long, value_name = "K=V")]
    env: Vec<String>,

    /// Compiled seccomp-bpf program to install
    #[arg(long, value_name = "FILE")]
    seccomp: Option<PathBuf>,

    /// Program and its arguments
    #[arg(last = true, required = true, value_name = "ARGV")]
    argv: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct BindSpec {
    source: String,
    dest: String,
    writable: bool,
    exec: bool,
}

fn parse_bind(s: &str) -> Result<BindSpec, String> {
    let mut parts = s.split(':');
    let (Some(source), Some(dest)) = (parts.next(), parts.next()) else {
        return Err(format!("expected SRC:DEST, got '{s}'"));
    };
    let mut spec = BindSpec {
        source: source.to_string(),
        dest: dest.to_string(),
        writable: false,
        exec: false,
    };
    for flag in parts {
        match flag {
            "rw" => spec.writable = true,
            "exec" => spec.exec = true,
            other => return Err(format!("unknown bind option '{other}'")),
        }
    }
    Ok(spec)
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::from_default_env().add_directive(Level::DEBUG.into())
    } else {
        EnvFilter::from_default_env().add_directive(Level::INFO.into())
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .with_target(false)
        .init();

    // Load configuration
    let config = if let Some(ref path) = cli.config {
        info!(?path, "loading configuration");
        Config::from_file(path).context("failed to load configuration")?
    } else {
        debug!("using configuration from the environment");
        Config::from_env().context("failed to load configuration")?
    };

    match cli.command {
        Commands::Init { output, force } => init_config(&output, force),
        Commands::Run(args) => {
            let code = run(&config, args)?;
            std::process::exit(code);
        }
        Commands::ShowConfig => {
            show_config(&config);
            Ok(())
        }
    }
}

fn secs(value: f64, flag: &str) -> Result<Duration> {
    Duration::try_from_secs_f64(value).with_context(|| format!("invalid {flag}: {value}"))
}

/// Mount operations and new root for the run flags
fn mount_plan(root: Option<&Path>, binds: &[BindSpec]) -> Result<(Vec<MountOp>, Option<String>)> {
    let Some(root) = root else {
        let ops = binds.iter().map(|b| bind_op(b, &b.dest)).collect();
        return Ok((ops, None));
    };
    let root = root
        .to_str()
        .context("--root must be valid UTF-8")?
        .trim_end_matches('/')
        .to_string();
    if root.is_empty() {
        bail!("--root cannot be /");
    }

    let mut ops = vec![MountOp::MountTmpfs(MountTmpfs::new(&root))];
    for dir in SYSTEM_DIRS {
        if Path::new(dir).is_dir() {
            ops.push(MountOp::CreateDir(CreateDir::new(format!("{root}{dir}"))));
            ops.push(MountOp::BindMount(
                BindMount::new(*dir, format!("{root}{dir}"))
                    .recursive(true)
                    .read_only(true),
            ));
        }
    }
    for bind in binds {
        let dest = format!("{root}{}", bind.dest);
        if Path::new(&bind.source).is_dir() {
            ops.push(MountOp::CreateDir(CreateDir::new(&dest)));
        } else {
            ops.push(MountOp::CreateFile(CreateFile::new(&dest)));
        }
        ops.push(bind_op(bind, &dest));
    }
    ops.push(MountOp::CreateDir(CreateDir::new(format!("{root}/proc"))));
    ops.push(MountOp::MountProc(MountProc::new(format!("{root}/proc"))));
    ops.push(MountOp::CreateDir(CreateDir::new(format!("{root}/tmp"))));
    ops.push(MountOp::MountTmpfs(MountTmpfs::new(format!("{root}/tmp")).no_exec(true)));
    Ok((ops, Some(root)))
}

fn bind_op(bind: &BindSpec, dest: &str) -> MountOp {
    MountOp::BindMount(
        BindMount::new(&bind.source, dest)
            .recursive(true)
            .read_only(!bind.writable)
            .no_exec(!bind.exec),
    )
}

fn run(config: &Config, args: RunArgs) -> Result<i32> {
    let seccomp = args
        .seccomp
        .as_ref()
        .map(|path| {
            File::open(path)
                .with_context(|| format!("failed to open seccomp program {}", path.display()))
        })
        .transpose()?;

    let stdin = io::stdin();
    let stdout = io::stdout();
    let stderr = io::stderr();
    let mut options = RequestOptions::new()
        .with_env(args.env.iter().cloned())
        .with_stdin(stdin.as_fd())
        .with_stdout(stdout.as_fd())
        .with_stderr(stderr.as_fd());
    if let Some(file) = &seccomp {
        options = options.with_seccomp_bpf(file.as_fd());
    }
    if let Some(limit) = args.time_limit {
        options = options.with_time_limit(secs(limit, "--time-limit")?);
    }
    if let Some(limit) = args.cpu_time_limit {
        options = options.with_cpu_time_limit(secs(limit, "--cpu-time-limit")?);
    }
    if let Some(bytes) = args.memory_limit {
        options = options.with_memory_limit(bytes);
    }
    if let Some(pids) = args.pids {
        options = options.with_process_num_limit(pids);
    }
    let (ops, new_root) = mount_plan(args.root.as_deref(), &args.bind)?;
    for op in ops {
        options = options.with_mount(op);
    }
    if let Some(root) = new_root {
        options = options.with_new_root(root);
    }

    let mut conn = SupervisorConnection::spawn(config).context("failed to start supervisor")?;
    info!(argv = ?args.argv, "running program");
    let handle = conn
        .send_request(&args.argv, &options)
        .context("failed to send request")?;
    let result = conn.await_result(handle).context("failed to run program")?;
    conn.shutdown().context("supervisor shutdown failed")?;

    match result {
        SandboxResult::Ok {
            si,
            cgroup,
            runtime,
        } => {
            // Log execution info via tracing (stderr), keeping stdout clean for piping
            info!(
                status = %si,
                runtime = format_args!("{:.3}s", runtime.as_secs_f64()),
                user = format_args!("{:.3}s", cgroup.cpu_time.user.as_secs_f64()),
                system = format_args!("{:.3}s", cgroup.cpu_time.system.as_secs_f64()),
                peak_memory = cgroup.peak_memory_in_bytes,
                "execution result"
            );
            Ok(match si.code {
                SiCode::Exited => si.status,
                _ => 128 + si.status,
            })
        }
        SandboxResult::Error { description } => bail!("sandbox setup failed: {description}"),
    }
}

fn show_config(config: &Config) {
    println!("Supervisor binary: {}", config.supervisor_binary().display());
    match config.effective_cgroup_root() {
        Ok(root) => match confine::sandbox::cgroup::check_root(&root) {
            Ok(()) => println!("cgroup root: {}", root.display()),
            Err(e) => println!("cgroup root: {} ({e})", root.display()),
        },
        Err(e) => println!("cgroup root: unavailable ({e})"),
    }
    println!("Max parallel sandboxes: {}", config.max_parallel_sandboxes);
    println!("Shutdown timeout: {} ms", config.shutdown_timeout_ms);
}

fn init_config(output: &PathBuf, force: bool) -> Result<()> {
    if output.exists() && !force {
        bail!(
            "Configuration file already exists at '{}'. Use --force to overwrite.",
            output.display()
        );
    }

    std::fs::write(output, EXAMPLE_CONFIG).context("failed to write configuration file")?;

    println!("Created configuration file at '{}'", output.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bind_defaults_to_read_only_no_exec() {
        let spec = parse_bind("/data:/data").unwrap();
        assert_eq!(spec.source, "/data");
        assert_eq!(spec.dest, "/data");
        assert!(!spec.writable);
        assert!(!spec.exec);
    }

    #[test]
    fn bind_flags() {
        let spec = parse_bind("/a:/b:rw:exec").unwrap();
        assert!(spec.writable);
        assert!(spec.exec);
        assert!(parse_bind("/a").is_err());
        assert!(parse_bind("/a:/b:nosuid").is_err());
    }

    #[test]
    fn plan_without_root_binds_in_place() {
        let binds = [parse_bind("/data:/srv").unwrap()];
        let (ops, root) = mount_plan(None, &binds).unwrap();
        assert!(root.is_none());
        assert_eq!(ops.len(), 1);
        let MountOp::BindMount(op) = &ops[0] else {
            panic!("expected bind mount, got {:?}", ops[0]);
        };
        assert_eq!(op.dest, "/srv");
        assert!(op.read_only && op.no_exec);
    }

    #[test]
    fn plan_with_root_ends_with_proc_and_tmp() {
        let (ops, root) = mount_plan(Some(Path::new("/tmp/box/")), &[]).unwrap();
        assert_eq!(root.as_deref(), Some("/tmp/box"));
        assert!(matches!(&ops[0], MountOp::MountTmpfs(op) if op.path == "/tmp/box"));
        assert!(ops.iter().any(|op| matches!(op, MountOp::MountProc(p) if p.path == "/tmp/box/proc")));
        assert!(matches!(ops.last(), Some(MountOp::MountTmpfs(op)) if op.path == "/tmp/box/tmp"));
    }

    #[test]
    fn plan_rejects_slash_root() {
        assert!(mount_plan(Some(Path::new("/")), &[]).is_err());
    }

    #[test]
    fn cli_parses_run() {
        let cli = Cli::try_parse_from([
            "confine", "run", "--time-limit", "1.5", "--bind", "/a:/b", "--", "/bin/echo", "hi",
        ])
        .unwrap();
        let Commands::Run(args) = cli.command else {
            panic!("expected run");
        };
        assert_eq!(args.time_limit, Some(1.5));
        assert_eq!(args.argv, ["/bin/echo", "hi"]);
        assert_eq!(args.bind.len(), 1);
    }
}
