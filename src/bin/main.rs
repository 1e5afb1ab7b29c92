use std::{
    fs::OpenOptions,
    os::unix::io::IntoRawFd,
    path::Path,
    process::ExitCode,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use clawops::{
    cli::{Cli, Commands, DeployCommand, parse_args},
    config::{ServerMode, Settings},
    constants::WATCHDOG_INTERVAL,
    deploy::{self, DeployOptions, Deployer, RollbackOptions},
    endpoint::{self, EndpointState},
    error::{EXIT_FAILURE, OpsError, Result},
    git::{self, GitRollback, RollbackOutcome, RollbackTarget},
    inspector::InspectorChain,
    logs,
    process::TerminatePolicy,
    runtime::RuntimeDirectory,
    supervisor::{ProcessSupervisor, StartOptions, StopOptions},
    watchdog::{self, SupervisedServer, Watchdog, WatchdogOptions, WatchdogPolicy},
};

fn main() -> ExitCode {
    let args = parse_args();
    init_logging(&args);

    match run(args) {
        Ok(code) => code,
        Err(err) => {
            error!("{err}");
            ExitCode::from(err.exit_code())
        }
    }
}

fn init_logging(args: &Cli) {
    let filter = if let Some(level) = args.log_level {
        EnvFilter::new(level.as_str())
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

/// Resolved paths and settings shared by every command.
struct Context {
    settings: Settings,
    runtime: RuntimeDirectory,
}

impl Context {
    fn load(args: &Cli) -> Result<Self> {
        let project_dir = match &args.project_dir {
            Some(dir) => dir.clone(),
            None => std::env::current_dir()?,
        };
        let project_dir = project_dir.canonicalize().map_err(|err| {
            OpsError::Config(format!(
                "project directory {} is not accessible: {err}",
                project_dir.display()
            ))
        })?;

        let settings = Settings::load(&project_dir, args.config.as_deref())?;
        let runtime = RuntimeDirectory::resolve(args.runtime_dir.as_deref(), &project_dir);
        let runtime = RuntimeDirectory::new(std::path::absolute(runtime.root())?);

        Ok(Self { settings, runtime })
    }

    fn inspector(&self) -> Result<Arc<InspectorChain>> {
        Ok(Arc::new(InspectorChain::detect(
            &self.settings.inspectors,
            &self.settings.host,
        )?))
    }

    fn supervisor(&self, settings: Settings) -> Result<ProcessSupervisor> {
        Ok(ProcessSupervisor::new(
            settings,
            self.runtime.clone(),
            self.inspector()?,
        ))
    }
}

fn run(args: Cli) -> Result<ExitCode> {
    let ctx = Context::load(&args)?;

    match args.command {
        Commands::Start {
            port,
            host,
            mode,
            no_build,
            clean,
            force,
        } => {
            let supervisor = ctx.supervisor(ctx.settings.clone().with_target(host, port))?;
            let options = StartOptions {
                build: !no_build,
                clean,
                force,
                ..StartOptions::from_settings(supervisor.settings(), mode)
            };
            let state = supervisor.start(&options)?;
            println!("{}", state.summary());
        }
        Commands::Stop { port, force } => {
            let supervisor = ctx.supervisor(ctx.settings.clone().with_target(None, port))?;
            let report = supervisor.stop(&StopOptions {
                port: supervisor.settings().port,
                force,
            })?;
            if report.was_running() {
                for (pid, outcome) in &report.terminated {
                    println!("Stopped PID {pid} ({outcome:?})");
                }
            } else {
                println!("Server already stopped");
            }
        }
        Commands::Restart {
            port,
            host,
            mode,
            no_build,
        } => {
            let supervisor = ctx.supervisor(ctx.settings.clone().with_target(host, port))?;
            let mode = mode
                .or_else(|| supervisor.recorded_mode())
                .unwrap_or(ServerMode::Dev);
            let options = StartOptions {
                build: !no_build,
                ..StartOptions::from_settings(supervisor.settings(), mode)
            };
            let state = supervisor.restart(&options)?;
            println!("{}", state.summary());
        }
        Commands::Status { json } => {
            let supervisor = ctx.supervisor(ctx.settings.clone())?;
            let status = supervisor.status()?;
            if json {
                println!("{}", serde_json::to_string_pretty(&status)?);
            } else {
                match status.pid {
                    Some(pid) => println!(
                        "PID {pid} ({}){}",
                        if status.alive { "running" } else { "not running" },
                        status
                            .process_name
                            .map(|name| format!(" {name}"))
                            .unwrap_or_default()
                    ),
                    None => println!("No PID recorded"),
                }
                match status.health {
                    Some(health) => println!("{}", health.summary()),
                    None => println!("No health snapshot recorded"),
                }
                if let Some(owner) = status.lock_owner {
                    println!("Lifecycle lock held by PID {owner}");
                }
            }
        }
        Commands::Health {
            port,
            host,
            json,
            state,
        } => {
            let supervisor = ctx.supervisor(ctx.settings.clone().with_target(host, port))?;
            let settings = supervisor.settings();
            let mode = supervisor.recorded_mode().unwrap_or(ServerMode::Stopped);
            let evaluator = supervisor.evaluator()?;
            let health = if state {
                evaluator.check_and_persist(&ctx.runtime, &settings.host, settings.port, mode)?
            } else {
                evaluator.check_health(&settings.host, settings.port, mode)
            };

            if json {
                println!("{}", serde_json::to_string_pretty(&health)?);
            } else {
                println!("{}", health.summary());
            }
            if !health.healthy() {
                return Ok(ExitCode::from(EXIT_FAILURE));
            }
        }
        Commands::Watchdog {
            interval,
            threshold,
            mode,
            daemonize,
            stop,
            status,
            once,
            dry_run,
        } => {
            return run_watchdog(
                &ctx,
                WatchdogArgs {
                    interval,
                    threshold,
                    mode,
                    daemonize,
                    stop,
                    status,
                    once,
                    dry_run,
                },
            );
        }
        Commands::Deploy { action } => return run_deploy(&ctx, action),
        Commands::Rollback {
            to,
            steps,
            mode,
            port,
            dry_run,
            force,
        } => {
            if !git::is_repository(&ctx.settings.project_dir) {
                return Err(OpsError::Config(format!(
                    "{} is not a git checkout",
                    ctx.settings.project_dir.display()
                )));
            }
            let supervisor = ctx.supervisor(ctx.settings.clone())?;
            let target = match to {
                Some(reference) => RollbackTarget::Ref(reference),
                None => RollbackTarget::Steps(steps.unwrap_or(1)),
            };
            let mode = mode
                .or_else(|| supervisor.recorded_mode())
                .unwrap_or(ServerMode::Dev);
            let port = port.unwrap_or(supervisor.settings().port);

            match GitRollback::new(&supervisor).run(&target, mode, port, dry_run, force)? {
                RollbackOutcome::Planned { plan, dirty } => {
                    println!("Plan: {plan}");
                    if dirty {
                        println!("Working tree has uncommitted changes (use --force to discard)");
                    }
                }
                RollbackOutcome::Completed(state) => {
                    println!("Rollback {}: {} -> {}", state.status, state.from, state.to);
                }
            }
        }
        Commands::Endpoint { listen_port } => {
            let listen_port = listen_port.unwrap_or(ctx.settings.health_port);
            let state = EndpointState::new(&ctx.settings, ctx.runtime.clone(), ctx.inspector()?);
            endpoint::serve(state, &ctx.settings.host, listen_port)?;
        }
        Commands::Logs { lines, watchdog } => {
            logs::show_logs(&ctx.runtime, lines, watchdog)?;
        }
    }

    Ok(ExitCode::SUCCESS)
}

struct WatchdogArgs {
    interval: Option<u64>,
    threshold: Option<u32>,
    mode: Option<ServerMode>,
    daemonize: bool,
    stop: bool,
    status: bool,
    once: bool,
    dry_run: bool,
}

fn run_watchdog(ctx: &Context, args: WatchdogArgs) -> Result<ExitCode> {
    if args.stop {
        let policy = TerminatePolicy {
            checks: ctx.settings.terminate_checks,
            interval: ctx.settings.terminate_interval,
            immediate: false,
        };
        match watchdog::stop(&ctx.runtime, policy)? {
            Some(outcome) => println!("Watchdog stopped ({outcome:?})"),
            None => println!("Watchdog is not running"),
        }
        return Ok(ExitCode::SUCCESS);
    }

    if args.status {
        let status = watchdog::status(&ctx.runtime)?;
        match status.pid.filter(|_| status.running) {
            Some(pid) => println!("Watchdog running (PID {pid})"),
            None => println!("Watchdog not running"),
        }
        println!(
            "Consecutive failures: {}",
            status.state.consecutive_failures
        );
        if let Some(action) = status.state.last_action {
            println!("Last action: {action}");
        }
        if let Some(health) = status.health {
            println!("{}", health.summary());
        }
        return Ok(ExitCode::SUCCESS);
    }

    let interval = match args.interval {
        Some(0) => return Err(OpsError::Config("--interval must be positive".into())),
        Some(secs) => Duration::from_secs(secs),
        None => WATCHDOG_INTERVAL,
    };
    let mut policy = WatchdogPolicy::default();
    if let Some(threshold) = args.threshold {
        if threshold == 0 {
            return Err(OpsError::Config("--threshold must be positive".into()));
        }
        policy.threshold = threshold;
    }
    let options = WatchdogOptions {
        interval,
        policy,
        dry_run: args.dry_run,
    };

    if args.daemonize {
        watchdog::ensure_not_running(&ctx.runtime)?;
        ctx.runtime.ensure()?;
        info!(
            "Starting watchdog in the background; logging to {}",
            ctx.runtime.watchdog_log_file().display()
        );
        daemonize(&ctx.runtime.watchdog_log_file())?;
    }

    let supervisor = ctx.supervisor(ctx.settings.clone())?;
    let mode = args
        .mode
        .or_else(|| supervisor.recorded_mode())
        .unwrap_or(ServerMode::Dev);
    let target = SupervisedServer::new(&supervisor, mode);
    let watchdog = Watchdog::new(&ctx.runtime, options);

    if args.once {
        let report = watchdog.run_once(&target)?;
        println!(
            "{} (action: {}, failures: {})",
            report.health.summary(),
            report.action,
            report.consecutive_failures
        );
        let ok = report.health.healthy() || report.restarted == Some(true);
        return Ok(if ok {
            ExitCode::SUCCESS
        } else {
            ExitCode::from(EXIT_FAILURE)
        });
    }

    let shutdown = register_shutdown_flag()?;
    watchdog.run_loop(&target, shutdown)?;
    Ok(ExitCode::SUCCESS)
}

fn run_deploy(ctx: &Context, action: DeployCommand) -> Result<ExitCode> {
    let supervisor = ctx.supervisor(ctx.settings.clone())?;
    let deployer = Deployer::new(&supervisor);

    match action {
        DeployCommand::Deploy {
            pre_build,
            no_health_check,
            timeout,
            mode,
            health_target,
        } => {
            if timeout == 0 {
                return Err(OpsError::Config("--timeout must be positive".into()));
            }
            let report = deployer.deploy(&DeployOptions {
                mode,
                pre_build,
                health_check: !no_health_check,
                health_target,
                timeout: Duration::from_secs(timeout),
            })?;
            println!("Deployed {} as {}", report.version, report.tx_id);
            if !report.pruned.is_empty() {
                println!("Pruned backups: {}", report.pruned.join(", "));
            }
        }
        DeployCommand::Rollback { to, force, mode } => {
            let target = deployer.rollback(&RollbackOptions {
                target: to,
                force,
                mode,
            })?;
            println!("Rolled back to {target}");
        }
        DeployCommand::Status { json } => {
            let overview = deployer.status()?;
            if json {
                println!("{}", serde_json::to_string_pretty(&overview)?);
            } else {
                match &overview.current {
                    Some(current) => println!(
                        "Status: {} (version {}, transaction {})",
                        current.status,
                        current.version,
                        current.transaction_id.as_deref().unwrap_or("-")
                    ),
                    None => println!("Status: not initialised"),
                }
                println!("Recent transactions:");
                for entry in &overview.recent {
                    println!("  {}", deploy::describe(entry));
                }
                println!("Backups: {}", overview.backups.len());
                for backup in &overview.backups {
                    println!("  {backup}");
                }
            }
        }
        DeployCommand::Journal { lines } => {
            for entry in deployer.journal_tail(lines)? {
                println!("{}", serde_json::to_string(&entry)?);
            }
        }
        DeployCommand::Verify { json } => {
            let report = deployer.verify()?;
            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                for check in &report.checks {
                    let mark = if check.passed { "ok" } else { "FAIL" };
                    println!("[{mark}] {}: {}", check.name, check.detail);
                }
                println!("{} issue(s)", report.issues);
            }
            if !report.passed() {
                return Ok(ExitCode::from(EXIT_FAILURE));
            }
        }
        DeployCommand::Init => {
            let current = deployer.init()?;
            println!("Deployment state: {}", current.status);
        }
    }

    Ok(ExitCode::SUCCESS)
}

fn register_shutdown_flag() -> Result<Arc<AtomicBool>> {
    let shutdown = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&shutdown);
    ctrlc::set_handler(move || {
        flag.store(true, Ordering::SeqCst);
    })
    .map_err(|err| OpsError::Config(format!("cannot install signal handler: {err}")))?;
    Ok(shutdown)
}

/// Detaches from the terminal, sending stdout and stderr to `log_path`.
fn daemonize(log_path: &Path) -> Result<()> {
    let log = OpenOptions::new().create(true).append(true).open(log_path)?;

    if unsafe { libc::fork() } > 0 {
        std::process::exit(0);
    }

    unsafe {
        libc::setsid();
    }

    if unsafe { libc::fork() } > 0 {
        std::process::exit(0);
    }

    std::env::set_current_dir("/")?;
    let devnull = std::fs::File::open("/dev/null")?;
    let null_fd = devnull.into_raw_fd();
    let log_fd = log.into_raw_fd();
    unsafe {
        let _ = libc::dup2(null_fd, libc::STDIN_FILENO);
        let _ = libc::dup2(log_fd, libc::STDOUT_FILENO);
        let _ = libc::dup2(log_fd, libc::STDERR_FILENO);
        libc::close(null_fd);
        libc::close(log_fd);
    }

    Ok(())
}
