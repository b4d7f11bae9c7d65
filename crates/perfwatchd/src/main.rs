//! perfwatchd - performance telemetry polling daemon.
//!
//! Connects to a virtualization management endpoint, resolves its counter
//! catalog once and polls the configured VMs and hosts at a fixed interval,
//! one worker thread per object. Records are logged, or written to stdout
//! as JSON lines with `--json`.

use std::collections::BTreeSet;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use clap::Parser;
use tracing::{Level, debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use perfwatch_core::config::TlsPolicy;
use perfwatch_core::transport::TlsTransport;
use perfwatch_core::{
    ClientConfig, EntityKind, Lifecycle, MetricRecord, ObjectKey, PerfError, PerfService,
    QueryMode,
};

/// Performance telemetry polling daemon.
#[derive(Parser)]
#[command(name = "perfwatchd", about = "Performance telemetry polling daemon", version)]
struct Args {
    /// JSON configuration file. Command-line flags override its values.
    #[arg(short, long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Management endpoint: host, host:port or https URL.
    #[arg(short, long, env = "PERFWATCH_ENDPOINT")]
    endpoint: Option<String>,

    /// User name. Falls back to $USER.
    #[arg(short, long, env = "PERFWATCH_USER")]
    user: Option<String>,

    /// Password.
    #[arg(long, env = "PERFWATCH_PASSWORD", hide_env_values = true)]
    password: Option<String>,

    /// Accept invalid TLS certificates and host names.
    #[arg(long, env = "PERFWATCH_INSECURE")]
    insecure: bool,

    /// Virtual machine id to monitor. Repeatable.
    #[arg(long = "vm", value_name = "ID")]
    vms: Vec<String>,

    /// Host id to monitor. Repeatable.
    #[arg(long = "host", value_name = "ID")]
    hosts: Vec<String>,

    /// Polling interval in seconds [default: 20, or `query.interval_secs` from --config].
    #[arg(short, long)]
    interval: Option<u64>,

    /// Fetch every sample since the previous poll instead of only the latest.
    #[arg(long)]
    incremental: bool,

    /// Write records to stdout as JSON lines.
    #[arg(long)]
    json: bool,

    /// Increase logging verbosity (-v for debug, -vv for trace). Default is info level.
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Quiet mode - only show errors.
    #[arg(short, long)]
    quiet: bool,
}

/// Initializes the tracing subscriber with the appropriate log level.
fn init_logging(verbose: u8, quiet: bool) {
    let level = if quiet {
        Level::ERROR
    } else {
        match verbose {
            0 => Level::INFO,
            1 => Level::DEBUG,
            _ => Level::TRACE,
        }
    };

    let filter = EnvFilter::from_default_env()
        .add_directive(format!("perfwatchd={}", level).parse().unwrap())
        .add_directive(format!("perfwatch_core={}", level).parse().unwrap());

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

/// Builds the client configuration from the optional file and the flags.
fn build_config(args: &Args) -> Result<ClientConfig, PerfError> {
    let mut config = match &args.config {
        Some(path) => ClientConfig::load_file(path)?,
        None => ClientConfig::default(),
    };

    if let Some(endpoint) = &args.endpoint {
        config.endpoint = endpoint.clone();
    }
    if let Some(user) = &args.user {
        config.credentials.username = user.clone();
    } else if config.credentials.username.is_empty()
        && let Ok(user) = std::env::var("USER")
    {
        config.credentials.username = user;
    }
    if let Some(password) = &args.password {
        config.credentials.password = password.clone();
    }
    if args.insecure {
        config.tls = TlsPolicy::Bypass;
    }
    if args.incremental {
        config.query.mode = QueryMode::Incremental;
    }
    if let Some(interval) = args.interval {
        config.query.interval_secs = interval.clamp(1, u32::MAX as u64) as u32;
    }

    config.validate()?;
    Ok(config)
}

/// Objects to poll, deduplicated and in key order.
fn build_targets(vms: &[String], hosts: &[String]) -> Result<Vec<(ObjectKey, EntityKind)>, PerfError> {
    let mut targets = BTreeSet::new();
    for id in vms {
        targets.insert((ObjectKey::vm(id.as_str())?, EntityKind::VirtualMachine));
    }
    for id in hosts {
        targets.insert((ObjectKey::host(id.as_str())?, EntityKind::Host));
    }
    if targets.is_empty() {
        return Err(PerfError::Config(
            "nothing to monitor (use --vm and/or --host)".to_string(),
        ));
    }
    Ok(targets.into_iter().collect())
}

/// Summarizes a batch of records for logging.
fn describe_records(records: &[MetricRecord]) -> String {
    if records.is_empty() {
        return "no samples".to_string();
    }
    let metrics: BTreeSet<&str> = records.iter().map(|r| r.name.as_str()).collect();
    let instances = records.iter().filter(|r| !r.instance.is_empty()).count();
    format!(
        "{} records, {} metrics, {} per-instance",
        records.len(),
        metrics.len(),
        instances
    )
}

fn emit_json(records: &[MetricRecord]) -> std::io::Result<()> {
    let mut out = std::io::stdout().lock();
    for record in records {
        serde_json::to_writer(&mut out, record)?;
        out.write_all(b"\n")?;
    }
    out.flush()
}

/// Sleeps for `duration`, waking every 100ms to check `running`.
fn sleep_while_running(running: &AtomicBool, duration: Duration) {
    let sleep_interval = Duration::from_millis(100);
    let mut remaining = duration;
    while remaining > Duration::ZERO && running.load(Ordering::SeqCst) {
        let sleep_time = remaining.min(sleep_interval);
        std::thread::sleep(sleep_time);
        remaining = remaining.saturating_sub(sleep_time);
    }
}

fn poll_object(
    service: &PerfService<TlsTransport>,
    key: &ObjectKey,
    kind: EntityKind,
    json: bool,
    interval: Duration,
    running: &AtomicBool,
) {
    let mut polls: u64 = 0;
    while running.load(Ordering::SeqCst) {
        match service.retrieve_metrics(key, kind) {
            Ok(records) => {
                polls += 1;
                info!(object = %key, poll = polls, "{}", describe_records(&records));
                if json {
                    if let Err(e) = emit_json(&records) {
                        error!(error = %e, "failed to write records");
                    }
                } else {
                    for r in &records {
                        debug!(
                            object = %key,
                            metric = %r.name,
                            instance = %r.instance,
                            value = r.value,
                            unit = %r.unit,
                            timestamp = %r.timestamp,
                            "sample"
                        );
                    }
                }
            }
            Err(e) => match e.error() {
                PerfError::InvalidArgument(_) => {
                    error!(error = %e, "object rejected by endpoint, worker stopping");
                    return;
                }
                _ => warn!(error = %e, "poll failed"),
            },
        }
        sleep_while_running(running, interval);
    }
    debug!(object = %key, polls, "worker stopped");
}

/// Starts the service, retrying transient failures until shutdown.
fn start_service(
    service: &PerfService<TlsTransport>,
    interval: Duration,
    running: &AtomicBool,
) -> Result<(), PerfError> {
    loop {
        match service.start() {
            Ok(()) => return Ok(()),
            Err(e @ (PerfError::Authentication(_) | PerfError::Config(_))) => return Err(e),
            Err(e) => {
                warn!(error = %e, "startup failed, retrying in {}s", interval.as_secs());
                sleep_while_running(running, interval);
                if !running.load(Ordering::SeqCst) {
                    return Err(e);
                }
            }
        }
    }
}

fn main() {
    let args = Args::parse();

    init_logging(args.verbose, args.quiet);

    info!("perfwatchd {} starting", env!("CARGO_PKG_VERSION"));

    let config = match build_config(&args) {
        Ok(config) => config,
        Err(e) => {
            error!("{}", e);
            print_config_hint();
            std::process::exit(2);
        }
    };
    let targets = match build_targets(&args.vms, &args.hosts) {
        Ok(targets) => targets,
        Err(e) => {
            error!("{}", e);
            std::process::exit(2);
        }
    };
    info!(
        "Config: endpoint={}, user={}, tls={:?}, interval={}s, mode={:?}, objects={}",
        config.endpoint,
        config.credentials.username,
        config.tls,
        config.query.interval_secs,
        config.query.mode,
        targets.len()
    );

    let service = match PerfService::from_config(&config) {
        Ok(service) => Arc::new(service),
        Err(e) => {
            error!("{}", e);
            std::process::exit(2);
        }
    };

    // Setup graceful shutdown
    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();

    if let Err(e) = ctrlc::set_handler(move || {
        info!("Received shutdown signal");
        r.store(false, Ordering::SeqCst);
    }) {
        warn!("Failed to set Ctrl-C handler: {}", e);
    }

    let interval = Duration::from_secs(u64::from(config.query.interval_secs.max(1)));

    if let Err(e) = start_service(&service, interval, &running) {
        error!("Failed to start: {}", e);
        std::process::exit(1);
    }

    info!("Starting {} workers", targets.len());

    let mut workers = Vec::with_capacity(targets.len());
    for (key, kind) in targets {
        let service = service.clone();
        let running = running.clone();
        let json = args.json;
        let spawned = std::thread::Builder::new()
            .name(format!("poll-{}", key.id()))
            .spawn(move || poll_object(&service, &key, kind, json, interval, &running));
        match spawned {
            Ok(handle) => workers.push(handle),
            Err(e) => error!("Failed to spawn worker: {}", e),
        }
    }

    for handle in workers {
        if handle.join().is_err() {
            error!("Worker panicked");
        }
    }

    // Graceful shutdown
    info!("Shutting down...");
    let dropped = service.engine().dropped_samples();
    if dropped > 0 {
        info!("Dropped {} samples with unknown counter ids", dropped);
    }
    service.stop();
    info!("Shutdown complete");
}

/// Prints configuration hints after a configuration error.
fn print_config_hint() {
    const YELLOW: &str = "\x1b[33m";
    const RESET: &str = "\x1b[0m";

    eprintln!();
    eprintln!("{YELLOW}  Configure the endpoint with flags or environment variables:");
    eprintln!("    export PERFWATCH_ENDPOINT=vc.example.com");
    eprintln!("    export PERFWATCH_USER=monitor");
    eprintln!("    export PERFWATCH_PASSWORD=secret");
    eprintln!("    export PERFWATCH_INSECURE=true   # self-signed certificates");
    eprintln!("{RESET}");
}
