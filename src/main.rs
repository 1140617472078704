use std::io::{BufRead, Write};
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{error, info, warn};

mod config;
mod error;
mod event;
mod evaluator;
mod field;
mod loader;
mod management;
mod payload;
mod primitives;
mod projector;
mod rule;
mod session;

use config::MelodyConfig;
use evaluator::EvalBudget;
use event::{Event, ReassembledHttpRequest};
use loader::RuleStore;
use session::SessionRegistry;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "melody=info".into()),
        )
        .with_target(false)
        .with_thread_ids(true)
        .with_line_number(true)
        .init();

    info!("starting melody sensor core v{}", env!("CARGO_PKG_VERSION"));

    let mut args = std::env::args().skip(1);
    match args.next().as_deref() {
        Some("lint") => {
            let rules_dir = args.next().context("usage: melody lint <rules-dir>")?;
            run_lint(&rules_dir)
        }
        Some("replay") => {
            let file = args.next().context("usage: melody replay <ndjson-file>")?;
            let config = load_config()?;
            run_replay(&file, &config)
        }
        Some("serve") | None => run_serve().await,
        Some(other) => {
            error!(command = %other, "unknown subcommand");
            Err(anyhow::anyhow!("unknown subcommand '{other}'"))
        }
    }
}

fn load_config() -> Result<MelodyConfig> {
    let config_name = std::env::var("MELODY_CONFIG").unwrap_or_else(|_| "config".to_string());

    let config = MelodyConfig::from_file(&config_name).unwrap_or_else(|e| {
        warn!(error = %e, config_name = %config_name, "no configuration file found, using defaults");
        MelodyConfig::default()
    });

    config.validate().map_err(|e| anyhow::anyhow!("invalid configuration: {e}"))?;
    Ok(config)
}

/// `melody lint <rules-dir>`: load every rule file and report the
/// per-layer rule count, or the first fatal error, without starting
/// any server.
fn run_lint(rules_dir: &str) -> Result<()> {
    match loader::load_rules(rules_dir, &[]) {
        Ok(store) => {
            info!(total = store.total_rules(), "rules loaded successfully");
            for (layer, count) in store.stats() {
                println!("{layer}: {count}");
            }
            Ok(())
        }
        Err(e) => {
            error!(error = %e, "rule lint failed");
            Err(anyhow::anyhow!(e))
        }
    }
}

/// `melody replay <file>`: read newline-delimited [`ReassembledHttpRequest`]
/// JSON records, evaluate each against the configured rules, and print
/// the resulting log record to stdout. Stands in for the live capture
/// pipeline during local testing and demos.
fn run_replay(file: &str, config: &MelodyConfig) -> Result<()> {
    let rules = loader::load_rules(&config.rules.rules_dir, &config.rules.skip_list)?;
    let sessions = SessionRegistry::new(&config.sessions);
    let budget = EvalBudget::from_millis(config.rules.regex_timeout_ms);

    let reader = std::io::BufReader::new(
        std::fs::File::open(file).with_context(|| format!("opening replay file '{file}'"))?,
    );
    let stdout = std::io::stdout();
    let mut out = stdout.lock();

    for line in reader.lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let request: ReassembledHttpRequest =
            serde_json::from_str(&line).with_context(|| "parsing replay line as ReassembledHttpRequest")?;

        let key = session::flow_key(&request.source_ip, request.source_port, &request.dest_ip, request.dest_port);
        let session_id = sessions.get_or_insert(&key);
        let timestamp_ns = nanos_now();

        let mut event = Event::new_from_reassembled_http(request, session_id, timestamp_ns);
        evaluator::evaluate(&mut event, &rules, budget);

        let record = projector::project(&event, config.sensor.max_body_bytes);
        let line = projector::to_json_line(&record)?;
        writeln!(out, "{line}")?;
    }

    Ok(())
}

/// Default mode: load rules, start the management/metrics surface, and
/// idle. The real event feed (capture/reassembly, decoy server) is an
/// external collaborator per the sensor's own scope; this process is
/// the rule-engine core they call into.
async fn run_serve() -> Result<()> {
    let config = load_config()?;

    let rules = Arc::new(loader::load_rules(&config.rules.rules_dir, &config.rules.skip_list)?);
    info!(total = rules.total_rules(), "rules loaded");

    let sessions = Arc::new(SessionRegistry::new(&config.sessions));

    if config.metrics.enabled {
        let metrics_addr: std::net::SocketAddr = config
            .metrics
            .listen_addr
            .parse()
            .with_context(|| format!("invalid metrics listen address '{}'", config.metrics.listen_addr))?;
        metrics_exporter_prometheus::PrometheusBuilder::new()
            .with_http_listener(metrics_addr)
            .install()
            .context("failed to install Prometheus exporter")?;
        info!(addr = %metrics_addr, "metrics server listening");
    }

    describe_metrics();

    let (shutdown_signal, shutdown_rx) = management::ShutdownSignal::new();
    let mgmt_task = tokio::spawn(management::start_management_api(
        config.management.clone(),
        shutdown_signal,
        Arc::clone(&rules),
        Arc::clone(&sessions),
    ));

    let _ = shutdown_rx.await;
    mgmt_task.abort();
    info!("melody sensor core shutting down");
    Ok(())
}

fn describe_metrics() {
    metrics::describe_counter!("melody_rules_loaded", "Rules loaded at startup, by layer");
    metrics::describe_counter!("melody_events_evaluated", "Events run through the evaluator");
    metrics::describe_counter!("melody_rule_matches", "Rule matches, by rule name");
    metrics::describe_counter!(
        "melody_regex_deadline_exceeded",
        "Rule evaluations that exceeded their per-rule deadline"
    );
    metrics::describe_counter!("melody_sessions_evicted", "Sessions evicted from the registry");
    metrics::describe_counter!("melody_payload_truncated", "Payloads truncated before logging");
    metrics::describe_gauge!("melody_sessions_active", "Currently tracked sessions");
}

fn nanos_now() -> u128 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos()
}
