//! relaylobby - Relay-backed multiplayer session lifecycle

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::{Parser, Subcommand};
use parking_lot::Mutex;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval, Instant};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use relaylobby::config::{AppConfig, SessionConfig, StatsConfig};
use relaylobby::services::local::{LocalAuth, LocalNetworkRole, LocalRelay, LocalTransport};
use relaylobby::services::{PeerId, Services};
use relaylobby::session::{
    Role, RoleEventSubscription, SessionError, SessionEvent, SessionOrchestrator,
};
use relaylobby::stats::{spawn_sampler, SamplerHandle, StatsAggregator, StatsSnapshot};

/// Simulated render rate feeding the frame-time smoother
const FRAME_INTERVAL: Duration = Duration::from_micros(16_667);

#[derive(Parser)]
#[command(name = "relaylobby")]
#[command(about = "Host or join relay-backed multiplayer sessions")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file (TOML)
    #[arg(short, long, global = true, env = "RELAYLOBBY_CONFIG")]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Host a session on the in-process relay and print its join code
    Host {
        /// Remote participant slots (defaults to the configured value)
        #[arg(long)]
        capacity: Option<u32>,

        /// Print stats snapshots as JSON lines
        #[arg(long)]
        json: bool,
    },

    /// Host a session and let simulated participants join and leave
    Demo {
        /// Number of participants to join
        #[arg(short, long, default_value = "3")]
        participants: u32,

        /// Print stats snapshots as JSON lines
        #[arg(long)]
        json: bool,
    },

    /// Interactive console (host, join, disconnect, stats, toggle, status, quit)
    Console,

    /// Print the effective configuration
    Config,
}

fn setup_logging(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();
}

/// An orchestrator wired to in-process collaborators
struct LocalSession {
    orchestrator: Arc<SessionOrchestrator>,
    role: Arc<LocalNetworkRole>,
    relay: LocalRelay,
    _role_events: RoleEventSubscription,
}

impl LocalSession {
    fn new(config: &SessionConfig, relay: LocalRelay) -> Self {
        let role = Arc::new(LocalNetworkRole::new());
        let services = Services {
            auth: Arc::new(LocalAuth::new()),
            relay: Arc::new(relay.clone()),
            transport: Arc::new(LocalTransport::new(config.relay_protocol)),
            role: role.clone(),
        };
        let orchestrator = Arc::new(SessionOrchestrator::new(config.clone(), services));
        let role_events = orchestrator.subscribe_role_events();

        Self {
            orchestrator,
            role,
            relay,
            _role_events: role_events,
        }
    }

    /// Disconnect, releasing the relay allocation when this session hosted it
    fn disconnect(&self) -> Result<(), SessionError> {
        let hosted = match self.orchestrator.role() {
            Role::Authority => self.orchestrator.join_code(),
            _ => None,
        };
        self.orchestrator.disconnect()?;
        if let Some(code) = hosted {
            self.relay.release_join_code(&code);
        }
        Ok(())
    }
}

/// Running stats sampler plus the simulated frame clock
struct StatsFeed {
    aggregator: Arc<Mutex<StatsAggregator>>,
    snapshots: watch::Receiver<StatsSnapshot>,
    _sampler: SamplerHandle,
    frames: JoinHandle<()>,
}

impl StatsFeed {
    fn start(orchestrator: Arc<SessionOrchestrator>, config: &StatsConfig) -> Self {
        // No transport metrics probe is available in-process
        let aggregator = Arc::new(Mutex::new(StatsAggregator::new(orchestrator, None, config)));
        let (snapshots, sampler) = spawn_sampler(aggregator.clone(), config.interval());

        let frame_aggregator = aggregator.clone();
        let frames = tokio::spawn(async move {
            let mut ticker = interval(FRAME_INTERVAL);
            let mut last = Instant::now();
            loop {
                ticker.tick().await;
                let now = Instant::now();
                frame_aggregator.lock().record_frame(now - last);
                last = now;
            }
        });

        Self {
            aggregator,
            snapshots,
            _sampler: sampler,
            frames,
        }
    }

    fn latest(&self) -> StatsSnapshot {
        self.snapshots.borrow().clone()
    }

    fn is_visible(&self) -> bool {
        self.aggregator.lock().is_visible()
    }
}

impl Drop for StatsFeed {
    fn drop(&mut self) {
        self.frames.abort();
    }
}

fn print_snapshot(snapshot: &StatsSnapshot, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string(snapshot)?);
    } else {
        println!("───────────────────────────");
        println!("{}", snapshot);
    }
    Ok(())
}

/// Print session events until the channel closes
fn spawn_event_printer(mut events: broadcast::Receiver<SessionEvent>) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(SessionEvent::JoinCodeGenerated(code)) => println!("Join code: {}", code),
                Ok(SessionEvent::ConnectionStateChanged(connected)) => {
                    println!("Connected: {}", connected)
                }
                Ok(SessionEvent::ConnectionError(message)) => println!("Error: {}", message),
                Ok(SessionEvent::StatusChanged(status)) => println!("» {}", status),
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}

async fn run_host(config: AppConfig, capacity: Option<u32>, json: bool) -> Result<()> {
    let session = LocalSession::new(&config.session, LocalRelay::new());
    let printer = spawn_event_printer(session.orchestrator.subscribe());

    let capacity = capacity.unwrap_or(config.session.max_connections);
    let join_code = session.orchestrator.request_host(capacity).await?;

    println!("\nHost started. Join code: {}", join_code);
    println!("Press Ctrl+C to stop.\n");

    let mut stats = StatsFeed::start(session.orchestrator.clone(), &config.stats);
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Shutting down...");
                break;
            }
            changed = stats.snapshots.changed() => {
                if changed.is_err() {
                    break;
                }
                if stats.is_visible() {
                    print_snapshot(&stats.latest(), json)?;
                }
            }
        }
    }

    session.disconnect()?;
    printer.abort();
    Ok(())
}

async fn run_demo(config: AppConfig, participants: u32, json: bool) -> Result<()> {
    let relay = LocalRelay::new();
    let host = LocalSession::new(&config.session, relay.clone());
    let printer = spawn_event_printer(host.orchestrator.subscribe());

    let join_code = host
        .orchestrator
        .request_host(config.session.max_connections)
        .await?;
    let stats = StatsFeed::start(host.orchestrator.clone(), &config.stats);
    let settle = config.stats.interval() * 2;

    let mut guests = Vec::new();
    for i in 0..participants {
        let guest = LocalSession::new(&config.session, relay.clone());
        match guest.orchestrator.request_join(&join_code).await {
            Ok(()) => {
                let peer = PeerId(u64::from(i) + 1);
                info!("Participant {} joined as peer {}", i + 1, peer);
                host.role.emit_peer_connected(peer);
                guests.push((peer, guest));
            }
            Err(e) => warn!("Participant {} could not join: {}", i + 1, e),
        }
    }

    tokio::time::sleep(settle).await;
    print_snapshot(&stats.latest(), json)?;

    for (peer, guest) in guests {
        guest.disconnect()?;
        host.role.emit_peer_disconnected(peer);
    }

    tokio::time::sleep(settle).await;
    print_snapshot(&stats.latest(), json)?;

    host.disconnect()?;
    tokio::time::sleep(Duration::from_millis(50)).await;
    printer.abort();
    Ok(())
}

async fn run_console(config: AppConfig) -> Result<()> {
    let session = LocalSession::new(&config.session, LocalRelay::new());
    let printer = spawn_event_printer(session.orchestrator.subscribe());
    let stats = StatsFeed::start(session.orchestrator.clone(), &config.stats);

    println!("Commands: host [n] | join <code> | disconnect | stats | toggle | status | quit");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let mut words = line.split_whitespace();
        let Some(command) = words.next() else {
            continue;
        };

        match command {
            "host" | "h" => {
                let capacity = match words.next() {
                    Some(n) => match n.parse() {
                        Ok(n) => n,
                        Err(e) => {
                            println!("Invalid capacity {}: {}", n, e);
                            continue;
                        }
                    },
                    None => config.session.max_connections,
                };
                // Stage failures are reported through the event printer
                if let Err(e) = session.orchestrator.request_host(capacity).await {
                    if e.stage().is_none() {
                        println!("{}", e);
                    }
                }
            }
            "join" | "c" => {
                let code = words.next().unwrap_or_default();
                if let Err(e) = session.orchestrator.request_join(code).await {
                    // Stage failures are reported through the event printer
                    if e.stage().is_none() {
                        println!("{}", e);
                    }
                }
            }
            "disconnect" | "d" => {
                if let Err(e) = session.disconnect() {
                    println!("{}", e);
                }
            }
            "stats" => {
                if stats.is_visible() {
                    print_snapshot(&stats.latest(), false)?;
                } else {
                    println!("Stats hidden (use 'toggle')");
                }
            }
            "toggle" => {
                let mut aggregator = stats.aggregator.lock();
                aggregator.toggle();
                println!("Stats visible: {}", aggregator.is_visible());
            }
            "status" => {
                let state = session.orchestrator.state();
                println!(
                    "{} | role={} | code={} | {}",
                    state.status,
                    state.role,
                    state.join_code.as_deref().unwrap_or("-"),
                    state.occupancy()
                );
            }
            "quit" | "q" => break,
            other => println!("Unknown command: {}", other),
        }
    }

    if let Err(e) = session.disconnect() {
        warn!("Disconnect on exit failed: {}", e);
    }
    printer.abort();
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    setup_logging(cli.verbose);

    let config = AppConfig::load_or_default(cli.config.as_deref())?;

    match cli.command {
        Commands::Host { capacity, json } => run_host(config, capacity, json).await?,
        Commands::Demo { participants, json } => run_demo(config, participants, json).await?,
        Commands::Console => run_console(config).await?,
        Commands::Config => print!("{}", toml::to_string_pretty(&config)?),
    }

    Ok(())
}
