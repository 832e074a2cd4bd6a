use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use walkunlock_core::*;

/// How long `steps` in run mode waits for the ledger to pick up a delta
const STEP_ACK_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Parser)]
#[command(name = "walkunlock")]
#[command(about = "Walk to earn screen time for locked apps", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Override data directory
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Show the step balance and locked apps
    Status {
        /// Print machine-readable JSON
        #[arg(long)]
        json: bool,
    },

    /// Record walked steps (simulated sensor)
    Walk {
        /// Number of steps to add
        steps: u64,
    },

    /// Manage locked apps
    Lock {
        #[command(subcommand)]
        action: LockAction,
    },

    /// Zero the step ledger
    Reset {
        /// Confirm the reset
        #[arg(long)]
        yes: bool,
    },

    /// Run the enforcer, reading events from stdin
    ///
    /// One event per line: `fg <app-id>`, `fg -`, `steps <n>`, `retry`,
    /// `status`, `quit`.
    Run,
}

#[derive(Subcommand)]
enum LockAction {
    /// Lock an app (replaces an existing entry with the same id)
    Add {
        app_id: String,

        /// Display name (defaults to the app id)
        #[arg(long)]
        name: Option<String>,

        /// Steps charged per minute of use
        #[arg(long)]
        cost: u64,

        /// Path to an icon image
        #[arg(long)]
        icon: Option<PathBuf>,
    },

    /// Unlock an app
    Remove { app_id: String },

    /// List locked apps
    List,

    /// Unlock every app
    Clear,
}

fn main() -> Result<()> {
    // Initialize logging
    walkunlock_core::logging::init();

    let cli = Cli::parse();

    // Determine data directory
    let config = Config::load()?;
    let data_dir = cli
        .data_dir
        .unwrap_or_else(|| config.data.data_dir.clone());
    let file_store = Arc::new(FileStore::open(&data_dir)?);
    tracing::debug!("Using data directory {:?}", file_store.dir());
    let store: Arc<dyn KeyValueStore> = file_store.clone();

    match cli.command {
        Commands::Status { json } => cmd_status(store, json),
        Commands::Walk { steps } => cmd_walk(store, steps),
        Commands::Lock { action } => cmd_lock(store, action),
        Commands::Reset { yes } => cmd_reset(store, yes),
        Commands::Run => cmd_run(file_store, &config),
    }
}

fn cmd_status(store: Arc<dyn KeyValueStore>, json: bool) -> Result<()> {
    let balance = StepLedger::open(store.clone()).balance();
    let registry = LockedAppRegistry::open(store, Arc::new(ConsoleNotifier));
    let apps = registry.list();

    if json {
        let report = serde_json::json!({
            "balance": balance,
            "locked_apps": apps,
        });
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    print_balance(&balance);
    print_apps(&apps);
    Ok(())
}

fn cmd_walk(store: Arc<dyn KeyValueStore>, steps: u64) -> Result<()> {
    let ledger = StepLedger::open(store);
    let balance = ledger.add_steps(steps)?;
    println!("✓ Recorded {} steps", steps);
    print_balance(&balance);
    Ok(())
}

fn cmd_lock(store: Arc<dyn KeyValueStore>, action: LockAction) -> Result<()> {
    let registry = LockedAppRegistry::open(store, Arc::new(ConsoleNotifier));

    match action {
        LockAction::Add {
            app_id,
            name,
            cost,
            icon,
        } => {
            let name = name.unwrap_or_else(|| app_id.clone());
            let mut app = LockedApp::new(app_id, name, cost);
            if let Some(path) = icon {
                app = app.with_icon(std::fs::read(&path)?);
            }
            let label = format!("{} ({} steps/min)", app.display_name, app.cost_per_minute);
            if !registry.add(app) {
                return Err(Error::Other("locked app was not saved".into()));
            }
            println!("✓ Locked {}", label);
        }
        LockAction::Remove { app_id } => {
            if registry.get(&app_id).is_none() {
                println!("{} is not locked", app_id);
                return Ok(());
            }
            if !registry.remove(&app_id) {
                return Err(Error::Other("locked app was not removed".into()));
            }
            println!("✓ Unlocked {}", app_id);
        }
        LockAction::List => print_apps(&registry.list()),
        LockAction::Clear => {
            if !registry.clear() {
                return Err(Error::Other("locked apps were not cleared".into()));
            }
            println!("✓ Cleared locked apps");
        }
    }

    Ok(())
}

fn cmd_reset(store: Arc<dyn KeyValueStore>, yes: bool) -> Result<()> {
    if !yes {
        eprintln!("Refusing to reset the step ledger without --yes");
        return Err(Error::Other("reset not confirmed".into()));
    }

    let balance = StepLedger::open(store).reset()?;
    println!("✓ Step ledger reset");
    print_balance(&balance);
    Ok(())
}

fn cmd_run(store: Arc<FileStore>, config: &Config) -> Result<()> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    let result = runtime.block_on(run_events(store, config));
    // A pending stdin read would otherwise hold the runtime open
    runtime.shutdown_timeout(Duration::from_millis(100));
    result
}

async fn run_events(store: Arc<FileStore>, config: &Config) -> Result<()> {
    // Pick up `walk`, `lock` and `reset` run from other shells
    let watcher = store.watch_dir(config.data.watch_interval());
    let foreground = ForegroundSignal::new();
    let (steps_tx, steps_rx) = mpsc::channel(32);
    let service = WalkUnlockService::start(
        &config.enforcement,
        store,
        foreground.subscribe(),
        steps_rx,
        Arc::new(ConsoleNotifier),
    );

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let mut words = line.split_whitespace();
        match (words.next(), words.next()) {
            (None, _) => continue,
            (Some("fg"), Some(app_id)) => {
                let app_id = (app_id != "-").then(|| app_id.to_string());
                foreground.publish(app_id);
                // Round-trip so the decision prints before the next event
                service.status().await?;
            }
            (Some("steps"), Some(count)) => match count.parse::<u64>() {
                Ok(delta) if delta > 0 => {
                    let mut balance = service.ledger().subscribe();
                    if steps_tx.send(delta).await.is_err() {
                        eprintln!("Step intake has stopped");
                        continue;
                    }
                    if tokio::time::timeout(STEP_ACK_TIMEOUT, balance.changed())
                        .await
                        .is_err()
                    {
                        eprintln!("Steps were not recorded");
                        continue;
                    }
                    println!("✓ Recorded {} steps", delta);
                }
                _ => eprintln!("Invalid step count: {}", count),
            },
            (Some("retry"), None) => {
                service.enforcer().reevaluate().await?;
                service.status().await?;
            }
            (Some("status"), None) => print_status(&service.status().await?),
            (Some("quit"), None) => break,
            _ => eprintln!("Unknown event: {}", line.trim()),
        }
    }

    watcher.abort();
    service.stop().await
}

/// Notifier that prints to the terminal
struct ConsoleNotifier;

impl Notifier for ConsoleNotifier {
    fn on_blocked(&self, app: &LockedApp, available_steps: u64) {
        println!(
            "⛔ {} is blocked: needs {} steps/min, {} available",
            app.display_name, app.cost_per_minute, available_steps
        );
    }

    fn on_usage_charged(&self, app: &LockedApp, minutes_used: u64, remaining_steps: u64) {
        println!(
            "{}: Used {}min, {} steps remaining",
            app.display_name, minutes_used, remaining_steps
        );
    }

    fn on_notice(&self, message: &str) {
        eprintln!("{}", message);
    }
}

fn print_balance(balance: &StepBalance) {
    println!(
        "Steps: {} available ({} earned, {} redeemed)",
        balance.available, balance.total, balance.redeemed
    );
}

fn print_apps(apps: &[LockedApp]) {
    if apps.is_empty() {
        println!("No locked apps.");
        return;
    }

    println!("Locked apps:");
    for app in apps {
        println!(
            "  {:<32} {:<20} {} steps/min",
            app.app_id, app.display_name, app.cost_per_minute
        );
    }
}

fn print_status(status: &EnforcerStatus) {
    print_balance(&status.balance);
    println!(
        "Foreground: {}",
        status.foreground.as_deref().unwrap_or("none")
    );
    match &status.tracking {
        Some(session) => println!(
            "Tracking: {} ({} min, {} steps charged)",
            session.app_id, session.minutes_used, session.steps_charged
        ),
        None => println!("Tracking: none"),
    }
    if status.blocked.is_empty() {
        println!("Blocked: none");
    } else {
        let blocked: Vec<&str> = status.blocked.iter().map(String::as_str).collect();
        println!("Blocked: {}", blocked.join(", "));
    }
}
