//! Context Sensor Agent CLI
//!
//! Runs the orchestration loop and inspects or edits the agent's state.

use chrono::Utc;
use clap::{Parser, Subcommand};
use context_sensor_agent::{
    buffer::{BufferConfig, FlushMode},
    bus::NotificationBus,
    config::Config,
    lifecycle::{LifecycleManager, ModuleStatus, ProcessLauncher},
    logging,
    orchestrator::{AgentContext, Orchestrator},
    scheduler::Scheduler,
    sensors::{
        builtin_runtime, ProducerOptions, SensorSetup, SensorSink, DEFAULT_TIMEZONE_PERIOD,
    },
    settings::{keys, SettingsStore},
    storage::{
        DataMaintenance, MemoryStore, ModuleTable, SampleReader, ScheduleTable, SettingsTable,
        SqliteStore,
    },
    transparency::{create_shared_log, create_shared_log_with_persistence, TransparencyLog},
    ActivationReport, VERSION,
};
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "context-sensor")]
#[command(version = VERSION)]
#[command(about = "Device-resident context sensing agent", long_about = None)]
struct Cli {
    /// Keep all state in memory for this invocation only
    #[arg(long, global = true)]
    ephemeral: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the agent until interrupted
    Run,

    /// Run a single activation pass and exit
    Activate,

    /// Show agent status
    Status,

    /// Print a setting
    Get {
        key: String,
        /// Module scope (ignored for global-only keys)
        #[arg(long)]
        scope: Option<String>,
    },

    /// Change a setting
    Set {
        key: String,
        value: String,
        /// Module scope (ignored for global-only keys)
        #[arg(long)]
        scope: Option<String>,
    },

    /// List built-in modules and installed plugins
    Modules,

    /// List stored schedules
    Schedules,

    /// Register an installed plugin package
    Install {
        package: String,
        /// The package replaces an earlier version
        #[arg(long)]
        replacing: bool,
    },

    /// Unregister a plugin package and delete its settings and schedules
    Uninstall {
        package: String,
        /// The package is being replaced, keep its state
        #[arg(long)]
        replacing: bool,
    },

    /// Reset settings, schedules and plugins to defaults
    Reset,

    /// Upload stored samples to the webservice now
    Sync {
        /// Only check that the server answers
        #[arg(long)]
        check: bool,
    },

    /// Show configuration
    Config {
        /// Write the effective configuration to the config file
        #[arg(long)]
        save: bool,
    },
}

fn main() {
    let cli = Cli::parse();

    let config = match Config::load() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Warning: Could not load configuration ({e}), using defaults");
            Config::default()
        }
    };

    if let Commands::Config { save } = cli.command {
        logging::init(false);
        if save {
            if let Err(e) = config.save() {
                eprintln!("Error saving config: {e}");
                std::process::exit(1);
            }
            println!("Configuration written to {:?}", Config::config_path());
            println!();
        }
        cmd_config(&config);
        return;
    }

    let agent = match build_agent(&config, cli.ephemeral) {
        Ok(agent) => agent,
        Err(e) => {
            eprintln!("Error: {e}");
            std::process::exit(1);
        }
    };
    logging::init(agent.context().settings.get_bool(keys::DEBUG_FLAG, None));

    match cli.command {
        Commands::Run => cmd_run(&agent),
        Commands::Activate => cmd_activate(&agent),
        Commands::Status => cmd_status(&agent, &config),
        Commands::Get { key, scope } => cmd_get(&agent, &key, scope.as_deref()),
        Commands::Set { key, value, scope } => cmd_set(&agent, &key, &value, scope.as_deref()),
        Commands::Modules => cmd_modules(&agent),
        Commands::Schedules => cmd_schedules(&agent),
        Commands::Install { package, replacing } => cmd_install(&agent, &package, replacing),
        Commands::Uninstall { package, replacing } => {
            cmd_uninstall(&agent, &package, replacing)
        }
        Commands::Reset => cmd_reset(&agent),
        Commands::Sync { check } => cmd_sync(&agent, check),
        Commands::Config { .. } => cmd_config(&config),
    }
}

/// Storage the agent can run on.
trait AgentStore:
    SettingsTable + ScheduleTable + ModuleTable + DataMaintenance + SampleReader + SensorSink
{
}

impl<S> AgentStore for S where
    S: SettingsTable + ScheduleTable + ModuleTable + DataMaintenance + SampleReader + SensorSink
{
}

fn build_agent(config: &Config, ephemeral: bool) -> Result<Orchestrator, String> {
    let tz = config.tz().map_err(|e| e.to_string())?;

    if ephemeral {
        return Ok(assemble(
            Arc::new(MemoryStore::new()),
            config,
            tz,
            create_shared_log(),
        ));
    }

    config.ensure_directories().map_err(|e| e.to_string())?;
    let store = SqliteStore::open(&config.database_path()).map_err(|e| {
        format!(
            "could not open database {}: {e}",
            config.database_path().display()
        )
    })?;
    let transparency = create_shared_log_with_persistence(config.transparency_path());
    Ok(assemble(Arc::new(store), config, tz, transparency))
}

fn assemble<S: AgentStore>(
    store: Arc<S>,
    config: &Config,
    tz: chrono_tz::Tz,
    transparency: Arc<TransparencyLog>,
) -> Orchestrator {
    let bus = NotificationBus::new();
    let settings = SettingsStore::new(store.clone(), bus.clone());
    // Producers need the device id, so defaults are seeded before anything starts.
    settings.seed_defaults();

    let setup = SensorSetup {
        device_id: settings.get(keys::DEVICE_ID, None),
        timezone: tz,
        timezone_period: settings
            .get_u64(keys::FREQUENCY_TIMEZONE, None)
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_TIMEZONE_PERIOD),
        location: config.location.clone(),
        options: ProducerOptions {
            buffer: BufferConfig {
                capacity: config.buffer_capacity,
                write_enabled: true,
                mode: FlushMode::Background,
            },
            bus: Some(bus.clone()),
            transparency: Some(transparency.clone()),
            poll_timeout: None,
            settings: Some(settings.clone()),
        },
    };
    let runtime = Arc::new(builtin_runtime(store.clone(), setup));
    let launcher = ProcessLauncher::new(config.plugin_dir.clone()).with_bundled(runtime.clone());

    let scheduler = Arc::new(Scheduler::new(store.clone(), tz));
    let lifecycle = Arc::new(
        LifecycleManager::new(
            settings.clone(),
            store.clone(),
            scheduler.clone(),
            runtime,
            Arc::new(launcher),
        )
        .with_plugin_prefix(config.plugin_prefix.clone())
        .with_transparency(transparency.clone()),
    );

    let ctx = AgentContext {
        settings: settings.clone(),
        scheduler,
        lifecycle,
        bus,
        transparency,
        maintenance: store.clone(),
        samples: store.clone(),
    };
    let orchestrator = Orchestrator::new(ctx, config.watchdog_interval);
    with_gateway(orchestrator, settings, store)
}

#[cfg(feature = "gateway")]
fn with_gateway<S: AgentStore>(
    orchestrator: Orchestrator,
    settings: SettingsStore,
    store: Arc<S>,
) -> Orchestrator {
    use context_sensor_agent::GatewaySync;

    orchestrator.with_sync(Arc::new(GatewaySync::new(settings, store)))
}

#[cfg(not(feature = "gateway"))]
fn with_gateway<S: AgentStore>(
    orchestrator: Orchestrator,
    _settings: SettingsStore,
    _store: Arc<S>,
) -> Orchestrator {
    orchestrator
}

fn cmd_run(agent: &Orchestrator) {
    let settings = &agent.context().settings;
    println!("Context Sensor Agent v{VERSION}");
    println!();
    println!("  Device ID: {}", settings.get(keys::DEVICE_ID, None));
    println!("  Device label: {}", settings.get(keys::DEVICE_LABEL, None));
    println!("  Watchdog: {}s", agent.watchdog_interval().as_secs());
    #[cfg(not(feature = "gateway"))]
    if settings.get_bool(keys::STATUS_WEBSERVICE, None) {
        eprintln!("Warning: webservice sync is on but the gateway feature is not enabled");
    }
    println!();
    println!("Press Ctrl+C to stop");
    println!();

    let (shutdown_tx, shutdown_rx) = crossbeam_channel::bounded(1);
    if let Err(e) = ctrlc::set_handler(move || {
        let _ = shutdown_tx.try_send(());
    }) {
        eprintln!("Error setting Ctrl+C handler: {e}");
        std::process::exit(1);
    }

    agent.run(&shutdown_rx);

    println!();
    println!("{}", agent.context().transparency.summary());
}

fn cmd_activate(agent: &Orchestrator) {
    let report = agent.activate(Utc::now());
    print_activation(&report);
    agent.deactivate();
}

fn print_activation(report: &ActivationReport) {
    println!("Activation");
    println!("==========");
    println!("  Modules started: {:?}", report.modules.started);
    println!("  Modules stopped: {:?}", report.modules.stopped);
    for module in &report.modules.disabled {
        println!("  Disabled (hardware absent): {module}");
    }
    for (module, error) in &report.modules.failed {
        println!("  Failed: {module}: {error}");
    }
    for (package, outcome) in &report.plugins {
        println!("  Plugin {package}: {outcome:?}");
    }
    println!("  Sync schedule: {:?}", report.sync_schedule);
    println!("  Maintenance schedule: {:?}", report.maintenance_schedule);
    println!("  Schedules fired: {:?}", report.evaluation.fired);
    for (id, reason) in &report.evaluation.failed {
        println!("  Schedule failed: {id}: {reason}");
    }
    println!("  Next activation: {}", report.next_activation);
}

fn cmd_status(agent: &Orchestrator, config: &Config) {
    let ctx = agent.context();
    let settings = &ctx.settings;

    println!("Context Sensor Agent Status");
    println!("===========================");
    println!();
    println!("Device ID: {}", settings.get(keys::DEVICE_ID, None));
    println!("Device label: {}", settings.get(keys::DEVICE_LABEL, None));
    let study = settings.get(keys::STUDY_ID, None);
    if !study.is_empty() {
        println!("Study: {study}");
    }
    println!();

    println!("Data sync:");
    println!(
        "  Webservice: {}",
        if settings.get_bool(keys::STATUS_WEBSERVICE, None) {
            "enabled"
        } else {
            "disabled"
        }
    );
    println!("  Server: {}", settings.get(keys::WEBSERVICE_SERVER, None));
    println!(
        "  Frequency: {} min",
        settings.get(keys::FREQUENCY_WEBSERVICE, None)
    );
    println!();

    let enabled: Vec<&str> = ctx
        .lifecycle
        .catalog()
        .modules()
        .iter()
        .filter(|m| ctx.lifecycle.catalog().is_desired(m.id, settings))
        .map(|m| m.id)
        .collect();
    println!("Enabled modules: {}", enabled.len());
    for id in enabled {
        println!("  {id}");
    }
    let plugins = ctx.lifecycle.active_plugins();
    println!("Active plugins: {}", plugins.len());
    for record in plugins {
        println!("  {} ({})", record.package_name, record.display_name);
    }
    println!("Schedules: {}", ctx.scheduler.list().len());
    println!();

    let stats_path = config.transparency_path();
    if stats_path.exists() {
        let log = TransparencyLog::with_persistence(stats_path);
        println!("{}", log.summary());
    } else {
        println!("No previous session data found.");
    }
}

fn cmd_get(agent: &Orchestrator, key: &str, scope: Option<&str>) {
    println!("{}", agent.context().settings.get(key, scope));
}

fn cmd_set(agent: &Orchestrator, key: &str, value: &str, scope: Option<&str>) {
    let settings = &agent.context().settings;
    if settings.set(key, value, scope) {
        println!("{key} = {value}");
    } else if settings.get(key, scope) == value {
        println!("{key} unchanged");
    } else {
        eprintln!("Error: {key} could not be changed");
        std::process::exit(1);
    }
}

fn cmd_modules(agent: &Orchestrator) {
    let ctx = agent.context();
    let catalog = ctx.lifecycle.catalog();

    println!("Built-in modules");
    println!("================");
    for module in catalog.modules() {
        let state = if catalog.is_desired(module.id, &ctx.settings) {
            "on"
        } else {
            "off"
        };
        println!("  {:<22} {:<4} {}", module.id, state, module.flags.join(", "));
    }
    println!();

    println!("Plugins");
    println!("=======");
    let records = ctx.lifecycle.records();
    if records.is_empty() {
        println!("  (none)");
    }
    for record in records {
        let status = match record.status {
            ModuleStatus::On => "on",
            ModuleStatus::Off => "off",
            ModuleStatus::PendingUpdate => "pending update",
        };
        println!(
            "  {} v{} [{}] {:?}",
            record.package_name, record.version, status, record.kind
        );
    }
}

fn cmd_schedules(agent: &Orchestrator) {
    let schedules = agent.context().scheduler.list();
    if schedules.is_empty() {
        println!("No schedules.");
        return;
    }
    for entry in schedules {
        let last = entry
            .last_triggered
            .map(|t| t.to_rfc3339())
            .unwrap_or_else(|| "never".to_string());
        println!("{} (owner: {})", entry.id, entry.owner);
        println!("  when: {}", entry.trigger.describe());
        println!("  does: {}", entry.action.describe());
        println!("  last fired: {last}");
    }
}

fn cmd_install(agent: &Orchestrator, package: &str, replacing: bool) {
    let outcome = agent
        .context()
        .lifecycle
        .on_package_added(package, replacing);
    println!("{package}: {outcome:?}");
}

fn cmd_uninstall(agent: &Orchestrator, package: &str, replacing: bool) {
    let outcome = agent
        .context()
        .lifecycle
        .on_package_removed(package, replacing);
    println!("{package}: {outcome:?}");
}

fn cmd_reset(agent: &Orchestrator) {
    agent.reset();
    println!("Agent reset to defaults.");
    println!(
        "Device ID kept: {}",
        agent.context().settings.get(keys::DEVICE_ID, None)
    );
}

#[cfg(feature = "gateway")]
fn cmd_sync(agent: &Orchestrator, check: bool) {
    use context_sensor_agent::{BlockingGatewayClient, GatewayConfig, GatewaySync, SyncService};

    let ctx = agent.context();
    if check {
        let result = GatewayConfig::from_settings(&ctx.settings)
            .and_then(BlockingGatewayClient::new)
            .and_then(|client| {
                let url = client.config().url().to_string();
                client.test_connection().map(|ok| (url, ok))
            });
        match result {
            Ok((url, true)) => println!("{url} is reachable"),
            Ok((url, false)) => {
                eprintln!("{url} answered with an error status");
                std::process::exit(1);
            }
            Err(e) => {
                eprintln!("Error: {e}");
                std::process::exit(1);
            }
        }
        return;
    }

    let sync = GatewaySync::new(ctx.settings.clone(), ctx.samples.clone());
    match sync.sync() {
        Ok(done) => {
            println!("Synced {} producer(s)", done.len());
            for synced in done {
                println!("  {} through #{}", synced.producer, synced.through_seq);
            }
        }
        Err(e) => {
            eprintln!("Error: {e}");
            std::process::exit(1);
        }
    }
}

#[cfg(not(feature = "gateway"))]
fn cmd_sync(_agent: &Orchestrator, _check: bool) {
    eprintln!("Error: built without the gateway feature");
    std::process::exit(1);
}

fn cmd_config(config: &Config) {
    println!("Configuration");
    println!("=============");
    println!();
    println!("Config file: {:?}", Config::config_path());
    println!();
    println!(
        "{}",
        serde_json::to_string_pretty(config).unwrap_or_else(|_| "Error".to_string())
    );
}
