//! NightOps CLI - the `nightops` binary.
//!
//! `nightops daemon` runs the operations daemon in the foreground; the
//! remaining subcommands are the thin remote-control client used by
//! operators and cron jobs. Client commands exit with 0 on success, 1 on a
//! local error, and otherwise the daemon's CommandStatus code.

mod client;
mod error;
mod scripts;

use chrono::Utc;
use clap::{Parser, Subcommand, ValueEnum};
use client::DaemonClient;
use error::CliError;
use nightops::config::Config;
use nightops::daemon::OperationsDaemon;
use nightops::schedule::{current_night, validate_schedule};
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;

#[derive(Parser)]
#[command(name = "nightops")]
#[command(version = nightops::VERSION)]
#[command(about = "Observatory operations control", long_about = None)]
struct Cli {
    /// Site config file (falls back to $NIGHTOPS_CONFIG).
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Clone, ValueEnum)]
enum DomeCommand {
    /// Schedule an open window covering the rest of tonight.
    Open,
    /// Clear the open window so the dome closes.
    Close,
    /// Switch the dome to automatic control.
    Auto,
    /// Switch the dome to manual control.
    Manual,
}

#[derive(Debug, Clone, ValueEnum)]
enum TelCommand {
    /// Switch the telescope to automatic control.
    Auto,
    /// Switch the telescope to manual control.
    Manual,
    /// Abort the running action and drain the queue.
    Stop,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the operations daemon in the foreground.
    Daemon,

    /// Print a human-readable status summary.
    Status,

    /// Print the raw status payload as JSON.
    Json,

    /// Control the dome.
    Dome {
        #[arg(value_enum)]
        action: DomeCommand,
    },

    /// Control the telescope.
    Tel {
        #[arg(value_enum)]
        action: TelCommand,
    },

    /// Validate a schedule file without submitting it.
    Validate { file: PathBuf },

    /// Submit a schedule file for tonight.
    Schedule {
        /// Submit only the dome window.
        #[arg(long)]
        dome: bool,
        /// Submit only the telescope actions.
        #[arg(long)]
        tel: bool,
        file: PathBuf,
    },

    /// Run a named operator script.
    Script {
        name: String,
        args: Vec<String>,
    },
}

fn main() {
    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Daemon => run_daemon(cli.config),
        Commands::Status => run_status(cli.config),
        Commands::Json => run_json(cli.config),
        Commands::Dome { action } => run_dome(cli.config, action),
        Commands::Tel { action } => run_tel(cli.config, action),
        Commands::Validate { file } => run_validate(cli.config, file),
        Commands::Schedule { dome, tel, file } => run_schedule(cli.config, dome, tel, file),
        Commands::Script { name, args } => run_script(cli.config, name, args),
    };

    if let Err(e) = result {
        e.exit();
    }
}

fn load_config(path: Option<PathBuf>) -> Result<Config, CliError> {
    let path = path
        .or_else(|| std::env::var_os("NIGHTOPS_CONFIG").map(PathBuf::from))
        .ok_or_else(|| {
            CliError::Config("no config file given (use --config or $NIGHTOPS_CONFIG)".to_string())
        })?;
    Config::load(&path).map_err(|e| CliError::Config(e.to_string()))
}

fn connect(config: &Config) -> Result<DaemonClient, CliError> {
    DaemonClient::new(&config.daemon)
}

fn run_daemon(config_path: Option<PathBuf>) -> Result<(), CliError> {
    let config = load_config(config_path)?;
    let _logging = nightops::logging::init_logging(Path::new("logs"), &config.log_name)
        .map_err(|e| CliError::Local(format!("failed to initialize logging: {e}")))?;

    let runtime = tokio::runtime::Runtime::new()
        .map_err(|e| CliError::Local(format!("failed to start runtime: {e}")))?;
    runtime.block_on(async move {
        let daemon = OperationsDaemon::from_config(config)
            .map_err(|e| CliError::Config(e.to_string()))?;

        let shutdown = CancellationToken::new();
        let signal_shutdown = shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                signal_shutdown.cancel();
            }
        });

        daemon
            .run(shutdown)
            .await
            .map_err(|e| CliError::Local(format!("daemon failed: {e}")))
    })
}

fn run_status(config_path: Option<PathBuf>) -> Result<(), CliError> {
    let config = load_config(config_path)?;
    let payload = connect(&config)?.status()?;
    print_status(&payload);
    Ok(())
}

fn run_json(config_path: Option<PathBuf>) -> Result<(), CliError> {
    let config = load_config(config_path)?;
    let payload = connect(&config)?.status()?;
    println!(
        "{}",
        serde_json::to_string_pretty(&payload)
            .map_err(|e| CliError::Local(format!("failed to format status: {e}")))?
    );
    Ok(())
}

fn run_dome(config_path: Option<PathBuf>, action: DomeCommand) -> Result<(), CliError> {
    let config = load_config(config_path)?;
    let client = connect(&config)?;
    match action {
        DomeCommand::Open => {
            // An auto/auto window for tonight opens as soon (and as long)
            // as conditions allow.
            let schedule = json!({
                "night": current_night(Utc::now()).to_string(),
                "dome": {"open": "auto", "close": "auto"},
            });
            client.schedule_observations(&schedule)?.into_result()?;
            println!("dome window scheduled for the rest of tonight");
        }
        DomeCommand::Close => {
            client.clear_dome_window()?.into_result()?;
            println!("dome window cleared");
        }
        DomeCommand::Auto => {
            client.dome_control(true)?.into_result()?;
            println!("dome is under automatic control");
        }
        DomeCommand::Manual => {
            client.dome_control(false)?.into_result()?;
            println!("dome is under manual control");
        }
    }
    Ok(())
}

fn run_tel(config_path: Option<PathBuf>, action: TelCommand) -> Result<(), CliError> {
    let config = load_config(config_path)?;
    let client = connect(&config)?;
    match action {
        TelCommand::Auto => {
            client.tel_control(true)?.into_result()?;
            println!("telescope is under automatic control");
        }
        TelCommand::Manual => {
            client.tel_control(false)?.into_result()?;
            println!("telescope is under manual control");
        }
        TelCommand::Stop => {
            client.stop_telescope()?.into_result()?;
            println!("telescope stopped");
        }
    }
    Ok(())
}

fn read_schedule_file(file: &Path) -> Result<Value, CliError> {
    let raw = std::fs::read_to_string(file)
        .map_err(|e| CliError::Local(format!("failed to read {}: {e}", file.display())))?;
    serde_json::from_str(&raw)
        .map_err(|e| CliError::Local(format!("{} is not valid JSON: {e}", file.display())))
}

fn run_validate(config_path: Option<PathBuf>, file: PathBuf) -> Result<(), CliError> {
    let config = load_config(config_path)?;
    let schedule = read_schedule_file(&file)?;

    let (valid, messages) = validate_schedule(&schedule, &config, Utc::now(), false);
    for message in &messages {
        println!("{message}");
    }
    if valid {
        println!("schedule is valid");
        Ok(())
    } else {
        Err(CliError::Local("schedule is invalid".to_string()))
    }
}

fn run_schedule(
    config_path: Option<PathBuf>,
    dome_only: bool,
    tel_only: bool,
    file: PathBuf,
) -> Result<(), CliError> {
    let config = load_config(config_path)?;
    let mut schedule = read_schedule_file(&file)?;

    // --dome / --tel submit one half of the plan; default is both.
    if let Some(plan) = schedule.as_object_mut() {
        if dome_only && !tel_only {
            plan.remove("actions");
        } else if tel_only && !dome_only {
            plan.remove("dome");
        }
    }

    connect(&config)?
        .schedule_observations(&schedule)?
        .into_result()?;
    println!("schedule accepted");
    Ok(())
}

fn run_script(
    config_path: Option<PathBuf>,
    name: String,
    args: Vec<String>,
) -> Result<(), CliError> {
    let config = load_config(config_path)?;
    let Some(script) = scripts::lookup_script(&config.scripts_module, &name) else {
        let available = scripts::script_names(&config.scripts_module).join(", ");
        return Err(CliError::Local(format!(
            "unknown script '{name}' (available: {available})"
        )));
    };
    let client = connect(&config)?;
    script.run(&client, &args)
}

fn print_status(payload: &Value) {
    if let Some(environment) = payload.get("environment") {
        let safe = environment["safe"].as_bool().unwrap_or(false);
        println!(
            "Environment: {} (updated {})",
            if safe { "SAFE" } else { "UNSAFE" },
            environment["updated"].as_str().unwrap_or("never")
        );
        if let Some(conditions) = environment["conditions"].as_object() {
            for (label, sensors) in conditions {
                let entries: Vec<String> = sensors
                    .as_array()
                    .map(|sensors| {
                        sensors
                            .iter()
                            .map(|sensor| {
                                let mut entry = format!(
                                    "{}={}",
                                    sensor["label"].as_str().unwrap_or("?"),
                                    sensor["value"]
                                );
                                if sensor["unsafe"].as_bool().unwrap_or(false) {
                                    entry.push_str(" [UNSAFE]");
                                }
                                if sensor["stale"].as_bool().unwrap_or(false) {
                                    entry.push_str(" [STALE]");
                                }
                                entry
                            })
                            .collect()
                    })
                    .unwrap_or_default();
                println!("  {label}: {}", entries.join(", "));
            }
        }
    }

    if let Some(dome) = payload.get("dome") {
        println!(
            "Dome: {} ({})",
            dome["mode"].as_str().unwrap_or("?"),
            dome["status"].as_str().unwrap_or("?")
        );
        if let (Some(open), Some(close)) = (
            dome["requested_open_date"].as_str(),
            dome["requested_close_date"].as_str(),
        ) {
            println!("  window: {open} - {close}");
        }
    }

    if let Some(telescope) = payload.get("telescope") {
        println!("Telescope: {}", telescope["mode"].as_str().unwrap_or("?"));
        if let Some(schedule) = telescope["schedule"].as_array() {
            for (index, action) in schedule.iter().enumerate() {
                let tasks: Vec<String> = action["tasks"]
                    .as_array()
                    .map(|tasks| tasks.iter().map(render_task).collect())
                    .unwrap_or_default();
                println!(
                    "  {}. {} [{}] {}",
                    index + 1,
                    action["name"].as_str().unwrap_or("?"),
                    action["state"].as_str().unwrap_or("?"),
                    tasks.join("; ")
                );
            }
        }
    }
}

fn render_task(task: &Value) -> String {
    match task {
        Value::String(label) => label.clone(),
        Value::Array(group) => group
            .iter()
            .filter_map(Value::as_str)
            .collect::<Vec<_>>()
            .join(" / "),
        other => other.to_string(),
    }
}
