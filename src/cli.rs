use crate::config::loader;
use crate::config::types::{ShimConfig, StartupError};
use crate::config::validator::validate_config;
use crate::observability::events;
use crate::prepare::Startup;
use anyhow::Result;
use clap::{Parser, Subcommand};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum CliMode {
    Compat,
    Entrypoint,
    Prepare,
}

impl CliMode {
    fn primary_binary(self) -> &'static str {
        match self {
            Self::Compat => "enclave-init",
            Self::Entrypoint => "entrypoint",
            Self::Prepare => "prepare",
        }
    }

    fn mode_name(self) -> &'static str {
        match self {
            Self::Compat => "compat",
            Self::Entrypoint => "entrypoint",
            Self::Prepare => "prepare",
        }
    }

    fn allows(self, command: &Commands) -> bool {
        match self {
            Self::Compat => true,
            Self::Entrypoint => matches!(command, Commands::Run { .. } | Commands::Check { .. }),
            Self::Prepare => matches!(command, Commands::Prepare { .. } | Commands::Check { .. }),
        }
    }
}

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Prepare the container and supervise the workload as PID 1
    Run {
        /// JSON configuration file (defaults to $ENCLAVE_INIT_CONFIG)
        #[arg(long)]
        config: Option<PathBuf>,
        /// Register as child subreaper
        #[arg(long)]
        subreaper: bool,
        /// Forward signals to the workload's process group
        #[arg(long)]
        group: bool,
        /// Keep reaping until every descendant has exited
        #[arg(long)]
        drain: bool,
        /// Write the supervisor report as JSON to this file
        #[arg(long)]
        report: Option<PathBuf>,
        /// Start the workload without running the preparation steps
        #[arg(long)]
        skip_prepare: bool,
        /// Workload command and arguments
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        command: Vec<String>,
    },
    /// Run the preparation steps only
    Prepare {
        /// JSON configuration file (defaults to $ENCLAVE_INIT_CONFIG)
        #[arg(long)]
        config: Option<PathBuf>,
        /// Print the composed environment as shell export lines
        #[arg(long)]
        print_env: bool,
    },
    /// Load and validate the configuration without changing anything
    Check {
        /// JSON configuration file (defaults to $ENCLAVE_INIT_CONFIG)
        #[arg(long)]
        config: Option<PathBuf>,
    },
}

impl Commands {
    fn command_name(&self) -> &'static str {
        match self {
            Self::Run { .. } => "run",
            Self::Prepare { .. } => "prepare",
            Self::Check { .. } => "check",
        }
    }
}

fn validate_command_mode(mode: CliMode, command: &Commands) {
    if mode.allows(command) {
        return;
    }

    eprintln!(
        "Error: command '{}' is not available in '{}' mode",
        command.command_name(),
        mode.mode_name()
    );

    match mode {
        CliMode::Compat => {}
        CliMode::Entrypoint => {
            eprintln!(
                "Use '{}' for the standalone 'prepare' stage.",
                CliMode::Prepare.primary_binary()
            );
        }
        CliMode::Prepare => {
            eprintln!(
                "Use '{}' to supervise a workload with 'run'.",
                CliMode::Entrypoint.primary_binary()
            );
        }
    }

    std::process::exit(2);
}

/// Load, apply overrides, validate and install the events sink
fn load_config(path: Option<&Path>) -> Result<(ShimConfig, String)> {
    let source = loader::resolve_config_path(path)
        .map(|p| p.display().to_string())
        .unwrap_or_else(|| "built-in defaults".to_string());
    let config = loader::load(path)?;
    Ok((config, source))
}

fn finish_loading(config: &ShimConfig, source: &str) -> Result<String> {
    validate_config(config)?;
    if let Some(path) = &config.events_file {
        events::init_event_sink(path)?;
    }
    let run_id = config.resolved_instance_id();
    events::config_loaded(&run_id, source);
    Ok(run_id)
}

/// Single-quote `value` for POSIX shells
fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

fn export_lines(env: &BTreeMap<String, String>) -> Vec<String> {
    env.iter()
        .map(|(key, value)| format!("export {}={}", key, shell_quote(value)))
        .collect()
}

fn execute(command: Commands) -> Result<i32> {
    match command {
        Commands::Run {
            config,
            subreaper,
            group,
            drain,
            report,
            skip_prepare,
            command,
        } => {
            let (mut config, source) = load_config(config.as_deref())?;
            // Flags only ever switch behavior on
            config.supervisor.subreaper |= subreaper;
            config.supervisor.forward_to_group |= group;
            config.supervisor.drain_descendants |= drain;
            if report.is_some() {
                config.supervisor.report_file = report;
            }
            let run_id = finish_loading(&config, &source)?;
            config.instance_id = Some(run_id);

            let startup = Startup::new(config);
            let prepared = if skip_prepare {
                startup.skip_prepare()
            } else {
                startup.prepare()?
            };

            let report = prepared.launch(command)?;
            if let Some(failure) = &report.spawn_failure {
                eprintln!("error: {}", failure);
            }
            log::info!(
                "Workload {} {}, exit code {}",
                report.child_pid,
                report.exit,
                report.exit_code
            );
            Ok(report.exit_code)
        }
        Commands::Prepare { config, print_env } => {
            let (mut config, source) = load_config(config.as_deref())?;
            let run_id = finish_loading(&config, &source)?;
            config.instance_id = Some(run_id);

            let prepared = Startup::new(config).prepare()?;
            if print_env {
                for line in export_lines(&prepared.environment().env) {
                    println!("{}", line);
                }
                // Inherited as is, so the calling shell already has them
                for name in prepared.environment().opaque_env.keys() {
                    log::warn!(
                        "Not exporting {}: value is not valid UTF-8",
                        name.to_string_lossy()
                    );
                }
            } else {
                eprintln!(
                    "Preparation complete: {} steps",
                    prepared.environment().steps.len()
                );
            }
            Ok(0)
        }
        Commands::Check { config } => {
            let (config, source) = load_config(config.as_deref())?;
            let result = validate_config(&config)?;
            println!("Configuration OK ({})", source);
            println!("  framework home: {}", config.framework.home.display());
            println!("  java home:      {}", config.java.home.display());
            match &config.enclave.instance_dir {
                Some(dir) => println!("  enclave:        {}", dir.display()),
                None => println!("  enclave:        disabled"),
            }
            println!("  hooks:          {}", config.hooks.len());
            println!(
                "  supervisor:     subreaper={} group={} drain={}",
                config.supervisor.subreaper,
                config.supervisor.forward_to_group,
                config.supervisor.drain_descendants
            );
            for warning in &result.warnings {
                println!("  warning: {}", warning);
            }
            Ok(0)
        }
    }
}

/// Exit code for an error that aborted startup
fn failure_exit_code(err: &anyhow::Error) -> i32 {
    err.downcast_ref::<StartupError>()
        .map(StartupError::exit_code)
        .unwrap_or(1)
}

pub fn run(mode: CliMode) -> Result<()> {
    env_logger::init();

    if !cfg!(target_os = "linux") {
        eprintln!("Error: enclave-init requires Linux (prctl, /proc, sigtimedwait)");
        std::process::exit(1);
    }

    let cli = Cli::parse();
    validate_command_mode(mode, &cli.command);

    let code = match execute(cli.command) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("error: {:#}", e);
            failure_exit_code(&e)
        }
    };
    std::process::exit(code);
}
