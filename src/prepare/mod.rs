//! Startup sequence with type-state enforcement.
//!
//! A [`Startup`] is created from a loaded configuration and can only launch
//! the workload after it went through [`Startup::prepare`] (or was
//! explicitly marked prepared with [`Startup::skip_prepare`]):
//!
//! ```compile_fail
//! use enclave_init::config::types::ShimConfig;
//! use enclave_init::prepare::Startup;
//!
//! let startup = Startup::new(ShimConfig::default());
//! // `launch` only exists on `Startup<Prepared>`
//! startup.launch(vec!["true".to_string()]);
//! ```
//!
//! ```no_run
//! use enclave_init::config::types::ShimConfig;
//! use enclave_init::prepare::Startup;
//!
//! let report = Startup::new(ShimConfig::default())
//!     .prepare()?
//!     .launch(vec!["spark-submit".to_string(), "--version".to_string()])?;
//! println!("workload exited with {}", report.exit_code);
//! # Ok::<(), enclave_init::config::types::StartupError>(())
//! ```

pub mod enclave;
pub mod environment;
pub mod hooks;
pub mod identity;
pub mod layout;

use crate::config::types::{PrepareStep, Result, ShimConfig, StartupError};
use crate::core::supervisor::supervise;
use crate::core::types::{PreparedEnvironment, SupervisorReport};
use crate::observability::events;
use crate::utils::env_hygiene::{apply_umask, split_inherited};
use std::collections::BTreeMap;
use std::marker::PhantomData;

/// Configuration loaded, nothing on disk touched yet
pub struct Loaded;

/// Preparation finished, workload may be launched
pub struct Prepared;

pub struct Startup<S> {
    run_id: String,
    config: ShimConfig,
    environment: PreparedEnvironment,
    _state: PhantomData<S>,
}

impl<S> Startup<S> {
    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn config(&self) -> &ShimConfig {
        &self.config
    }
}

/// Strip the variant prefix so the step name carries the context
fn failure_reason(err: StartupError) -> String {
    match err {
        StartupError::Config(msg) | StartupError::Process(msg) => msg,
        other => other.to_string(),
    }
}

fn run_step(
    run_id: &str,
    steps: &mut Vec<PrepareStep>,
    step: PrepareStep,
    action: impl FnOnce() -> Result<String>,
) -> Result<()> {
    log::debug!("Preparation step: {}", step);
    match action() {
        Ok(details) => {
            events::prepare_step(run_id, &step.to_string(), &details);
            steps.push(step);
            Ok(())
        }
        Err(e) => {
            let err = match e {
                hook @ StartupError::Hook { .. } => hook,
                other => StartupError::prepare(step, failure_reason(other)),
            };
            events::prepare_failed(run_id, &err.to_string());
            Err(err)
        }
    }
}

impl Startup<Loaded> {
    /// Start from the environment inherited by this process
    pub fn new(config: ShimConfig) -> Self {
        let (base, opaque) = split_inherited(std::env::vars_os());
        let mut startup = Self::with_base_environment(config, base);
        startup.environment.opaque_env = opaque;
        startup
    }

    pub fn with_base_environment(config: ShimConfig, base: BTreeMap<String, String>) -> Self {
        let run_id = config.resolved_instance_id();
        let environment = PreparedEnvironment {
            env: base,
            workdir: config.supervisor.workdir.clone(),
            run_as: config.supervisor.run_as,
            ..Default::default()
        };
        Self {
            run_id,
            config,
            environment,
            _state: PhantomData,
        }
    }

    /// Run every preparation step in order, stopping at the first failure
    pub fn prepare(self) -> Result<Startup<Prepared>> {
        let Self {
            run_id,
            config,
            environment: initial,
            ..
        } = self;
        let PreparedEnvironment {
            env: base,
            opaque_env: mut opaque,
            workdir,
            run_as,
            mut steps,
        } = initial;

        if let Some(mask) = config.environment.umask {
            run_step(&run_id, &mut steps, PrepareStep::Umask, || {
                apply_umask(mask)?;
                Ok(format!("umask {:04o}", mask))
            })?;
        }

        run_step(&run_id, &mut steps, PrepareStep::Layout, || {
            layout::verify_required_paths(&config.layout.required_paths)?;
            let created = layout::create_directories(&config.layout.directories)?;
            Ok(format!(
                "{} required paths present, {} directories created",
                config.layout.required_paths.len(),
                created.len()
            ))
        })?;

        run_step(&run_id, &mut steps, PrepareStep::Runtime, || {
            if config.framework.require_layout {
                layout::verify_framework(&config.framework)?;
            }
            if config.java.require {
                layout::verify_java(&config.java)?;
            }
            Ok(format!(
                "{}={} {}={}",
                config.framework.home_env,
                config.framework.home.display(),
                config.java.home_env,
                config.java.home.display()
            ))
        })?;

        run_step(&run_id, &mut steps, PrepareStep::Identity, || {
            let uid = nix::unistd::getuid().as_raw();
            let gid = nix::unistd::getgid().as_raw();
            let outcome =
                identity::ensure_passwd_entry(&config.identity, uid, gid, &config.framework.home)?;
            Ok(format!("uid {}: {:?}", uid, outcome))
        })?;

        let mut composed = PreparedEnvironment {
            workdir,
            run_as,
            ..Default::default()
        };
        run_step(&run_id, &mut steps, PrepareStep::Environment, || {
            composed.env = environment::compose(&config, base, &mut opaque)?;
            Ok(format!("{} variables", composed.env.len() + opaque.len()))
        })?;
        composed.opaque_env = opaque;

        run_step(&run_id, &mut steps, PrepareStep::Enclave, || {
            let outcome = enclave::prepare_instance(&config.enclave)?;
            Ok(format!("{:?}", outcome))
        })?;

        if !config.hooks.is_empty() {
            run_step(&run_id, &mut steps, PrepareStep::Hooks, || {
                let outcomes = hooks::run_hooks(&config.hooks, &composed)?;
                Ok(format!("{} hooks completed", outcomes.len()))
            })?;
        }

        log::info!("Preparation complete ({} steps)", steps.len());
        composed.steps = steps;
        Ok(Startup {
            run_id,
            config,
            environment: composed,
            _state: PhantomData,
        })
    }

    /// Mark as prepared without touching anything; the inherited environment
    /// is passed to the workload unchanged
    pub fn skip_prepare(self) -> Startup<Prepared> {
        log::info!("Skipping preparation");
        Startup {
            run_id: self.run_id,
            config: self.config,
            environment: self.environment,
            _state: PhantomData,
        }
    }
}

impl Startup<Prepared> {
    pub fn environment(&self) -> &PreparedEnvironment {
        &self.environment
    }

    /// Supervise `command` (or the configured default) until it exits
    pub fn launch(self, command: Vec<String>) -> Result<SupervisorReport> {
        let command = if command.is_empty() {
            self.config.supervisor.default_command.clone()
        } else {
            command
        };
        if command.is_empty() {
            return Err(StartupError::Config(
                "no workload command given and no default_command configured".to_string(),
            ));
        }

        supervise(
            &self.run_id,
            &self.config.supervisor,
            &self.environment,
            &command,
        )
    }
}
