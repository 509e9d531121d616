//! Nebula CLI entrypoint.
//!
//! This is the main entrypoint for the nebula command-line tool.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use nebula_reconcile::cli::{Cli, Commands, OutputFormat, OutputFormatter, StateCommands};
use nebula_reconcile::config::{find_config_file, ConfigParser, ConfigValidator, DeployConfig};
use nebula_reconcile::drivers::{DriverContext, Drivers, ResourceKind};
use nebula_reconcile::error::{ReconcileError, Result};
use nebula_reconcile::one::OneClient;
use nebula_reconcile::reconciler::Reconciler;
use nebula_reconcile::state::{LocalStateStore, StateStore};

use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

/// Main entrypoint.
fn main() -> ExitCode {
    let cli = Cli::parse_args();

    init_logging(cli.verbose, matches!(cli.output, OutputFormat::Json));

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("Failed to create async runtime: {e}");
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(run(cli)) {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            eprintln!("Error: {e}");
            ExitCode::FAILURE
        }
    }
}

/// Initializes the logging system. JSON output also gets JSON log lines.
fn init_logging(verbose: bool, json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if verbose {
            EnvFilter::new("debug")
        } else {
            EnvFilter::new("info")
        }
    });

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);

    if json {
        subscriber.json().init();
    } else {
        subscriber.init();
    }
}

/// Main async entry point. Returns false when the command ran but did not
/// converge.
async fn run(cli: Cli) -> Result<bool> {
    let formatter = OutputFormatter::new(cli.output);
    let config_path = cli.config.as_ref();

    match cli.command {
        Commands::Validate { warnings } => cmd_validate(config_path, warnings, &formatter),
        Commands::Plan { detailed } => cmd_plan(config_path, detailed, &formatter).await,
        Commands::Apply { yes } => cmd_apply(config_path, yes, &formatter).await,
        Commands::Read { kind, reference } => {
            cmd_read(config_path, kind, &reference, &formatter).await
        }
        Commands::Destroy { yes } => cmd_destroy(config_path, yes, &formatter).await,
        Commands::State { command } => cmd_state(config_path, command, &formatter).await,
    }
}

/// Validate configuration.
fn cmd_validate(
    config_path: Option<&PathBuf>,
    show_warnings: bool,
    formatter: &OutputFormatter,
) -> Result<bool> {
    let config_file = resolve_config_path(config_path)?;
    info!("Validating configuration: {}", config_file.display());

    let parser = ConfigParser::new().with_base_path(base_dir(&config_file));
    parser.load_dotenv()?;
    let config = parser.load_with_env(&config_file)?;

    let result = ConfigValidator::new().check(&config);
    emit(&formatter.format_validation(&result, show_warnings));

    if result.is_valid() && !formatter.is_json() {
        eprintln!("\nConfiguration summary:");
        eprintln!("  Security groups: {}", config.security_groups.len());
        eprintln!("  Virtual networks: {}", config.vnets.len());
        eprintln!("  Images: {}", config.images.len());
        eprintln!("  Virtual machines: {}", config.vms.len());
        eprintln!("  Account lookups: {}", config.users.len() + config.groups.len());
    }

    Ok(result.is_valid())
}

/// Show what apply would change.
async fn cmd_plan(
    config_path: Option<&PathBuf>,
    detailed: bool,
    formatter: &OutputFormatter,
) -> Result<bool> {
    let (config, state_store) = load_config_and_state(config_path)?;
    let client = connect(&config)?;
    let reconciler = Reconciler::new(&config, &state_store, drivers(&client, &config));

    let lookups = reconciler.lookups().await?;
    debug!("Resolved {} account lookups", lookups.len());

    let plan = reconciler.plan().await?;
    emit(&formatter.format_plan(&plan, detailed));

    Ok(true)
}

/// Converge remote resources on the configuration.
async fn cmd_apply(
    config_path: Option<&PathBuf>,
    auto_approve: bool,
    formatter: &OutputFormatter,
) -> Result<bool> {
    let (config, state_store) = load_config_and_state(config_path)?;
    let client = connect(&config)?;
    let reconciler = Reconciler::new(&config, &state_store, drivers(&client, &config));

    reconciler.lookups().await?;

    let plan = reconciler.plan().await?;
    if !plan.has_changes() {
        eprintln!("No changes to apply.");
        return Ok(true);
    }

    if !formatter.is_json() {
        emit(&formatter.format_plan(&plan, false));
    }

    if !auto_approve && !confirm("Do you want to apply this plan? [y/N]: ")? {
        eprintln!("Apply cancelled.");
        return Ok(true);
    }

    let result = reconciler.apply().await?;
    emit(&formatter.format_reconciliation(&result));

    Ok(result.success)
}

/// Read one remote object.
async fn cmd_read(
    config_path: Option<&PathBuf>,
    kind: ResourceKind,
    reference: &str,
    formatter: &OutputFormatter,
) -> Result<bool> {
    let (config, _) = load_config_and_state(config_path)?;
    let client = connect(&config)?;

    let summary = drivers(&client, &config)
        .read_reference(kind, reference)
        .await?
        .ok_or_else(|| ReconcileError::NotFound {
            kind,
            reference: reference.to_string(),
        })?;

    emit(&formatter.format_resources(std::slice::from_ref(&summary)));
    Ok(true)
}

/// Delete every managed resource.
async fn cmd_destroy(
    config_path: Option<&PathBuf>,
    auto_approve: bool,
    formatter: &OutputFormatter,
) -> Result<bool> {
    let (config, state_store) = load_config_and_state(config_path)?;

    let Some(state) = state_store.load().await? else {
        eprintln!("No state found - nothing to destroy.");
        return Ok(true);
    };
    if state.resources.is_empty() {
        eprintln!("No managed resources to destroy.");
        return Ok(true);
    }

    if !formatter.is_json() {
        eprintln!("The following resources will be destroyed:");
        for (key, record) in &state.resources {
            eprintln!("  - {key} (id {})", record.id);
        }
    }

    if !auto_approve
        && !confirm("\nAre you sure you want to destroy all managed resources? [y/N]: ")?
    {
        eprintln!("Destroy cancelled.");
        return Ok(true);
    }

    let client = connect(&config)?;
    let reconciler = Reconciler::new(&config, &state_store, drivers(&client, &config));
    let result = reconciler.destroy().await?;
    emit(&formatter.format_reconciliation(&result));

    Ok(result.success)
}

/// Manage the applied state.
async fn cmd_state(
    config_path: Option<&PathBuf>,
    command: StateCommands,
    formatter: &OutputFormatter,
) -> Result<bool> {
    let (_, state_store) = load_config_and_state(config_path)?;

    match command {
        StateCommands::Show => {
            if let Some(state) = state_store.load().await? {
                emit(&formatter.format_state(&state));
            } else {
                eprintln!("No state found at {}", state_store.state_path().display());
            }
        }
        StateCommands::Unlock { lock_id, force } => {
            let Some(info) = state_store.get_lock_info().await? else {
                eprintln!("State is not locked.");
                return Ok(true);
            };

            let target = match lock_id {
                Some(id) => id,
                None if force => {
                    warn!(
                        "Force-unlocking state held by {} since {}",
                        info.holder, info.acquired_at
                    );
                    info.lock_id.clone()
                }
                None => {
                    eprintln!(
                        "State is locked by {} (lock {}). Pass --lock-id or --force.",
                        info.holder, info.lock_id
                    );
                    return Ok(false);
                }
            };

            state_store.release_lock(&target).await?;
            if state_store.is_locked().await? {
                eprintln!("Lock {target} does not match the current lock; nothing released.");
                return Ok(false);
            }
            eprintln!("State unlocked.");
        }
    }

    Ok(true)
}

/// Writes formatted output.
fn emit(output: &str) {
    eprintln!("{output}");
}

/// Asks for confirmation on stderr.
fn confirm(prompt: &str) -> Result<bool> {
    eprint!("{prompt}");
    std::io::stderr().flush()?;

    let mut input = String::new();
    std::io::stdin().read_line(&mut input)?;

    Ok(input.trim().eq_ignore_ascii_case("y"))
}

/// Resolves the configuration file path.
fn resolve_config_path(config_path: Option<&PathBuf>) -> Result<PathBuf> {
    config_path.map_or_else(|| find_config_file("."), |path| Ok(path.clone()))
}

/// Returns the directory holding the configuration file.
fn base_dir(config_file: &Path) -> PathBuf {
    config_file
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .map_or_else(|| PathBuf::from("."), Path::to_path_buf)
}

/// Loads and validates configuration, and opens the state store next to it.
fn load_config_and_state(config_path: Option<&PathBuf>) -> Result<(DeployConfig, LocalStateStore)> {
    let config_file = resolve_config_path(config_path)?;
    debug!("Loading configuration from: {}", config_file.display());

    let base = base_dir(&config_file);
    let parser = ConfigParser::new().with_base_path(&base);
    parser.load_dotenv()?;

    let config = parser.load_with_env(&config_file)?;
    ConfigValidator::new().validate(&config)?;

    let state_store = config.state.path.as_deref().map_or_else(
        || LocalStateStore::with_base_dir(base.join(".nebula")),
        LocalStateStore::with_base_dir,
    );

    Ok((config, state_store))
}

/// Opens a client for the configured endpoint.
fn connect(config: &DeployConfig) -> Result<OneClient> {
    ConfigParser::require_provider(config)?;
    let provider = &config.provider;
    info!("Connecting to {} as {}", provider.endpoint, provider.username);
    OneClient::new(&provider.endpoint, &provider.username, &provider.password)
}

/// Builds the driver dispatcher over a client.
fn drivers<'a>(client: &'a OneClient, config: &DeployConfig) -> Drivers<'a> {
    Drivers::new(DriverContext::new(client, config.wait.poll_config()))
}
