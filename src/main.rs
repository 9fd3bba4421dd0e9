//! strata CLI entrypoint.
//!
//! This is the main entrypoint for the strata command-line tool.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use strata_provision::cli::{Cli, Commands, OutputFormatter, StateCommands};
use strata_provision::error::{ApplyError, Result, StrataError};
use strata_provision::provider::{HttpProvider, ProviderApi};
use strata_provision::reconciler::Reconciler;
use strata_provision::state::{generate_holder_id, LocalStateStore, StateStore};
use strata_provision::template::{
    find_template_file, ParameterValues, TemplateParser, TemplateSet, TemplateValidator,
};

use clap::Parser;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

/// Main entrypoint.
fn main() -> ExitCode {
    let cli = Cli::parse();

    init_logging(cli.verbose);

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("Failed to create async runtime: {e}");
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(run(cli)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e}");
            ExitCode::FAILURE
        }
    }
}

/// Initializes the logging system.
fn init_logging(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

/// Main async entry point.
async fn run(cli: Cli) -> Result<()> {
    let formatter = OutputFormatter::new(cli.output);

    match cli.command {
        Commands::Init { ref path, force } => cmd_init(path, force),
        Commands::Validate { warnings } => cmd_validate(&cli, warnings, &formatter),
        Commands::Plan { detailed } => cmd_plan(&cli, detailed, &formatter).await,
        Commands::Apply {
            yes,
            concurrency,
            max_attempts,
        } => cmd_apply(&cli, yes, concurrency, max_attempts, &formatter).await,
        Commands::Destroy { yes } => cmd_destroy(&cli, yes, &formatter).await,
        Commands::Status => cmd_status(&cli, &formatter).await,
        Commands::Outputs => cmd_outputs(&cli, &formatter).await,
        Commands::State { ref command } => cmd_state(&cli, command, &formatter).await,
    }
}

/// Initialize a new project.
fn cmd_init(path: &PathBuf, force: bool) -> Result<()> {
    info!("Initializing new strata project in: {}", path.display());

    let template_path = path.join("strata.deploy.yaml");
    let env_path = path.join(".env.example");
    let gitignore_path = path.join(".gitignore");

    if !force && template_path.exists() {
        eprintln!("Template file already exists: {}", template_path.display());
        eprintln!("Use --force to overwrite.");
        return Ok(());
    }

    if !path.exists() {
        std::fs::create_dir_all(path)?;
    }

    let template = include_str!("../templates/strata.deploy.yaml");
    std::fs::write(&template_path, template)?;
    eprintln!("Created: {}", template_path.display());

    let env_template = include_str!("../templates/.env.example");
    std::fs::write(&env_path, env_template)?;
    eprintln!("Created: {}", env_path.display());

    let gitignore_content = ".env\n.strata/\n";
    if gitignore_path.exists() {
        let existing = std::fs::read_to_string(&gitignore_path)?;
        if !existing.contains(".strata/") {
            let mut file = std::fs::OpenOptions::new()
                .append(true)
                .open(&gitignore_path)?;
            file.write_all(gitignore_content.as_bytes())?;
            eprintln!("Updated: {}", gitignore_path.display());
        }
    } else {
        std::fs::write(&gitignore_path, gitignore_content)?;
        eprintln!("Created: {}", gitignore_path.display());
    }

    eprintln!("\nNext steps:");
    eprintln!("  1. Edit strata.deploy.yaml to declare your resources");
    eprintln!("  2. Copy .env.example to .env and set STRATA_API_TOKEN");
    eprintln!("  3. Run 'strata plan' to preview changes");

    Ok(())
}

/// Validate the template set.
fn cmd_validate(cli: &Cli, show_warnings: bool, formatter: &OutputFormatter) -> Result<()> {
    let (template, _path) = load_template(cli)?;
    let validator = TemplateValidator::new();
    let result = validator.validate(&template)?;

    eprint!("{}", formatter.format_validation(&result, show_warnings));
    Ok(())
}

/// Compute and display the plan.
async fn cmd_plan(cli: &Cli, detailed: bool, formatter: &OutputFormatter) -> Result<()> {
    let (template, template_path) = load_template(cli)?;
    let warnings = validate_template(&template)?;

    let provider = build_provider()?;
    let state_store = build_state_store(&template_path);

    let reconciler = Reconciler::new(&template, &state_store, provider).with_warnings(warnings);
    let (plan, _state) = reconciler.plan().await?;

    if detailed {
        eprintln!("{plan}");
    } else {
        eprint!("{}", formatter.format_plan(&plan));
    }

    Ok(())
}

/// Apply the template set until converged.
async fn cmd_apply(
    cli: &Cli,
    yes: bool,
    concurrency: Option<usize>,
    max_attempts: u32,
    formatter: &OutputFormatter,
) -> Result<()> {
    let (mut template, template_path) = load_template(cli)?;
    if let Some(concurrency) = concurrency {
        template.project.concurrency = concurrency;
    }
    let warnings = validate_template(&template)?;

    let provider = build_provider()?;
    let state_store = build_state_store(&template_path);

    let reconciler = Reconciler::new(&template, &state_store, provider)
        .with_warnings(warnings)
        .with_max_attempts(max_attempts);

    let (plan, _state) = reconciler.plan().await?;
    eprint!("{}", formatter.format_plan(&plan));

    if plan.is_converged() {
        return Ok(());
    }

    if !yes && !confirm("Apply these changes?")? {
        eprintln!("Cancelled.");
        return Ok(());
    }

    let lock = state_store
        .acquire_lock(&generate_holder_id(), "apply")
        .await?;
    let result = reconciler.converge().await;
    state_store.release_lock(&lock.lock_id).await?;
    let result = result?;

    eprint!("{}", formatter.format_convergence(&result));

    if result.success {
        Ok(())
    } else {
        Err(StrataError::Apply(ApplyError::Aborted {
            reason: format!("{} resource(s) failed to converge", result.failures.len()),
        }))
    }
}

/// Delete every resource recorded in state.
async fn cmd_destroy(cli: &Cli, yes: bool, formatter: &OutputFormatter) -> Result<()> {
    let (template, template_path) = load_template(cli)?;

    if !yes && !confirm("Destroy all recorded resources?")? {
        eprintln!("Cancelled.");
        return Ok(());
    }

    let provider = build_provider()?;
    let state_store = build_state_store(&template_path);

    let lock = state_store
        .acquire_lock(&generate_holder_id(), "destroy")
        .await?;
    let reconciler = Reconciler::new(&template, &state_store, provider);
    let result = reconciler.destroy().await;
    state_store.release_lock(&lock.lock_id).await?;
    let result = result?;

    eprint!("{}", formatter.format_convergence(&result));

    if result.success {
        Ok(())
    } else {
        Err(StrataError::Apply(ApplyError::Aborted {
            reason: format!("{} resource(s) failed to delete", result.failures.len()),
        }))
    }
}

/// Show recorded state.
async fn cmd_status(cli: &Cli, formatter: &OutputFormatter) -> Result<()> {
    let (_template, template_path) = load_template(cli)?;
    let state_store = build_state_store(&template_path);

    match state_store.load().await? {
        Some(state) => eprint!("{}", formatter.format_state(&state)),
        None => eprintln!("No state recorded. Run apply first."),
    }
    Ok(())
}

/// Print recorded output values.
async fn cmd_outputs(cli: &Cli, formatter: &OutputFormatter) -> Result<()> {
    let (_template, template_path) = load_template(cli)?;
    let state_store = build_state_store(&template_path);

    let outputs = state_store
        .load()
        .await?
        .map(|state| state.outputs)
        .unwrap_or_default();
    eprint!("{}", formatter.format_outputs(&outputs));
    Ok(())
}

/// State management commands.
async fn cmd_state(
    cli: &Cli,
    command: &StateCommands,
    formatter: &OutputFormatter,
) -> Result<()> {
    let (_template, template_path) = load_template(cli)?;
    let state_store = build_state_store(&template_path);

    match command {
        StateCommands::Show => {
            match state_store.load().await? {
                Some(state) => eprint!("{}", formatter.format_state(&state)),
                None => eprintln!("No state recorded."),
            }
            Ok(())
        }
        StateCommands::Unlock { lock_id, force } => {
            let Some(info) = state_store.get_lock_info().await? else {
                eprintln!("State is not locked.");
                return Ok(());
            };

            let id = lock_id.clone().unwrap_or_else(|| info.lock_id.clone());
            if !force && id != info.lock_id {
                eprintln!(
                    "Lock ID mismatch (held by {}, since {}). Use --force to override.",
                    info.holder,
                    info.acquired_at.to_rfc3339()
                );
                return Ok(());
            }

            state_store.release_lock(&info.lock_id).await?;
            eprintln!("Released lock {}.", info.lock_id);
            Ok(())
        }
    }
}

/// Loads, parameterizes, and returns the template set plus its path.
fn load_template(cli: &Cli) -> Result<(TemplateSet, PathBuf)> {
    let template_path = match &cli.config {
        Some(path) => path.clone(),
        None => {
            let cwd = std::env::current_dir()?;
            find_template_file(&cwd)?
        }
    };

    let base = template_path
        .parent()
        .map_or_else(|| PathBuf::from("."), Path::to_path_buf);
    let parser = TemplateParser::new().with_base_path(base);
    parser.load_dotenv()?;

    let mut template = parser.load(&template_path)?;

    let mut values = ParameterValues::new();
    values.merge_cli_args(&cli.param)?;
    if let Some(param_file) = &cli.param_file {
        values.merge_file(param_file)?;
    }
    values.merge_env();

    parser.resolve_parameters(&mut template, &values)?;
    debug!(
        "Loaded template '{}' with {} resources",
        template.project.name,
        template.resources.len()
    );

    Ok((template, template_path))
}

/// Validates the template and returns its warnings.
fn validate_template(template: &TemplateSet) -> Result<Vec<String>> {
    let validator = TemplateValidator::new();
    let result = validator.validate(template)?;
    for warning in &result.warnings {
        tracing::warn!("{warning}");
    }
    Ok(result.warnings)
}

/// Builds the provider client from the environment.
fn build_provider() -> Result<Arc<dyn ProviderApi>> {
    let token = TemplateParser::get_api_token()?;
    let provider = match TemplateParser::get_endpoint() {
        Some(endpoint) => HttpProvider::with_endpoint(&endpoint, &token)?,
        None => HttpProvider::new(&token)?,
    };
    Ok(Arc::new(provider))
}

/// Builds the state store rooted next to the template.
fn build_state_store(template_path: &Path) -> LocalStateStore {
    let base = template_path
        .parent()
        .map_or_else(|| PathBuf::from("."), Path::to_path_buf)
        .join(".strata");
    LocalStateStore::with_base_dir(base)
}

/// Prompts for confirmation on stderr.
fn confirm(question: &str) -> Result<bool> {
    eprint!("\n{question} Type 'yes' to continue: ");
    std::io::stderr().flush()?;

    let mut input = String::new();
    std::io::stdin().read_line(&mut input)?;
    Ok(input.trim() == "yes")
}
