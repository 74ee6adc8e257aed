//! CLI subcommands: init, validate, plan, apply, destroy, status, output.

use crate::core::environment::{self, Environment};
use crate::core::error::{ConfigError, Error, Result};
use crate::core::executor::{self, ApplyConfig, DestroyConfig};
use crate::core::resolver;
use crate::core::retry::Backoff;
use crate::core::state::{self, StateStore};
use crate::core::types::{ExecutionPlan, PlanAction, ResourceSpec, StateLock};
use crate::core::variables::{self, Context, CATALOG};
use crate::provider::CliProvider;
use crate::resources::stack;
use crate::secrets::ModalSecretStore;
use clap::{Args, Subcommand};
use indexmap::IndexMap;
use std::path::{Path, PathBuf};

/// Which environment to act on and where its files live.
#[derive(Args, Debug, Clone)]
pub struct TargetArgs {
    /// Environment name
    #[arg(short, long = "env", default_value = "dev", env = "STRATUM_ENV")]
    pub environment: String,

    /// Directory of environment files
    #[arg(long, default_value = "environments")]
    pub env_dir: PathBuf,

    /// Explicit environment file (must exist)
    #[arg(long)]
    pub env_file: Option<PathBuf>,

    /// Local state directory (also holds the event log)
    #[arg(long, default_value = "state")]
    pub state_dir: PathBuf,

    /// AWS region, overriding the environment file
    #[arg(long)]
    pub region: Option<String>,
}

/// Variable overrides. These take precedence over the environment file.
#[derive(Args, Debug, Clone, Default)]
pub struct VarArgs {
    /// Master password of the database
    #[arg(long, env = "DB_PASSWORD", hide_env_values = true)]
    pub db_password: Option<String>,

    /// Name of the S3 bucket
    #[arg(long)]
    pub bucket_name: Option<String>,

    /// CIDR blocks allowed to reach the database (comma-separated)
    #[arg(long, value_delimiter = ',')]
    pub allowed_db_cidr_blocks: Vec<String>,

    #[arg(long)]
    pub db_deletion_protection: Option<bool>,

    #[arg(long)]
    pub db_backup_retention_days: Option<i64>,

    #[arg(long)]
    pub s3_versioning: Option<bool>,

    /// Any catalog variable
    #[arg(long = "var", value_name = "KEY=VALUE")]
    pub vars: Vec<String>,
}

impl VarArgs {
    /// Command-line variable layer. Named flags win over `--var`.
    pub fn layer(&self) -> std::result::Result<IndexMap<String, String>, ConfigError> {
        let mut layer = IndexMap::new();
        for raw in &self.vars {
            let (key, value) = raw.split_once('=').ok_or_else(|| ConfigError::InvalidVariable {
                name: raw.clone(),
                reason: "expected KEY=VALUE".to_string(),
            })?;
            let key = key.trim();
            if key == "environment" {
                return Err(ConfigError::InvalidVariable {
                    name: key.to_string(),
                    reason: "select the environment with --env".to_string(),
                });
            }
            layer.insert(key.to_string(), value.to_string());
        }
        let named = [
            ("db_password", self.db_password.clone()),
            ("bucket_name", self.bucket_name.clone()),
            (
                "allowed_db_cidr_blocks",
                (!self.allowed_db_cidr_blocks.is_empty()).then(|| self.allowed_db_cidr_blocks.join(",")),
            ),
            ("db_deletion_protection", self.db_deletion_protection.map(|b| b.to_string())),
            ("db_backup_retention_days", self.db_backup_retention_days.map(|n| n.to_string())),
            ("s3_versioning", self.s3_versioning.map(|b| b.to_string())),
        ];
        for (key, value) in named {
            if let Some(v) = value {
                layer.insert(key.to_string(), v);
            }
        }
        Ok(layer)
    }
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Scaffold an environment file
    Init {
        /// Environment name
        #[arg(default_value = "dev")]
        name: String,

        /// Directory of environment files
        #[arg(long, default_value = "environments")]
        env_dir: PathBuf,

        #[arg(long, default_value = environment::DEFAULT_REGION)]
        region: String,
    },

    /// Resolve variables and the dependency graph without any network call
    Validate {
        #[command(flatten)]
        target: TargetArgs,

        #[command(flatten)]
        vars: VarArgs,
    },

    /// Show the execution plan (desired state against recorded state)
    Plan {
        #[command(flatten)]
        target: TargetArgs,

        #[command(flatten)]
        vars: VarArgs,

        /// Converge this resource even if unchanged (repeatable)
        #[arg(long, value_name = "ID")]
        replace: Vec<String>,
    },

    /// Converge the stack to the desired state
    Apply {
        #[command(flatten)]
        target: TargetArgs,

        #[command(flatten)]
        vars: VarArgs,

        /// Converge this resource even if unchanged (repeatable)
        #[arg(long, value_name = "ID")]
        replace: Vec<String>,

        /// Print the plan without changing anything
        #[arg(long)]
        dry_run: bool,
    },

    /// Delete every resource recorded in state, dependents first
    Destroy {
        #[command(flatten)]
        target: TargetArgs,

        /// List what would be deleted without deleting
        #[arg(long)]
        dry_run: bool,
    },

    /// Show recorded state
    Status {
        #[command(flatten)]
        target: TargetArgs,
    },

    /// Print recorded (non-sensitive) outputs
    Output {
        #[command(flatten)]
        target: TargetArgs,

        /// Only this resource
        resource: Option<String>,

        /// Print JSON
        #[arg(long)]
        json: bool,
    },
}

/// Dispatch a CLI command.
pub fn dispatch(cmd: Commands) -> Result<()> {
    match cmd {
        Commands::Init {
            name,
            env_dir,
            region,
        } => cmd_init(&env_dir, &name, &region),
        Commands::Validate { target, vars } => cmd_validate(&target, &vars),
        Commands::Plan {
            target,
            vars,
            replace,
        } => cmd_plan(&target, &vars, &replace),
        Commands::Apply {
            target,
            vars,
            replace,
            dry_run,
        } => cmd_apply(&target, &vars, &replace, dry_run),
        Commands::Destroy { target, dry_run } => cmd_destroy(&target, dry_run),
        Commands::Status { target } => cmd_status(&target),
        Commands::Output {
            target,
            resource,
            json,
        } => cmd_output(&target, resource.as_deref(), json),
    }
}

/// Everything derived from the environment and the variables.
struct Loaded {
    env: Environment,
    ctx: Context,
    specs: Vec<ResourceSpec>,
    region: String,
}

fn load(target: &TargetArgs, vars: &VarArgs) -> Result<Loaded> {
    let env = environment::load_environment(
        &target.env_dir,
        &target.environment,
        target.env_file.as_deref(),
    )?;
    let mut cli = vars.layer()?;
    if let Some(region) = &target.region {
        cli.insert("region".to_string(), region.clone());
    }
    let ctx = variables::resolve(CATALOG, &env.layer(), &cli)?;
    let specs = stack::build(&ctx)?;
    let region = ctx.string("region")?.to_string();
    Ok(Loaded {
        env,
        ctx,
        specs,
        region,
    })
}

/// Environment and region for commands that only read state.
fn load_target(target: &TargetArgs) -> Result<(Environment, String)> {
    let env = environment::load_environment(
        &target.env_dir,
        &target.environment,
        target.env_file.as_deref(),
    )?;
    let region = target.region.clone().unwrap_or_else(|| {
        env.layer()
            .get("region")
            .and_then(|v| v.as_str())
            .map_or_else(|| env.region.clone(), str::to_string)
    });
    Ok((env, region))
}

fn open_state(target: &TargetArgs, env: &Environment, region: &str) -> Box<dyn StateStore> {
    state::open_store(&env.state, &target.state_dir, &env.name, region)
}

fn backoff(ctx: &Context) -> Result<Backoff> {
    let secs = ctx.int("db_connect_timeout_secs")?;
    Ok(Backoff::database(u64::try_from(secs).unwrap_or_default()))
}

fn cmd_init(env_dir: &Path, name: &str, region: &str) -> Result<()> {
    let path = environment::environment_path(env_dir, name);
    if path.exists() {
        return Err(ConfigError::InvalidEnvironment {
            name: name.to_string(),
            reasons: vec![format!("{} already exists", path.display())],
        }
        .into());
    }
    std::fs::create_dir_all(env_dir)?;
    std::fs::write(&path, environment::scaffold(name, region))?;
    println!("Initialized environment '{}'", name);
    println!("  Created: {}", path.display());
    println!("  Pass the database password with DB_PASSWORD or --db-password.");
    Ok(())
}

fn cmd_validate(target: &TargetArgs, vars: &VarArgs) -> Result<()> {
    let loaded = load(target, vars)?;
    let order = resolver::build_execution_order(&loaded.specs)?;
    println!(
        "OK: {} ({}, {}, {} resources)",
        stack::NAME,
        loaded.env.name,
        loaded.region,
        loaded.specs.len()
    );
    println!();
    println!("Apply order:");
    for (i, id) in order.iter().enumerate() {
        println!("  {}. {}", i + 1, id);
    }
    println!();
    println!("Variables:");
    for (name, value, source) in loaded.ctx.describe() {
        println!("  {} = {} ({})", name, value, source);
    }
    Ok(())
}

fn apply_config<'a>(
    loaded: &'a Loaded,
    target: &'a TargetArgs,
    store: &'a dyn StateStore,
    replace: &'a [String],
    dry_run: bool,
) -> Result<ApplyConfig<'a>> {
    for id in replace {
        if !loaded.specs.iter().any(|s| &s.id == id) {
            return Err(ConfigError::InvalidVariable {
                name: "replace".to_string(),
                reason: format!("unknown resource '{}'", id),
            }
            .into());
        }
    }
    Ok(ApplyConfig {
        stack: stack::NAME,
        environment: &loaded.env.name,
        region: &loaded.region,
        specs: &loaded.specs,
        state: store,
        event_dir: Some(target.state_dir.as_path()),
        dry_run,
        replace,
        backoff: backoff(&loaded.ctx)?,
    })
}

fn cmd_plan(target: &TargetArgs, vars: &VarArgs, replace: &[String]) -> Result<()> {
    let loaded = load(target, vars)?;
    let store = open_state(target, &loaded.env, &loaded.region);
    let cfg = apply_config(&loaded, target, store.as_ref(), replace, true)?;
    let plan = executor::plan(&cfg)?;
    print_plan(&plan);
    Ok(())
}

/// Display a plan to stdout.
fn print_plan(plan: &ExecutionPlan) {
    println!(
        "Planning: {} ({}, {} resources)",
        plan.stack,
        plan.environment,
        plan.changes.len()
    );
    println!();
    for change in &plan.changes {
        let symbol = match change.action {
            PlanAction::Create => "+",
            PlanAction::Update => "~",
            PlanAction::Destroy => "-",
            PlanAction::NoOp => " ",
        };
        println!("  {} {}: {}", symbol, change.resource_id, change.description);
    }
    println!();
    println!(
        "Plan: {} to add, {} to change, {} to destroy, {} unchanged.",
        plan.to_create, plan.to_update, plan.to_destroy, plan.unchanged
    );
}

fn cmd_apply(target: &TargetArgs, vars: &VarArgs, replace: &[String], dry_run: bool) -> Result<()> {
    let loaded = load(target, vars)?;
    let store = open_state(target, &loaded.env, &loaded.region);
    let cfg = apply_config(&loaded, target, store.as_ref(), replace, dry_run)?;

    let plan = executor::plan(&cfg)?;
    print_plan(&plan);
    if dry_run {
        println!();
        println!("Dry run: no changes applied.");
        return Ok(());
    }
    if !plan.has_changes() {
        println!();
        println!("Nothing to do.");
        return Ok(());
    }

    let mut provider = CliProvider::default();
    let mut secrets = ModalSecretStore::default();
    let result = executor::apply(&cfg, &mut provider, &mut secrets)?;

    println!();
    for warning in &result.warnings {
        println!("WARNING: {}", warning);
    }
    println!(
        "Apply complete: {} created, {} updated, {} destroyed, {} unchanged, {} secret push(es) ({:.1}s).",
        result.created,
        result.updated,
        result.destroyed,
        result.unchanged,
        result.secret_pushes,
        result.total_duration.as_secs_f64()
    );
    println!("State: {}", store.describe());
    Ok(())
}

fn cmd_destroy(target: &TargetArgs, dry_run: bool) -> Result<()> {
    let (env, region) = load_target(target)?;
    let store = open_state(target, &env, &region);

    if dry_run {
        let Some(lock) = store.load()? else {
            println!("No state found for {} ({}).", env.name, region);
            return Ok(());
        };
        let nodes: Vec<(String, Vec<String>)> = lock
            .resources
            .iter()
            .map(|(id, entry)| (id.clone(), entry.depends_on.clone()))
            .collect();
        let mut order = resolver::order_nodes(&nodes)?;
        order.reverse();
        for id in order {
            if let Some(entry) = lock.resources.get(&id) {
                println!("  - {}: destroy {} {}", id, entry.kind, entry.name);
            }
        }
        println!();
        println!("Dry run: nothing destroyed.");
        return Ok(());
    }

    let cfg = DestroyConfig {
        stack: stack::NAME,
        environment: &env.name,
        region: &region,
        state: store.as_ref(),
        event_dir: Some(target.state_dir.as_path()),
    };
    let result = executor::destroy(
        &cfg,
        &mut CliProvider::default(),
        &mut ModalSecretStore::default(),
    )?;
    for id in &result.destroyed {
        println!("  - {}", id);
    }
    println!(
        "Destroy complete: {} resource(s) destroyed ({:.1}s).",
        result.destroyed.len(),
        result.total_duration.as_secs_f64()
    );
    Ok(())
}

fn load_lock(target: &TargetArgs) -> Result<Option<StateLock>> {
    let (env, region) = load_target(target)?;
    let store = open_state(target, &env, &region);
    store.load().map_err(Error::from)
}

fn cmd_status(target: &TargetArgs) -> Result<()> {
    let Some(lock) = load_lock(target)? else {
        println!("No state found. Run `stratum apply` first.");
        return Ok(());
    };
    println!("Stack: {} ({}, {})", lock.stack, lock.environment, lock.region);
    println!("  Generated: {}", lock.generated_at);
    println!("  Generator: {}", lock.generator);
    println!("  Resources: {}", lock.resources.len());
    for (id, rl) in &lock.resources {
        let duration = rl
            .duration_seconds
            .map(|d| format!(" ({:.2}s)", d))
            .unwrap_or_default();
        println!("    {}: {} [{}] {}{}", id, rl.status, rl.kind, rl.name, duration);
    }
    Ok(())
}

fn cmd_output(target: &TargetArgs, resource: Option<&str>, json: bool) -> Result<()> {
    let Some(lock) = load_lock(target)? else {
        println!("No state found. Run `stratum apply` first.");
        return Ok(());
    };
    let selected: IndexMap<&String, _> = lock
        .resources
        .iter()
        .filter(|(id, _)| resource.is_none_or(|r| r == id.as_str()))
        .map(|(id, rl)| (id, &rl.outputs))
        .collect();
    if let Some(r) = resource {
        if selected.is_empty() {
            return Err(ConfigError::InvalidVariable {
                name: "resource".to_string(),
                reason: format!("'{}' is not in state", r),
            }
            .into());
        }
    }

    if json {
        let rendered = serde_json::to_string_pretty(&selected)
            .map_err(|e| std::io::Error::other(e.to_string()))?;
        println!("{}", rendered);
        return Ok(());
    }
    for (id, outputs) in selected {
        for (key, value) in outputs {
            println!("{}.{} = {}", id, key, value);
        }
    }
    Ok(())
}
