//! privagg CLI
//!
//! Command-line access to the lifecycle operations:
//! - Check and register queries
//! - Answer consent requests
//! - Run a sweep by hand
//! - Inspect and list queries
//! - Settle payment of completed queries

use anyhow::Context;
use clap::{Parser, Subcommand};
use privagg::config::generate_default_config;
use privagg::{
    Config, ConsentState, NewPinQuery, NewQuery, QueryKey, QueryLifecycleManager, QueryRecord,
    QueryState, Repository, SqliteRepository, UserId,
};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "privagg-cli")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Manage privacy-preserving aggregate queries")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Config file (default: standard locations, then environment)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Database file, overrides the config
    #[arg(long, global = true)]
    pub database: Option<PathBuf>,

    /// Output format (table, json)
    #[arg(short, long, default_value = "table", global = true)]
    pub format: String,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Compile a query and show what it touches
    Check {
        /// Query text, e.g. "SELECT AVG(RandomData.random_one)"
        query: String,
    },

    /// Register a query described by a JSON file ("-" for stdin)
    Register {
        path: PathBuf,
        /// Register as a pin query instead
        #[arg(long)]
        pin: bool,
    },

    /// Answer a consent request
    Consent {
        #[arg(short, long)]
        user: i64,
        #[arg(short, long)]
        processor: Option<i64>,
        #[arg(short, long)]
        query: Option<i64>,
        /// Answer a pin query instead
        #[arg(long, conflicts_with_all = ["processor", "query"])]
        pin: Option<u32>,
        /// Refuse instead of accepting
        #[arg(long)]
        refuse: bool,
    },

    /// Process every query whose consent window has closed
    Sweep {
        /// Reference time in ms (default: now)
        #[arg(long)]
        now: Option<i64>,
    },

    /// Show one query
    Show {
        #[arg(short, long)]
        processor: i64,
        #[arg(short, long)]
        query: i64,
        /// Show the query as this user sees it
        #[arg(short, long)]
        user: Option<i64>,
    },

    /// List queries of a processor or a user
    List {
        #[arg(short, long, required_unless_present = "user")]
        processor: Option<i64>,
        #[arg(short, long)]
        user: Option<i64>,
        /// pending, processing, completed, aborted, paid
        #[arg(short, long)]
        state: Option<QueryState>,
        /// pending, accepted, refused (user listings only)
        #[arg(long)]
        consent: Option<ConsentState>,
    },

    /// Settle payment of a completed query
    Pay {
        #[arg(short, long)]
        processor: i64,
        #[arg(short, long)]
        query: i64,
    },

    /// Generate default config file
    Config {
        /// Output path (default: stdout)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

fn load_config(cli: &Cli) -> anyhow::Result<Config> {
    let mut config = match &cli.config {
        Some(path) => Config::load_with_env(path)?,
        None => Config::load_default(),
    };
    if let Some(db) = &cli.database {
        config.storage.database_path = db.to_string_lossy().to_string();
    }
    Ok(config)
}

fn open_manager(config: Config) -> anyhow::Result<QueryLifecycleManager> {
    let path = Path::new(&config.storage.database_path);
    let repo = SqliteRepository::open(path)
        .with_context(|| format!("opening database {}", path.display()))?;
    repo.install_data_sources()?;
    Ok(QueryLifecycleManager::new(Arc::new(repo), Arc::new(config)))
}

fn read_input(path: &Path) -> anyhow::Result<String> {
    if path == Path::new("-") {
        Ok(std::io::read_to_string(std::io::stdin())?)
    } else {
        std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))
    }
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn print_queries(format: &str, queries: &[QueryRecord]) -> anyhow::Result<()> {
    if format == "json" {
        return print_json(&queries);
    }

    println!(
        "{:<12} {:<14} {:<11} {:>6}  {}",
        "PROCESSOR", "QUERY", "STATE", "AMOUNT", "TEXT"
    );
    println!("{}", "-".repeat(72));
    for q in queries {
        println!(
            "{:<12} {:<14} {:<11} {:>6}  {}",
            q.processor_id,
            q.query_id,
            q.state.as_str(),
            q.amount,
            q.query
        );
    }
    println!("\n{} queries", queries.len());
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "privagg=warn".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    if let Commands::Config { output } = &cli.command {
        let template = generate_default_config();
        match output {
            Some(path) => {
                std::fs::write(path, template)?;
                println!("Config written to {}", path.display());
            }
            None => print!("{}", template),
        }
        return Ok(());
    }

    let config = load_config(&cli)?;
    let manager = open_manager(config)?;

    match cli.command {
        Commands::Check { query } => {
            let plan = manager.check_query(&query).map_err(report)?;
            if cli.format == "json" {
                print_json(&serde_json::json!({
                    "calls": plan.calls.iter().map(|c| serde_json::json!({
                        "function": c.function,
                        "attributes": c.attrs.iter().map(|a| a.to_string()).collect::<Vec<_>>(),
                    })).collect::<Vec<_>>(),
                    "branches": plan.branches.len(),
                    "data_types": plan.data_types,
                }))?;
            } else {
                println!("Query OK");
                for (i, call) in plan.calls.iter().enumerate() {
                    let attrs: Vec<String> = call.attrs.iter().map(|a| a.to_string()).collect();
                    println!("  Fun{}: {}({})", i, call.function.as_str(), attrs.join(", "));
                }
                for (i, branch) in plan.branches.iter().enumerate() {
                    let constraints: Vec<String> = branch
                        .iter()
                        .map(|c| format!("{} in {}", c.attr, c.bound.encode()))
                        .collect();
                    println!("  branch {}: [{}]", i, constraints.join(", "));
                }
                let types: Vec<&str> = plan.data_types.iter().map(|t| t.as_str()).collect();
                println!("  data types: {}", types.join(", "));
            }
        }

        Commands::Register { path, pin } => {
            let input = read_input(&path)?;
            if pin {
                let new: NewPinQuery = serde_json::from_str(&input)?;
                let record = manager.register_pin_query(new).map_err(report)?;
                println!("Registered pin query {} with PIN {:05}", record.key(), record.pin);
            } else {
                let new: NewQuery = serde_json::from_str(&input)?;
                let record = manager.register_query(new).map_err(report)?;
                let selected = manager.repository().query_users(record.key(), None)?.len();
                println!("Registered query {} ({} users selected)", record.key(), selected);
            }
        }

        Commands::Consent {
            user,
            processor,
            query,
            pin,
            refuse,
        } => {
            let consent = match (pin, processor, query) {
                (Some(pin), _, _) => manager
                    .set_pin_consent(UserId(user), pin, !refuse)
                    .map_err(report)?,
                (None, Some(p), Some(q)) => manager
                    .set_consent(UserId(user), QueryKey::new(p, q), !refuse)
                    .map_err(report)?,
                _ => anyhow::bail!("either --pin or both --processor and --query are required"),
            };
            println!("Consent of user {}: {}", user, consent);
        }

        Commands::Sweep { now } => {
            let summary = manager
                .sweep(now.unwrap_or_else(privagg::now_millis))
                .await
                .map_err(report)?;
            if cli.format == "json" {
                print_json(&summary)?;
            } else {
                println!(
                    "Processed {} queries: {} completed, {} aborted",
                    summary.processed, summary.completed, summary.aborted
                );
                for e in &summary.errors {
                    println!("  [{}] {}", e.code, e.message);
                }
            }
        }

        Commands::Show {
            processor,
            query,
            user,
        } => {
            let key = QueryKey::new(processor, query);
            match user {
                Some(user) => {
                    print_json(&manager.retrieve_for_user(UserId(user), key).map_err(report)?)?
                }
                None => print_json(&manager.retrieve_for_processor(key).map_err(report)?)?,
            }
        }

        Commands::List {
            processor,
            user,
            state,
            consent,
        } => match (user, processor) {
            (Some(user), _) => {
                let views = manager
                    .user_queries(UserId(user), state, consent)
                    .map_err(report)?;
                if cli.format == "json" {
                    print_json(&views)?;
                } else {
                    for view in &views {
                        println!(
                            "{:<20} {:<11} {:<9} {}",
                            view.query.key().to_string(),
                            view.query.state.as_str(),
                            view.consent.as_str(),
                            view.query.title
                        );
                    }
                    println!("\n{} queries", views.len());
                }
            }
            (None, Some(processor)) => {
                let queries = manager.processor_queries(processor, state).map_err(report)?;
                print_queries(&cli.format, &queries)?;
            }
            (None, None) => anyhow::bail!("either --processor or --user is required"),
        },

        Commands::Pay { processor, query } => {
            let outcome = manager
                .settle_payment(QueryKey::new(processor, query))
                .await
                .map_err(report)?;
            println!("Payment outcome: {:?}", outcome);
        }

        Commands::Config { .. } => {}
    }

    Ok(())
}

/// Surface the stable `(code, message)` pair of a core error
fn report(err: privagg::CoreError) -> anyhow::Error {
    let report = err.to_report();
    anyhow::anyhow!("[{}] {}", report.code, report.message)
}
