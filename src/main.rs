use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};
use colored::Colorize;

use mashtun::engine::NodeOutcome;
use mashtun::{BuildConfig, Engine, FormulaIndex, PlatformFingerprint, Request};

#[derive(Parser)]
#[command(name = "mash")]
#[command(author, version, about = "Formula resolution and build orchestration engine", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Install root (cellar, links, bottle cache live under it).
    /// Defaults to $MASHTUN_ROOT or /opt/mashtun.
    #[arg(long, global = true)]
    root: Option<PathBuf>,

    /// Directory of formula declarations (*.json).
    /// Defaults to $MASHTUN_FORMULAE or <root>/formulae.
    #[arg(long, global = true)]
    formulae: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Resolve requests into an install plan without executing it
    Resolve {
        /// Package names, optionally pinned as name@version
        packages: Vec<String>,
    },

    /// Resolve and execute: install packages and their dependencies
    Install {
        /// Package names, optionally pinned as name@version
        packages: Vec<String>,

        /// Per-build wall-clock budget in seconds
        #[arg(long, default_value_t = 3600)]
        timeout: u64,

        /// Enable an option on a requested package (name:option)
        #[arg(long)]
        option: Vec<String>,
    },

    /// Show the installed record for a package
    Query {
        /// Package name
        package: String,
    },

    /// Remove an installed package
    Remove {
        /// Package name
        package: String,
    },

    /// List installed packages
    List,
}

/// Split `name@version` into a request
fn parse_request(spec: &str, options: &[String]) -> Request {
    let (name, pin) = match spec.split_once('@') {
        Some((name, version)) => (name.to_string(), Some(version.to_string())),
        None => (spec.to_string(), None),
    };
    let options = options
        .iter()
        .filter_map(|o| o.split_once(':'))
        .filter(|(pkg, _)| *pkg == name)
        .map(|(_, opt)| opt.to_string())
        .collect();
    Request { name, pin, options }
}

/// Resolve the install root: flag, then $MASHTUN_ROOT, then /opt/mashtun
fn detect_root(flag: &Option<PathBuf>) -> PathBuf {
    if let Some(root) = flag {
        return root.clone();
    }
    match std::env::var("MASHTUN_ROOT") {
        Ok(root) => PathBuf::from(root),
        Err(_) => PathBuf::from("/opt/mashtun"),
    }
}

fn build_engine(
    root: &PathBuf,
    formulae: &Option<PathBuf>,
    timeout: u64,
) -> anyhow::Result<Engine> {
    let formula_dir = formulae
        .clone()
        .or_else(|| std::env::var("MASHTUN_FORMULAE").ok().map(PathBuf::from))
        .unwrap_or_else(|| root.join("formulae"));
    let index = FormulaIndex::load_dir(&formula_dir)?;
    let platform = PlatformFingerprint::host()?;
    let mut config = BuildConfig::new(root.clone());
    config.timeout = Duration::from_secs(timeout);
    Ok(Engine::new(index, platform, config))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    if std::env::var("RUST_LOG").is_err() {
        unsafe {
            std::env::set_var("RUST_LOG", "warn");
        }
    }
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .init();

    let cli = Cli::parse();
    let root = detect_root(&cli.root);

    match cli.command {
        Commands::Resolve { packages } => {
            let engine = build_engine(&root, &cli.formulae, 3600)?;
            let requests: Vec<Request> = packages.iter().map(|p| parse_request(p, &[])).collect();
            let plan = engine.resolve(&requests)?;

            println!("Plan for {} packages:", plan.order.len().to_string().bold());
            for name in &plan.order {
                let node = &plan.nodes[name];
                let source = if node.decision.is_bottle() {
                    "bottle".green()
                } else {
                    "source build".yellow()
                };
                println!("  {} {} ({source})", name.bold(), node.pkg.version.dimmed());
            }
        }

        Commands::Install {
            packages,
            timeout,
            option,
        } => {
            let engine = build_engine(&root, &cli.formulae, timeout)?;
            let requests: Vec<Request> = packages
                .iter()
                .map(|p| parse_request(p, &option))
                .collect();
            let plan = engine.resolve(&requests)?;
            println!(
                "Installing {} packages...",
                plan.order.len().to_string().bold()
            );

            let outcomes = engine.execute(plan).await?;
            let mut failed = false;
            for (name, outcome) in &outcomes {
                match outcome {
                    NodeOutcome::Installed {
                        version,
                        poured_from_bottle,
                    } => {
                        let how = if *poured_from_bottle { "poured" } else { "built" };
                        println!("  {} {} {} ({how})", "✓".green(), name.bold(), version.dimmed());
                    }
                    NodeOutcome::AlreadyInstalled { version } => {
                        println!("  {} {} {} (already installed)", "✓".green(), name, version.dimmed());
                    }
                    NodeOutcome::Failed { error } => {
                        failed = true;
                        println!("  {} {} {}", "✗".red(), name.bold(), error.red());
                    }
                    NodeOutcome::Skipped { failed_dependency } => {
                        failed = true;
                        println!(
                            "  {} {} skipped ({} failed)",
                            "-".yellow(),
                            name,
                            failed_dependency
                        );
                    }
                }
            }
            if failed {
                anyhow::bail!("some packages were not installed");
            }
        }

        Commands::Query { package } => {
            let engine = build_engine(&root, &cli.formulae, 3600)?;
            let record = engine.query(&package)?;
            println!("{} {}", record.name.bold(), record.version);
            println!("  variant: {}", record.variant.dimmed());
            let when = chrono::DateTime::from_timestamp(record.time, 0)
                .map(|t| t.format("%Y-%m-%d %H:%M").to_string())
                .unwrap_or_else(|| record.time.to_string());
            println!(
                "  installed: {} ({})",
                when,
                if record.poured_from_bottle {
                    "bottle"
                } else {
                    "source"
                }
            );
            for dep in &record.dependencies {
                println!("  depends on {} {} ({:?})", dep.name, dep.version, dep.kind);
            }
        }

        Commands::Remove { package } => {
            let engine = build_engine(&root, &cli.formulae, 3600)?;
            let record = engine.remove(&package)?;
            println!(
                "{} Removed {} {}",
                "✓".green(),
                record.name.bold(),
                record.version.dimmed()
            );
        }

        Commands::List => {
            let engine = build_engine(&root, &cli.formulae, 3600)?;
            for record in engine.store().list()? {
                println!("{} {}", record.name, record.version.dimmed());
            }
        }
    }

    Ok(())
}
