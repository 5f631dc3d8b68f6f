// src/main.rs
//! Banquet - CLI entry point

use anyhow::{Context, Result};
use clap::Parser;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use banquet::cycle::{run_cycle, Collaborators};
use banquet::db::{BuildLogDb, SqliteDb};
use banquet::logs::BuildLogger;
use banquet::sched::driver::request_interrupt;
use banquet::{CommandBuilder, CommandChecker, GitCli, LogNotifier, Notifier, TomlRecipeLoader};

#[derive(Parser)]
#[command(name = "banquet")]
#[command(author = "Banquet Contributors")]
#[command(version)]
#[command(about = "Automated batch build scheduler for a rolling-release package repository", long_about = None)]
struct Cli {
    /// Packages to force-build; the full managed set when omitted
    pkgs: Vec<String>,

    /// Working directory holding config.toml, the lock file, state and logs
    #[arg(long, default_value = ".")]
    mydir: PathBuf,
}

extern "C" fn handle_sigint(_: i32) {
    request_interrupt();
}

fn install_sigint_handler() -> Result<()> {
    use nix::sys::signal::{signal, SigHandler, Signal};
    unsafe {
        signal(Signal::SIGINT, SigHandler::Handler(handle_sigint))
            .context("cannot install SIGINT handler")?;
    }
    Ok(())
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    install_sigint_handler()?;

    let config = banquet::load_config(&cli.mydir.join("config.toml"))
        .context("cannot load configuration")?;

    let repodir = config.repository.repodir.clone();
    let vcs = GitCli::new(repodir.clone());
    let checker = CommandChecker::new(&config.nvchecker);
    let loader = TomlRecipeLoader::new(config.repository.destdir.clone());
    let builder = Arc::new(CommandBuilder::new(
        config.misc.build_command.clone(),
        repodir,
    ));

    let logger = Arc::new(BuildLogger::open(&cli.mydir).context("cannot open build logs")?);
    let notifier = LogNotifier::new(config.banquet.name.clone(), Some(logger));

    let db = match &config.banquet.dburl {
        Some(url) => Some(SqliteDb::open(Path::new(url)).context("cannot open database")?),
        None => None,
    };
    let db_ref: Option<&dyn BuildLogDb> = db.as_ref().map(|d| d as &dyn BuildLogDb);

    let outcome = run_cycle(
        &config,
        &cli.mydir,
        &cli.pkgs,
        true,
        &Collaborators {
            vcs: &vcs,
            checker: &checker,
            builder,
            loader: &loader,
            notifier: &notifier,
            db: db_ref,
        },
    );
    let outcome = match outcome {
        Ok(outcome) => outcome,
        Err(e) => {
            // top-level handler: report to the maintainer, then exit non-zero
            notifier.report(None, "cycle aborted", &e.to_string());
            return Err(e.into());
        }
    };

    println!(
        "cycle finished: {} built, {} failed",
        outcome.built.len(),
        outcome.failed.len()
    );
    if !outcome.failed.is_empty() {
        println!("failed: {}", outcome.failed.join(", "));
    }

    // package failures are part of a normal cycle; only setup errors exit
    // non-zero (propagated above)
    Ok(())
}
