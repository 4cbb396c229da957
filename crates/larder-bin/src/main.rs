use std::{path::PathBuf, sync::Arc};

use clap::Parser;
use indicatif::{MultiProgress, ProgressDrawTarget};
use larder_build::{CancellationToken, SilentTaskHandler, TaskHandler};
use larder_store::{
    locations::{default_store, StoreConfig},
    DirectoryStore, ImplementationStore,
};
use miette::IntoDiagnostic;
use once_cell::sync::Lazy;
use tracing_subscriber::{filter::LevelFilter, util::SubscriberInitExt, EnvFilter};

mod commands;
mod handler;
mod writer;

/// Returns a global instance of [`indicatif::MultiProgress`].
///
/// Logging is routed through this instance so log lines do not tear progress bars.
pub fn global_multi_progress() -> MultiProgress {
    static GLOBAL_MP: Lazy<MultiProgress> = Lazy::new(|| {
        let mp = MultiProgress::new();
        mp.set_draw_target(ProgressDrawTarget::stderr_with_hz(20));
        mp
    });
    GLOBAL_MP.clone()
}

/// Manage stores of content-addressed implementations
#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Never ask questions, answer them with the default instead
    #[arg(long, global = true)]
    batch: bool,

    /// Use this store directory instead of the configured stores
    #[arg(long, global = true)]
    store: Option<PathBuf>,
}

#[derive(clap::Subcommand)]
enum Commands {
    /// Add an implementation built from archives
    Add(commands::add::Opt),
    /// List stored implementations
    List(commands::list::Opt),
    /// Print the directory of an implementation
    Find(commands::find::Opt),
    /// Check that stored implementations are unmodified
    Verify(commands::verify::Opt),
    /// Remove implementations
    Remove(commands::remove::Opt),
    /// Replace duplicate files with hardlinks
    Optimise(commands::optimise::Opt),
    /// Remove all implementations
    Purge(commands::purge::Opt),
    /// Print the manifest of a directory
    Manifest(commands::manifest::Opt),
    /// Add implementations on behalf of other users
    #[cfg(unix)]
    Serve(commands::serve::Opt),
}

/// The stores and the handler shared by all commands.
pub struct Context {
    pub store: Arc<dyn ImplementationStore>,
    pub handler: Box<dyn TaskHandler>,
}

impl Context {
    fn new(store_dir: Option<PathBuf>, batch: bool) -> miette::Result<Self> {
        let config = StoreConfig::load_default().into_diagnostic()?;
        let store: Arc<dyn ImplementationStore> = match store_dir {
            Some(dir) => Arc::new(
                DirectoryStore::open_with_options(dir, config.store_options()).into_diagnostic()?,
            ),
            None => Arc::new(default_store(&config).into_diagnostic()?),
        };
        let cancellation = CancellationToken::new();
        #[cfg(unix)]
        handler::cancel_on_interrupt(cancellation.clone()).into_diagnostic()?;
        let handler: Box<dyn TaskHandler> = if batch {
            Box::new(SilentTaskHandler::new().with_cancellation_token(cancellation))
        } else {
            Box::new(handler::ConsoleTaskHandler::new(
                global_multi_progress(),
                cancellation,
            ))
        };
        Ok(Self { store, handler })
    }
}

/// Entry point of the `larder` cli.
fn main() -> miette::Result<()> {
    let cli = Cli::parse();

    let env_filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .from_env()
        .into_diagnostic()?;

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(writer::IndicatifWriter::new(global_multi_progress()))
        .without_time()
        .finish()
        .try_init()
        .into_diagnostic()?;

    let context = || Context::new(cli.store.clone(), cli.batch);
    match cli.command {
        Commands::Add(opt) => commands::add::add(&context()?, opt),
        Commands::List(opt) => commands::list::list(&context()?, opt),
        Commands::Find(opt) => commands::find::find(&context()?, opt),
        Commands::Verify(opt) => commands::verify::verify(&context()?, opt),
        Commands::Remove(opt) => commands::remove::remove(&context()?, opt),
        Commands::Optimise(opt) => commands::optimise::optimise(&context()?, opt),
        Commands::Purge(opt) => commands::purge::purge(&context()?, opt),
        Commands::Manifest(opt) => commands::manifest::manifest(opt),
        #[cfg(unix)]
        Commands::Serve(opt) => commands::serve::serve(opt, cli.store.clone()),
    }
}
