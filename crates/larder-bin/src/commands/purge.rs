use clap::Parser;
use miette::IntoDiagnostic;

use crate::Context;

/// Remove every implementation and every left-over temporary directory
#[derive(Debug, Parser)]
pub struct Opt {
    /// Do not ask for confirmation
    #[arg(long)]
    yes: bool,
}

pub fn purge(context: &Context, opt: Opt) -> miette::Result<()> {
    if !opt.yes && !context.handler.ask("Remove all implementations from the store?") {
        tracing::info!("nothing was removed");
        return Ok(());
    }
    context
        .store
        .purge(context.handler.as_ref())
        .into_diagnostic()
}
