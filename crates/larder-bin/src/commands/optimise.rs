use clap::Parser;
use indicatif::HumanBytes;
use miette::IntoDiagnostic;

use crate::Context;

/// Replace identical files of different implementations with hardlinks
#[derive(Debug, Parser)]
pub struct Opt {}

pub fn optimise(context: &Context, _opt: Opt) -> miette::Result<()> {
    let saved = context
        .store
        .optimise(context.handler.as_ref())
        .into_diagnostic()?;
    println!("Saved {}", HumanBytes(saved));
    Ok(())
}
