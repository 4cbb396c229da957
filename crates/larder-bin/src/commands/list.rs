use clap::Parser;
use itertools::Itertools;
use miette::IntoDiagnostic;

use crate::Context;

/// List stored implementations
#[derive(Debug, Parser)]
pub struct Opt {
    /// List left-over temporary directories instead
    #[arg(long)]
    temp: bool,
}

pub fn list(context: &Context, opt: Opt) -> miette::Result<()> {
    if opt.temp {
        let temp = context.store.list_temp().into_diagnostic()?;
        if !temp.is_empty() {
            println!("{}", temp.iter().map(|path| path.display()).format("\n"));
        }
    } else {
        let all = context.store.list_all().into_diagnostic()?;
        if !all.is_empty() {
            println!("{}", all.iter().format("\n"));
        }
    }
    Ok(())
}
