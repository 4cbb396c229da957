use clap::Parser;
use larder_store::ManifestDigest;
use miette::IntoDiagnostic;

use crate::Context;

/// Remove implementations from the store
#[derive(Debug, Parser)]
pub struct Opt {
    #[arg(required = true)]
    digests: Vec<ManifestDigest>,
}

pub fn remove(context: &Context, opt: Opt) -> miette::Result<()> {
    for digest in &opt.digests {
        if !context
            .store
            .remove(digest, context.handler.as_ref())
            .into_diagnostic()?
        {
            tracing::warn!("{digest} is not stored");
        }
    }
    Ok(())
}
