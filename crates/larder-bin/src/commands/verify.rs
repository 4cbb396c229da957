use clap::Parser;
use larder_store::ManifestDigest;
use miette::IntoDiagnostic;

use crate::Context;

/// Check that stored implementations still match their digests
#[derive(Debug, Parser)]
pub struct Opt {
    /// The implementations to verify, all of them if none are given
    digests: Vec<ManifestDigest>,
}

pub fn verify(context: &Context, opt: Opt) -> miette::Result<()> {
    let digests = if opt.digests.is_empty() {
        context.store.list_all().into_diagnostic()?
    } else {
        opt.digests
    };

    let mut damaged = 0;
    for digest in &digests {
        match context.store.verify(digest, context.handler.as_ref()) {
            Ok(()) => tracing::debug!("{digest} is intact"),
            Err(e) => {
                tracing::error!("{e}");
                damaged += 1;
            }
        }
    }

    if damaged > 0 {
        return Err(miette::miette!(
            "{damaged} of {} implementations failed verification",
            digests.len()
        ));
    }
    tracing::info!("verified {} implementations", digests.len());
    Ok(())
}
