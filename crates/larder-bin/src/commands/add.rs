use std::path::PathBuf;

use clap::Parser;
use larder_build::{BuildContext, Recipe, RecipeStep};
use larder_store::ManifestDigest;
use miette::{Context as _, IntoDiagnostic};

use crate::Context;

/// Add an implementation built from one or more archives
#[derive(Debug, Parser)]
pub struct Opt {
    /// The digest the implementation must have, e.g. `sha256new_...`
    digest: ManifestDigest,

    /// The archives to extract, in order
    #[arg(required = true)]
    archives: Vec<PathBuf>,

    /// The MIME type of the archives, guessed from their names if absent
    #[arg(long)]
    mime_type: Option<String>,

    /// Only extract this sub-directory of each archive
    #[arg(long)]
    extract: Option<String>,

    /// Place the extracted content in this sub-directory
    #[arg(long)]
    destination: Option<String>,
}

pub fn add(context: &Context, opt: Opt) -> miette::Result<()> {
    let steps = opt
        .archives
        .iter()
        .map(|path| {
            // The recipe may be executed by a service with a different working directory.
            let path = std::fs::canonicalize(path)
                .into_diagnostic()
                .with_context(|| format!("failed to locate '{}'", path.display()))?;
            Ok(RecipeStep::Archive {
                path,
                mime_type: opt.mime_type.clone(),
                extract: opt.extract.clone(),
                destination: opt.destination.clone(),
            })
        })
        .collect::<miette::Result<Vec<_>>>()?;
    let recipe = Recipe::new(steps);

    let lookup = |digest: &ManifestDigest| context.store.get_path(digest);
    let build_context =
        BuildContext::new(context.handler.as_ref()).with_implementation_lookup(&lookup);
    let path = context
        .store
        .add(&opt.digest, &recipe, &build_context)
        .into_diagnostic()?;
    println!("{}", path.display());
    Ok(())
}
