use std::path::PathBuf;

use clap::Parser;
use larder_manifest::{Manifest, ManifestFormat, ScanOptions};
use miette::IntoDiagnostic;

/// Print the manifest of a directory and its digest
#[derive(Debug, Parser)]
pub struct Opt {
    /// The directory to describe
    dir: PathBuf,

    /// The digest algorithm
    #[arg(long, default_value = "sha256new")]
    format: ManifestFormat,
}

pub fn manifest(opt: Opt) -> miette::Result<()> {
    let manifest =
        Manifest::from_directory(&opt.dir, opt.format, &ScanOptions::default()).into_diagnostic()?;
    print!("{manifest}");
    eprintln!("{}", manifest.digest());
    Ok(())
}
