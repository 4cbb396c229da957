use clap::Parser;
use larder_store::ManifestDigest;

use crate::Context;

/// Print the directory of an implementation
#[derive(Debug, Parser)]
pub struct Opt {
    digest: ManifestDigest,
}

pub fn find(context: &Context, opt: Opt) -> miette::Result<()> {
    match context.store.get_path(&opt.digest) {
        Some(path) => {
            println!("{}", path.display());
            Ok(())
        }
        None => Err(miette::miette!("{} is not stored", opt.digest)),
    }
}
