use std::{path::PathBuf, sync::Arc};

use clap::Parser;
use larder_store::{
    locations::{system_cache_dir, StoreConfig},
    service::StoreService,
    DirectoryStore,
};
use miette::IntoDiagnostic;

/// Add implementations to a shared store on behalf of other users
#[derive(Debug, Parser)]
pub struct Opt {
    /// The socket to listen on, taken from the configuration if absent
    #[arg(long)]
    socket: Option<PathBuf>,
}

pub fn serve(opt: Opt, store_dir: Option<PathBuf>) -> miette::Result<()> {
    let config = StoreConfig::load_default().into_diagnostic()?;
    let socket = opt
        .socket
        .or_else(|| config.service_socket.clone())
        .ok_or_else(|| miette::miette!("no socket given and none configured"))?;

    let root = store_dir.unwrap_or_else(system_cache_dir);
    let store = DirectoryStore::open_with_options(&root, config.store_options()).into_diagnostic()?;
    if store.is_read_only() {
        return Err(miette::miette!(
            "the store at '{}' is not writable by this process",
            root.display()
        ));
    }

    let listener = StoreService::bind(&socket).into_diagnostic()?;
    StoreService::new(Arc::new(store))
        .serve(listener)
        .into_diagnostic()
}
