pub mod add;
pub mod find;
pub mod list;
pub mod manifest;
pub mod optimise;
pub mod purge;
pub mod remove;
#[cfg(unix)]
pub mod serve;
pub mod verify;
