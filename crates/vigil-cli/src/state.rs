//! State commands for Vigil CLI.
//!
//! Reads and removes values in the file-backed state store, with the same
//! ownership checks a detector gets.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use vigil_core::{FileBlobStore, StateRepository, VigilDirs};

use crate::colors;

fn repository(dirs: &VigilDirs, module: &str, scope: &str) -> anyhow::Result<StateRepository> {
    let store = FileBlobStore::new(&dirs.state_dir)?;
    Ok(StateRepository::new(Arc::new(store), module, scope))
}

/// Print the JSON value stored under `key`.
pub fn get(dirs: &VigilDirs, module: &str, scope: &str, key: &str) -> anyhow::Result<()> {
    let repo = repository(dirs, module, scope)?;
    let value: Option<serde_json::Value> = repo
        .try_get_state(key, &CancellationToken::new())
        .map_err(vigil_core::Error::from)?;

    match value {
        Some(value) => println!("{}", serde_json::to_string_pretty(&value)?),
        None => println!("{}No value stored under '{}'{}", colors::YELLOW, key, colors::RESET),
    }
    Ok(())
}

/// Remove the value stored under `key`.
pub fn delete(dirs: &VigilDirs, module: &str, scope: &str, key: &str) -> anyhow::Result<()> {
    repository(dirs, module, scope)?
        .delete_state(key, &CancellationToken::new())
        .map_err(vigil_core::Error::from)?;
    println!(
        "{}Deleted{} '{}' of {} / {}",
        colors::GREEN,
        colors::RESET,
        StateRepository::normalize_key(key),
        module,
        scope
    );
    Ok(())
}
