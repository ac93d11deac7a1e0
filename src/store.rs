//! JSON persistence of [`ChainState`] between CLI invocations.

use std::{
    fs, io,
    path::{Path, PathBuf},
};

use crate::chain::ChainState;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("i/o error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("malformed state file {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Loads the state file, or `None` when it does not exist yet.
pub fn load(path: &Path) -> Result<Option<ChainState>, StoreError> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(source) => {
            return Err(StoreError::Io {
                path: path.to_path_buf(),
                source,
            })
        }
    };
    let state = serde_json::from_slice(&bytes).map_err(|source| StoreError::Json {
        path: path.to_path_buf(),
        source,
    })?;
    tracing::debug!(path = %path.display(), "state loaded");
    Ok(Some(state))
}

/// Writes the state next to `path` and renames it into place.
pub fn save(path: &Path, state: &ChainState) -> Result<(), StoreError> {
    let io_err = |source| StoreError::Io {
        path: path.to_path_buf(),
        source,
    };
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(io_err)?;
    }
    let bytes = serde_json::to_vec_pretty(state).map_err(|source| StoreError::Json {
        path: path.to_path_buf(),
        source,
    })?;
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, bytes).map_err(io_err)?;
    fs::rename(&tmp, path).map_err(io_err)?;
    tracing::debug!(path = %path.display(), height = state.height, "state saved");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        address::Address,
        chain::{Call, Chain},
        units::tokens,
    };

    #[test]
    fn missing_file_loads_as_none() {
        let dir = tempfile::tempdir().unwrap();
        assert!(load(&dir.path().join("absent.json")).unwrap().is_none());
    }

    #[test]
    fn saved_state_reloads_identically() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("chain.json");

        let chain = Chain::new();
        let deployer = Address::derive("deployer");
        let token = chain.deploy_token(deployer, "Nir Coin", "NIR", 18, tokens(1_000_000));
        chain
            .submit(
                Call::Transfer {
                    token,
                    from: deployer,
                    to: Address::derive("user1"),
                    amount: tokens(100),
                },
                7,
            )
            .unwrap();
        save(&path, &chain.state()).unwrap();

        let reloaded = load(&path).unwrap().unwrap();
        assert_eq!(reloaded, chain.state());
        assert_eq!(Chain::from_state(reloaded).summary().state_root, chain.summary().state_root);
    }

    #[test]
    fn malformed_file_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("chain.json");
        fs::write(&path, b"{not json").unwrap();
        assert!(matches!(load(&path), Err(StoreError::Json { .. })));
    }
}
