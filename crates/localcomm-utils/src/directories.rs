use std::{io, path::PathBuf};

use directories::BaseDirs;
use tracing::warn;

/// Directory holding the service sockets: `$XDG_RUNTIME_DIR` when set,
/// otherwise `/tmp`.
pub fn runtime_dir() -> PathBuf {
    let Some(base_dirs) = BaseDirs::new() else {
        warn!("couldn't find basedirs, using /tmp as runtime dir");
        return PathBuf::from("/tmp");
    };
    match base_dirs.runtime_dir() {
        Some(dir) => dir.to_path_buf(),
        None => PathBuf::from("/tmp"),
    }
}

pub fn ensure_runtime_dir() -> io::Result<PathBuf> {
    let dir = runtime_dir();
    std::fs::create_dir_all(&dir)?;
    Ok(dir)
}
