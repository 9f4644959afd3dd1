//! Companion script run by the remote interpreter.

use std::fs::OpenOptions;
use std::io::{self, Write};
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};

/// `1` asks the companion script for debug output on stderr.
pub const ENV_DEBUG: &str = "TCLBRIDGE_DEBUG";

pub const SCRIPT_NAME: &str = "bridge.tcl";

const SCRIPT: &str = include_str!("tcl/bridge.tcl");

/// Write the companion script into `dir` (mode 0600) and return its path.
pub fn install(dir: &Path) -> io::Result<PathBuf> {
    let path = dir.join(SCRIPT_NAME);
    let mut file = OpenOptions::new()
        .write(true)
        .create_new(true)
        .mode(0o600)
        .open(&path)?;
    file.write_all(SCRIPT.as_bytes())?;
    file.flush()?;
    tracing::trace!(path = %path.display(), "Installed companion script");
    Ok(path)
}
