//! Output, socket, and PID file path resolution.
//!
//! Socket directory priority:
//! 1. `TAPCAP_SOCKET_DIR` (explicit override)
//! 2. `XDG_RUNTIME_DIR/tapcap` (Linux standard)
//! 3. `~/.tapcap` (home directory fallback)
//! 4. System temp dir (last resort)
//!
//! Output directory priority:
//! 1. `TAPCAP_OUT_DIR` (explicit override)
//! 2. platform data dir + `tapcap` (e.g. `~/.local/share/tapcap`)
//! 3. `~/.tapcap/data`
//! 4. System temp dir (last resort)
//!
//! The output directory holds `image/` (screenshots), `xml/` (hierarchy
//! dumps) and `records.json` (the ledger).

use std::env;
use std::path::{Path, PathBuf};

/// Socket directory with priority fallback. Empty env values are ignored.
pub fn get_socket_dir() -> PathBuf {
    if let Ok(dir) = env::var("TAPCAP_SOCKET_DIR") {
        if !dir.is_empty() {
            return PathBuf::from(dir);
        }
    }
    if let Ok(runtime_dir) = env::var("XDG_RUNTIME_DIR") {
        if !runtime_dir.is_empty() {
            return PathBuf::from(runtime_dir).join("tapcap");
        }
    }
    if let Some(home) = dirs::home_dir() {
        return home.join(".tapcap");
    }
    env::temp_dir().join("tapcap")
}

pub fn get_socket_path() -> PathBuf {
    get_socket_dir().join("tapcap.sock")
}

pub fn get_pid_path() -> PathBuf {
    get_socket_dir().join("tapcap.pid")
}

/// Output directory with priority fallback. Empty env values are ignored.
pub fn get_output_dir() -> PathBuf {
    if let Ok(dir) = env::var("TAPCAP_OUT_DIR") {
        if !dir.is_empty() {
            return PathBuf::from(dir);
        }
    }
    if let Some(data) = dirs::data_dir() {
        return data.join("tapcap");
    }
    if let Some(home) = dirs::home_dir() {
        return home.join(".tapcap").join("data");
    }
    env::temp_dir().join("tapcap")
}

pub fn image_dir(out_dir: &Path) -> PathBuf {
    out_dir.join("image")
}

pub fn xml_dir(out_dir: &Path) -> PathBuf {
    out_dir.join("xml")
}

pub fn records_path(out_dir: &Path) -> PathBuf {
    out_dir.join("records.json")
}

/// Ensure the output layout exists.
pub fn ensure_output_dirs(out_dir: &Path) -> std::io::Result<()> {
    std::fs::create_dir_all(image_dir(out_dir))?;
    std::fs::create_dir_all(xml_dir(out_dir))?;
    Ok(())
}

/// Ensure socket directory exists with owner-only permissions.
pub fn ensure_socket_dir() -> std::io::Result<()> {
    let dir = get_socket_dir();
    std::fs::create_dir_all(&dir)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&dir, std::fs::Permissions::from_mode(0o700))?;
    }

    Ok(())
}
