//! On-disk storage for tunnel configurations
//!
//! Configurations live as `<name>.conf` files in a single directory. The
//! file stem is the tunnel name, so the name validation rules double as
//! filesystem safety rules.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::StoreError;
use crate::model::{tunnel_name_is_valid, Config};
use crate::parser::from_wg_quick_with_unknown_encoding;

pub const CONFIG_FILE_SUFFIX: &str = ".conf";

/// Environment variable overriding the configuration directory.
pub const CONFIG_DIR_ENV: &str = "BURROW_CONFIG_DIR";

#[cfg(windows)]
const DEFAULT_CONFIG_DIR: &str = r"C:\ProgramData\Burrow\Configurations";
#[cfg(not(windows))]
const DEFAULT_CONFIG_DIR: &str = "/etc/burrow";

/// The directory holding tunnel configuration files.
pub fn tunnel_configurations_directory() -> PathBuf {
    env::var_os(CONFIG_DIR_ENV)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_DIR))
}

/// Derive the tunnel name from a configuration file path.
pub fn name_from_path(path: &Path) -> Result<String, StoreError> {
    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or(StoreError::InvalidPath)?;
    let name = file_name
        .strip_suffix(CONFIG_FILE_SUFFIX)
        .filter(|stem| !stem.is_empty())
        .ok_or_else(|| StoreError::BadSuffix {
            name: file_name.to_string(),
        })?;
    if !tunnel_name_is_valid(name) {
        return Err(StoreError::InvalidName(name.to_string()));
    }
    Ok(name.to_string())
}

/// List the names of all stored tunnel configurations.
pub fn list_config_names() -> Result<Vec<String>, StoreError> {
    let dir = tunnel_configurations_directory();
    let mut names = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        if let Ok(name) = name_from_path(&entry.path()) {
            names.push(name);
        }
    }
    names.sort();
    Ok(names)
}

/// Load and parse the configuration at `path`. The tunnel name is derived
/// from the file name; the bytes go through the unknown-encoding parser so
/// files saved by legacy editors still load.
pub fn load_from_path(path: &Path) -> Result<Config, StoreError> {
    let name = name_from_path(path)?;
    let bytes = fs::read(path)?;
    Ok(from_wg_quick_with_unknown_encoding(&bytes, &name)?)
}

/// Load the stored configuration for `name`.
pub fn load_from_name(name: &str) -> Result<Config, StoreError> {
    if !tunnel_name_is_valid(name) {
        return Err(StoreError::InvalidName(name.to_string()));
    }
    let path = tunnel_configurations_directory().join(format!("{name}{CONFIG_FILE_SUFFIX}"));
    if !path.exists() {
        return Err(StoreError::NotFound(name.to_string()));
    }
    load_from_path(&path)
}

impl Config {
    /// The path this configuration would be stored at.
    pub fn storage_path(&self) -> Result<PathBuf, StoreError> {
        if !tunnel_name_is_valid(&self.name) {
            return Err(StoreError::InvalidName(self.name.clone()));
        }
        Ok(tunnel_configurations_directory().join(format!("{}{CONFIG_FILE_SUFFIX}", self.name)))
    }

    /// Serialize and write this configuration to the store.
    pub fn save(&self, overwrite: bool) -> Result<(), StoreError> {
        let path = self.storage_path()?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        if !overwrite && path.exists() {
            return Err(StoreError::AlreadyExists(path.display().to_string()));
        }
        let text = self.to_wg_quick();
        write_restricted(&path, text.as_bytes())?;
        Ok(())
    }

    /// Remove this configuration from the store.
    pub fn delete(&self) -> Result<(), StoreError> {
        let path = self.storage_path()?;
        fs::remove_file(path)?;
        Ok(())
    }
}

#[cfg(unix)]
fn write_restricted(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    use std::io::Write;
    use std::os::unix::fs::OpenOptionsExt;

    let mut file = fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(path)?;
    file.write_all(bytes)
}

#[cfg(not(unix))]
fn write_restricted(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    // The configuration directory under ProgramData is ACL-restricted at
    // install time; per-file permissions are inherited.
    fs::write(path, bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_name_from_path() {
        assert_eq!(name_from_path(Path::new("/etc/burrow/office.conf")).unwrap(), "office");
        assert!(matches!(
            name_from_path(Path::new("/etc/burrow/office.txt")),
            Err(StoreError::BadSuffix { .. })
        ));
        assert!(matches!(
            name_from_path(Path::new("/etc/burrow/.conf")),
            Err(StoreError::BadSuffix { .. })
        ));
        assert!(matches!(
            name_from_path(Path::new("/etc/burrow/bad name.conf")),
            Err(StoreError::InvalidName(_))
        ));
    }

    #[test]
    fn test_default_config_dir() {
        let dir = tunnel_configurations_directory();
        assert!(!dir.as_os_str().is_empty());
    }
}
