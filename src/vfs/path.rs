//! Mount point handling.

use crate::error::{Error, Result};

/// A validated, normalised mount point.
///
/// The engine keys mounts by a path with a trailing slash (`/mnt/sd/`);
/// callers may pass either form.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MountPoint {
    components: Vec<String>,
}

impl MountPoint {
    /// Parse a mount point string.
    ///
    /// Mount points must be absolute (start with /).
    pub fn parse(path: &str) -> Result<Self> {
        if !path.starts_with('/') {
            return Err(Error::InvalidPath(format!(
                "Mount point must be absolute: {}",
                path
            )));
        }

        let components: Vec<String> = path
            .split('/')
            .filter(|s| !s.is_empty())
            .map(|s| s.to_string())
            .collect();

        for component in &components {
            if component == "." || component == ".." {
                return Err(Error::InvalidPath(format!(
                    "Invalid path component: {}",
                    component
                )));
            }
        }

        Ok(Self { components })
    }

    /// Check if this is the root path.
    pub fn is_root(&self) -> bool {
        self.components.is_empty()
    }

    /// Path without the trailing slash (`/mnt/sd`, or `/` for root).
    pub fn as_dir(&self) -> String {
        if self.is_root() {
            "/".to_string()
        } else {
            format!("/{}", self.components.join("/"))
        }
    }

    /// Path with the trailing slash the engine expects (`/mnt/sd/`).
    pub fn engine_key(&self) -> String {
        if self.is_root() {
            "/".to_string()
        } else {
            format!("{}/", self.as_dir())
        }
    }

    /// Whether `path` lies inside this mount.
    pub fn contains(&self, path: &str) -> bool {
        match MountPoint::parse(path) {
            Ok(other) => other.components.starts_with(&self.components),
            Err(_) => false,
        }
    }
}

impl std::fmt::Display for MountPoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_dir())
    }
}
