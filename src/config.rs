use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Environment variable pointing directly at the sourcekitd library.
pub const SOURCEKITD_ENV: &str = "SOURCEKITD_PATH";

/// Environment variable pointing at a Swift toolchain root.
pub const TOOLCHAIN_ENV: &str = "SOURCEKIT_TOOLCHAIN_PATH";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("sourcekitd library not found at '{path}'")]
    LibraryNotFound { path: String },
    #[error(
        "could not locate sourcekitd; pass --sourcekitd, or set {SOURCEKITD_ENV} or {TOOLCHAIN_ENV}"
    )]
    NoLibrary,
    #[error("failed to parse initialization options: {source}")]
    InitOptions {
        #[source]
        source: serde_json::Error,
    },
}

/// Server configuration, merged from CLI flags and the client's
/// `initializationOptions`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Config {
    /// Path to the sourcekitd dynamic library.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sourcekitd: Option<PathBuf>,

    /// URI schemes treated as read-only shadows: documents may be opened but
    /// diagnostics are never published for them.
    #[serde(default = "default_excluded_schemes")]
    pub excluded_schemes: Vec<String>,
}

fn default_excluded_schemes() -> Vec<String> {
    vec!["git".to_string(), "hg".to_string()]
}

impl Default for Config {
    fn default() -> Self {
        Self {
            sourcekitd: None,
            excluded_schemes: default_excluded_schemes(),
        }
    }
}

impl Config {
    /// Parse the client's `initializationOptions` payload, falling back to
    /// defaults when absent.
    pub fn from_initialization_options(
        options: Option<&serde_json::Value>,
    ) -> Result<Self, ConfigError> {
        match options {
            Some(value) => serde_json::from_value(value.clone())
                .map_err(|source| ConfigError::InitOptions { source }),
            None => Ok(Self::default()),
        }
    }

    pub fn is_excluded_scheme(&self, scheme: &str) -> bool {
        self.excluded_schemes.iter().any(|s| s == scheme)
    }
}

/// Library file names relative to a toolchain root, in probe order.
#[cfg(target_os = "macos")]
const TOOLCHAIN_RELATIVE: &[&str] = &[
    "usr/lib/sourcekitd.framework/sourcekitd",
    "usr/lib/sourcekitdInProc.framework/sourcekitdInProc",
];
#[cfg(not(target_os = "macos"))]
const TOOLCHAIN_RELATIVE: &[&str] = &["usr/lib/libsourcekitdInProc.so"];

/// Well-known install locations probed when nothing is configured.
#[cfg(target_os = "macos")]
const DEFAULT_TOOLCHAINS: &[&str] = &[
    "/Applications/Xcode.app/Contents/Developer/Toolchains/XcodeDefault.xctoolchain",
    "/Library/Developer/CommandLineTools",
];
#[cfg(not(target_os = "macos"))]
const DEFAULT_TOOLCHAINS: &[&str] = &["/usr", "/usr/local/swift"];

/// Resolve the sourcekitd dylib path: explicit flag/config first, then the
/// environment, then well-known toolchain locations.
pub fn resolve_dylib_path(explicit: Option<&Path>) -> Result<PathBuf, ConfigError> {
    if let Some(path) = explicit {
        if path.exists() {
            return Ok(path.to_path_buf());
        }
        return Err(ConfigError::LibraryNotFound {
            path: path.display().to_string(),
        });
    }

    if let Ok(path) = std::env::var(SOURCEKITD_ENV) {
        let path = PathBuf::from(path);
        if path.exists() {
            return Ok(path);
        }
        return Err(ConfigError::LibraryNotFound {
            path: path.display().to_string(),
        });
    }

    let toolchains: Vec<PathBuf> = std::env::var(TOOLCHAIN_ENV)
        .map(|t| vec![PathBuf::from(t)])
        .unwrap_or_else(|_| DEFAULT_TOOLCHAINS.iter().map(PathBuf::from).collect());

    for toolchain in &toolchains {
        for relative in TOOLCHAIN_RELATIVE {
            let candidate = toolchain.join(relative);
            if candidate.exists() {
                return Ok(candidate);
            }
        }
    }

    Err(ConfigError::NoLibrary)
}
