//! Path utilities for consistent directory management across Meridian
//!
//! This module provides the standard locations for cache data and the
//! durable queue used for CRITICAL messages.

use std::env;
use std::path::{Path, PathBuf};

/// Default cache directory name relative to user home
const CACHE_DIR_NAME: &str = ".cache/meridian";

/// Durable queue directory name inside the cache directory
const DURABLE_QUEUE_DIR_NAME: &str = "critical-queue";

/// Get the default cache directory path
///
/// Returns `$HOME/.cache/meridian` on Unix systems, or equivalent on other
/// platforms.
pub fn default_cache_dir() -> PathBuf {
    get_home_dir().join(CACHE_DIR_NAME)
}

/// Get the default durable queue directory
///
/// Returns `$HOME/.cache/meridian/critical-queue`.
///
/// # Examples
///
/// ```
/// use meridian_shared::default_durable_queue_dir;
///
/// let queue_dir = default_durable_queue_dir();
/// assert!(queue_dir.ends_with("critical-queue"));
/// ```
pub fn default_durable_queue_dir() -> PathBuf {
    default_cache_dir().join(DURABLE_QUEUE_DIR_NAME)
}

/// Get the user's home directory
///
/// Falls back to current directory if HOME cannot be determined.
fn get_home_dir() -> PathBuf {
    if let Ok(home) = env::var("HOME") {
        PathBuf::from(home)
    } else if let Some(home_dir) = dirs::home_dir() {
        home_dir
    } else {
        PathBuf::from(".")
    }
}

/// Expand a path that starts with `~` to use the user's home directory
///
/// # Examples
///
/// ```
/// use meridian_shared::expand_home_dir;
///
/// let path = expand_home_dir("~/meridian/queue");
/// assert!(!path.to_string_lossy().starts_with('~'));
/// ```
pub fn expand_home_dir<P: AsRef<Path>>(path: P) -> PathBuf {
    let path = path.as_ref();
    if let Some(path_str) = path.to_str() {
        if let Some(stripped) = path_str.strip_prefix("~/") {
            return get_home_dir().join(stripped);
        } else if path_str == "~" {
            return get_home_dir();
        }
    }
    path.to_path_buf()
}
