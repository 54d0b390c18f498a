//! Centralized path functions for hudcache storage locations.

use std::path::PathBuf;

/// App cache root: `~/Library/Caches/hudcache/` (macOS) or `~/.cache/hudcache/` (Linux).
pub fn app_cache_dir() -> Option<PathBuf> {
    dirs::cache_dir().map(|d| d.join("hudcache"))
}

/// SQLite database file: `<app_cache_dir>/hudcache.db`.
pub fn db_path() -> Option<PathBuf> {
    app_cache_dir().map(|d| d.join("hudcache.db"))
}

/// Config file: `~/.config/hudcache/hudcache.toml` (Linux).
pub fn config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join("hudcache").join("hudcache.toml"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_db_path_lives_under_cache_dir() {
        if let (Some(root), Some(db)) = (app_cache_dir(), db_path()) {
            assert!(db.starts_with(&root));
            assert!(db.to_string_lossy().ends_with("hudcache.db"));
        }
    }
}
