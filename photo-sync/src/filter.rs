//! Photo file filtering using globset

use std::path::Path;

use globset::{GlobBuilder, GlobSet, GlobSetBuilder};

use crate::error::{Result, SyncError};

/// Extensions treated as photos when no explicit list is configured
pub const DEFAULT_PHOTO_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "tiff", "tif", "bmp", "webp"];

/// Extension allow-list plus exclude globs, always matched case-insensitively
#[derive(Debug, Clone)]
pub struct PhotoFilter {
    include_set: GlobSet,
    exclude_set: Option<GlobSet>,
}

impl PhotoFilter {
    /// Build a filter from an extension list (with or without the leading dot)
    /// and optional exclude patterns.
    pub fn new<S: AsRef<str>>(extensions: &[S], exclude_patterns: &[S]) -> Result<Self> {
        if extensions.is_empty() {
            return Err(SyncError::FilterPattern(
                "At least one photo extension is required".to_string(),
            ));
        }

        let include_patterns: Vec<String> = extensions
            .iter()
            .map(|ext| {
                let ext = ext.as_ref().trim_start_matches('.');
                format!("**/*.{}", ext)
            })
            .collect();

        let include_set = Self::build_globset(&include_patterns)?;

        let exclude_set = if exclude_patterns.is_empty() {
            None
        } else {
            let patterns: Vec<String> = exclude_patterns
                .iter()
                .map(|p| p.as_ref().to_string())
                .collect();
            Some(Self::build_globset(&patterns)?)
        };

        Ok(Self {
            include_set,
            exclude_set,
        })
    }

    /// Filter for the default photo extensions with no excludes
    pub fn photos() -> Result<Self> {
        let no_excludes: &[&str] = &[];
        Self::new(DEFAULT_PHOTO_EXTENSIONS, no_excludes)
    }

    /// Check a path relative to the photo directory.
    ///
    /// Hidden entries anywhere in the relative path are rejected so editor
    /// scratch files and thumbnail caches never reach the queue.
    pub fn matches(&self, relative_path: &Path) -> bool {
        if is_hidden(relative_path) {
            return false;
        }

        if !self.include_set.is_match(relative_path) {
            return false;
        }

        if let Some(exclude_set) = &self.exclude_set {
            if exclude_set.is_match(relative_path) {
                return false;
            }
        }

        true
    }

    fn build_globset(patterns: &[String]) -> Result<GlobSet> {
        let mut builder = GlobSetBuilder::new();

        for pattern in patterns {
            let glob = GlobBuilder::new(pattern)
                .case_insensitive(true)
                .build()
                .map_err(|e| {
                    SyncError::FilterPattern(format!("Failed to compile glob '{}': {}", pattern, e))
                })?;

            builder.add(glob);
        }

        builder.build().map_err(|e| {
            SyncError::FilterPattern(format!("Failed to build globset: {}", e))
        })
    }
}

fn is_hidden(path: &Path) -> bool {
    path.components().any(|component| {
        component
            .as_os_str()
            .to_str()
            .map(|s| s.starts_with('.') && s != "." && s != "..")
            .unwrap_or(false)
    })
}
