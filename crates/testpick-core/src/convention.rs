//! Spec naming convention: which files are specs, which sources need one, and where it lives.

use std::path::{Path, PathBuf};

/// Basenames that never get a companion spec.
pub const SKIP_BASENAMES: &[&str] = &[
    "index.ts",
    "public-api.ts",
    "test.ts",
    "test-setup.ts",
    "main.ts",
];

/// Suffixes for files presumed to carry no independently testable logic.
pub const SKIP_SUFFIXES: &[&str] = &[
    // Angular/Nx wiring
    ".module.ts",
    ".routes.ts",
    ".imports.ts",
    ".providers.ts",
    // Configuration
    ".config.ts",
    ".const.ts",
    ".consts.ts",
    ".constant.ts",
    ".constants.ts",
    // Type definitions
    ".model.ts",
    ".models.ts",
    ".interface.ts",
    ".interfaces.ts",
    ".type.ts",
    ".types.ts",
    ".enum.ts",
    ".enums.ts",
    // Test helpers
    ".mock.ts",
    ".mocks.ts",
    ".stub.ts",
    ".stubs.ts",
    ".token.ts",
    ".tokens.ts",
    // Barrels with a prefix, e.g. public-api.index.ts
    ".index.ts",
];

/// The `foo.ts` ↔ `foo.spec.ts` convention.
#[derive(Debug, Clone)]
pub struct SpecConvention {
    source_ext: &'static str,
    spec_ext: &'static str,
}

impl Default for SpecConvention {
    fn default() -> Self {
        Self::typescript()
    }
}

impl SpecConvention {
    pub fn typescript() -> Self {
        Self {
            source_ext: ".ts",
            spec_ext: ".spec.ts",
        }
    }

    /// Whether `path` is itself a spec file.
    pub fn is_spec(&self, path: &Path) -> bool {
        file_name(path).is_some_and(|name| name.ends_with(self.spec_ext))
    }

    /// Whether a changed `path` is a source file that should have a companion spec.
    pub fn should_derive_spec(&self, path: &Path) -> bool {
        let Some(name) = file_name(path) else {
            return false;
        };
        if !name.ends_with(self.source_ext) || name.ends_with(self.spec_ext) {
            return false;
        }
        if SKIP_BASENAMES.contains(&name) {
            return false;
        }
        if SKIP_SUFFIXES.iter().any(|s| name.ends_with(s)) {
            return false;
        }
        // environment.ts, environment.prod.ts, app.environment.ts
        if name.starts_with("environment.") || name.contains(".environment.") {
            return false;
        }
        true
    }

    /// Expected spec location for a source file: same directory, `.ts` → `.spec.ts`.
    pub fn derive_spec_path(&self, source: &Path) -> PathBuf {
        let Some(name) = file_name(source) else {
            return source.to_path_buf();
        };
        let stem = name.strip_suffix(self.source_ext).unwrap_or(name);
        source.with_file_name(format!("{stem}{}", self.spec_ext))
    }
}

fn file_name(path: &Path) -> Option<&str> {
    path.file_name().and_then(|n| n.to_str())
}
