//! Version information.

use std::sync::OnceLock;

/// Crate version.
#[must_use]
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

/// `--version` text: the version and the symbol ABI the shim resolves.
#[must_use]
pub fn long_version() -> &'static str {
    static LONG: OnceLock<String> = OnceLock::new();
    LONG.get_or_init(|| {
        format!(
            "{} ({} foreign symbols)",
            version(),
            poolkit_shim::SYMBOL_NAMES.len()
        )
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_not_empty() {
        assert!(!version().is_empty());
    }

    #[test]
    fn long_version_names_symbol_count() {
        assert!(long_version().starts_with(version()));
        assert!(long_version().ends_with("(20 foreign symbols)"));
    }
}
