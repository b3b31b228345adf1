//! Version information of the current pianola build
//!
//! A little more than the bare version string, so bug reports carry the
//! build date alongside the package version.

/// Package version plus build date
pub struct Version {
    /// Version of the package, reported in Cargo.toml
    pkg_version: &'static str,

    /// Local date of the binary build
    date: &'static str,
}

impl Default for Version {
    fn default() -> Self {
        Self {
            pkg_version: env!("CARGO_PKG_VERSION"),
            date: build_time::build_time_local!("%Y-%m-%d %H:%M"),
        }
    }
}

/// Pretty print version information in the terminal
impl std::fmt::Display for Version {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let Self { pkg_version, date } = self;
        write!(f, "{pkg_version} ({date})")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_renders_package_and_date() {
        let rendered = format!("{}", Version::default());
        assert!(rendered.starts_with(env!("CARGO_PKG_VERSION")));
        assert!(rendered.contains('('));
    }
}
