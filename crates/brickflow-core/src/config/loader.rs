//! Multi-file configuration loading.

use std::path::Path;

use snafu::ResultExt;

use crate::config::{ConfigPath, interpolate, is_yaml_file};
use crate::error::{ConfigError, ReadDirSnafu, ReadFileSnafu};

/// Configs that can be assembled from several files.
///
/// Each file is parsed on its own, then folded into the running config with
/// [`Mergeable::merge`]. Implementations reject duplicate declarations there.
pub trait Mergeable: Sized + Default {
    /// Parse one interpolated YAML document.
    fn parse_yaml(contents: &str) -> Result<Self, ConfigError>;

    /// Fold `other` into `self`.
    fn merge(&mut self, other: Self) -> Result<(), ConfigError>;
}

/// Load and merge every configuration source, in order.
///
/// Errors from individual files are collected so a single run reports all of
/// them.
pub fn load_from_paths<C: Mergeable>(paths: &[ConfigPath]) -> Result<C, ConfigError> {
    let mut config = C::default();
    let mut errors = Vec::new();

    for source in paths {
        let loaded = match source {
            ConfigPath::File(path) => load_file::<C>(path),
            ConfigPath::Dir(path) => load_dir::<C>(path),
        };
        if let Err(e) = loaded.and_then(|partial| config.merge(partial)) {
            errors.push(format!("{}: {}", source.path().display(), e));
        }
    }

    if !errors.is_empty() {
        return Err(ConfigError::MultipleErrors { errors });
    }
    Ok(config)
}

fn load_file<C: Mergeable>(path: &Path) -> Result<C, ConfigError> {
    if !is_yaml_file(path) {
        return Err(ConfigError::UnsupportedFormat {
            path: path.to_path_buf(),
        });
    }

    let contents = std::fs::read_to_string(path).context(ReadFileSnafu { path })?;

    let result = interpolate(&contents);
    if !result.is_ok() {
        return Err(ConfigError::EnvInterpolation {
            message: result.errors.join("\n"),
        });
    }

    C::parse_yaml(&result.text)
}

fn load_dir<C: Mergeable>(dir: &Path) -> Result<C, ConfigError> {
    let mut files: Vec<_> = std::fs::read_dir(dir)
        .context(ReadDirSnafu { path: dir })?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| path.is_file() && is_yaml_file(path))
        .collect();
    files.sort();

    let mut config = C::default();
    let mut errors = Vec::new();
    for path in files {
        if let Err(e) = load_file::<C>(&path).and_then(|partial| config.merge(partial)) {
            errors.push(format!("{}: {}", path.display(), e));
        }
    }

    if !errors.is_empty() {
        return Err(ConfigError::MultipleErrors { errors });
    }
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use std::fs;
    use tempfile::TempDir;

    #[derive(Debug, Default, Deserialize)]
    struct Names {
        #[serde(default)]
        names: Vec<String>,
    }

    impl Mergeable for Names {
        fn parse_yaml(contents: &str) -> Result<Self, ConfigError> {
            serde_yaml::from_str(contents).context(crate::error::YamlParseSnafu)
        }

        fn merge(&mut self, other: Self) -> Result<(), ConfigError> {
            let dupes: Vec<String> = other
                .names
                .iter()
                .filter(|n| self.names.contains(n))
                .cloned()
                .collect();
            if !dupes.is_empty() {
                return Err(ConfigError::DuplicateFlows { names: dupes });
            }
            self.names.extend(other.names);
            Ok(())
        }
    }

    #[test]
    fn test_load_files_and_dirs_in_order() {
        let tmp = TempDir::new().unwrap();
        let dir = tmp.path().join("conf.d");
        fs::create_dir(&dir).unwrap();
        fs::write(tmp.path().join("main.yaml"), "names: [a]").unwrap();
        fs::write(dir.join("20-c.yml"), "names: [c]").unwrap();
        fs::write(dir.join("10-b.yaml"), "names: [b]").unwrap();
        fs::write(dir.join("notes.txt"), "ignored").unwrap();

        let config: Names = load_from_paths(&[
            ConfigPath::file(tmp.path().join("main.yaml")),
            ConfigPath::dir(&dir),
        ])
        .unwrap();

        assert_eq!(config.names, vec!["a", "b", "c"]);
    }

    #[test]
    fn test_duplicates_across_files_are_reported() {
        let tmp = TempDir::new().unwrap();
        fs::write(tmp.path().join("one.yaml"), "names: [a]").unwrap();
        fs::write(tmp.path().join("two.yaml"), "names: [a]").unwrap();

        let err = load_from_paths::<Names>(&[
            ConfigPath::file(tmp.path().join("one.yaml")),
            ConfigPath::file(tmp.path().join("two.yaml")),
        ])
        .unwrap_err();

        assert!(err.to_string().contains("Duplicate flow names: a"));
    }

    #[test]
    fn test_rejects_non_yaml_and_missing_files() {
        let tmp = TempDir::new().unwrap();
        let toml = tmp.path().join("flows.toml");
        fs::write(&toml, "names = []").unwrap();

        let err = load_from_paths::<Names>(&[
            ConfigPath::file(&toml),
            ConfigPath::file(tmp.path().join("missing.yaml")),
        ])
        .unwrap_err();

        match err {
            ConfigError::MultipleErrors { errors } => {
                assert_eq!(errors.len(), 2);
                assert!(errors[0].contains("only .yaml/.yml supported"));
                assert!(errors[1].contains("Failed to read configuration file"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }
}
