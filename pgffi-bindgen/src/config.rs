//LICENSE Portions Copyright 2019-2021 ZomboDB, LLC.
//LICENSE
//LICENSE Portions Copyright 2021-2023 Technology Concepts & Design, Inc.
//LICENSE
//LICENSE Portions Copyright 2023-2023 PgCentral Foundation, Inc. <contact@pgcentral.org>
//LICENSE
//LICENSE All rights reserved.
//LICENSE
//LICENSE Use of this source code is governed by the MIT license that can be found in the LICENSE file.
//! `pgffi.toml`, the generation config.
use crate::emit::rules::{FilterRule, RuleError, RuleSet, RuleSpec};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

pub const CONFIG_FILE_NAME: &str = "pgffi.toml";

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GenerateConfig {
    /// Passed to libclang for every platform
    #[serde(default)]
    pub clang_args: Vec<String>,
    /// `-D` definitions; an empty value defines the name with no value
    #[serde(default)]
    pub defines: BTreeMap<String, String>,
    #[serde(default)]
    pub include_system_headers: bool,
    /// Directory of extra `pgNN.h` manifests
    #[serde(default)]
    pub manifest_dir: Option<PathBuf>,
    #[serde(default, rename = "platform")]
    pub platforms: Vec<Platform>,
    #[serde(default, rename = "rule")]
    pub rules: Vec<RuleSpec>,
}

/// One target the header closure is parsed for.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Platform {
    pub name: String,
    /// A Rust `cfg` predicate, e.g. `all(target_os = "linux", target_arch = "x86_64")`
    pub cfg: String,
    #[serde(default)]
    pub clang_args: Vec<String>,
}

impl Platform {
    /// The platform used when none are configured: whatever libclang targets by default.
    pub fn host() -> Self {
        Platform { name: "host".into(), cfg: "all()".into(), clang_args: Vec::new() }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read `{0}`")]
    Io(PathBuf, #[source] std::io::Error),
    #[error("cannot parse `{0}`")]
    Toml(PathBuf, #[source] toml::de::Error),
    #[error(transparent)]
    Rule(#[from] RuleError),
    #[error("platform `{0}` is listed twice")]
    DuplicatePlatform(String),
    #[error("platform `{0}` has a cfg predicate that is not valid Rust: `{1}`")]
    PlatformCfg(String, String),
}

impl GenerateConfig {
    pub fn from_toml_file(path: &Path) -> Result<Self, ConfigError> {
        let contents =
            std::fs::read_to_string(path).map_err(|e| ConfigError::Io(path.to_path_buf(), e))?;
        let mut config = Self::from_toml_str(&contents)
            .map_err(|e| match e {
                ConfigError::Toml(_, source) => ConfigError::Toml(path.to_path_buf(), source),
                other => other,
            })?;
        // relative manifest dirs are relative to the config file
        if let (Some(dir), Some(parent)) = (config.manifest_dir.as_mut(), path.parent()) {
            if dir.is_relative() {
                *dir = parent.join(&*dir);
            }
        }
        Ok(config)
    }

    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        let config: GenerateConfig =
            toml::from_str(contents).map_err(|e| ConfigError::Toml(PathBuf::new(), e))?;
        config.validate()?;
        Ok(config)
    }

    /// `pgffi.toml` in `dir` if there is one, else the defaults.
    pub fn discover(dir: &Path) -> Result<Self, ConfigError> {
        let path = dir.join(CONFIG_FILE_NAME);
        if path.is_file() {
            tracing::debug!(config = %path.display(), "using generation config");
            Self::from_toml_file(&path)
        } else {
            Ok(Self::default())
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let mut seen = std::collections::BTreeSet::new();
        for platform in &self.platforms {
            if !seen.insert(platform.name.as_str()) {
                return Err(ConfigError::DuplicatePlatform(platform.name.clone()));
            }
            if syn::parse_str::<syn::Meta>(&platform.cfg).is_err() {
                return Err(ConfigError::PlatformCfg(platform.name.clone(), platform.cfg.clone()));
            }
        }
        Ok(())
    }

    pub fn rule_set(&self) -> Result<RuleSet, ConfigError> {
        Ok(self
            .rules
            .iter()
            .cloned()
            .map(FilterRule::try_from)
            .collect::<Result<RuleSet, _>>()?)
    }

    /// The configured platforms, or the single host platform.
    pub fn platforms(&self) -> Vec<Platform> {
        if self.platforms.is_empty() {
            vec![Platform::host()]
        } else {
            self.platforms.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::emit::rules::Decision;
    use crate::ir::SymbolKind;

    const SAMPLE: &str = r#"
clang_args = ["-Wno-everything"]
include_system_headers = false

[defines]
PGFFI_GENERATING = "1"
EMPTY = ""

[[platform]]
name = "linux-x86_64"
cfg = 'all(target_os = "linux", target_arch = "x86_64")'
clang_args = ["--target=x86_64-unknown-linux-gnu"]

[[platform]]
name = "windows"
cfg = "windows"
clang_args = ["--target=x86_64-pc-windows-msvc"]

[[rule]]
pattern = "pg_re_throw"
action = "deny"

[[rule]]
pattern = "Node"
action = "opaque"
kinds = ["struct"]
"#;

    #[test]
    fn parses_full_config() {
        let config = GenerateConfig::from_toml_str(SAMPLE).unwrap();
        assert_eq!(config.clang_args, ["-Wno-everything"]);
        assert_eq!(config.defines.get("EMPTY").map(String::as_str), Some(""));
        assert_eq!(config.platforms().len(), 2);
        assert_eq!(config.platforms()[1].name, "windows");
        let rules = config.rule_set().unwrap();
        assert_eq!(rules.decide("pg_re_throw", SymbolKind::Function), Decision::Deny);
        assert_eq!(rules.decide("Node", SymbolKind::Struct), Decision::Opaque);
    }

    #[test]
    fn defaults_to_host_platform() {
        let config = GenerateConfig::from_toml_str("").unwrap();
        assert_eq!(config.platforms(), vec![Platform::host()]);
        assert!(config.rule_set().unwrap().is_empty());
    }

    #[test]
    fn rejects_unknown_keys_and_bad_platforms() {
        assert!(matches!(
            GenerateConfig::from_toml_str("clang_argz = []"),
            Err(ConfigError::Toml(..))
        ));
        let dup = "[[platform]]\nname = \"a\"\ncfg = \"unix\"\n[[platform]]\nname = \"a\"\ncfg = \"windows\"\n";
        assert!(matches!(
            GenerateConfig::from_toml_str(dup),
            Err(ConfigError::DuplicatePlatform(p)) if p == "a"
        ));
        let bad = "[[platform]]\nname = \"a\"\ncfg = \"target_os = \"\n";
        assert!(matches!(GenerateConfig::from_toml_str(bad), Err(ConfigError::PlatformCfg(..))));
    }

    #[test]
    fn discover_reads_pgffi_toml() {
        let dir = tempfile::tempdir().unwrap();
        assert!(GenerateConfig::discover(dir.path()).unwrap().platforms.is_empty());
        std::fs::write(dir.path().join(CONFIG_FILE_NAME), "manifest_dir = \"manifests\"\n").unwrap();
        let config = GenerateConfig::discover(dir.path()).unwrap();
        assert_eq!(config.manifest_dir, Some(dir.path().join("manifests")));
    }
}
