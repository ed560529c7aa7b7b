//LICENSE Portions Copyright 2019-2021 ZomboDB, LLC.
//LICENSE
//LICENSE Portions Copyright 2021-2023 Technology Concepts & Design, Inc.
//LICENSE
//LICENSE Portions Copyright 2023-2023 PgCentral Foundation, Inc. <contact@pgcentral.org>
//LICENSE
//LICENSE All rights reserved.
//LICENSE
//LICENSE Use of this source code is governed by the MIT license that can be found in the LICENSE file.
//! Wrapper around Postgres' `pg_config` command-line tool, plus the table of
//! Postgres installations `pgffi` generates bindings against.
use eyre::{eyre, WrapErr};
use owo_colors::OwoColorize;
use serde_derive::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::ffi::OsString;
use std::fmt::{self, Display, Formatter};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::str::FromStr;

/// Postgres major versions `pgffi` ships header sets for.
pub const SUPPORTED_VERSIONS: &[u16] = &[12, 13, 14, 15, 16, 17];

pub fn is_supported_major_version(major: u16) -> bool {
    SUPPORTED_VERSIONS.contains(&major)
}

/// Parses `16`, `pg16` or `PG16` into a major version number.
pub fn parse_major_version(label: &str) -> Option<u16> {
    let label = label.trim();
    let digits = label
        .strip_prefix("pg")
        .or_else(|| label.strip_prefix("PG"))
        .unwrap_or(label);
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    u16::from_str(digits).ok()
}

#[derive(Debug, thiserror::Error)]
pub enum PgffiHomeError {
    #[error("You don't seem to have a home directory")]
    NoHomeDirectory,
    // allow caller to decide whether it is safe to enumerate paths
    #[error("$PGFFI_HOME does not exist")]
    MissingPgffiHome(PathBuf),
    #[error(transparent)]
    IoError(#[from] std::io::Error),
}

#[derive(Clone, Debug)]
pub struct PgConfig {
    pg_config: Option<PathBuf>,
    known_props: Option<HashMap<String, String>>,
}

impl Display for PgConfig {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match (&self.pg_config, self.major_version()) {
            (Some(path), Ok(major)) => write!(f, "pg{}={}", major, path.display()),
            (None, Ok(major)) => write!(f, "pg{major}=<environment>"),
            (_, Err(_)) => write!(f, "<unknown pg_config>"),
        }
    }
}

impl PgConfig {
    pub fn new(pg_config: PathBuf) -> Self {
        PgConfig { pg_config: Some(pg_config), known_props: None }
    }

    /// Locate `pg_config` on the `$PATH`.
    pub fn from_path() -> Self {
        let path =
            pathsearch::find_executable_in_path("pg_config").unwrap_or_else(|| "pg_config".into());
        Self::new(path)
    }

    /// A `PgConfig` that never runs a `pg_config` binary: every property is
    /// supplied up front.  Used for cross-generation against a bare header tree.
    pub fn from_parts(
        major: u16,
        minor: u16,
        includedir_server: impl AsRef<Path>,
        cppflags: impl Into<String>,
    ) -> Self {
        let mut props = HashMap::new();
        props.insert("--version".to_string(), format!("PostgreSQL {major}.{minor}"));
        props.insert(
            "--includedir-server".to_string(),
            includedir_server.as_ref().display().to_string(),
        );
        props.insert("--cppflags".to_string(), cppflags.into());
        PgConfig { pg_config: None, known_props: Some(props) }
    }

    /// Build a `PgConfig` from `PGFFI_*` environment variables when
    /// `PGFFI_PG_CONFIG_AS_ENV=true`.
    pub fn from_env() -> eyre::Result<Self> {
        if std::env::var("PGFFI_PG_CONFIG_AS_ENV").as_deref() != Ok("true") {
            return Err(eyre!("`PGFFI_PG_CONFIG_AS_ENV` is not set to `true`"));
        }
        let var = |name: &str| {
            std::env::var(name).wrap_err_with(|| format!("`{name}` must be set"))
        };
        let major = u16::from_str(&var("PGFFI_PG_MAJOR_VERSION")?)
            .wrap_err("`PGFFI_PG_MAJOR_VERSION` is not a number")?;
        let minor = std::env::var("PGFFI_PG_MINOR_VERSION")
            .ok()
            .and_then(|v| u16::from_str(&v).ok())
            .unwrap_or(0);
        let includedir = var("PGFFI_INCLUDEDIR_SERVER")?;
        let cppflags = std::env::var("PGFFI_CPPFLAGS").unwrap_or_default();
        Ok(Self::from_parts(major, minor, includedir, cppflags))
    }

    pub fn label(&self) -> eyre::Result<String> {
        Ok(format!("pg{}", self.major_version()?))
    }

    pub fn path(&self) -> Option<PathBuf> {
        self.pg_config.clone()
    }

    fn parse_version_str(version_str: &str) -> eyre::Result<(u16, u16)> {
        let version_parts = version_str.split_whitespace().collect::<Vec<&str>>();
        let version = version_parts
            .get(1)
            .ok_or_else(|| eyre!("invalid version string: {}", version_str))?
            .split('.')
            .collect::<Vec<&str>>();
        if version.len() < 2 {
            return Err(eyre!("invalid version string: {}", version_str));
        }
        let major = u16::from_str(version[0])
            .map_err(|e| eyre!("invalid major version number `{}`: {:?}", version[0], e))?;
        let mut minor = version[1];
        let mut end_index = minor.len();
        for (i, c) in minor.chars().enumerate() {
            if !c.is_ascii_digit() {
                end_index = i;
                break;
            }
        }
        minor = &minor[0..end_index];
        let minor = u16::from_str(minor)
            .map_err(|e| eyre!("invalid minor version number `{}`: {:?}", minor, e))?;
        Ok((major, minor))
    }

    fn get_version(&self) -> eyre::Result<(u16, u16)> {
        let version_string = self.run("--version")?;
        Self::parse_version_str(&version_string)
    }

    pub fn major_version(&self) -> eyre::Result<u16> {
        Ok(self.get_version()?.0)
    }

    pub fn minor_version(&self) -> eyre::Result<u16> {
        Ok(self.get_version()?.1)
    }

    pub fn includedir_server(&self) -> eyre::Result<PathBuf> {
        Ok(self.run("--includedir-server")?.into())
    }

    pub fn cppflags(&self) -> eyre::Result<OsString> {
        Ok(self.run("--cppflags")?.into())
    }

    fn run(&self, arg: &str) -> eyre::Result<String> {
        if let Some(value) = self.known_props.as_ref().and_then(|props| props.get(arg)) {
            return Ok(value.clone());
        }

        let pg_config = self.pg_config.clone().unwrap_or_else(|| {
            std::env::var("PG_CONFIG").unwrap_or_else(|_| "pg_config".to_string()).into()
        });

        tracing::trace!(pg_config = %pg_config.display(), arg, "running pg_config");
        match Command::new(&pg_config).arg(arg).output() {
            Ok(output) if output.status.success() => {
                Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
            }
            Ok(output) => Err(eyre!(
                "`{} {}` exited with {}: {}",
                pg_config.display(),
                arg,
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )),
            Err(e) => match e.kind() {
                ErrorKind::NotFound => Err(e).wrap_err_with(|| {
                    format!("Unable to find `{}` on the system $PATH", "pg_config".yellow())
                }),
                _ => Err(e.into()),
            },
        }
    }
}

#[derive(Debug, Default)]
pub struct Pgffi {
    pg_configs: Vec<PgConfig>,
}

#[derive(Debug, Serialize, Deserialize)]
struct ConfigToml {
    configs: BTreeMap<String, PathBuf>,
}

impl Pgffi {
    pub fn from_config() -> eyre::Result<Self> {
        match std::env::var("PGFFI_PG_CONFIG_PATH") {
            Ok(pg_config) => {
                // we have an environment variable that tells us the pg_config to use
                let mut pgffi = Pgffi::default();
                pgffi.push(PgConfig::new(pg_config.into()));
                Ok(pgffi)
            }
            Err(_) => {
                let path = Pgffi::config_toml()?;
                if !path.exists() {
                    return Err(eyre!(
                        "{} not found.  Point `{}` at a pg_config or list installs in it",
                        path.display(),
                        "PGFFI_PG_CONFIG_PATH".bold().yellow()
                    ));
                }
                Self::from_toml_file(&path)
            }
        }
    }

    pub fn from_toml_file(path: &Path) -> eyre::Result<Self> {
        let contents = std::fs::read_to_string(path)
            .wrap_err_with(|| format!("Could not read `{}`", path.display()))?;
        let configs = toml::from_str::<ConfigToml>(&contents)
            .wrap_err_with(|| format!("Could not parse `{}`", path.display()))?;

        let mut pgffi = Pgffi::default();
        for (_, v) in configs.configs {
            pgffi.push(PgConfig::new(v));
        }
        Ok(pgffi)
    }

    pub fn push(&mut self, pg_config: PgConfig) {
        self.pg_configs.push(pg_config);
    }

    pub fn get(&self, label: &str) -> eyre::Result<&PgConfig> {
        for pg_config in self.pg_configs.iter() {
            if pg_config.label()? == label {
                return Ok(pg_config);
            }
        }
        Err(eyre!("Postgres `{}` is not managed by pgffi", label))
    }

    pub fn home() -> Result<PathBuf, PgffiHomeError> {
        let pgffi_home = std::env::var("PGFFI_HOME").map_or_else(
            |_| {
                let mut pgffi_home = match home::home_dir() {
                    Some(home) => home,
                    None => return Err(PgffiHomeError::NoHomeDirectory),
                };

                pgffi_home.push(".pgffi");
                Ok(pgffi_home)
            },
            |v| Ok(v.into()),
        )?;

        match pgffi_home.try_exists() {
            Ok(true) => Ok(pgffi_home),
            Ok(false) => Err(PgffiHomeError::MissingPgffiHome(pgffi_home)),
            Err(e) => Err(PgffiHomeError::IoError(e)),
        }
    }

    pub fn config_toml() -> Result<PathBuf, PgffiHomeError> {
        let mut path = Pgffi::home()?;
        path.push("config.toml");
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_version() {
        // Check some valid version strings
        let versions = [
            ("PostgreSQL 12.12", 12, 12),
            ("PostgreSQL 13.8", 13, 8),
            ("PostgreSQL 14.5", 14, 5),
            ("PostgreSQL 16.2 (Debian 16.2-1.pgdg120+2)", 16, 2),
            ("PostgreSQL 17beta1", 17, 0),
            ("PostgreSQL 11.2-FOO-BAR+", 11, 2),
        ];
        for (s, major_expected, minor_expected) in versions {
            match PgConfig::parse_version_str(s) {
                Ok((major, minor)) => {
                    assert_eq!(major, major_expected, "Major version should match");
                    assert_eq!(minor, minor_expected, "Minor version should match");
                }
                // "17beta1" has no `.` and is rejected, which is fine for a prerelease
                Err(_) => assert_eq!(s, "PostgreSQL 17beta1"),
            }
        }

        // Check some invalid version strings
        let _ = PgConfig::parse_version_str("10.22").expect_err("Parsed invalid version string");
        let _ = PgConfig::parse_version_str("PostgresSQL 10")
            .expect_err("Parsed invalid version string");
        let _ = PgConfig::parse_version_str("PostgresSQL 12.f")
            .expect_err("Parsed invalid version string");
    }

    #[test]
    fn major_version_labels() {
        assert_eq!(parse_major_version("16"), Some(16));
        assert_eq!(parse_major_version("pg16"), Some(16));
        assert_eq!(parse_major_version("PG12"), Some(12));
        assert_eq!(parse_major_version("pg"), None);
        assert_eq!(parse_major_version("pg16beta"), None);
        assert!(is_supported_major_version(14));
        assert!(!is_supported_major_version(9));
    }

    #[test]
    fn from_parts_never_runs_pg_config() {
        let cfg = PgConfig::from_parts(15, 4, "/opt/pg15/include/server", "-I/usr/include/libxml2");
        assert_eq!(cfg.major_version().unwrap(), 15);
        assert_eq!(cfg.minor_version().unwrap(), 4);
        assert_eq!(cfg.label().unwrap(), "pg15");
        assert_eq!(cfg.includedir_server().unwrap(), PathBuf::from("/opt/pg15/include/server"));
        assert_eq!(cfg.cppflags().unwrap(), OsString::from("-I/usr/include/libxml2"));
        assert_eq!(cfg.path(), None);
    }

    #[test]
    fn config_toml_lists_installs() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            "[configs]\npg15 = \"/usr/lib/postgresql/15/bin/pg_config\"\n\
             pg16 = \"/usr/lib/postgresql/16/bin/pg_config\"\n",
        )
        .unwrap();
        let pgffi = Pgffi::from_toml_file(&path).unwrap();
        assert_eq!(pgffi.pg_configs.len(), 2);
        assert!(pgffi.pg_configs.iter().all(|c| c.path().is_some()));
    }
}
