//LICENSE Portions Copyright 2019-2021 ZomboDB, LLC.
//LICENSE
//LICENSE Portions Copyright 2021-2023 Technology Concepts & Design, Inc.
//LICENSE
//LICENSE Portions Copyright 2023-2023 PgCentral Foundation, Inc. <contact@pgcentral.org>
//LICENSE
//LICENSE All rights reserved.
//LICENSE
//LICENSE Use of this source code is governed by the MIT license that can be found in the LICENSE file.
use eyre::{eyre, WrapErr};
use pgffi_bindgen::{BuildEnvironment, GenerateConfig, HeaderSetRegistry, RuleSet};
use pgffi_pg_config::{PgConfig, Pgffi};
use std::path::{Path, PathBuf};

pub(crate) mod generate;
pub(crate) mod pgffi;
pub(crate) mod probe;
pub(crate) mod versions;

/// Where the headers and the generation config come from.
#[derive(clap::Args, Debug)]
pub(crate) struct Inputs {
    /// Parse this header tree instead of a Postgres install's server include directory
    #[clap(long, value_name = "DIR", conflicts_with = "pg_config")]
    include_dir: Option<PathBuf>,
    /// The `pg_config` to use [default: the one `$PGFFI_HOME/config.toml` lists for the
    /// version, else the first on the `$PATH`]
    #[clap(long, value_name = "PATH")]
    pg_config: Option<PathBuf>,
    /// Generation config [default: `pgffi.toml` in the current directory, if present]
    #[clap(long, value_name = "FILE")]
    config: Option<PathBuf>,
}

/// Everything a run needs that does not depend on the version.
pub(crate) struct Loaded {
    pub(crate) config: GenerateConfig,
    pub(crate) registry: HeaderSetRegistry,
    pub(crate) rules: RuleSet,
}

impl Inputs {
    pub(crate) fn load(&self) -> eyre::Result<Loaded> {
        let config = load_config(self.config.as_deref())?;
        let registry = load_registry(&config)?;
        let rules = config.rule_set()?;
        Ok(Loaded { config, registry, rules })
    }

    #[tracing::instrument(level = "debug", skip(self, config))]
    pub(crate) fn environment(
        &self,
        version: u16,
        config: &GenerateConfig,
    ) -> eyre::Result<BuildEnvironment> {
        if let Some(dir) = &self.include_dir {
            let mut env = BuildEnvironment::for_include_dir(dir);
            env.apply_config(config);
            return Ok(env);
        }

        let pg_config = match &self.pg_config {
            Some(path) => PgConfig::new(path.clone()),
            None if std::env::var_os("PGFFI_PG_CONFIG_AS_ENV").is_some() => PgConfig::from_env()?,
            None => match Pgffi::from_config() {
                Ok(pgffi) => pgffi.get(&format!("pg{version}"))?.clone(),
                Err(e) => {
                    tracing::debug!(error = %e, "falling back to the pg_config on $PATH");
                    PgConfig::from_path()
                }
            },
        };
        let major = pg_config.major_version()?;
        if major != version {
            return Err(eyre!("`{pg_config}` belongs to Postgres {major}, not Postgres {version}"));
        }
        tracing::debug!(pg_config = %pg_config, "using pg_config");
        Ok(BuildEnvironment::from_pg_config(&pg_config, config)?)
    }
}

pub(crate) fn load_config(path: Option<&Path>) -> eyre::Result<GenerateConfig> {
    match path {
        Some(path) => GenerateConfig::from_toml_file(path)
            .wrap_err_with(|| format!("loading `{}`", path.display())),
        None => {
            let cwd = std::env::current_dir()?;
            Ok(GenerateConfig::discover(&cwd)?)
        }
    }
}

/// The built-in header sets plus any from the config's manifest directory.
pub(crate) fn load_registry(config: &GenerateConfig) -> eyre::Result<HeaderSetRegistry> {
    let registry = HeaderSetRegistry::builtin()?;
    match &config.manifest_dir {
        Some(dir) => registry
            .with_manifest_dir(dir)
            .wrap_err_with(|| format!("loading header manifests from `{}`", dir.display())),
        None => Ok(registry),
    }
}
