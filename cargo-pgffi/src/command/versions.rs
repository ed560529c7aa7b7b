//LICENSE Portions Copyright 2019-2021 ZomboDB, LLC.
//LICENSE
//LICENSE Portions Copyright 2021-2023 Technology Concepts & Design, Inc.
//LICENSE
//LICENSE Portions Copyright 2023-2023 PgCentral Foundation, Inc. <contact@pgcentral.org>
//LICENSE
//LICENSE All rights reserved.
//LICENSE
//LICENSE Use of this source code is governed by the MIT license that can be found in the LICENSE file.
use crate::command::{load_config, load_registry};
use crate::CommandExecute;
use owo_colors::OwoColorize;
use pgffi_pg_config::{is_supported_major_version, Pgffi};
use std::path::PathBuf;

/// List the Postgres versions bindings can be generated for, and their configured `pg_config`
#[derive(clap::Args, Debug)]
#[clap(author)]
pub(crate) struct Versions {
    /// Generation config [default: `pgffi.toml` in the current directory, if present]
    #[clap(long, value_name = "FILE")]
    config: Option<PathBuf>,
    #[clap(from_global, action = clap::ArgAction::Count)]
    verbose: u8,
}

impl CommandExecute for Versions {
    #[tracing::instrument(level = "error", skip(self))]
    fn execute(self) -> eyre::Result<()> {
        let config = load_config(self.config.as_deref())?;
        let registry = load_registry(&config)?;
        let pgffi = match Pgffi::from_config() {
            Ok(pgffi) => Some(pgffi),
            Err(e) => {
                tracing::debug!(error = %e, "no pg_config installs are configured");
                None
            }
        };

        for version in registry.versions() {
            let set = registry.get(version)?;
            let label = format!("pg{version}");
            let origin = if is_supported_major_version(version) { "built-in" } else { "manifest" };
            let install = match pgffi.as_ref().and_then(|pgffi| pgffi.get(&label).ok()) {
                Some(pg_config) => {
                    let minor = pg_config.minor_version().map_or_else(|_| "?".into(), |m| m.to_string());
                    let path = pg_config.path().map(|p| p.display().to_string()).unwrap_or_default();
                    format!("{version}.{minor} at {path}")
                }
                None => "(no pg_config)".dimmed().to_string(),
            };
            println!(
                "{} {:>3} headers ({origin})  {install}",
                format!("{label:<5}").bold(),
                set.headers().len()
            );
        }
        Ok(())
    }
}
