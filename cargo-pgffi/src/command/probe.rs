//LICENSE Portions Copyright 2019-2021 ZomboDB, LLC.
//LICENSE
//LICENSE Portions Copyright 2021-2023 Technology Concepts & Design, Inc.
//LICENSE
//LICENSE Portions Copyright 2023-2023 PgCentral Foundation, Inc. <contact@pgcentral.org>
//LICENSE
//LICENSE All rights reserved.
//LICENSE
//LICENSE Use of this source code is governed by the MIT license that can be found in the LICENSE file.
use crate::command::Inputs;
use crate::CommandExecute;
use eyre::{eyre, WrapErr};
use owo_colors::OwoColorize;
use pgffi_bindgen::{Extractor, LayoutProbe};
use std::path::PathBuf;

/// Check extracted layouts against the C compiler with a `_Static_assert` probe
#[derive(clap::Args, Debug)]
#[clap(author)]
pub(crate) struct Probe {
    /// The Postgres version to probe: `pg16` or `16`
    #[clap(env = "PG_VERSION")]
    pg_version: String,
    /// Which configured platform to check [default: the first one]
    #[clap(long)]
    platform: Option<String>,
    /// Also write the probe's C source to this file
    #[clap(long, value_name = "FILE")]
    write_source: Option<PathBuf>,
    #[clap(flatten)]
    inputs: Inputs,
    #[clap(from_global, action = clap::ArgAction::Count)]
    verbose: u8,
}

impl CommandExecute for Probe {
    #[tracing::instrument(level = "error", skip(self), fields(pg_version = %self.pg_version))]
    fn execute(self) -> eyre::Result<()> {
        let loaded = self.inputs.load()?;
        let set = loaded.registry.select(&self.pg_version)?;
        let mut env = self.inputs.environment(set.version(), &loaded.config)?;

        let platform = match &self.platform {
            Some(name) => env.platforms.iter().find(|p| &p.name == name),
            None => env.platforms.first(),
        }
        .cloned()
        .ok_or_else(|| eyre!("platform `{}` is not configured", self.platform.as_deref().unwrap_or("")))?;
        // only the checked platform is extracted; its compiler arguments go to the C compiler too
        env.platforms = vec![platform.clone()];

        let ir = Extractor::new(&env).extract(set)?;
        let probe = LayoutProbe::new(set, &ir, &platform.name);
        if let Some(path) = &self.write_source {
            std::fs::write(path, probe.source())
                .wrap_err_with(|| format!("writing `{}`", path.display()))?;
        }
        probe.compile(&env)?;

        println!(
            "{} pg{} on {}: {} layout checks passed",
            "     Probed".bold().green(),
            set.version(),
            platform.name,
            probe.checks()
        );
        Ok(())
    }
}
