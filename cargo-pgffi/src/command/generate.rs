//LICENSE Portions Copyright 2019-2021 ZomboDB, LLC.
//LICENSE
//LICENSE Portions Copyright 2021-2023 Technology Concepts & Design, Inc.
//LICENSE
//LICENSE Portions Copyright 2023-2023 PgCentral Foundation, Inc. <contact@pgcentral.org>
//LICENSE
//LICENSE All rights reserved.
//LICENSE
//LICENSE Use of this source code is governed by the MIT license that can be found in the LICENSE file.
use crate::command::{Inputs, Loaded};
use crate::CommandExecute;
use eyre::{eyre, WrapErr};
use owo_colors::OwoColorize;
use std::path::PathBuf;

/// Generate `pgNN.rs` for one Postgres version, or for every supported version
#[derive(clap::Args, Debug)]
#[clap(author)]
pub(crate) struct Generate {
    /// The Postgres version to generate for: `pg16`, `16`, or `all`
    #[clap(env = "PG_VERSION", default_value = "all")]
    pg_version: String,
    /// Directory the generated modules are written to
    #[clap(long, short, value_name = "DIR", default_value = ".")]
    out: PathBuf,
    /// Also write the declaration IR as `pgNN.ir.json`
    #[clap(long)]
    emit_ir: bool,
    #[clap(flatten)]
    inputs: Inputs,
    #[clap(from_global, action = clap::ArgAction::Count)]
    verbose: u8,
}

impl CommandExecute for Generate {
    #[tracing::instrument(level = "error", skip(self), fields(pg_version = %self.pg_version))]
    fn execute(self) -> eyre::Result<()> {
        let loaded = self.inputs.load()?;
        let versions = match self.pg_version.as_str() {
            "all" => loaded.registry.versions().collect::<Vec<_>>(),
            label => vec![loaded.registry.select(label)?.version()],
        };

        // every version runs in isolation; one failing does not stop the rest
        let results = std::thread::scope(|scope| {
            let this = &self;
            let loaded = &loaded;
            let handles = versions
                .iter()
                .map(|&version| (version, scope.spawn(move || this.generate_one(version, loaded))))
                .collect::<Vec<_>>();
            handles
                .into_iter()
                .map(|(version, handle)| {
                    let result = handle
                        .join()
                        .unwrap_or_else(|_| Err(eyre!("the generator for pg{version} panicked")));
                    (version, result)
                })
                .collect::<Vec<_>>()
        });

        let mut failed = Vec::new();
        for (version, result) in results {
            match result {
                Ok(path) => {
                    println!("{} pg{version} to {}", "  Generated".bold().green(), path.display())
                }
                Err(e) => {
                    eprintln!("{} pg{version}: {e:?}", "     Failed".bold().red());
                    failed.push(format!("pg{version}"));
                }
            }
        }

        if failed.is_empty() {
            Ok(())
        } else {
            Err(eyre!("failed to generate bindings for {}", failed.join(", ")))
        }
    }
}

impl Generate {
    #[tracing::instrument(level = "error", skip(self, loaded))]
    fn generate_one(&self, version: u16, loaded: &Loaded) -> eyre::Result<PathBuf> {
        let env = self.inputs.environment(version, &loaded.config)?;
        let bindings =
            pgffi_bindgen::generate(&loaded.registry, &format!("pg{version}"), &env, &loaded.rules)
                .wrap_err_with(|| format!("generating bindings for Postgres {version}"))?;

        for diagnostic in &bindings.ir.diagnostics {
            tracing::debug!(%diagnostic, "excluded");
        }
        let report = &bindings.report;
        tracing::info!(
            emitted = report.emitted.len(),
            denied = report.denied.len(),
            opaque = report.opaque.len(),
            renamed = report.renamed.len(),
            excluded_macros = bindings.ir.diagnostics.len(),
            "emission report"
        );

        let path = bindings.write_to(&self.out)?;
        if self.emit_ir {
            let ir = bindings.write_ir(&self.out)?;
            tracing::info!(path = %ir.display(), "wrote declaration IR");
        }
        Ok(path)
    }
}
