//LICENSE Portions Copyright 2019-2021 ZomboDB, LLC.
//LICENSE
//LICENSE Portions Copyright 2021-2023 Technology Concepts & Design, Inc.
//LICENSE
//LICENSE Portions Copyright 2023-2023 PgCentral Foundation, Inc. <contact@pgcentral.org>
//LICENSE
//LICENSE All rights reserved.
//LICENSE
//LICENSE Use of this source code is governed by the MIT license that can be found in the LICENSE file.
use crate::CommandExecute;

/// Generate Rust bindings for the Postgres C headers, one module per major version
#[derive(clap::Args, Debug)]
#[clap(about, author)]
pub(crate) struct Pgffi {
    #[clap(subcommand)]
    subcommand: CargoPgffiSubCommands,
    #[clap(from_global, action = clap::ArgAction::Count)]
    verbose: u8,
}

impl CommandExecute for Pgffi {
    fn execute(self) -> eyre::Result<()> {
        self.subcommand.execute()
    }
}

#[derive(clap::Subcommand, Debug)]
enum CargoPgffiSubCommands {
    Generate(super::generate::Generate),
    Versions(super::versions::Versions),
    Probe(super::probe::Probe),
}

impl CommandExecute for CargoPgffiSubCommands {
    fn execute(self) -> eyre::Result<()> {
        use CargoPgffiSubCommands::*;
        match self {
            Generate(c) => c.execute(),
            Versions(c) => c.execute(),
            Probe(c) => c.execute(),
        }
    }
}
