//LICENSE Portions Copyright 2019-2021 ZomboDB, LLC.
//LICENSE
//LICENSE Portions Copyright 2021-2023 Technology Concepts & Design, Inc.
//LICENSE
//LICENSE Portions Copyright 2023-2023 PgCentral Foundation, Inc. <contact@pgcentral.org>
//LICENSE
//LICENSE All rights reserved.
//LICENSE
//LICENSE Use of this source code is governed by the MIT license that can be found in the LICENSE file.
//! Select, extract, emit: one version's run from identifier to rendered module.
use crate::config::ConfigError;
use crate::emit::rules::RuleSet;
use crate::emit::{EmitReport, Emitter, LowerError};
use crate::env::BuildEnvironment;
use crate::extract::{ExtractError, Extractor};
use crate::headers::{HeaderSetRegistry, SelectError};
use crate::ir::DeclarationIr;
use std::io::Write;
use std::path::{Path, PathBuf};

#[derive(Debug, thiserror::Error)]
pub enum GenerateError {
    #[error(transparent)]
    Select(#[from] SelectError),
    #[error(transparent)]
    Extract(#[from] ExtractError),
    #[error(transparent)]
    Lower(#[from] LowerError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("cannot write `{0}`")]
    Io(PathBuf, #[source] std::io::Error),
    #[error("cannot serialize the declaration IR")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug)]
pub struct GeneratedBindings {
    pub version: u16,
    pub source: String,
    pub report: EmitReport,
    pub ir: DeclarationIr,
}

/// Run one version end to end.  Nothing touches disk; see [`GeneratedBindings::write_to`].
#[tracing::instrument(level = "info", skip(registry, env, rules))]
pub fn generate(
    registry: &HeaderSetRegistry,
    version: &str,
    env: &BuildEnvironment,
    rules: &RuleSet,
) -> Result<GeneratedBindings, GenerateError> {
    let set = registry.select(version)?;
    let ir = Extractor::new(env).extract(set)?;
    let module = Emitter::new(&ir, rules).emit()?;
    Ok(GeneratedBindings {
        version: set.version(),
        source: module.source,
        report: module.report,
        ir,
    })
}

impl GeneratedBindings {
    pub fn file_name(&self) -> String {
        format!("pg{}.rs", self.version)
    }

    /// Write `pgNN.rs` into `dir`.  The file is replaced atomically, so a reader never sees
    /// a partial module.
    pub fn write_to(&self, dir: &Path) -> Result<PathBuf, GenerateError> {
        let path = dir.join(self.file_name());
        write_atomically(&path, self.source.as_bytes())?;
        tracing::info!(path = %path.display(), "wrote bindings");
        Ok(path)
    }

    /// Write the IR as `pgNN.ir.json` into `dir`.
    pub fn write_ir(&self, dir: &Path) -> Result<PathBuf, GenerateError> {
        let path = dir.join(format!("pg{}.ir.json", self.version));
        let mut json = serde_json::to_vec_pretty(&self.ir)?;
        json.push(b'\n');
        write_atomically(&path, &json)?;
        Ok(path)
    }
}

fn write_atomically(path: &Path, contents: &[u8]) -> Result<(), GenerateError> {
    let io_error = |e| GenerateError::Io(path.to_path_buf(), e);
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(dir).map_err(io_error)?;
    let mut file = tempfile::NamedTempFile::new_in(dir).map_err(io_error)?;
    file.write_all(contents).map_err(io_error)?;
    file.persist(path).map_err(|e| io_error(e.error))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::condition::PlatformInfo;

    #[test]
    fn writes_are_whole_files() {
        let dir = tempfile::tempdir().unwrap();
        let bindings = GeneratedBindings {
            version: 15,
            source: "pub type int32 = i32;\n".into(),
            report: EmitReport::default(),
            ir: DeclarationIr::new(15, vec![PlatformInfo { name: "host".into(), cfg: "all()".into() }]),
        };
        let out = dir.path().join("bindings");
        let path = bindings.write_to(&out).unwrap();
        assert_eq!(path, out.join("pg15.rs"));
        assert_eq!(std::fs::read_to_string(&path).unwrap(), bindings.source);

        let ir_path = bindings.write_ir(&out).unwrap();
        let ir: DeclarationIr = serde_json::from_slice(&std::fs::read(ir_path).unwrap()).unwrap();
        assert_eq!(ir, bindings.ir);
        // only the two outputs; no stray temporaries
        assert_eq!(std::fs::read_dir(&out).unwrap().count(), 2);
    }

    #[test]
    fn unsupported_versions_fail_before_parsing() {
        let registry = HeaderSetRegistry::builtin().unwrap();
        let env = BuildEnvironment::for_include_dir("/definitely/not/here/pgffi");
        let err = generate(&registry, "pg9", &env, &RuleSet::default()).unwrap_err();
        assert!(matches!(err, GenerateError::Select(SelectError::UnsupportedVersion(..))));
    }
}
