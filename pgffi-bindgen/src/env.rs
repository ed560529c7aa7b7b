//LICENSE Portions Copyright 2019-2021 ZomboDB, LLC.
//LICENSE
//LICENSE Portions Copyright 2021-2023 Technology Concepts & Design, Inc.
//LICENSE
//LICENSE Portions Copyright 2023-2023 PgCentral Foundation, Inc. <contact@pgcentral.org>
//LICENSE
//LICENSE All rights reserved.
//LICENSE
//LICENSE Use of this source code is governed by the MIT license that can be found in the LICENSE file.
//! The build environment a header set is parsed in: include paths, preprocessor
//! definitions, extra clang arguments and the platforms to parse for.
use crate::condition::PlatformInfo;
use crate::config::{GenerateConfig, Platform};
use pgffi_pg_config::PgConfig;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Extra arguments for libclang, split like a shell would.
pub const EXTRA_CLANG_ARGS_VAR: &str = "PGFFI_EXTRA_CLANG_ARGS";

#[derive(Debug, thiserror::Error)]
pub enum EnvironmentError {
    #[error("include directory `{0}` does not exist")]
    MissingIncludeDir(PathBuf),
    #[error("no include directories were configured")]
    NoIncludeDirs,
    #[error("unable to load libclang: {0}")]
    Libclang(String),
    #[error("unable to query pg_config: {0:#}")]
    PgConfig(eyre::Report),
    #[error("`{0}` is not valid shell syntax: `{1}`")]
    Unsplittable(String, String),
}

#[derive(Clone, Debug)]
pub struct BuildEnvironment {
    pub include_dirs: Vec<PathBuf>,
    pub defines: BTreeMap<String, String>,
    pub clang_args: Vec<String>,
    pub platforms: Vec<Platform>,
    pub include_system_headers: bool,
}

impl BuildEnvironment {
    /// An environment with one include directory, no extra arguments, and the host platform.
    pub fn for_include_dir(dir: impl Into<PathBuf>) -> Self {
        BuildEnvironment {
            include_dirs: vec![dir.into()],
            defines: BTreeMap::new(),
            clang_args: Vec::new(),
            platforms: vec![Platform::host()],
            include_system_headers: false,
        }
    }

    /// Builds the environment for one Postgres install: its server include directory,
    /// its `--cppflags`, the generation config, and `$PGFFI_EXTRA_CLANG_ARGS`.
    pub fn from_pg_config(
        pg_config: &PgConfig,
        config: &GenerateConfig,
    ) -> Result<Self, EnvironmentError> {
        let includedir = pg_config.includedir_server().map_err(EnvironmentError::PgConfig)?;
        let cppflags = pg_config.cppflags().map_err(EnvironmentError::PgConfig)?;
        let cppflags = cppflags.to_string_lossy();

        let mut env = Self::for_include_dir(includedir);
        env.clang_args = split_args("--cppflags", &cppflags)?;
        env.apply_config(config);
        if let Ok(extra) = std::env::var(EXTRA_CLANG_ARGS_VAR) {
            env.clang_args.extend(split_args(EXTRA_CLANG_ARGS_VAR, &extra)?);
        }
        Ok(env)
    }

    pub fn apply_config(&mut self, config: &GenerateConfig) {
        self.clang_args.extend(config.clang_args.iter().cloned());
        self.defines.extend(config.defines.iter().map(|(k, v)| (k.clone(), v.clone())));
        self.include_system_headers |= config.include_system_headers;
        self.platforms = config.platforms();
    }

    /// Every include directory must exist.
    pub fn validate(&self) -> Result<(), EnvironmentError> {
        if self.include_dirs.is_empty() {
            return Err(EnvironmentError::NoIncludeDirs);
        }
        for dir in &self.include_dirs {
            if !dir.is_dir() {
                return Err(EnvironmentError::MissingIncludeDir(dir.clone()));
            }
        }
        Ok(())
    }

    /// The full libclang command line for `platform`.
    pub fn clang_args_for(&self, platform: &Platform) -> Vec<String> {
        let mut args = vec!["-x".to_string(), "c".to_string()];
        args.extend(self.include_dirs.iter().map(|d| format!("-I{}", d.display())));
        args.extend(self.defines.iter().map(|(k, v)| {
            if v.is_empty() {
                format!("-D{k}")
            } else {
                format!("-D{k}={v}")
            }
        }));
        args.extend(self.clang_args.iter().cloned());
        args.extend(platform.clang_args.iter().cloned());
        args
    }

    pub fn platform_infos(&self) -> Vec<PlatformInfo> {
        self.platforms
            .iter()
            .map(|p| PlatformInfo { name: p.name.clone(), cfg: p.cfg.clone() })
            .collect()
    }

    /// `file` relative to the include directory containing it, or unchanged when it lies
    /// outside all of them.
    pub fn relative_header(&self, file: &Path) -> String {
        let best = self
            .include_dirs
            .iter()
            .flat_map(|dir| {
                let canonical = dir.canonicalize().ok();
                std::iter::once(dir.clone()).chain(canonical)
            })
            .filter_map(|dir| file.strip_prefix(&dir).ok().map(Path::to_path_buf))
            .min_by_key(|rel| rel.components().count());
        match best {
            Some(rel) => rel
                .components()
                .map(|c| c.as_os_str().to_string_lossy().into_owned())
                .collect::<Vec<_>>()
                .join("/"),
            None => file.display().to_string(),
        }
    }
}

fn split_args(what: &str, args: &str) -> Result<Vec<String>, EnvironmentError> {
    shlex::split(args).ok_or_else(|| EnvironmentError::Unsplittable(what.into(), args.into()))
}
