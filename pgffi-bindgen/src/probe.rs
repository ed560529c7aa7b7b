//LICENSE Portions Copyright 2019-2021 ZomboDB, LLC.
//LICENSE
//LICENSE Portions Copyright 2021-2023 Technology Concepts & Design, Inc.
//LICENSE
//LICENSE Portions Copyright 2023-2023 PgCentral Foundation, Inc. <contact@pgcentral.org>
//LICENSE
//LICENSE All rights reserved.
//LICENSE
//LICENSE Use of this source code is governed by the MIT license that can be found in the LICENSE file.
//! A C translation unit that `_Static_assert`s every recorded size, alignment and offset,
//! compiled by the system C compiler.  It passes only when the IR agrees with the compiler
//! that will build the extension.
use crate::condition::Condition;
use crate::env::BuildEnvironment;
use crate::headers::VersionedHeaderSet;
use crate::ir::*;
use std::collections::BTreeMap;

#[derive(Debug, thiserror::Error)]
pub enum ProbeError {
    #[error("cannot write the layout probe")]
    Io(#[from] std::io::Error),
    #[error("the layout probe for Postgres {version} does not compile")]
    Compile {
        version: u16,
        #[source]
        source: cc::Error,
    },
    #[error("platform `{0}` is not configured")]
    UnknownPlatform(String),
}

pub struct LayoutProbe {
    version: u16,
    platform: String,
    source: String,
    checks: usize,
}

impl LayoutProbe {
    /// Assertions for every declaration that holds on `platform`.
    pub fn new(set: &VersionedHeaderSet, ir: &DeclarationIr, platform: &str) -> Self {
        let applies = |condition: &Condition| match condition {
            Condition::Always => true,
            other => other.platforms().contains(&platform),
        };

        // anonymous records are spelled in C through the typedef that names them
        let mut typedef_names = BTreeMap::new();
        for symbol in ir.symbols.values() {
            for variant in symbol.variants.iter().filter(|v| applies(&v.condition)) {
                if let DeclKind::Typedef(TypedefDecl { target: CType::Named(q), .. }) = &variant.decl.kind {
                    typedef_names.entry(q.as_str()).or_insert(symbol.name.as_str());
                }
            }
        }

        let mut source = String::from("#include <stddef.h>\n");
        source.push_str(&set.umbrella_source());
        source.push('\n');
        let mut checks = 0;
        let mut check = |source: &mut String, expr: String, value: u64| {
            source.push_str(&format!("_Static_assert({expr} == {value}, \"{expr}\");\n"));
            checks += 1;
        };

        for symbol in ir.symbols.values() {
            for variant in symbol.variants.iter().filter(|v| applies(&v.condition)) {
                match &variant.decl.kind {
                    DeclKind::Record(rec) if rec.complete => {
                        let spelling = if rec.anonymous {
                            match typedef_names.get(symbol.name.as_str()) {
                                Some(name) => name.to_string(),
                                None => continue,
                            }
                        } else {
                            symbol.name.clone()
                        };
                        check(&mut source, format!("sizeof({spelling})"), rec.size);
                        check(&mut source, format!("_Alignof({spelling})"), rec.align);
                        if rec.is_union {
                            continue;
                        }
                        for field in &rec.fields {
                            if field.bit_width.is_some() || field.name.starts_with("__anon") {
                                continue;
                            }
                            check(
                                &mut source,
                                format!("offsetof({spelling}, {})", field.name),
                                field.offset_bits / 8,
                            );
                        }
                    }
                    DeclKind::Typedef(t) if t.size > 0 && !matches!(t.target, CType::Function(_)) => {
                        check(&mut source, format!("sizeof({})", symbol.name), t.size);
                        check(&mut source, format!("_Alignof({})", symbol.name), t.align);
                    }
                    _ => {}
                }
            }
        }

        LayoutProbe { version: set.version(), platform: platform.to_string(), source, checks }
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// Number of `_Static_assert`s in the probe.
    pub fn checks(&self) -> usize {
        self.checks
    }

    /// The platform's own compiler arguments, which select the layout being checked.
    fn platform_args<'e>(&self, env: &'e BuildEnvironment) -> Result<&'e [String], ProbeError> {
        env.platforms
            .iter()
            .find(|p| p.name == self.platform)
            .map(|p| p.clang_args.as_slice())
            .ok_or_else(|| ProbeError::UnknownPlatform(self.platform.clone()))
    }

    #[tracing::instrument(level = "info", skip_all, fields(version = self.version, platform = %self.platform, checks = self.checks))]
    pub fn compile(&self, env: &BuildEnvironment) -> Result<(), ProbeError> {
        let platform_args = self.platform_args(env)?;
        let dir = tempfile::tempdir()?;
        let path = dir.path().join(format!("pgffi_probe_pg{}.c", self.version));
        std::fs::write(&path, &self.source)?;

        let mut build = compiler();
        build.out_dir(dir.path()).warnings(false).file(&path);
        for include in &env.include_dirs {
            build.include(include);
        }
        for (name, value) in &env.defines {
            build.define(name, (!value.is_empty()).then_some(value.as_str()));
        }
        for arg in &env.clang_args {
            build.flag_if_supported(arg);
        }
        // a compiler that cannot take these cannot check this platform
        for arg in platform_args {
            build.flag(arg);
        }
        build
            .try_compile(&format!("pgffi_probe_pg{}", self.version))
            .map_err(|source| ProbeError::Compile { version: self.version, source })?;
        tracing::info!("layout probe compiled");
        Ok(())
    }
}

/// A C compiler for the target this crate was built for, configured outside of a build
/// script.
pub fn compiler() -> cc::Build {
    let mut build = cc::Build::new();
    build
        .cargo_metadata(false)
        .target(env!("PGFFI_BUILD_TARGET"))
        .host(env!("PGFFI_BUILD_TARGET"))
        .opt_level(0)
        .debug(false);
    build
}
