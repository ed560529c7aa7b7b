//LICENSE Portions Copyright 2019-2021 ZomboDB, LLC.
//LICENSE
//LICENSE Portions Copyright 2021-2023 Technology Concepts & Design, Inc.
//LICENSE
//LICENSE Portions Copyright 2023-2023 PgCentral Foundation, Inc. <contact@pgcentral.org>
//LICENSE
//LICENSE All rights reserved.
//LICENSE
//LICENSE Use of this source code is governed by the MIT license that can be found in the LICENSE file.
//! Parse a [`VersionedHeaderSet`]'s closure with libclang, once per platform, and merge the
//! results into one [`DeclarationIr`].
mod clang;
pub mod macros;
mod walk;

use self::clang::{Index, TranslationUnit};
use self::macros::MacroTable;
use self::walk::{Walked, Walker};
use crate::condition::{Condition, PlatformInfo};
use crate::config::Platform;
use crate::env::{BuildEnvironment, EnvironmentError};
use crate::headers::VersionedHeaderSet;
use crate::ir::*;
use std::collections::{BTreeMap, BTreeSet};

pub use self::clang::ensure_loaded as load_libclang;

#[derive(Debug, thiserror::Error)]
pub enum ExtractError {
    #[error("Postgres {version} headers do not parse for platform `{platform}`:\n{}", .messages.join("\n"))]
    Parse { version: u16, platform: String, messages: Vec<String> },
    #[error(transparent)]
    Environment(#[from] EnvironmentError),
}

/// What one platform's parse contributed.
#[derive(Debug, Default)]
pub(crate) struct PlatformDecls {
    pub decls: BTreeMap<String, Declaration>,
    pub diagnostics: BTreeSet<Diagnostic>,
    pub closure: BTreeSet<String>,
}

pub struct Extractor<'env> {
    env: &'env BuildEnvironment,
}

impl<'env> Extractor<'env> {
    pub fn new(env: &'env BuildEnvironment) -> Self {
        Extractor { env }
    }

    #[tracing::instrument(level = "info", skip_all, fields(version = set.version()))]
    pub fn extract(&self, set: &VersionedHeaderSet) -> Result<DeclarationIr, ExtractError> {
        self.env.validate()?;
        clang::ensure_loaded().map_err(EnvironmentError::Libclang)?;

        let mut runs = Vec::with_capacity(self.env.platforms.len());
        for platform in &self.env.platforms {
            runs.push((platform.name.clone(), self.extract_platform(set, platform)?));
        }
        let ir = merge(set.version(), self.env.platform_infos(), runs);
        tracing::info!(
            symbols = ir.symbols.len(),
            unexpandable = ir.diagnostics.len(),
            headers = ir.closure.len(),
            "extracted declarations"
        );
        Ok(ir)
    }

    fn extract_platform(
        &self,
        set: &VersionedHeaderSet,
        platform: &Platform,
    ) -> Result<PlatformDecls, ExtractError> {
        let version = set.version();
        let parse_error = |messages: Vec<String>| ExtractError::Parse {
            version,
            platform: platform.name.clone(),
            messages,
        };

        let file_name = format!("pgffi_pg{version}.c");
        let source = format!("{}{}", set.umbrella_source(), walk::PROBES);
        let args = self.env.clang_args_for(platform);
        tracing::debug!(platform = %platform.name, ?args, "parsing header closure");

        let index = Index::new();
        let tu = TranslationUnit::parse(&index, &file_name, &source, &args)
            .map_err(|message| parse_error(vec![message]))?;
        let errors = tu.errors();
        if !errors.is_empty() {
            return Err(parse_error(errors.into_iter().map(|e| e.message).collect()));
        }

        let walked = Walker::new(&tu, self.env).walk();
        let closure = tu
            .inclusions()
            .iter()
            .map(|file| self.env.relative_header(file))
            .filter(|header| *header != file_name)
            .collect();
        Ok(resolve_macros(walked, closure))
    }
}

/// Evaluate every in-scope macro; constants join the declarations, the rest become
/// diagnostics.
fn resolve_macros(walked: Walked, closure: BTreeSet<String>) -> PlatformDecls {
    let Walked { mut decls, macros, int_typedefs, enum_constants, model } = walked;
    let in_scope = macros
        .iter()
        .filter(|(_, in_scope)| *in_scope)
        .map(|(def, _)| def.name.clone())
        .collect::<BTreeSet<_>>();
    let mut table =
        MacroTable::new(macros.into_iter().map(|(def, _)| def), &int_typedefs, &enum_constants, model);
    let targets = table
        .defs()
        .filter(|def| in_scope.contains(&def.name))
        .map(|def| (def.name.clone(), def.header.clone()))
        .collect::<Vec<_>>();

    let mut diagnostics = BTreeSet::new();
    for (name, header) in targets {
        if decls.contains_key(&name) {
            tracing::warn!(%header, name = %name, "macro shadowed by a declaration");
            diagnostics.insert(Diagnostic { symbol: name, header, kind: DiagnosticKind::ShadowedMacro });
            continue;
        }
        match table.evaluate(&name) {
            Ok(value) => {
                let kind = DeclKind::Constant(ConstantDecl { value: value.into() });
                decls.insert(name, Declaration { header, kind });
            }
            Err(reason) => {
                match reason {
                    Unexpandable::Empty | Unexpandable::FunctionLike => {
                        tracing::trace!(%header, name = %name, %reason, "skipping macro")
                    }
                    _ => tracing::warn!(%header, name = %name, %reason, "unexpandable macro"),
                }
                let kind = DiagnosticKind::UnexpandableMacro(reason);
                diagnostics.insert(Diagnostic { symbol: name, header, kind });
            }
        }
    }
    PlatformDecls { decls, diagnostics, closure }
}

/// Fold per-platform results into one IR.  A declaration identical on every platform is
/// `Always`; otherwise each distinct declaration becomes a variant keyed by the platforms
/// that saw it.  The result does not depend on the order of `runs`.
pub(crate) fn merge(
    version: u16,
    platforms: Vec<PlatformInfo>,
    runs: Vec<(String, PlatformDecls)>,
) -> DeclarationIr {
    let mut ir = DeclarationIr::new(version, platforms);
    let mut by_symbol: BTreeMap<String, Vec<(String, Declaration)>> = BTreeMap::new();
    let mut diagnostics = BTreeSet::new();
    let mut closure = BTreeSet::new();

    for (platform, run) in runs {
        for (name, decl) in run.decls {
            by_symbol.entry(name).or_default().push((platform.clone(), decl));
        }
        diagnostics.extend(run.diagnostics);
        closure.extend(run.closure);
    }

    for (name, seen) in by_symbol {
        let mut groups: Vec<(Declaration, Vec<String>)> = Vec::new();
        for (platform, decl) in seen {
            match groups.iter_mut().find(|(d, _)| *d == decl) {
                Some((_, members)) => members.push(platform),
                None => groups.push((decl, vec![platform])),
            }
        }
        for (_, members) in &mut groups {
            members.sort_unstable();
        }
        groups.sort_by(|a, b| a.1.cmp(&b.1));

        let variants = groups
            .into_iter()
            .map(|(decl, members)| {
                let members = members.iter().map(String::as_str).collect::<Vec<_>>();
                Variant { condition: Condition::covering(&members, &ir.platforms), decl }
            })
            .collect();
        ir.symbols.insert(name.clone(), Symbol { name, variants });
    }

    ir.diagnostics = diagnostics.into_iter().collect();
    ir.closure = closure.into_iter().collect();
    ir
}

#[cfg(test)]
mod tests {
    use super::*;

    fn platforms() -> Vec<PlatformInfo> {
        vec![
            PlatformInfo { name: "linux".into(), cfg: "target_os = \"linux\"".into() },
            PlatformInfo { name: "macos".into(), cfg: "target_os = \"macos\"".into() },
            PlatformInfo { name: "windows".into(), cfg: "windows".into() },
        ]
    }

    fn typedef(bits: u16) -> Declaration {
        Declaration {
            header: "c.h".into(),
            kind: DeclKind::Typedef(TypedefDecl {
                target: CType::Int(IntType::new(bits, true)),
                size: u64::from(bits / 8),
                align: u64::from(bits / 8),
            }),
        }
    }

    fn run(entries: &[(&str, Declaration)]) -> PlatformDecls {
        PlatformDecls {
            decls: entries.iter().map(|(n, d)| (n.to_string(), d.clone())).collect(),
            ..Default::default()
        }
    }

    fn runs() -> Vec<(String, PlatformDecls)> {
        vec![
            ("linux".into(), run(&[("int32", typedef(32)), ("long_t", typedef(64)), ("only_linux", typedef(8))])),
            ("macos".into(), run(&[("int32", typedef(32)), ("long_t", typedef(64))])),
            ("windows".into(), run(&[("int32", typedef(32)), ("long_t", typedef(32))])),
        ]
    }

    #[test]
    fn identical_declarations_are_unconditional() {
        let ir = merge(16, platforms(), runs());
        let int32 = ir.get("int32").unwrap();
        assert_eq!(int32.variants.len(), 1);
        assert_eq!(int32.variants[0].condition, Condition::Always);
    }

    #[test]
    fn differing_declarations_become_variants() {
        let ir = merge(16, platforms(), runs());
        let long_t = ir.get("long_t").unwrap();
        assert_eq!(long_t.variants.len(), 2);
        assert_eq!(
            long_t.variants[0].condition,
            Condition::Any(vec!["linux".into(), "macos".into()])
        );
        assert_eq!(long_t.variants[0].decl, typedef(64));
        assert_eq!(long_t.variants[1].condition, Condition::Platform("windows".into()));

        let only = ir.get("only_linux").unwrap();
        assert_eq!(only.variants[0].condition, Condition::Platform("linux".into()));
    }

    #[test]
    fn merge_is_order_independent() {
        let forward = merge(16, platforms(), runs());
        let mut reversed = runs();
        reversed.reverse();
        assert_eq!(merge(16, platforms(), reversed), forward);
    }

    fn walked(decls: &[(&str, Declaration)], macros: &[(&str, &str, bool)]) -> Walked {
        use super::macros::{IntModel, MacroDef, Token, TokenKind};
        let macros = macros
            .iter()
            .map(|(name, literal, in_scope)| {
                let tokens = vec![Token::new(TokenKind::Literal, *literal)];
                (MacroDef { name: name.to_string(), header: "c.h".into(), tokens, function_like: false }, *in_scope)
            })
            .collect();
        Walked {
            decls: decls.iter().map(|(n, d)| (n.to_string(), d.clone())).collect(),
            macros,
            int_typedefs: BTreeMap::new(),
            enum_constants: BTreeMap::new(),
            model: IntModel::LP64,
        }
    }

    #[test]
    fn in_scope_macros_become_constants() {
        let walked = walked(&[], &[("BLCKSZ", "8192", true), ("SYSTEM_ONLY", "1", false)]);
        let resolved = resolve_macros(walked, BTreeSet::from(["c.h".to_string()]));
        let Some(DeclKind::Constant(constant)) = resolved.decls.get("BLCKSZ").map(|d| &d.kind) else {
            panic!("BLCKSZ is not a constant: {:?}", resolved.decls);
        };
        assert_eq!(constant.value, ConstValue::Int { value: 8192, ty: IntType::new(32, true) });
        assert!(!resolved.decls.contains_key("SYSTEM_ONLY"));
        assert!(resolved.diagnostics.is_empty());
        assert_eq!(resolved.closure, BTreeSet::from(["c.h".to_string()]));
    }

    #[test]
    fn macros_named_like_declarations_are_reported() {
        let walked = walked(&[("int32", typedef(32))], &[("int32", "4", true)]);
        let resolved = resolve_macros(walked, BTreeSet::new());
        assert_eq!(resolved.decls["int32"], typedef(32));
        assert_eq!(
            resolved.diagnostics.into_iter().collect::<Vec<_>>(),
            [Diagnostic { symbol: "int32".into(), header: "c.h".into(), kind: DiagnosticKind::ShadowedMacro }]
        );
    }

    #[test]
    fn diagnostics_and_closure_are_deduplicated() {
        let diag = Diagnostic {
            symbol: "PG_LOG".into(),
            header: "elog.h".into(),
            kind: DiagnosticKind::UnexpandableMacro(Unexpandable::Call("errmsg".into())),
        };
        let mut a = run(&[]);
        a.diagnostics.insert(diag.clone());
        a.closure.extend(["c.h".to_string(), "postgres.h".to_string()]);
        let mut b = run(&[]);
        b.diagnostics.insert(diag.clone());
        b.closure.insert("c.h".to_string());

        let ir = merge(16, platforms()[..2].to_vec(), vec![("linux".into(), a), ("macos".into(), b)]);
        assert_eq!(ir.diagnostics, [diag]);
        assert_eq!(ir.closure, ["c.h", "postgres.h"]);
    }
}
