//LICENSE Portions Copyright 2019-2021 ZomboDB, LLC.
//LICENSE
//LICENSE Portions Copyright 2021-2023 Technology Concepts & Design, Inc.
//LICENSE
//LICENSE Portions Copyright 2023-2023 PgCentral Foundation, Inc. <contact@pgcentral.org>
//LICENSE
//LICENSE All rights reserved.
//LICENSE
//LICENSE Use of this source code is governed by the MIT license that can be found in the LICENSE file.
//! Lowering a [`DeclarationIr`] to one Rust module.
//!
//! Emission runs in two passes.  The plan pass applies the filter rules to every symbol and
//! fixes its Rust name (or its absence), so that the second pass can lower any reference
//! to any other symbol without caring about emission order.  Symbols are visited in the
//! IR's sorted order and nothing else feeds the output, which keeps it byte-identical
//! across runs.
mod layout;
mod lower;
pub mod rules;

use self::layout::{Modifier, Slot};
use self::lower::{abi_name, blob, float_literal, ident, int, int_literal, usize_literal, Types};
use self::rules::{Decision, RuleSet};
use crate::condition::CfgError;
use crate::ir::*;
use proc_macro2::{Ident, Literal, TokenStream};
use quote::{format_ident, quote};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};

#[derive(Debug, thiserror::Error)]
#[error("{header}: `{symbol}` {kind}")]
pub struct LowerError {
    pub symbol: String,
    pub header: String,
    pub kind: LowerErrorKind,
}

#[derive(Debug, thiserror::Error)]
pub enum LowerErrorKind {
    #[error("uses calling convention `{0}`, which has no Rust ABI")]
    UnknownAbi(String),
    #[error("uses `{0}` by value, but `{0}` is not emitted")]
    ExcludedByValue(String),
    #[error("refers to `{0}`, which was never declared")]
    UnknownType(String),
    #[error("has value {value}, which does not fit in {ty}")]
    ConstantOutOfRange { value: i128, ty: IntType },
    #[error("has value {0}, which is not a finite number")]
    NonFiniteFloat(f64),
    #[error("has a layout Rust cannot reproduce: {0}")]
    Layout(String),
    #[error("lowers to `{ident}`, which `{other}` already uses")]
    DuplicateIdent { ident: String, other: String },
    #[error("lowers to `{0}`, which is not a valid Rust identifier")]
    InvalidIdent(String),
    #[error("has no Rust equivalent: {0}")]
    Unsupported(String),
    #[error("has an unusable condition: {0}")]
    Cfg(#[from] CfgError),
    #[error("produced code that does not parse: {0}")]
    Syntax(#[from] syn::Error),
}

/// What happened to each symbol, by C-qualified name.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct EmitReport {
    pub emitted: Vec<String>,
    pub denied: Vec<String>,
    pub opaque: Vec<String>,
    /// `(C name, Rust name)`
    pub renamed: Vec<(String, String)>,
}

/// The rendered module for one version.
#[derive(Clone, Debug)]
pub struct EmittedModule {
    pub source: String,
    pub report: EmitReport,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum Planned {
    Emit(String),
    Opaque(String),
    Deny,
    /// `typedef struct Foo Foo;` is the record itself
    Alias(String),
}

pub(crate) struct Plan<'ir> {
    ir: &'ir DeclarationIr,
    entries: BTreeMap<&'ir str, Planned>,
}

pub(crate) enum Target<'p> {
    Emitted { name: &'p str, symbol: &'p Symbol, opaque: bool },
    Denied,
    Unknown,
}

impl<'ir> Plan<'ir> {
    /// What a reference to `qualified` lowers to, looking through identity typedefs.
    pub fn target(&self, qualified: &str) -> Target<'_> {
        let mut current = qualified;
        for _ in 0..8 {
            let (Some(symbol), Some(planned)) =
                (self.ir.symbols.get(current), self.entries.get(current))
            else {
                return Target::Unknown;
            };
            match planned {
                Planned::Emit(name) => return Target::Emitted { name, symbol, opaque: false },
                Planned::Opaque(name) if has_blob(symbol) => {
                    return Target::Emitted { name, symbol, opaque: true }
                }
                Planned::Opaque(_) | Planned::Deny => return Target::Denied,
                Planned::Alias(next) => current = next,
            }
        }
        Target::Unknown
    }
}

pub(crate) fn is_function_typedef(symbol: &Symbol) -> bool {
    symbol.variants.iter().any(|v| {
        matches!(&v.decl.kind, DeclKind::Typedef(t) if matches!(t.target, CType::Function(_)))
    })
}

/// `typedef struct Foo Foo;`: the record a same-named typedef stands for.
fn identity_target(symbol: &Symbol) -> Option<&str> {
    let mut target: Option<&str> = None;
    for variant in &symbol.variants {
        let DeclKind::Typedef(TypedefDecl { target: CType::Named(named), .. }) = &variant.decl.kind
        else {
            return None;
        };
        if plain_name(named) != symbol.name || target.is_some_and(|t| t != named.as_str()) {
            return None;
        }
        target = Some(named.as_str());
    }
    target
}

/// Only records and typedefs have a layout an opaque blob can stand in for.
fn has_blob(symbol: &Symbol) -> bool {
    symbol
        .variants
        .iter()
        .all(|v| matches!(v.decl.kind, DeclKind::Record(_) | DeclKind::Typedef(_)))
}

fn header_of(symbol: &Symbol) -> String {
    symbol.variants.first().map(|v| v.decl.header.clone()).unwrap_or_default()
}

/// Functions that have no linkable symbol, or no C ABI, are only emitted on request.
fn needs_explicit_allow(symbol: &Symbol) -> Option<&CallConv> {
    symbol.variants.iter().find_map(|v| match &v.decl.kind {
        DeclKind::Function(f) if f.inline || f.sig.call_conv != CallConv::C => Some(&f.sig.call_conv),
        _ => None,
    })
}

pub struct Emitter<'a> {
    ir: &'a DeclarationIr,
    rules: &'a RuleSet,
}

impl<'a> Emitter<'a> {
    pub fn new(ir: &'a DeclarationIr, rules: &'a RuleSet) -> Self {
        Emitter { ir, rules }
    }

    #[tracing::instrument(level = "info", skip_all, fields(version = self.ir.version))]
    pub fn emit(&self) -> Result<EmittedModule, LowerError> {
        let (plan, mut report) = self.plan()?;
        let types = Types::new(&plan);
        let mut out = Output::default();

        for symbol in self.ir.symbols.values() {
            let lower_error =
                |kind| LowerError { symbol: symbol.name.clone(), header: header_of(symbol), kind };
            let Some(planned) = plan.entries.get(symbol.name.as_str()) else { continue };
            let emitted = match planned {
                Planned::Emit(name) => {
                    self.symbol(&types, symbol, name, &mut out).map_err(lower_error)?;
                    true
                }
                Planned::Opaque(name) => {
                    self.opaque(symbol, name, &mut out).map_err(lower_error)?;
                    false
                }
                Planned::Deny | Planned::Alias(_) => false,
            };
            if emitted {
                report.emitted.push(symbol.name.clone());
            }
        }

        let file = out.into_file().map_err(|kind| LowerError {
            symbol: "<extern blocks>".into(),
            header: String::new(),
            kind,
        })?;
        let source = format!(
            "/* Automatically generated by pgffi-bindgen for Postgres {}. Do not hand-edit. */\n\n{}",
            self.ir.version,
            prettyplease::unparse(&file)
        );
        tracing::info!(
            emitted = report.emitted.len(),
            denied = report.denied.len(),
            opaque = report.opaque.len(),
            renamed = report.renamed.len(),
            "emitted bindings"
        );
        Ok(EmittedModule { source, report })
    }

    fn plan(&self) -> Result<(Plan<'a>, EmitReport), LowerError> {
        let mut entries = BTreeMap::new();
        let mut report = EmitReport::default();

        for symbol in self.ir.symbols.values() {
            // an identity typedef is named by its record's rules, but may still be denied
            if let Some(target) = identity_target(symbol) {
                let planned = match self.rules.decide(symbol.plain_name(), symbol.kind()) {
                    Decision::Deny => {
                        report.denied.push(symbol.name.clone());
                        Planned::Deny
                    }
                    _ => Planned::Alias(target.to_string()),
                };
                entries.insert(symbol.name.as_str(), planned);
                continue;
            }
            let plain = symbol.plain_name();
            let kind = symbol.kind();
            let planned = match self.rules.decide(plain, kind) {
                Decision::Deny => {
                    report.denied.push(symbol.name.clone());
                    Planned::Deny
                }
                Decision::Opaque => {
                    report.opaque.push(symbol.name.clone());
                    Planned::Opaque(plain.to_string())
                }
                Decision::Emit { name, explicit } => match needs_explicit_allow(symbol) {
                    Some(conv) if explicit && conv.rust_abi().is_none() => {
                        return Err(LowerError {
                            symbol: symbol.name.clone(),
                            header: header_of(symbol),
                            kind: LowerErrorKind::UnknownAbi(abi_name(conv)),
                        });
                    }
                    Some(_) if !explicit => {
                        report.opaque.push(symbol.name.clone());
                        Planned::Opaque(name)
                    }
                    _ => {
                        if name != plain {
                            report.renamed.push((symbol.name.clone(), name.clone()));
                        }
                        Planned::Emit(name)
                    }
                },
            };
            tracing::debug!(symbol = %symbol.name, %kind, decision = ?planned, "planned");
            entries.insert(symbol.name.as_str(), planned);
        }
        Ok((Plan { ir: self.ir, entries }, report))
    }

    /// Emit every variant of `symbol` as `name`.
    fn symbol(
        &self,
        types: &Types<'_, '_>,
        symbol: &Symbol,
        name: &str,
        out: &mut Output,
    ) -> Result<(), LowerErrorKind> {
        let rust_name = ident(name)?;
        let mut items = TokenStream::new();
        let mut foreign: BTreeMap<&'static str, TokenStream> = BTreeMap::new();
        let mut claimed_values = Vec::new();

        for variant in &symbol.variants {
            let cfg = variant.condition.to_cfg_attr(&self.ir.platforms)?;
            let doc = format!(" From `{}`.", variant.decl.header);
            match &variant.decl.kind {
                DeclKind::Record(rec) => items.extend(record(types, &rust_name, rec, &cfg, &doc)?),
                DeclKind::Enum(e) => {
                    let (tokens, values) = enumeration(&rust_name, e, &cfg, &doc)?;
                    items.extend(tokens);
                    claimed_values.extend(values);
                }
                DeclKind::Typedef(t) => {
                    let target = match &t.target {
                        CType::Function(sig) => types.fn_pointer(sig)?,
                        other => types.value(other)?,
                    };
                    items.extend(quote! {
                        #cfg
                        #[doc = #doc]
                        pub type #rust_name = #target;
                    });
                }
                DeclKind::Constant(c) => items.extend(constant(&rust_name, &c.value, &cfg, &doc)?),
                DeclKind::Function(f) => {
                    let abi = f
                        .sig
                        .call_conv
                        .rust_abi()
                        .ok_or_else(|| LowerErrorKind::UnknownAbi(abi_name(&f.sig.call_conv)))?;
                    foreign.entry(abi).or_default().extend(function(types, &rust_name, f, &cfg, &doc)?);
                }
                DeclKind::Variable(v) => {
                    let ty = types.value(&v.ty)?;
                    let mutability = (!v.is_const).then(|| quote!(mut));
                    foreign.entry("C").or_default().extend(quote! {
                        #cfg
                        #[doc = #doc]
                        pub static #mutability #rust_name: #ty;
                    });
                }
            }
        }

        let anonymous_enum =
            symbol.variants.iter().all(|v| matches!(&v.decl.kind, DeclKind::Enum(e) if e.anonymous));
        match symbol.kind() {
            SymbolKind::Function | SymbolKind::Variable | SymbolKind::Constant => {
                out.claim_value(&rust_name, &symbol.name)?
            }
            SymbolKind::Enum if anonymous_enum => {}
            _ => out.claim_type(&rust_name, &symbol.name)?,
        }
        claimed_values.sort();
        claimed_values.dedup();
        for value in &claimed_values {
            out.claim_value(value, &symbol.name)?;
        }

        out.items.extend(syn::parse2::<syn::File>(items)?.items);
        for (abi, tokens) in foreign {
            let block = syn::parse2::<syn::ItemForeignMod>(quote!(extern "C" { #tokens }))?;
            out.foreign.entry(abi).or_default().extend(block.items);
        }
        Ok(())
    }

    /// Records and typedefs become size- and alignment-preserving blobs; everything else
    /// is left out, and references to it are treated as denied.
    fn opaque(&self, symbol: &Symbol, name: &str, out: &mut Output) -> Result<(), LowerErrorKind> {
        if !has_blob(symbol) {
            return Ok(());
        }
        let rust_name = ident(name)?;
        let mut items = TokenStream::new();
        for variant in &symbol.variants {
            let (size, align) = match &variant.decl.kind {
                DeclKind::Record(r) => (r.size, r.align),
                DeclKind::Typedef(t) => (t.size, t.align),
                _ => continue,
            };
            let cfg = variant.condition.to_cfg_attr(&self.ir.platforms)?;
            let doc = format!(" Opaque; from `{}`.", variant.decl.header);
            items.extend(opaque_struct(&rust_name, size, align, &cfg, &doc));
        }
        if !items.is_empty() {
            out.claim_type(&rust_name, &symbol.name)?;
            out.items.extend(syn::parse2::<syn::File>(items)?.items);
        }
        Ok(())
    }
}

/// Accumulated items, plus which symbol owns each Rust name.
#[derive(Default)]
struct Output {
    items: Vec<syn::Item>,
    foreign: BTreeMap<&'static str, Vec<syn::ForeignItem>>,
    types: HashMap<String, String>,
    values: HashMap<String, String>,
}

impl Output {
    fn claim_type(&mut self, ident: &Ident, owner: &str) -> Result<(), LowerErrorKind> {
        claim(&mut self.types, ident, owner)
    }

    fn claim_value(&mut self, ident: &Ident, owner: &str) -> Result<(), LowerErrorKind> {
        claim(&mut self.values, ident, owner)
    }

    fn into_file(self) -> Result<syn::File, LowerErrorKind> {
        let mut items = self.items;
        for (abi, foreign) in self.foreign {
            let abi = Literal::string(abi);
            items.push(syn::parse2(quote!(extern #abi { #(#foreign)* }))?);
        }
        Ok(syn::File {
            shebang: None,
            attrs: vec![syn::parse_quote!(
                #![allow(non_camel_case_types, non_snake_case, non_upper_case_globals, dead_code, improper_ctypes)]
            )],
            items,
        })
    }
}

fn claim(
    namespace: &mut HashMap<String, String>,
    ident: &Ident,
    owner: &str,
) -> Result<(), LowerErrorKind> {
    let key = ident.to_string();
    match namespace.get(&key) {
        Some(other) if other != owner => {
            Err(LowerErrorKind::DuplicateIdent { ident: key, other: other.clone() })
        }
        Some(_) => Ok(()),
        None => {
            namespace.insert(key, owner.to_string());
            Ok(())
        }
    }
}

fn record(
    types: &Types<'_, '_>,
    name: &Ident,
    rec: &RecordDecl,
    cfg: &TokenStream,
    doc: &str,
) -> Result<TokenStream, LowerErrorKind> {
    let keyword = if rec.is_union { quote!(union) } else { quote!(struct) };
    if !rec.complete {
        return Ok(quote! {
            #cfg
            #[doc = #doc]
            #[repr(C)]
            #[derive(Copy, Clone)]
            pub #keyword #name { _unused: [u8; 0] }
        });
    }

    let layout = layout::plan(rec).map_err(LowerErrorKind::Layout)?;
    let mut fields = Vec::new();
    let mut offsets = Vec::new();
    let (mut pads, mut runs) = (0usize, 0usize);
    for slot in &layout.slots {
        match slot {
            Slot::Field(field) => {
                let field_name = ident(&field.name)?;
                let ty = types.value(&field.ty)?;
                fields.push(quote!(pub #field_name: #ty));
                offsets.push((field_name, field.offset_bits / 8));
            }
            Slot::Pad(len) => {
                let pad = format_ident!("_pad{}", pads);
                let len = usize_literal(*len);
                pads += 1;
                fields.push(quote!(#pad: [u8; #len]));
            }
            Slot::Bits { offset, len, members } => {
                let storage = format_ident!("_bitfield_{}", runs);
                runs += 1;
                let docs = members.iter().map(|m| {
                    let start = m.offset_bits - offset * 8;
                    let end = start + u64::from(m.bit_width.unwrap_or(0));
                    format!(" `{}`: bits {start}..{end}", m.name)
                });
                let len = usize_literal(*len);
                fields.push(quote!(#(#[doc = #docs])* pub #storage: [u8; #len]));
                offsets.push((storage, *offset));
            }
        }
    }

    let repr = match layout.modifier {
        Modifier::None => quote!(#[repr(C)]),
        Modifier::Packed(n) => {
            let n = usize_literal(n);
            quote!(#[repr(C, packed(#n))])
        }
        Modifier::Align(n) => {
            let n = usize_literal(n);
            quote!(#[repr(C, align(#n))])
        }
    };
    let size = usize_literal(rec.size);
    let align = usize_literal(rec.align);
    let offset_checks = if rec.is_union {
        Vec::new()
    } else {
        offsets
            .iter()
            .map(|(field, offset)| {
                let offset = usize_literal(*offset);
                quote!(assert!(::core::mem::offset_of!(#name, #field) == #offset);)
            })
            .collect()
    };

    Ok(quote! {
        #cfg
        #[doc = #doc]
        #repr
        #[derive(Copy, Clone)]
        pub #keyword #name { #(#fields),* }

        #cfg
        const _: () = {
            assert!(::core::mem::size_of::<#name>() == #size);
            assert!(::core::mem::align_of::<#name>() == #align);
            #(#offset_checks)*
        };
    })
}

fn opaque_struct(name: &Ident, size: u64, align: u64, cfg: &TokenStream, doc: &str) -> TokenStream {
    let align_lit = usize_literal(align.max(1));
    let size_lit = usize_literal(size);
    let storage = blob(size, 1);
    quote! {
        #cfg
        #[doc = #doc]
        #[repr(C, align(#align_lit))]
        #[derive(Copy, Clone)]
        pub struct #name { _opaque: #storage }

        #cfg
        const _: () = {
            assert!(::core::mem::size_of::<#name>() == #size_lit);
            assert!(::core::mem::align_of::<#name>() == #align_lit);
        };
    }
}

/// A type alias for the enum's integer type, plus one constant per value.  Anonymous enums
/// get only the constants, typed with the integer type.
fn enumeration(
    name: &Ident,
    e: &EnumDecl,
    cfg: &TokenStream,
    doc: &str,
) -> Result<(TokenStream, Vec<Ident>), LowerErrorKind> {
    let repr = int(&e.repr)?;
    let mut tokens = TokenStream::new();
    let value_ty = if e.anonymous {
        repr.clone()
    } else {
        tokens.extend(quote! {
            #cfg
            #[doc = #doc]
            pub type #name = #repr;
        });
        quote!(#name)
    };

    let mut names = Vec::with_capacity(e.values.len());
    for value in &e.values {
        if !e.repr.contains(value.value) {
            return Err(LowerErrorKind::ConstantOutOfRange { value: value.value, ty: e.repr });
        }
        let value_name = ident(&value.name)?;
        let literal = int_literal(value.value);
        tokens.extend(quote! {
            #cfg
            pub const #value_name: #value_ty = #literal;
        });
        names.push(value_name);
    }
    Ok((tokens, names))
}

fn constant(
    name: &Ident,
    value: &ConstValue,
    cfg: &TokenStream,
    doc: &str,
) -> Result<TokenStream, LowerErrorKind> {
    let (ty, literal) = match value {
        ConstValue::Int { value, ty } => {
            if !ty.contains(*value) {
                return Err(LowerErrorKind::ConstantOutOfRange { value: *value, ty: *ty });
            }
            (int(ty)?, int_literal(*value))
        }
        ConstValue::Float { value, bits } => {
            if !value.is_finite() {
                return Err(LowerErrorKind::NonFiniteFloat(*value));
            }
            let ty = if *bits == 32 { quote!(f32) } else { quote!(f64) };
            (ty, float_literal(*value))
        }
        ConstValue::Str { bytes } => {
            let mut bytes = bytes.clone();
            bytes.push(0);
            let len = usize_literal(bytes.len() as u64);
            let literal = Literal::byte_string(&bytes);
            (quote!(&[u8; #len]), quote!(#literal))
        }
    };
    Ok(quote! {
        #cfg
        #[doc = #doc]
        pub const #name: #ty = #literal;
    })
}

fn function(
    types: &Types<'_, '_>,
    name: &Ident,
    f: &FunctionDecl,
    cfg: &TokenStream,
    doc: &str,
) -> Result<TokenStream, LowerErrorKind> {
    let mut seen = Vec::new();
    let mut params = Vec::with_capacity(f.sig.params.len());
    for (i, ty) in f.sig.params.iter().enumerate() {
        let param_name = match f.param_names.get(i).cloned().flatten() {
            Some(n) if !seen.contains(&n) => ident(&n)?,
            _ => format_ident!("arg{}", i),
        };
        seen.push(param_name.to_string());
        let ty = types.param(ty)?;
        params.push(quote!(#param_name: #ty));
    }
    let variadic = lower::variadic(&f.sig)?;
    let ret = types.ret(&f.sig.ret)?;
    Ok(quote! {
        #cfg
        #[doc = #doc]
        pub fn #name(#(#params),* #variadic) #ret;
    })
}
