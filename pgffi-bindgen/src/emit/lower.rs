//LICENSE Portions Copyright 2019-2021 ZomboDB, LLC.
//LICENSE
//LICENSE Portions Copyright 2021-2023 Technology Concepts & Design, Inc.
//LICENSE
//LICENSE Portions Copyright 2023-2023 PgCentral Foundation, Inc. <contact@pgcentral.org>
//LICENSE
//LICENSE All rights reserved.
//LICENSE
//LICENSE Use of this source code is governed by the MIT license that can be found in the LICENSE file.
use super::{LowerErrorKind, Plan, Target};
use crate::ir::{CType, CallConv, FnSig, IntType};
use proc_macro2::{Ident, Literal, Span, TokenStream};
use quote::{format_ident, quote};

const KEYWORDS: &[&str] = &[
    "abstract", "as", "async", "await", "become", "box", "break", "const", "continue", "do",
    "dyn", "else", "enum", "extern", "false", "final", "fn", "for", "gen", "if", "impl", "in",
    "let", "loop", "macro", "match", "mod", "move", "mut", "override", "priv", "pub", "ref",
    "return", "static", "struct", "trait", "true", "try", "type", "typeof", "unsafe", "unsized",
    "use", "virtual", "where", "while", "yield",
];

/// A Rust identifier for a C name.  Keywords become raw identifiers; the few that cannot
/// be raw get a trailing underscore.
pub(super) fn ident(name: &str) -> Result<Ident, LowerErrorKind> {
    let mut chars = name.chars();
    let valid = match chars.next() {
        Some(c) if c == '_' || c.is_ascii_alphabetic() => {
            chars.all(|c| c == '_' || c.is_ascii_alphanumeric())
        }
        _ => false,
    };
    if !valid || name == "_" {
        return Err(LowerErrorKind::InvalidIdent(name.to_string()));
    }
    Ok(match name {
        "crate" | "self" | "Self" | "super" => format_ident!("{}_", name),
        _ if KEYWORDS.contains(&name) => Ident::new_raw(name, Span::call_site()),
        _ => Ident::new(name, Span::call_site()),
    })
}

pub(super) fn int(ty: &IntType) -> Result<TokenStream, LowerErrorKind> {
    match ty.bits {
        8 | 16 | 32 | 64 | 128 => {
            let ident = Ident::new(&ty.to_string(), Span::call_site());
            Ok(quote!(#ident))
        }
        _ => Err(LowerErrorKind::Unsupported(format!("{}-bit integer", ty.bits))),
    }
}

pub(super) fn int_literal(value: i128) -> TokenStream {
    let magnitude = Literal::u128_unsuffixed(value.unsigned_abs());
    if value < 0 {
        quote!(-#magnitude)
    } else {
        quote!(#magnitude)
    }
}

pub(super) fn float_literal(value: f64) -> TokenStream {
    let magnitude = Literal::f64_unsuffixed(value.abs());
    if value.is_sign_negative() && value != 0.0 {
        quote!(-#magnitude)
    } else {
        quote!(#magnitude)
    }
}

pub(super) fn usize_literal(value: u64) -> Literal {
    Literal::u64_unsuffixed(value)
}

/// A `[uN; size / align]` array with the given size and alignment.
pub(super) fn blob(size: u64, align: u64) -> TokenStream {
    let unit = match align {
        2 => quote!(u16),
        4 => quote!(u32),
        8 => quote!(u64),
        16 => quote!(u128),
        _ => quote!(u8),
    };
    if align > 1 && size % align == 0 {
        let len = usize_literal(size / align);
        quote!([#unit; #len])
    } else {
        let len = usize_literal(size);
        quote!([u8; #len])
    }
}

/// Lowers C types for one emission run.
pub(super) struct Types<'p, 'ir> {
    plan: &'p Plan<'ir>,
}

impl<'p, 'ir> Types<'p, 'ir> {
    pub fn new(plan: &'p Plan<'ir>) -> Self {
        Types { plan }
    }

    pub fn value(&self, ty: &CType) -> Result<TokenStream, LowerErrorKind> {
        Ok(match ty {
            CType::Void => quote!(::core::ffi::c_void),
            CType::Bool => quote!(bool),
            CType::Int(int_ty) => int(int_ty)?,
            CType::Float { bits: 32 } => quote!(f32),
            CType::Float { bits: 64 } => quote!(f64),
            CType::Float { bits } => {
                return Err(LowerErrorKind::Unsupported(format!("{bits}-bit float")))
            }
            CType::Pointer { pointee, is_const } => self.pointer(pointee, *is_const)?,
            CType::Array { element, len } => {
                let element = self.value(element)?;
                let len = usize_literal(*len);
                quote!([#element; #len])
            }
            CType::FlexibleArray { element } => {
                let element = self.value(element)?;
                quote!([#element; 0])
            }
            CType::Named(qualified) => match self.plan.target(qualified) {
                Target::Emitted { name, .. } => {
                    let ident = ident(name)?;
                    quote!(#ident)
                }
                Target::Denied => return Err(LowerErrorKind::ExcludedByValue(qualified.clone())),
                Target::Unknown => return Err(LowerErrorKind::UnknownType(qualified.clone())),
            },
            CType::Function(sig) => self.fn_pointer(sig)?,
            CType::Opaque { size, align, .. } => blob(*size, *align),
        })
    }

    /// A parameter type: arrays and functions decay to pointers.
    pub fn param(&self, ty: &CType) -> Result<TokenStream, LowerErrorKind> {
        match ty {
            CType::Array { element, .. } | CType::FlexibleArray { element } => {
                self.pointer(element, false)
            }
            other => self.value(other),
        }
    }

    /// `-> T`, or nothing for `void`.
    pub fn ret(&self, ty: &CType) -> Result<TokenStream, LowerErrorKind> {
        match ty {
            CType::Void => Ok(TokenStream::new()),
            other => {
                let ty = self.value(other)?;
                Ok(quote!(-> #ty))
            }
        }
    }

    fn pointer(&self, pointee: &CType, is_const: bool) -> Result<TokenStream, LowerErrorKind> {
        let ptr = if is_const { quote!(*const) } else { quote!(*mut) };
        Ok(match pointee {
            CType::Void | CType::Opaque { .. } => quote!(#ptr ::core::ffi::c_void),
            CType::Function(sig) => self.fn_pointer(sig)?,
            CType::Named(qualified) => match self.plan.target(qualified) {
                Target::Emitted { name, symbol, opaque } => {
                    let ident = ident(name)?;
                    // the typedef already lowers to a function pointer
                    if !opaque && super::is_function_typedef(symbol) {
                        quote!(#ident)
                    } else {
                        quote!(#ptr #ident)
                    }
                }
                Target::Denied | Target::Unknown => quote!(#ptr ::core::ffi::c_void),
            },
            other => {
                let pointee = self.value(other)?;
                quote!(#ptr #pointee)
            }
        })
    }

    /// `Option<unsafe extern "ABI" fn(..)>`.
    pub fn fn_pointer(&self, sig: &FnSig) -> Result<TokenStream, LowerErrorKind> {
        let abi = sig
            .call_conv
            .rust_abi()
            .ok_or_else(|| LowerErrorKind::UnknownAbi(abi_name(&sig.call_conv)))?;
        let abi = Literal::string(abi);
        let params = sig.params.iter().map(|p| self.param(p)).collect::<Result<Vec<_>, _>>()?;
        let variadic = variadic(sig)?;
        let ret = self.ret(&sig.ret)?;
        Ok(quote!(::core::option::Option<unsafe extern #abi fn(#(#params),* #variadic) #ret>))
    }
}

/// The `, ...` closing a variadic parameter list.
pub(super) fn variadic(sig: &FnSig) -> Result<Option<TokenStream>, LowerErrorKind> {
    match (sig.variadic, sig.params.is_empty()) {
        (false, _) => Ok(None),
        (true, false) => Ok(Some(quote!(, ...))),
        (true, true) => Err(LowerErrorKind::Unsupported(
            "a variadic signature with no named parameters".into(),
        )),
    }
}

/// How a calling convention is spelled in diagnostics.
pub(super) fn abi_name(conv: &CallConv) -> String {
    match conv {
        CallConv::Other(spelling) => spelling.clone(),
        other => format!("{other:?}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identifiers() {
        assert_eq!(ident("relation").unwrap().to_string(), "relation");
        assert_eq!(ident("type").unwrap().to_string(), "r#type");
        assert_eq!(ident("self").unwrap().to_string(), "self_");
        assert!(matches!(ident("1abc"), Err(LowerErrorKind::InvalidIdent(_))));
        assert!(matches!(ident("_"), Err(LowerErrorKind::InvalidIdent(_))));
        assert!(matches!(ident("a-b"), Err(LowerErrorKind::InvalidIdent(_))));
    }

    #[test]
    fn literals() {
        assert_eq!(int_literal(100).to_string(), "100");
        assert_eq!(int_literal(-1).to_string(), "- 1");
        assert_eq!(int_literal(i128::from(i64::MIN)).to_string(), "- 9223372036854775808");
        assert_eq!(float_literal(-0.5).to_string(), "- 0.5");
    }

    #[test]
    fn blobs_keep_alignment() {
        assert_eq!(blob(16, 16).to_string(), "[u128 ; 1]");
        assert_eq!(blob(12, 4).to_string(), "[u32 ; 3]");
        assert_eq!(blob(3, 1).to_string(), "[u8 ; 3]");
    }

    #[test]
    fn variadic_lists_need_a_named_parameter() {
        let sig = |params: Vec<CType>, variadic| FnSig { ret: CType::Void, params, variadic, call_conv: CallConv::C };
        assert!(variadic(&sig(vec![CType::Bool], false)).unwrap().is_none());
        assert_eq!(variadic(&sig(vec![CType::Bool], true)).unwrap().unwrap().to_string(), ", ...");
        assert!(matches!(variadic(&sig(vec![], true)), Err(LowerErrorKind::Unsupported(_))));
    }

    #[test]
    fn calling_convention_names() {
        assert_eq!(abi_name(&CallConv::Other("pascal".into())), "pascal");
        assert_eq!(abi_name(&CallConv::Stdcall), "Stdcall");
    }
}
