//LICENSE Portions Copyright 2019-2021 ZomboDB, LLC.
//LICENSE
//LICENSE Portions Copyright 2021-2023 Technology Concepts & Design, Inc.
//LICENSE
//LICENSE Portions Copyright 2023-2023 PgCentral Foundation, Inc. <contact@pgcentral.org>
//LICENSE
//LICENSE All rights reserved.
//LICENSE
//LICENSE Use of this source code is governed by the MIT license that can be found in the LICENSE file.
//! Walks one parsed translation unit and lowers its declarations into IR.
use super::clang::{Cursor, Location, TranslationUnit, Type};
use super::macros::{IntModel, MacroDef};
use crate::env::BuildEnvironment;
use crate::ir::*;
use clang_sys::*;
use std::collections::{BTreeMap, HashMap};

/// Names declared by the umbrella unit itself to learn the target's integer model.
pub(super) const PROBE_PREFIX: &str = "__pgffi_";
pub(super) const PROBES: &str = "typedef long __pgffi_long;\ntypedef char __pgffi_char;\n";

/// Everything one platform's parse produced, before macros are evaluated.
pub(super) struct Walked {
    pub decls: BTreeMap<String, Declaration>,
    pub macros: Vec<(MacroDef, bool)>,
    pub int_typedefs: BTreeMap<String, IntType>,
    pub enum_constants: BTreeMap<String, (i128, IntType)>,
    pub model: IntModel,
}

pub(super) struct Walker<'tu> {
    tu: &'tu TranslationUnit,
    env: &'tu BuildEnvironment,
    /// USR of an untagged record or enum -> the qualified name it was given
    anon_names: HashMap<String, String>,
    decls: BTreeMap<String, Declaration>,
    macros: Vec<(MacroDef, bool)>,
    int_typedefs: BTreeMap<String, IntType>,
    enum_constants: BTreeMap<String, (i128, IntType)>,
    model: IntModel,
}

fn tag(kind: CXCursorKind) -> &'static str {
    match kind {
        CXCursor_UnionDecl => "union",
        CXCursor_EnumDecl => "enum",
        _ => "struct",
    }
}

/// `struct Foo`, `union Foo` or `enum Foo`.
fn tagged_name(kind: CXCursorKind, name: &str) -> String {
    format!("{} {name}", tag(kind))
}

/// The name an untagged record or enum gets from the record and member that hold it.
fn member_name(outer: &str, member: &str) -> String {
    format!("{outer}__{member}")
}

/// The field standing in for the `n`th anonymous struct or union member.
fn anon_member(n: usize) -> String {
    format!("__anon{n}")
}

fn is_tag_decl(kind: CXCursorKind) -> bool {
    matches!(kind, CXCursor_StructDecl | CXCursor_UnionDecl | CXCursor_EnumDecl)
}

/// `struct Foo` spelled with its keyword becomes plain `Foo`'s record type.
fn desugar(ty: Type) -> Type {
    if ty.kind() == CXType_Elaborated {
        ty.named()
    } else {
        ty
    }
}

/// The record or enum declaration a field's type names, looking through arrays.
fn field_tag_decl(ty: Type) -> Option<Cursor> {
    let mut ty = desugar(ty);
    while matches!(ty.kind(), CXType_ConstantArray | CXType_IncompleteArray) {
        ty = desugar(ty.element());
    }
    let decl = ty.declaration();
    (!decl.is_null() && is_tag_decl(decl.kind())).then_some(decl)
}

pub(super) fn int_type(ty: Type) -> Option<IntType> {
    let signed = match ty.kind() {
        CXType_Char_S | CXType_SChar | CXType_Short | CXType_Int | CXType_Long
        | CXType_LongLong | CXType_Int128 | CXType_WChar => true,
        CXType_Char_U | CXType_UChar | CXType_UShort | CXType_UInt | CXType_ULong
        | CXType_ULongLong | CXType_UInt128 | CXType_Char16 | CXType_Char32 => false,
        _ => return None,
    };
    let bits = u16::try_from(ty.size()? * 8).ok()?;
    Some(IntType::new(bits, signed))
}

fn call_conv(conv: CXCallingConv) -> CallConv {
    match conv {
        CXCallingConv_Default | CXCallingConv_C => CallConv::C,
        CXCallingConv_X86StdCall => CallConv::Stdcall,
        CXCallingConv_X86FastCall => CallConv::Fastcall,
        CXCallingConv_X86ThisCall => CallConv::Thiscall,
        CXCallingConv_X86VectorCall => CallConv::Vectorcall,
        CXCallingConv_Win64 => CallConv::Win64,
        CXCallingConv_X86_64SysV => CallConv::SysV64,
        CXCallingConv_AAPCS => CallConv::Aapcs,
        CXCallingConv_X86Pascal => CallConv::Other("pascal".into()),
        CXCallingConv_AAPCS_VFP => CallConv::Other("aapcs-vfp".into()),
        CXCallingConv_X86RegCall => CallConv::Other("regcall".into()),
        CXCallingConv_IntelOclBicc => CallConv::Other("intel_ocl_bicc".into()),
        other => CallConv::Other(format!("clang#{other}")),
    }
}

impl<'tu> Walker<'tu> {
    pub fn new(tu: &'tu TranslationUnit, env: &'tu BuildEnvironment) -> Self {
        Walker {
            tu,
            env,
            anon_names: HashMap::new(),
            decls: BTreeMap::new(),
            macros: Vec::new(),
            int_typedefs: BTreeMap::new(),
            enum_constants: BTreeMap::new(),
            model: IntModel::LP64,
        }
    }

    pub fn walk(mut self) -> Walked {
        let top = self.tu.cursor().children();

        // untagged records and enums take their typedef's name, which comes after them
        for cursor in top.iter().filter(|c| c.kind() == CXCursor_TypedefDecl) {
            let decl = desugar(cursor.typedef_target()).declaration();
            if !decl.is_null() && is_tag_decl(decl.kind()) && decl.is_unnamed() {
                let name = tagged_name(decl.kind(), &cursor.spelling());
                self.anon_names.entry(decl.usr()).or_insert(name);
            }
        }

        for cursor in &top {
            self.top_level(cursor);
        }

        Walked {
            decls: self.decls,
            macros: self.macros,
            int_typedefs: self.int_typedefs,
            enum_constants: self.enum_constants,
            model: self.model,
        }
    }

    fn excluded(&self, loc: &Location) -> bool {
        loc.file.is_none() || (loc.in_system_header && !self.env.include_system_headers)
    }

    fn header(&self, loc: &Location) -> String {
        loc.file
            .as_deref()
            .map(|f| self.env.relative_header(f))
            .unwrap_or_else(|| "<builtin>".to_string())
    }

    fn top_level(&mut self, cursor: &Cursor) {
        let loc = cursor.location();
        let kind = cursor.kind();

        if kind == CXCursor_MacroDefinition {
            self.collect_macro(cursor, &loc);
            return;
        }
        if kind == CXCursor_TypedefDecl {
            // integer typedefs are usable in macro casts wherever they are declared
            if let Some(ty) = int_type(cursor.typedef_target().canonical()) {
                self.int_typedefs.insert(cursor.spelling(), ty);
            }
        }
        if loc.in_main_file {
            self.probe(cursor);
            return;
        }
        if self.excluded(&loc) {
            return;
        }

        let header = self.header(&loc);
        match kind {
            CXCursor_TypedefDecl => self.typedef(cursor, header),
            CXCursor_StructDecl | CXCursor_UnionDecl => self.record_cursor(cursor),
            CXCursor_EnumDecl => self.enum_cursor(cursor),
            CXCursor_FunctionDecl => self.function(cursor, header),
            CXCursor_VarDecl => self.variable(cursor, header),
            _ => {}
        }
    }

    fn probe(&mut self, cursor: &Cursor) {
        match cursor.spelling().strip_prefix(PROBE_PREFIX) {
            Some("long") => {
                if let Some(ty) = int_type(cursor.typedef_target().canonical()) {
                    self.model.long = ty.bits;
                }
            }
            Some("char") => {
                self.model.char_signed = cursor.typedef_target().canonical().kind() == CXType_Char_S;
            }
            _ => {}
        }
    }

    fn collect_macro(&mut self, cursor: &Cursor, loc: &Location) {
        if cursor.is_macro_builtin() {
            return;
        }
        let name = cursor.spelling();
        let function_like = cursor.is_macro_function_like();
        let mut tokens = if function_like { Vec::new() } else { self.tu.tokens(cursor) };
        // the first token is the macro's own name
        if !tokens.is_empty() {
            tokens.remove(0);
        }
        let in_scope = !self.excluded(loc) && !loc.in_main_file;
        let def = MacroDef { name, header: self.header(loc), tokens, function_like };
        self.macros.push((def, in_scope));
    }

    fn typedef(&mut self, cursor: &Cursor, header: String) {
        let name = cursor.spelling();
        if self.decls.contains_key(&name) {
            return;
        }
        let target = self.lower(cursor.typedef_target());
        let ty = cursor.cur_type();
        let decl = TypedefDecl {
            target,
            size: ty.size().unwrap_or(0),
            align: ty.align().unwrap_or(1),
        };
        self.decls.insert(name, Declaration { header, kind: DeclKind::Typedef(decl) });
    }

    fn record_cursor(&mut self, cursor: &Cursor) {
        let (name, anonymous) = if cursor.is_unnamed() {
            match self.anon_names.get(&cursor.usr()) {
                Some(name) => (name.clone(), true),
                // an untagged record nothing can name
                None => return,
            }
        } else {
            (tagged_name(cursor.kind(), &cursor.spelling()), false)
        };

        if cursor.is_definition() {
            self.record(cursor, name, anonymous);
        } else if cursor.definition().is_none() && !self.decls.contains_key(&name) {
            let header = self.header(&cursor.location());
            let decl = RecordDecl {
                is_union: cursor.kind() == CXCursor_UnionDecl,
                anonymous,
                complete: false,
                size: 0,
                align: 1,
                fields: Vec::new(),
            };
            self.decls.insert(name, Declaration { header, kind: DeclKind::Record(decl) });
        }
    }

    fn record(&mut self, cursor: &Cursor, name: String, anonymous: bool) {
        let ty = cursor.cur_type();
        let is_union = cursor.kind() == CXCursor_UnionDecl;
        let outer = plain_name(&name).to_string();
        let children = cursor.children();

        let used_by_fields = children
            .iter()
            .filter(|c| c.kind() == CXCursor_FieldDecl)
            .filter_map(|c| field_tag_decl(c.cur_type()))
            .collect::<Vec<_>>();

        let mut fields: Vec<Field> = Vec::new();
        let mut anon_count = 0;
        for child in &children {
            match child.kind() {
                CXCursor_FieldDecl => {
                    let field_name = child.spelling();
                    let fty = child.cur_type();
                    if let Some(decl) = field_tag_decl(fty) {
                        if decl.is_unnamed() && !self.anon_names.contains_key(&decl.usr()) {
                            let nested = tagged_name(decl.kind(), &member_name(&outer, &field_name));
                            self.anon_names.insert(decl.usr(), nested.clone());
                            self.nested(&decl, nested);
                        }
                    }

                    let bit_width = child.bit_width();
                    // unnamed and zero-width bit-fields only shape the layout
                    if field_name.is_empty() || bit_width == Some(0) {
                        continue;
                    }
                    let offset_bits = match child.field_offset_bits() {
                        Some(offset) => offset,
                        None => next_offset_bits(&fields, fty.align().unwrap_or(1), is_union),
                    };
                    fields.push(Field {
                        name: field_name,
                        ty: self.lower(fty),
                        offset_bits,
                        bit_width,
                        size: fty.size().unwrap_or(0),
                        align: fty.align().unwrap_or(1),
                    });
                }
                CXCursor_StructDecl | CXCursor_UnionDecl | CXCursor_EnumDecl
                    if child.is_unnamed() =>
                {
                    if used_by_fields.contains(child) {
                        continue;
                    }
                    if child.kind() == CXCursor_EnumDecl {
                        self.enum_cursor(child);
                        continue;
                    }
                    // an anonymous member: its fields are reached through the outer record
                    anon_count += 1;
                    let nested =
                        tagged_name(child.kind(), &member_name(&outer, &anon_member(anon_count)));
                    self.anon_names.insert(child.usr(), nested.clone());
                    self.record(child, nested.clone(), true);

                    let cty = child.cur_type();
                    let align = cty.align().unwrap_or(1);
                    let offset_bits = first_field_name(child)
                        .and_then(|f| ty.offset_of(&f))
                        .unwrap_or_else(|| next_offset_bits(&fields, align, is_union));
                    fields.push(Field {
                        name: anon_member(anon_count),
                        ty: CType::Named(nested),
                        offset_bits,
                        bit_width: None,
                        size: cty.size().unwrap_or(0),
                        align,
                    });
                }
                // a tagged record declared inside another still has file scope
                CXCursor_StructDecl | CXCursor_UnionDecl => self.record_cursor(child),
                CXCursor_EnumDecl => self.enum_cursor(child),
                _ => {}
            }
        }

        let decl = RecordDecl {
            is_union,
            anonymous,
            complete: true,
            size: ty.size().unwrap_or(0),
            align: ty.align().unwrap_or(1),
            fields,
        };
        let header = self.header(&cursor.location());
        self.decls.insert(name, Declaration { header, kind: DeclKind::Record(decl) });
    }

    fn nested(&mut self, decl: &Cursor, name: String) {
        if decl.kind() == CXCursor_EnumDecl {
            self.enumeration(decl, name, false);
        } else if decl.is_definition() {
            self.record(decl, name, true);
        }
    }

    fn enum_cursor(&mut self, cursor: &Cursor) {
        if cursor.is_unnamed() {
            match self.anon_names.get(&cursor.usr()).cloned() {
                Some(name) => self.enumeration(cursor, name, false),
                None => {
                    let first = cursor
                        .children()
                        .into_iter()
                        .find(|c| c.kind() == CXCursor_EnumConstantDecl)
                        .map(|c| c.spelling());
                    if let Some(first) = first {
                        self.enumeration(cursor, tagged_name(CXCursor_EnumDecl, &first), true);
                    }
                }
            }
        } else {
            self.enumeration(cursor, tagged_name(CXCursor_EnumDecl, &cursor.spelling()), false);
        }
    }

    fn enumeration(&mut self, cursor: &Cursor, name: String, anonymous: bool) {
        if !cursor.is_definition() {
            return;
        }
        let repr = int_type(cursor.enum_type().canonical()).unwrap_or(IntType::U32);
        let mut values = Vec::new();
        for child in cursor.children() {
            if child.kind() != CXCursor_EnumConstantDecl {
                continue;
            }
            let value = if repr.signed {
                child.enum_value_signed() as i128
            } else {
                child.enum_value_unsigned() as i128
            };
            let name = child.spelling();
            self.enum_constants.insert(name.clone(), (value, repr));
            values.push(EnumValue { name, value });
        }
        let header = self.header(&cursor.location());
        let decl = EnumDecl { repr, anonymous, values };
        self.decls.insert(name, Declaration { header, kind: DeclKind::Enum(decl) });
    }

    fn function(&mut self, cursor: &Cursor, header: String) {
        let name = cursor.spelling();
        if self.decls.contains_key(&name) {
            return;
        }
        let sig = self.fn_sig(cursor.cur_type());
        let mut param_names = (0..cursor.num_args())
            .map(|i| Some(cursor.arg(i).spelling()).filter(|n| !n.is_empty()))
            .collect::<Vec<_>>();
        param_names.resize(sig.params.len(), None);
        let decl = FunctionDecl { sig, param_names, inline: cursor.is_static() || cursor.is_inline() };
        self.decls.insert(name, Declaration { header, kind: DeclKind::Function(decl) });
    }

    fn variable(&mut self, cursor: &Cursor, header: String) {
        let name = cursor.spelling();
        if cursor.is_static() || self.decls.contains_key(&name) {
            return;
        }
        let ty = cursor.cur_type();
        let decl = VariableDecl { ty: self.lower(ty), is_const: ty.is_const() };
        self.decls.insert(name, Declaration { header, kind: DeclKind::Variable(decl) });
    }

    fn fn_sig(&mut self, ty: Type) -> FnSig {
        let ty = match ty.kind() {
            CXType_FunctionProto | CXType_FunctionNoProto => ty,
            _ => ty.canonical(),
        };
        let ret = self.lower(ty.result());
        let (params, variadic) = match ty.args() {
            Some(args) => (args.into_iter().map(|a| self.lower(a)).collect(), ty.is_variadic()),
            None => (Vec::new(), false),
        };
        FnSig { ret, params, variadic, call_conv: call_conv(ty.calling_convention()) }
    }

    fn lower(&mut self, ty: Type) -> CType {
        self.lower_inner(ty, false)
    }

    fn lower_inner(&mut self, ty: Type, canonical: bool) -> CType {
        match ty.kind() {
            CXType_Void => CType::Void,
            CXType_Bool => CType::Bool,
            CXType_Float => CType::Float { bits: 32 },
            CXType_Double => CType::Float { bits: 64 },
            CXType_Pointer => {
                let pointee = ty.pointee();
                CType::Pointer { is_const: pointee.is_const(), pointee: Box::new(self.lower(pointee)) }
            }
            CXType_ConstantArray => CType::Array {
                element: Box::new(self.lower(ty.element())),
                len: ty.array_len().unwrap_or(0),
            },
            CXType_IncompleteArray => {
                CType::FlexibleArray { element: Box::new(self.lower(ty.element())) }
            }
            CXType_Elaborated => self.lower(ty.named()),
            CXType_Record | CXType_Enum => self.lower_tagged(ty),
            CXType_Typedef => {
                let decl = ty.declaration();
                if self.excluded(&decl.location()) {
                    self.lower_inner(ty.canonical(), true)
                } else {
                    CType::Named(decl.spelling())
                }
            }
            CXType_FunctionProto | CXType_FunctionNoProto => {
                CType::Function(Box::new(self.fn_sig(ty)))
            }
            _ => match int_type(ty) {
                Some(int) => CType::Int(int),
                None if !canonical => self.lower_inner(ty.canonical(), true),
                None => opaque(ty),
            },
        }
    }

    fn lower_tagged(&mut self, ty: Type) -> CType {
        let decl = ty.declaration();
        let defined = decl.definition().unwrap_or(decl);
        if self.excluded(&defined.location()) {
            if decl.kind() == CXCursor_EnumDecl {
                if let Some(repr) = int_type(decl.enum_type().canonical()) {
                    return CType::Int(repr);
                }
            }
            return opaque(ty);
        }
        if decl.is_unnamed() {
            return match self.anon_names.get(&decl.usr()) {
                Some(name) => CType::Named(name.clone()),
                None => opaque(ty),
            };
        }
        CType::Named(tagged_name(decl.kind(), &decl.spelling()))
    }
}

fn opaque(ty: Type) -> CType {
    CType::Opaque { spelling: ty.spelling(), size: ty.size().unwrap_or(0), align: ty.align().unwrap_or(1) }
}

/// Where a field goes when libclang cannot say: right after the previous one.
fn next_offset_bits(fields: &[Field], align: u64, is_union: bool) -> u64 {
    if is_union {
        return 0;
    }
    let end = fields.last().map(|f| f.offset_bits / 8 + f.size).unwrap_or(0);
    let align = align.max(1);
    end.div_ceil(align) * align * 8
}

/// The first named field reachable inside an anonymous member.
fn first_field_name(record: &Cursor) -> Option<String> {
    for child in record.children() {
        match child.kind() {
            CXCursor_FieldDecl if !child.spelling().is_empty() => return Some(child.spelling()),
            CXCursor_StructDecl | CXCursor_UnionDecl if child.is_unnamed() => {
                if let Some(name) = first_field_name(&child) {
                    return Some(name);
                }
            }
            _ => {}
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn field(name: &str, offset_bits: u64, size: u64) -> Field {
        Field { name: name.into(), ty: CType::Int(IntType::I32), offset_bits, bit_width: None, size, align: size }
    }

    #[test]
    fn untagged_members_are_named_after_their_holder() {
        let outer = plain_name("struct Port").to_string();
        assert_eq!(tagged_name(CXCursor_UnionDecl, &member_name(&outer, "raddr")), "union Port__raddr");
        assert_eq!(tagged_name(CXCursor_StructDecl, &member_name(&outer, &anon_member(2))), "struct Port__anon2");
        assert_eq!(tagged_name(CXCursor_EnumDecl, "NodeTag"), "enum NodeTag");
        assert_eq!(anon_member(1), "__anon1");
    }

    #[test]
    fn missing_offsets_follow_the_previous_field() {
        assert_eq!(next_offset_bits(&[], 8, false), 0);
        let fields = [field("a", 0, 4), field("b", 32, 1)];
        assert_eq!(next_offset_bits(&fields, 1, false), 40);
        assert_eq!(next_offset_bits(&fields, 4, false), 64);
        assert_eq!(next_offset_bits(&fields, 8, true), 0);
        // an alignment of zero is treated as one
        assert_eq!(next_offset_bits(&fields, 0, false), 40);
    }
}
