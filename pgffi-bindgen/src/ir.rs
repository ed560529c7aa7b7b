//LICENSE Portions Copyright 2019-2021 ZomboDB, LLC.
//LICENSE
//LICENSE Portions Copyright 2021-2023 Technology Concepts & Design, Inc.
//LICENSE
//LICENSE Portions Copyright 2023-2023 PgCentral Foundation, Inc. <contact@pgcentral.org>
//LICENSE
//LICENSE All rights reserved.
//LICENSE
//LICENSE Use of this source code is governed by the MIT license that can be found in the LICENSE file.
//! The normalized, language-neutral record of everything extracted from a header closure.
//!
//! The extractor owns a [`DeclarationIr`] while it is being built; the emitter only ever
//! sees it by shared reference.  Symbols are keyed by their C-qualified name (`struct Foo`,
//! `enum Bar`, `Foo`) in a `BTreeMap`, so iteration order never depends on parse order.
use crate::condition::{Condition, PlatformInfo};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DeclarationIr {
    /// Postgres major version the header set belongs to
    pub version: u16,
    /// Platforms the closure was parsed for, in configuration order
    pub platforms: Vec<PlatformInfo>,
    /// Every header reached from the top-level set, relative to its include directory
    pub closure: Vec<String>,
    pub symbols: BTreeMap<String, Symbol>,
    pub diagnostics: Vec<Diagnostic>,
}

impl DeclarationIr {
    pub fn new(version: u16, platforms: Vec<PlatformInfo>) -> Self {
        DeclarationIr {
            version,
            platforms,
            closure: Vec::new(),
            symbols: BTreeMap::new(),
            diagnostics: Vec::new(),
        }
    }

    /// Insert a declaration that holds on every platform.
    pub fn insert(&mut self, name: impl Into<String>, decl: Declaration) {
        let name = name.into();
        self.symbols.insert(
            name.clone(),
            Symbol { name, variants: vec![Variant { condition: Condition::Always, decl }] },
        );
    }

    pub fn get(&self, name: &str) -> Option<&Symbol> {
        self.symbols.get(name)
    }

    pub fn cfg_for(&self, platform: &str) -> Option<&str> {
        self.platforms.iter().find(|p| p.name == platform).map(|p| p.cfg.as_str())
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Symbol {
    /// C-qualified name: `struct Foo`, `union Foo`, `enum Foo`, or a bare ordinary identifier
    pub name: String,
    pub variants: Vec<Variant>,
}

impl Symbol {
    /// The name without its tag keyword.
    pub fn plain_name(&self) -> &str {
        plain_name(&self.name)
    }

    /// The kind of the first variant.  Variants of one symbol may in theory differ in kind
    /// across platforms; filter rules key off this one.
    pub fn kind(&self) -> SymbolKind {
        self.variants.first().map(|v| v.decl.kind.symbol_kind()).unwrap_or(SymbolKind::Typedef)
    }
}

/// Strip a leading `struct `/`union `/`enum ` tag.
pub fn plain_name(qualified: &str) -> &str {
    qualified
        .strip_prefix("struct ")
        .or_else(|| qualified.strip_prefix("union "))
        .or_else(|| qualified.strip_prefix("enum "))
        .unwrap_or(qualified)
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Variant {
    pub condition: Condition,
    pub decl: Declaration,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Declaration {
    /// Header of origin, relative to the include directory that holds it
    pub header: String,
    pub kind: DeclKind,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DeclKind {
    Function(FunctionDecl),
    Record(RecordDecl),
    Enum(EnumDecl),
    Typedef(TypedefDecl),
    Constant(ConstantDecl),
    Variable(VariableDecl),
}

impl DeclKind {
    pub fn symbol_kind(&self) -> SymbolKind {
        match self {
            DeclKind::Function(_) => SymbolKind::Function,
            DeclKind::Record(r) if r.is_union => SymbolKind::Union,
            DeclKind::Record(_) => SymbolKind::Struct,
            DeclKind::Enum(_) => SymbolKind::Enum,
            DeclKind::Typedef(_) => SymbolKind::Typedef,
            DeclKind::Constant(_) => SymbolKind::Constant,
            DeclKind::Variable(_) => SymbolKind::Variable,
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SymbolKind {
    Function,
    Struct,
    Union,
    Enum,
    Typedef,
    Constant,
    Variable,
}

impl fmt::Display for SymbolKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SymbolKind::Function => "function",
            SymbolKind::Struct => "struct",
            SymbolKind::Union => "union",
            SymbolKind::Enum => "enum",
            SymbolKind::Typedef => "typedef",
            SymbolKind::Constant => "constant",
            SymbolKind::Variable => "variable",
        };
        f.write_str(s)
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IntType {
    pub bits: u16,
    pub signed: bool,
}

impl IntType {
    pub const I32: IntType = IntType { bits: 32, signed: true };
    pub const U32: IntType = IntType { bits: 32, signed: false };
    pub const I64: IntType = IntType { bits: 64, signed: true };
    pub const U64: IntType = IntType { bits: 64, signed: false };

    pub fn new(bits: u16, signed: bool) -> Self {
        IntType { bits, signed }
    }

    pub fn min_value(&self) -> i128 {
        match (self.signed, self.bits) {
            (false, _) => 0,
            (true, bits) if bits >= 128 => i128::MIN,
            (true, bits) => -(1i128 << (bits - 1)),
        }
    }

    /// Largest value, saturating at `i128::MAX` for `u128`.
    pub fn max_value(&self) -> i128 {
        match (self.signed, self.bits) {
            (true, bits) if bits >= 128 => i128::MAX,
            (true, bits) => (1i128 << (bits - 1)) - 1,
            (false, bits) if bits >= 127 => i128::MAX,
            (false, bits) => (1i128 << bits) - 1,
        }
    }

    pub fn contains(&self, value: i128) -> bool {
        value >= self.min_value() && value <= self.max_value()
    }
}

impl fmt::Display for IntType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", if self.signed { 'i' } else { 'u' }, self.bits)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "of", rename_all = "snake_case")]
pub enum CType {
    Void,
    Bool,
    Int(IntType),
    Float {
        bits: u16,
    },
    Pointer {
        pointee: Box<CType>,
        is_const: bool,
    },
    Array {
        element: Box<CType>,
        len: u64,
    },
    /// A trailing `T name[]` member
    FlexibleArray {
        element: Box<CType>,
    },
    /// Reference to another symbol by qualified name
    Named(String),
    /// A bare function type; only meaningful behind a pointer or a typedef
    Function(Box<FnSig>),
    /// No Rust equivalent: only size and alignment are kept
    Opaque {
        spelling: String,
        size: u64,
        align: u64,
    },
}

impl CType {
    pub fn pointer(pointee: CType) -> Self {
        CType::Pointer { pointee: Box::new(pointee), is_const: false }
    }

    pub fn const_pointer(pointee: CType) -> Self {
        CType::Pointer { pointee: Box::new(pointee), is_const: true }
    }

    pub fn named(name: impl Into<String>) -> Self {
        CType::Named(name.into())
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FnSig {
    pub ret: CType,
    pub params: Vec<CType>,
    pub variadic: bool,
    pub call_conv: CallConv,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallConv {
    C,
    Stdcall,
    Fastcall,
    Thiscall,
    Vectorcall,
    Win64,
    SysV64,
    Aapcs,
    /// Anything else clang reports; carries clang's spelling
    Other(String),
}

impl CallConv {
    /// The Rust ABI string, when Rust has one.
    pub fn rust_abi(&self) -> Option<&'static str> {
        match self {
            CallConv::C => Some("C"),
            CallConv::Stdcall => Some("stdcall"),
            CallConv::Fastcall => Some("fastcall"),
            CallConv::Thiscall => Some("thiscall"),
            CallConv::Vectorcall => Some("vectorcall"),
            CallConv::Win64 => Some("win64"),
            CallConv::SysV64 => Some("sysv64"),
            CallConv::Aapcs => Some("aapcs"),
            CallConv::Other(_) => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FunctionDecl {
    pub sig: FnSig,
    pub param_names: Vec<Option<String>>,
    /// `static`/`inline` in the header: there is no exported symbol to link against
    pub inline: bool,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RecordDecl {
    pub is_union: bool,
    /// Declared without a tag; the name was derived from a typedef or the enclosing record
    #[serde(default)]
    pub anonymous: bool,
    /// `false` for forward declarations never completed in the closure
    pub complete: bool,
    pub size: u64,
    pub align: u64,
    pub fields: Vec<Field>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Field {
    pub name: String,
    pub ty: CType,
    pub offset_bits: u64,
    pub bit_width: Option<u32>,
    /// `sizeof` of the field's type
    pub size: u64,
    /// `_Alignof` of the field's type
    pub align: u64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EnumDecl {
    pub repr: IntType,
    /// `enum { A, B };` with no tag and no typedef: only the values are emitted
    #[serde(default)]
    pub anonymous: bool,
    pub values: Vec<EnumValue>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EnumValue {
    pub name: String,
    pub value: i128,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TypedefDecl {
    pub target: CType,
    pub size: u64,
    pub align: u64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ConstantDecl {
    pub value: ConstValue,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ConstValue {
    Int { value: i128, ty: IntType },
    Float { value: f64, bits: u16 },
    Str { bytes: Vec<u8> },
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct VariableDecl {
    pub ty: CType,
    pub is_const: bool,
}

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Diagnostic {
    pub symbol: String,
    pub header: String,
    pub kind: DiagnosticKind,
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: `{}`: {}", self.header, self.symbol, self.kind)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum DiagnosticKind {
    UnexpandableMacro(Unexpandable),
    /// A macro named like a declaration; the declaration keeps the name.
    ShadowedMacro,
}

impl fmt::Display for DiagnosticKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DiagnosticKind::UnexpandableMacro(why) => write!(f, "macro is not a constant: {why}"),
            DiagnosticKind::ShadowedMacro => f.write_str("macro shares its name with a declaration"),
        }
    }
}

/// Why a macro did not reduce to a compile-time scalar.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, thiserror::Error)]
#[serde(rename_all = "snake_case")]
pub enum Unexpandable {
    #[error("function-like macro")]
    FunctionLike,
    #[error("expands to nothing")]
    Empty,
    #[error("calls `{0}`")]
    Call(String),
    #[error("refers to unknown identifier `{0}`")]
    UnknownIdentifier(String),
    #[error("unexpected token `{0}`")]
    UnexpectedToken(String),
    #[error("refers to itself")]
    Recursive,
    #[error("division by zero")]
    DivisionByZero,
    #[error("shift out of range")]
    ShiftOutOfRange,
    #[error("malformed literal `{0}`")]
    MalformedLiteral(String),
    #[error("unexpected end of expansion")]
    Truncated,
}
