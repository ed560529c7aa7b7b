//LICENSE Portions Copyright 2019-2021 ZomboDB, LLC.
//LICENSE
//LICENSE Portions Copyright 2021-2023 Technology Concepts & Design, Inc.
//LICENSE
//LICENSE Portions Copyright 2023-2023 PgCentral Foundation, Inc. <contact@pgcentral.org>
//LICENSE
//LICENSE All rights reserved.
//LICENSE
//LICENSE Use of this source code is governed by the MIT license that can be found in the LICENSE file.
//! Thin safe wrappers over the parts of libclang the extractor uses.
//!
//! Every `unsafe` call into `clang_sys` lives in this module.  Cursors and types are only
//! valid while the [`TranslationUnit`] they came from (and its [`Index`]) is alive; the
//! extractor drops every cursor before the unit.
#![allow(non_upper_case_globals)]

use super::macros::{Token, TokenKind};
use clang_sys::*;
use std::ffi::{CStr, CString};
use std::os::raw::{c_char, c_int, c_uint, c_ulong, c_void};
use std::path::PathBuf;
use std::ptr;

/// Load libclang for the current thread.  With the `runtime` feature the library handle is
/// thread-local, so every thread that parses must call this.
pub fn ensure_loaded() -> Result<(), String> {
    if clang_sys::is_loaded() {
        return Ok(());
    }
    clang_sys::load()
}

fn into_string(s: CXString) -> String {
    unsafe {
        let ptr = clang_getCString(s);
        let out = if ptr.is_null() {
            String::new()
        } else {
            CStr::from_ptr(ptr).to_string_lossy().into_owned()
        };
        clang_disposeString(s);
        out
    }
}

pub struct Index {
    x: CXIndex,
}

impl Index {
    pub fn new() -> Self {
        Index { x: unsafe { clang_createIndex(0, 0) } }
    }
}

impl Drop for Index {
    fn drop(&mut self) {
        unsafe { clang_disposeIndex(self.x) }
    }
}

pub struct TranslationUnit {
    x: CXTranslationUnit,
}

/// A diagnostic at error severity or above.
#[derive(Debug, Clone)]
pub struct ParseProblem {
    pub message: String,
}

impl TranslationUnit {
    /// Parse `contents` as if it were a file named `file_name`, without touching disk.
    pub fn parse(
        index: &Index,
        file_name: &str,
        contents: &str,
        args: &[String],
    ) -> Result<TranslationUnit, String> {
        let c_file = CString::new(file_name).map_err(|e| e.to_string())?;
        let c_contents = CString::new(contents).map_err(|e| e.to_string())?;
        let c_args = args
            .iter()
            .map(|a| CString::new(a.as_str()))
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| e.to_string())?;
        let arg_ptrs = c_args.iter().map(|a| a.as_ptr()).collect::<Vec<*const c_char>>();
        let mut unsaved = [CXUnsavedFile {
            Filename: c_file.as_ptr(),
            Contents: c_contents.as_ptr(),
            Length: contents.len() as c_ulong,
        }];
        let options = CXTranslationUnit_DetailedPreprocessingRecord
            | CXTranslationUnit_SkipFunctionBodies;

        let mut tu: CXTranslationUnit = ptr::null_mut();
        let code = unsafe {
            clang_parseTranslationUnit2(
                index.x,
                c_file.as_ptr(),
                arg_ptrs.as_ptr(),
                arg_ptrs.len() as c_int,
                unsaved.as_mut_ptr(),
                unsaved.len() as c_uint,
                options,
                &mut tu,
            )
        };
        if code != CXError_Success || tu.is_null() {
            return Err(format!("libclang could not parse `{file_name}` (error code {code})"));
        }
        Ok(TranslationUnit { x: tu })
    }

    /// Diagnostics of error or fatal severity, formatted with their location.
    pub fn errors(&self) -> Vec<ParseProblem> {
        let mut out = Vec::new();
        unsafe {
            for i in 0..clang_getNumDiagnostics(self.x) {
                let diag = clang_getDiagnostic(self.x, i);
                let severity = clang_getDiagnosticSeverity(diag);
                if severity == CXDiagnostic_Error || severity == CXDiagnostic_Fatal {
                    let message =
                        into_string(clang_formatDiagnostic(diag, clang_defaultDiagnosticDisplayOptions()));
                    out.push(ParseProblem { message });
                }
                clang_disposeDiagnostic(diag);
            }
        }
        out
    }

    pub fn cursor(&self) -> Cursor {
        Cursor { x: unsafe { clang_getTranslationUnitCursor(self.x) } }
    }

    /// Every file reached by `#include`, directly or not.
    pub fn inclusions(&self) -> Vec<PathBuf> {
        extern "C" fn visit(
            file: CXFile,
            _stack: *mut CXSourceLocation,
            _len: c_uint,
            data: CXClientData,
        ) {
            let files = unsafe { &mut *(data as *mut Vec<PathBuf>) };
            let name = into_string(unsafe { clang_getFileName(file) });
            if !name.is_empty() {
                files.push(PathBuf::from(name));
            }
        }
        let mut files: Vec<PathBuf> = Vec::new();
        unsafe {
            clang_getInclusions(self.x, visit, &mut files as *mut Vec<PathBuf> as *mut c_void);
        }
        files
    }

    /// The tokens covered by `cursor`.
    pub fn tokens(&self, cursor: &Cursor) -> Vec<Token> {
        let mut out = Vec::new();
        unsafe {
            let range = clang_getCursorExtent(cursor.x);
            let mut tokens: *mut CXToken = ptr::null_mut();
            let mut count: c_uint = 0;
            clang_tokenize(self.x, range, &mut tokens, &mut count);
            if tokens.is_null() {
                return out;
            }
            for tok in std::slice::from_raw_parts(tokens, count as usize) {
                let kind = match clang_getTokenKind(*tok) {
                    CXToken_Punctuation => TokenKind::Punctuation,
                    CXToken_Keyword => TokenKind::Keyword,
                    CXToken_Identifier => TokenKind::Identifier,
                    CXToken_Literal => TokenKind::Literal,
                    _ => continue,
                };
                out.push(Token::new(kind, into_string(clang_getTokenSpelling(self.x, *tok))));
            }
            clang_disposeTokens(self.x, tokens, count);
        }
        out
    }
}

impl Drop for TranslationUnit {
    fn drop(&mut self) {
        unsafe { clang_disposeTranslationUnit(self.x) }
    }
}

#[derive(Copy, Clone)]
pub struct Cursor {
    x: CXCursor,
}

impl PartialEq for Cursor {
    fn eq(&self, other: &Cursor) -> bool {
        unsafe { clang_equalCursors(self.x, other.x) != 0 }
    }
}

/// Where a declaration comes from.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Location {
    /// `None` for builtins and anything else without a file
    pub file: Option<PathBuf>,
    pub line: u32,
    pub in_system_header: bool,
    pub in_main_file: bool,
}

impl Cursor {
    pub fn kind(&self) -> CXCursorKind {
        unsafe { clang_getCursorKind(self.x) }
    }

    pub fn spelling(&self) -> String {
        into_string(unsafe { clang_getCursorSpelling(self.x) })
    }

    pub fn usr(&self) -> String {
        into_string(unsafe { clang_getCursorUSR(self.x) })
    }

    pub fn is_null(&self) -> bool {
        unsafe { clang_Cursor_isNull(self.x) != 0 }
    }

    pub fn location(&self) -> Location {
        unsafe {
            let loc = clang_getCursorLocation(self.x);
            let mut file: CXFile = ptr::null_mut();
            let mut line: c_uint = 0;
            let mut col: c_uint = 0;
            let mut offset: c_uint = 0;
            clang_getExpansionLocation(loc, &mut file, &mut line, &mut col, &mut offset);
            let file = if file.is_null() {
                None
            } else {
                Some(into_string(clang_getFileName(file))).filter(|s| !s.is_empty()).map(PathBuf::from)
            };
            Location {
                file,
                line,
                in_system_header: clang_Location_isInSystemHeader(loc) != 0,
                in_main_file: clang_Location_isFromMainFile(loc) != 0,
            }
        }
    }

    /// Visit direct children in source order.
    pub fn children(&self) -> Vec<Cursor> {
        let mut out = Vec::new();
        self.visit(|child| {
            out.push(child);
            CXChildVisit_Continue
        });
        out
    }

    pub fn visit<F>(&self, mut f: F)
    where
        F: FnMut(Cursor) -> CXChildVisitResult,
    {
        extern "C" fn trampoline<F>(
            cursor: CXCursor,
            _parent: CXCursor,
            data: CXClientData,
        ) -> CXChildVisitResult
        where
            F: FnMut(Cursor) -> CXChildVisitResult,
        {
            let f = unsafe { &mut *(data as *mut F) };
            f(Cursor { x: cursor })
        }
        unsafe {
            clang_visitChildren(self.x, trampoline::<F>, &mut f as *mut F as CXClientData);
        }
    }

    pub fn cur_type(&self) -> Type {
        Type { x: unsafe { clang_getCursorType(self.x) } }
    }

    pub fn is_definition(&self) -> bool {
        unsafe { clang_isCursorDefinition(self.x) != 0 }
    }

    pub fn definition(&self) -> Option<Cursor> {
        let def = Cursor { x: unsafe { clang_getCursorDefinition(self.x) } };
        (!def.is_null()).then_some(def)
    }

    /// No tag, e.g. `struct { int a; }`.  Newer libclangs spell these
    /// `struct (unnamed at file:line:col)` instead of leaving them empty.
    pub fn is_unnamed(&self) -> bool {
        let spelling = self.spelling();
        spelling.is_empty() || spelling.contains("(unnamed") || spelling.contains("(anonymous")
    }

    pub fn typedef_target(&self) -> Type {
        Type { x: unsafe { clang_getTypedefDeclUnderlyingType(self.x) } }
    }

    pub fn enum_type(&self) -> Type {
        Type { x: unsafe { clang_getEnumDeclIntegerType(self.x) } }
    }

    pub fn enum_value_signed(&self) -> i64 {
        unsafe { clang_getEnumConstantDeclValue(self.x) }
    }

    pub fn enum_value_unsigned(&self) -> u64 {
        unsafe { clang_getEnumConstantDeclUnsignedValue(self.x) }
    }

    pub fn num_args(&self) -> usize {
        usize::try_from(unsafe { clang_Cursor_getNumArguments(self.x) }).unwrap_or(0)
    }

    pub fn arg(&self, i: usize) -> Cursor {
        Cursor { x: unsafe { clang_Cursor_getArgument(self.x, i as c_uint) } }
    }

    /// Bit offset of a field within its record.
    pub fn field_offset_bits(&self) -> Option<u64> {
        u64::try_from(unsafe { clang_Cursor_getOffsetOfField(self.x) }).ok()
    }

    pub fn bit_width(&self) -> Option<u32> {
        unsafe {
            if clang_Cursor_isBitField(self.x) == 0 {
                return None;
            }
            u32::try_from(clang_getFieldDeclBitWidth(self.x)).ok()
        }
    }

    pub fn is_static(&self) -> bool {
        unsafe { clang_Cursor_getStorageClass(self.x) == CX_SC_Static }
    }

    pub fn is_inline(&self) -> bool {
        unsafe { clang_Cursor_isFunctionInlined(self.x) != 0 }
    }

    pub fn is_macro_function_like(&self) -> bool {
        unsafe { clang_Cursor_isMacroFunctionLike(self.x) != 0 }
    }

    pub fn is_macro_builtin(&self) -> bool {
        unsafe { clang_Cursor_isMacroBuiltin(self.x) != 0 }
    }
}

#[derive(Copy, Clone)]
pub struct Type {
    x: CXType,
}

impl Type {
    pub fn kind(&self) -> CXTypeKind {
        self.x.kind
    }

    pub fn spelling(&self) -> String {
        into_string(unsafe { clang_getTypeSpelling(self.x) })
    }

    /// `sizeof`, or `None` for incomplete and dependent types.
    pub fn size(&self) -> Option<u64> {
        u64::try_from(unsafe { clang_Type_getSizeOf(self.x) }).ok()
    }

    pub fn align(&self) -> Option<u64> {
        u64::try_from(unsafe { clang_Type_getAlignOf(self.x) }).ok()
    }

    /// Bit offset of a (possibly indirect) field by name.
    pub fn offset_of(&self, field: &str) -> Option<u64> {
        let name = CString::new(field).ok()?;
        u64::try_from(unsafe { clang_Type_getOffsetOf(self.x, name.as_ptr()) }).ok()
    }

    pub fn is_const(&self) -> bool {
        unsafe { clang_isConstQualifiedType(self.x) != 0 }
    }

    pub fn canonical(&self) -> Type {
        Type { x: unsafe { clang_getCanonicalType(self.x) } }
    }

    pub fn pointee(&self) -> Type {
        Type { x: unsafe { clang_getPointeeType(self.x) } }
    }

    pub fn element(&self) -> Type {
        Type { x: unsafe { clang_getArrayElementType(self.x) } }
    }

    pub fn array_len(&self) -> Option<u64> {
        u64::try_from(unsafe { clang_getArraySize(self.x) }).ok()
    }

    /// The type behind an elaborated `struct Foo` / `enum Bar` spelling.
    pub fn named(&self) -> Type {
        Type { x: unsafe { clang_Type_getNamedType(self.x) } }
    }

    pub fn declaration(&self) -> Cursor {
        Cursor { x: unsafe { clang_getTypeDeclaration(self.x) } }
    }

    pub fn result(&self) -> Type {
        Type { x: unsafe { clang_getResultType(self.x) } }
    }

    /// Parameter types, or `None` for an unprototyped `f()`.
    pub fn args(&self) -> Option<Vec<Type>> {
        let n = u32::try_from(unsafe { clang_getNumArgTypes(self.x) }).ok()?;
        Some((0..n).map(|i| Type { x: unsafe { clang_getArgType(self.x, i) } }).collect())
    }

    pub fn is_variadic(&self) -> bool {
        unsafe { clang_isFunctionTypeVariadic(self.x) != 0 }
    }

    pub fn calling_convention(&self) -> CXCallingConv {
        unsafe { clang_getFunctionTypeCallingConv(self.x) }
    }
}
