//LICENSE Portions Copyright 2019-2021 ZomboDB, LLC.
//LICENSE
//LICENSE Portions Copyright 2021-2023 Technology Concepts & Design, Inc.
//LICENSE
//LICENSE Portions Copyright 2023-2023 PgCentral Foundation, Inc. <contact@pgcentral.org>
//LICENSE
//LICENSE All rights reserved.
//LICENSE
//LICENSE Use of this source code is governed by the MIT license that can be found in the LICENSE file.
//! Evaluation of object-like macros to compile-time constants.
//!
//! A macro is kept only when its expansion is a C constant expression over literals, other
//! such macros, enum constants and casts to integer types.  Everything else is refused with
//! an [`Unexpandable`] reason.  Integer arithmetic follows C: literals get the first type
//! that can hold them, operands go through the usual arithmetic conversions, and results
//! wrap to the width of their type.
use crate::ir::{ConstValue, IntType, Unexpandable};
use std::collections::{BTreeMap, BTreeSet, HashMap};

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum TokenKind {
    Punctuation,
    Keyword,
    Identifier,
    Literal,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Token {
    pub kind: TokenKind,
    pub text: String,
}

impl Token {
    pub fn new(kind: TokenKind, text: impl Into<String>) -> Self {
        Token { kind, text: text.into() }
    }
}

/// A `#define` as found in the preprocessing record.
#[derive(Clone, Debug)]
pub struct MacroDef {
    pub name: String,
    pub header: String,
    /// The replacement list, without the macro name
    pub tokens: Vec<Token>,
    pub function_like: bool,
}

/// Widths of C's integer types on the platform being parsed.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct IntModel {
    pub char_signed: bool,
    pub short: u16,
    pub int: u16,
    pub long: u16,
    pub long_long: u16,
}

impl IntModel {
    pub const LP64: IntModel =
        IntModel { char_signed: true, short: 16, int: 32, long: 64, long_long: 64 };
    pub const LLP64: IntModel =
        IntModel { char_signed: true, short: 16, int: 32, long: 32, long_long: 64 };

    fn int(&self) -> IntType {
        IntType::new(self.int, true)
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    Int(i128, IntType),
    Float(f64, u16),
    Str(Vec<u8>),
}

impl From<Value> for ConstValue {
    fn from(value: Value) -> Self {
        match value {
            Value::Int(value, ty) => ConstValue::Int { value, ty },
            Value::Float(value, bits) => ConstValue::Float { value, bits },
            Value::Str(bytes) => ConstValue::Str { bytes },
        }
    }
}

/// Every macro definition seen in a translation unit, plus what macros may refer to.
pub struct MacroTable<'a> {
    defs: BTreeMap<String, MacroDef>,
    int_typedefs: &'a BTreeMap<String, IntType>,
    enum_constants: &'a BTreeMap<String, (i128, IntType)>,
    model: IntModel,
    memo: HashMap<String, Result<Value, Unexpandable>>,
    in_progress: BTreeSet<String>,
}

impl<'a> MacroTable<'a> {
    pub fn new(
        defs: impl IntoIterator<Item = MacroDef>,
        int_typedefs: &'a BTreeMap<String, IntType>,
        enum_constants: &'a BTreeMap<String, (i128, IntType)>,
        model: IntModel,
    ) -> Self {
        // a later #define of the same name replaces the earlier one
        let defs = defs.into_iter().map(|d| (d.name.clone(), d)).collect();
        MacroTable {
            defs,
            int_typedefs,
            enum_constants,
            model,
            memo: HashMap::new(),
            in_progress: BTreeSet::new(),
        }
    }

    pub fn defs(&self) -> impl Iterator<Item = &MacroDef> {
        self.defs.values()
    }

    pub fn evaluate(&mut self, name: &str) -> Result<Value, Unexpandable> {
        if let Some(done) = self.memo.get(name) {
            return done.clone();
        }
        let Some(def) = self.defs.get(name) else {
            return Err(Unexpandable::UnknownIdentifier(name.to_string()));
        };
        if def.function_like {
            return Err(Unexpandable::FunctionLike);
        }
        if def.tokens.is_empty() {
            return Err(Unexpandable::Empty);
        }
        if !self.in_progress.insert(name.to_string()) {
            return Err(Unexpandable::Recursive);
        }
        let tokens = def.tokens.clone();
        let result = Parser { tokens: &tokens, pos: 0, skipping: 0, table: self }.parse_all();
        self.in_progress.remove(name);
        self.memo.insert(name.to_string(), result.clone());
        result
    }
}

struct Parser<'t, 'a, 'm> {
    tokens: &'t [Token],
    pos: usize,
    /// Nesting depth of operands C does not evaluate, as in the untaken arm of `?:`
    skipping: u32,
    table: &'m mut MacroTable<'a>,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum CastTo {
    Int(IntType),
    /// `_Bool` compares with zero instead of truncating
    Bool,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum BinOp {
    Mul,
    Div,
    Rem,
    Add,
    Sub,
    Shl,
    Shr,
    Lt,
    Gt,
    Le,
    Ge,
    Eq,
    Ne,
    BitAnd,
    BitXor,
    BitOr,
    And,
    Or,
}

impl BinOp {
    fn from_token(text: &str) -> Option<(BinOp, u8)> {
        let op = match text {
            "*" => (BinOp::Mul, 11),
            "/" => (BinOp::Div, 11),
            "%" => (BinOp::Rem, 11),
            "+" => (BinOp::Add, 10),
            "-" => (BinOp::Sub, 10),
            "<<" => (BinOp::Shl, 9),
            ">>" => (BinOp::Shr, 9),
            "<" => (BinOp::Lt, 8),
            ">" => (BinOp::Gt, 8),
            "<=" => (BinOp::Le, 8),
            ">=" => (BinOp::Ge, 8),
            "==" => (BinOp::Eq, 7),
            "!=" => (BinOp::Ne, 7),
            "&" => (BinOp::BitAnd, 6),
            "^" => (BinOp::BitXor, 5),
            "|" => (BinOp::BitOr, 4),
            "&&" => (BinOp::And, 3),
            "||" => (BinOp::Or, 2),
            _ => return None,
        };
        Some(op)
    }
}

const TERNARY_BP: u8 = 1;
const UNARY_BP: u8 = 12;

impl Parser<'_, '_, '_> {
    fn parse_all(mut self) -> Result<Value, Unexpandable> {
        let value = self.expr(0)?;
        match self.tokens.get(self.pos) {
            None => Ok(value),
            Some(tok) => Err(Unexpandable::UnexpectedToken(tok.text.clone())),
        }
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn peek_is(&self, text: &str) -> bool {
        self.peek().is_some_and(|t| t.kind == TokenKind::Punctuation && t.text == text)
    }

    fn next(&mut self) -> Result<Token, Unexpandable> {
        let tok = self.tokens.get(self.pos).cloned().ok_or(Unexpandable::Truncated)?;
        self.pos += 1;
        Ok(tok)
    }

    fn expect(&mut self, text: &str) -> Result<(), Unexpandable> {
        let tok = self.next()?;
        if tok.text == text {
            Ok(())
        } else {
            Err(Unexpandable::UnexpectedToken(tok.text))
        }
    }

    fn expr(&mut self, min_bp: u8) -> Result<Value, Unexpandable> {
        let mut lhs = self.unary()?;
        loop {
            let Some(tok) = self.peek() else { break };
            if tok.kind != TokenKind::Punctuation {
                return Err(Unexpandable::UnexpectedToken(tok.text.clone()));
            }
            if tok.text == "?" {
                if TERNARY_BP < min_bp {
                    break;
                }
                self.pos += 1;
                let pick = is_true(&lhs, "?")?;
                let then = self.evaluated_if(pick, |p| p.expr(0))?;
                self.expect(":")?;
                let otherwise = self.evaluated_if(!pick, |p| p.expr(TERNARY_BP))?;
                lhs = self.ternary(pick, then, otherwise)?;
                continue;
            }
            let Some((op, bp)) = BinOp::from_token(&tok.text) else { break };
            if bp <= min_bp {
                break;
            }
            self.pos += 1;
            let rhs = match op {
                BinOp::And => {
                    let needed = is_true(&lhs, "&&")?;
                    self.evaluated_if(needed, |p| p.expr(bp))?
                }
                BinOp::Or => {
                    let needed = !is_true(&lhs, "||")?;
                    self.evaluated_if(needed, |p| p.expr(bp))?
                }
                _ => self.expr(bp)?,
            };
            lhs = self.binary(op, lhs, rhs)?;
        }
        Ok(lhs)
    }

    /// Parse an operand; when it is not `evaluated`, arithmetic faults inside it are not errors.
    fn evaluated_if(
        &mut self,
        evaluated: bool,
        operand: impl FnOnce(&mut Self) -> Result<Value, Unexpandable>,
    ) -> Result<Value, Unexpandable> {
        if evaluated {
            return operand(self);
        }
        self.skipping += 1;
        let value = operand(self);
        self.skipping -= 1;
        value
    }

    fn unary(&mut self) -> Result<Value, Unexpandable> {
        let tok = self.next()?;
        match (tok.kind, tok.text.as_str()) {
            (TokenKind::Punctuation, "(") => {
                if let Some(to) = self.cast_type()? {
                    let value = self.expr(UNARY_BP)?;
                    return self.cast(value, to);
                }
                let value = self.expr(0)?;
                self.expect(")")?;
                Ok(value)
            }
            (TokenKind::Punctuation, "-") => {
                let value = self.expr(UNARY_BP)?;
                match value {
                    Value::Int(v, ty) => {
                        let ty = self.promote(ty);
                        Ok(Value::Int(wrap(v.wrapping_neg(), ty), ty))
                    }
                    Value::Float(v, bits) => Ok(Value::Float(-v, bits)),
                    Value::Str(_) => Err(Unexpandable::UnexpectedToken("-".into())),
                }
            }
            (TokenKind::Punctuation, "+") => match self.expr(UNARY_BP)? {
                Value::Int(v, ty) => Ok(Value::Int(v, self.promote(ty))),
                Value::Str(_) => Err(Unexpandable::UnexpectedToken("+".into())),
                float => Ok(float),
            },
            (TokenKind::Punctuation, "~") => {
                let (v, ty) = self.int_operand("~")?;
                let ty = self.promote(ty);
                Ok(Value::Int(wrap(!v, ty), ty))
            }
            (TokenKind::Punctuation, "!") => {
                let value = self.expr(UNARY_BP)?;
                let truth = is_true(&value, "!")?;
                Ok(self.boolean(!truth))
            }
            (TokenKind::Literal, text) => self.literal(text),
            (TokenKind::Identifier, name) => {
                if self.peek_is("(") {
                    return Err(Unexpandable::Call(name.to_string()));
                }
                self.identifier(name)
            }
            (TokenKind::Keyword, call @ ("sizeof" | "_Alignof" | "__alignof__")) => {
                Err(Unexpandable::Call(call.to_string()))
            }
            (_, text) => Err(Unexpandable::UnexpectedToken(text.to_string())),
        }
    }

    fn int_operand(&mut self, op: &str) -> Result<(i128, IntType), Unexpandable> {
        match self.expr(UNARY_BP)? {
            Value::Int(v, ty) => Ok((v, ty)),
            _ => Err(Unexpandable::UnexpectedToken(op.into())),
        }
    }

    fn identifier(&mut self, name: &str) -> Result<Value, Unexpandable> {
        if let Some((value, ty)) = self.table.enum_constants.get(name) {
            return Ok(Value::Int(*value, *ty));
        }
        if self.table.defs.contains_key(name) {
            return match self.table.evaluate(name) {
                Ok(value) => Ok(value),
                Err(Unexpandable::Recursive) => Err(Unexpandable::Recursive),
                // the referenced macro has its own diagnostic
                Err(Unexpandable::FunctionLike) => Err(Unexpandable::Call(name.to_string())),
                Err(_) => Err(Unexpandable::UnknownIdentifier(name.to_string())),
            };
        }
        Err(Unexpandable::UnknownIdentifier(name.to_string()))
    }

    /// After a `(`: if what follows is an integer type name and `)`, consume it.
    fn cast_type(&mut self) -> Result<Option<CastTo>, Unexpandable> {
        let start = self.pos;
        let mut words = Vec::new();
        while let Some(tok) = self.peek() {
            match tok.kind {
                TokenKind::Keyword | TokenKind::Identifier => {
                    words.push(tok.text.clone());
                    self.pos += 1;
                }
                TokenKind::Punctuation if tok.text == ")" && !words.is_empty() => break,
                _ => {
                    self.pos = start;
                    return Ok(None);
                }
            }
        }
        if !self.peek_is(")") {
            self.pos = start;
            return Ok(None);
        }
        let ty = match words.as_slice() {
            [single] if self.table.int_typedefs.contains_key(single.as_str())
                && !self.table.defs.contains_key(single.as_str()) =>
            {
                self.table.int_typedefs.get(single.as_str()).copied().map(CastTo::Int)
            }
            _ if words.iter().any(|w| w == "_Bool") => self.keyword_type(&words).map(|_| CastTo::Bool),
            _ => self.keyword_type(&words).map(CastTo::Int),
        };
        match ty {
            Some(ty) => {
                self.pos += 1;
                Ok(Some(ty))
            }
            None => {
                self.pos = start;
                Ok(None)
            }
        }
    }

    fn keyword_type(&self, words: &[String]) -> Option<IntType> {
        let model = &self.table.model;
        let mut unsigned = false;
        let mut signed = false;
        let mut base = None;
        let mut longs = 0;
        for word in words {
            match word.as_str() {
                "unsigned" => unsigned = true,
                "signed" => signed = true,
                "const" | "volatile" => {}
                "long" => longs += 1,
                "int" => {
                    if base.is_none() {
                        base = Some("int");
                    }
                }
                "short" | "char" | "_Bool" => {
                    if base.is_some_and(|b| b != "int") {
                        return None;
                    }
                    base = Some(word.as_str());
                }
                _ => return None,
            }
        }
        if unsigned && signed {
            return None;
        }
        let bits = match (base, longs) {
            (Some("char"), 0) => {
                let is_signed = if unsigned || signed { signed } else { model.char_signed };
                return Some(IntType::new(8, is_signed));
            }
            (Some("_Bool"), 0) if !unsigned && !signed => return Some(IntType::new(8, false)),
            (Some("short"), 0) => model.short,
            (Some("int") | None, 0) if unsigned || signed || base.is_some() => model.int,
            (Some("int") | None, 1) => model.long,
            (Some("int") | None, 2) => model.long_long,
            _ => return None,
        };
        Some(IntType::new(bits, !unsigned))
    }

    fn cast(&self, value: Value, to: CastTo) -> Result<Value, Unexpandable> {
        let ty = match to {
            CastTo::Int(ty) => ty,
            CastTo::Bool => {
                let truth = is_true(&value, "(")?;
                return Ok(Value::Int(truth as i128, IntType::new(8, false)));
            }
        };
        match value {
            Value::Int(v, _) => Ok(Value::Int(wrap(v, ty), ty)),
            Value::Float(f, _) if f.is_finite() => Ok(Value::Int(wrap(f.trunc() as i128, ty), ty)),
            _ => Err(Unexpandable::UnexpectedToken("(".into())),
        }
    }

    fn literal(&mut self, text: &str) -> Result<Value, Unexpandable> {
        let first = text.chars().next().ok_or(Unexpandable::Truncated)?;
        if first == '"' || text.starts_with("u8\"") {
            let mut bytes = string_literal(text)?;
            // adjacent string literals concatenate
            while let Some(next) = self.peek() {
                if next.kind != TokenKind::Literal
                    || !(next.text.starts_with('"') || next.text.starts_with("u8\""))
                {
                    break;
                }
                let next = self.next()?;
                bytes.extend(string_literal(&next.text)?);
            }
            return Ok(Value::Str(bytes));
        }
        if first == '\'' {
            return char_literal(text, self.table.model);
        }
        if first.is_ascii_digit() || first == '.' {
            return number_literal(text, self.table.model);
        }
        Err(Unexpandable::MalformedLiteral(text.to_string()))
    }

    fn promote(&self, ty: IntType) -> IntType {
        if ty.bits < self.table.model.int {
            self.table.model.int()
        } else {
            ty
        }
    }

    fn boolean(&self, truth: bool) -> Value {
        Value::Int(truth as i128, self.table.model.int())
    }

    /// C's usual arithmetic conversions for two integer types.
    fn common_type(&self, a: IntType, b: IntType) -> IntType {
        let (a, b) = (self.promote(a), self.promote(b));
        if a.signed == b.signed {
            return if a.bits >= b.bits { a } else { b };
        }
        let (unsigned, signed) = if a.signed { (b, a) } else { (a, b) };
        if unsigned.bits >= signed.bits {
            unsigned
        } else {
            signed
        }
    }

    fn ternary(&self, pick: bool, then: Value, otherwise: Value) -> Result<Value, Unexpandable> {
        match (then, otherwise) {
            (Value::Int(a, ta), Value::Int(b, tb)) => {
                let ty = self.common_type(ta, tb);
                let v = if pick { a } else { b };
                Ok(Value::Int(wrap(v, ty), ty))
            }
            (Value::Str(a), Value::Str(b)) => Ok(Value::Str(if pick { a } else { b })),
            (a @ (Value::Int(..) | Value::Float(..)), b @ (Value::Int(..) | Value::Float(..))) => {
                let bits = float_bits(&a).max(float_bits(&b));
                let v = if pick { as_f64(&a) } else { as_f64(&b) };
                Ok(Value::Float(v, bits))
            }
            _ => Err(Unexpandable::UnexpectedToken(":".into())),
        }
    }

    fn binary(&self, op: BinOp, lhs: Value, rhs: Value) -> Result<Value, Unexpandable> {
        match (lhs, rhs) {
            (Value::Int(a, ta), Value::Int(b, tb)) => self.int_binary(op, a, ta, b, tb),
            (a @ (Value::Int(..) | Value::Float(..)), b @ (Value::Int(..) | Value::Float(..))) => {
                self.float_binary(op, a, b)
            }
            _ => Err(Unexpandable::UnexpectedToken(format!("{op:?}"))),
        }
    }

    fn int_binary(
        &self,
        op: BinOp,
        a: i128,
        ta: IntType,
        b: i128,
        tb: IntType,
    ) -> Result<Value, Unexpandable> {
        if let BinOp::Shl | BinOp::Shr = op {
            let ty = self.promote(ta);
            if b < 0 || b >= ty.bits as i128 {
                return self.unevaluated_fault(Unexpandable::ShiftOutOfRange, ty);
            }
            let v = if op == BinOp::Shl { a.wrapping_shl(b as u32) } else { a >> b };
            return Ok(Value::Int(wrap(v, ty), ty));
        }
        if let BinOp::And | BinOp::Or = op {
            let truth = if op == BinOp::And { a != 0 && b != 0 } else { a != 0 || b != 0 };
            return Ok(self.boolean(truth));
        }

        let ty = self.common_type(ta, tb);
        let (a, b) = (wrap(a, ty), wrap(b, ty));
        let v = match op {
            BinOp::Add => a.wrapping_add(b),
            BinOp::Sub => a.wrapping_sub(b),
            BinOp::Mul => a.wrapping_mul(b),
            BinOp::Div | BinOp::Rem if b == 0 => {
                return self.unevaluated_fault(Unexpandable::DivisionByZero, ty)
            }
            BinOp::Div => a.wrapping_div(b),
            BinOp::Rem => a.wrapping_rem(b),
            BinOp::BitAnd => a & b,
            BinOp::BitXor => a ^ b,
            BinOp::BitOr => a | b,
            BinOp::Lt => return Ok(self.boolean(a < b)),
            BinOp::Gt => return Ok(self.boolean(a > b)),
            BinOp::Le => return Ok(self.boolean(a <= b)),
            BinOp::Ge => return Ok(self.boolean(a >= b)),
            BinOp::Eq => return Ok(self.boolean(a == b)),
            BinOp::Ne => return Ok(self.boolean(a != b)),
            BinOp::Shl | BinOp::Shr | BinOp::And | BinOp::Or => unreachable!("handled above"),
        };
        Ok(Value::Int(wrap(v, ty), ty))
    }

    fn unevaluated_fault(&self, fault: Unexpandable, ty: IntType) -> Result<Value, Unexpandable> {
        if self.skipping > 0 {
            Ok(Value::Int(0, ty))
        } else {
            Err(fault)
        }
    }

    fn float_binary(&self, op: BinOp, a: Value, b: Value) -> Result<Value, Unexpandable> {
        let bits = float_bits(&a).max(float_bits(&b));
        let (x, y) = (as_f64(&a), as_f64(&b));
        let v = match op {
            BinOp::Add => x + y,
            BinOp::Sub => x - y,
            BinOp::Mul => x * y,
            BinOp::Div => x / y,
            BinOp::Lt => return Ok(self.boolean(x < y)),
            BinOp::Gt => return Ok(self.boolean(x > y)),
            BinOp::Le => return Ok(self.boolean(x <= y)),
            BinOp::Ge => return Ok(self.boolean(x >= y)),
            BinOp::Eq => return Ok(self.boolean(x == y)),
            BinOp::Ne => return Ok(self.boolean(x != y)),
            BinOp::And => return Ok(self.boolean(x != 0.0 && y != 0.0)),
            BinOp::Or => return Ok(self.boolean(x != 0.0 || y != 0.0)),
            other => return Err(Unexpandable::UnexpectedToken(format!("{other:?}"))),
        };
        Ok(Value::Float(v, bits))
    }
}

fn is_true(value: &Value, op: &str) -> Result<bool, Unexpandable> {
    match value {
        Value::Int(v, _) => Ok(*v != 0),
        Value::Float(f, _) => Ok(*f != 0.0),
        Value::Str(_) => Err(Unexpandable::UnexpectedToken(op.into())),
    }
}

/// Integers take part in float arithmetic as the narrowest float, which is then widened.
fn float_bits(value: &Value) -> u16 {
    match value {
        Value::Float(_, bits) => *bits,
        _ => 32,
    }
}

fn as_f64(value: &Value) -> f64 {
    match value {
        Value::Int(v, _) => *v as f64,
        Value::Float(f, _) => *f,
        Value::Str(_) => f64::NAN,
    }
}

/// Reduce `value` modulo 2^bits and reinterpret it in `ty`.
pub(crate) fn wrap(value: i128, ty: IntType) -> i128 {
    if ty.bits >= 128 {
        return value;
    }
    let modulus = 1i128 << ty.bits;
    let low = value & (modulus - 1);
    if ty.signed && low >= modulus >> 1 {
        low - modulus
    } else {
        low
    }
}

fn number_literal(text: &str, model: IntModel) -> Result<Value, Unexpandable> {
    let malformed = || Unexpandable::MalformedLiteral(text.to_string());
    let clean = text.replace('\'', "");
    let lower = clean.to_ascii_lowercase();

    let is_hex = lower.starts_with("0x");
    let is_float = if is_hex {
        lower.contains('.') || lower.contains('p')
    } else {
        lower.contains('.') || lower.contains('e')
    };
    if is_float {
        return float_literal(&lower).ok_or_else(malformed);
    }

    let digits_end = lower
        .char_indices()
        .find(|(i, c)| {
            !(c.is_ascii_hexdigit() || (*i == 1 && is_hex && *c == 'x' || *c == 'b' && *i == 1))
        })
        .map(|(i, _)| i)
        .unwrap_or(lower.len());
    let (digits, suffix) = lower.split_at(digits_end);
    let (radix, body) = if is_hex {
        (16, &digits[2..])
    } else if let Some(bin) = digits.strip_prefix("0b") {
        (2, bin)
    } else if digits.len() > 1 && digits.starts_with('0') {
        (8, &digits[1..])
    } else {
        (10, digits)
    };
    if body.is_empty() && radix != 8 {
        return Err(malformed());
    }
    let value = if body.is_empty() { 0 } else { u128::from_str_radix(body, radix).map_err(|_| malformed())? };

    let (unsigned, longs) = match suffix {
        "" => (false, 0),
        "u" => (true, 0),
        "l" => (false, 1),
        "ul" | "lu" => (true, 1),
        "ll" => (false, 2),
        "ull" | "llu" => (true, 2),
        _ => return Err(malformed()),
    };

    let int = IntType::new(model.int, true);
    let uint = IntType::new(model.int, false);
    let long = IntType::new(model.long, true);
    let ulong = IntType::new(model.long, false);
    let llong = IntType::new(model.long_long, true);
    let ullong = IntType::new(model.long_long, false);
    let decimal = radix == 10;
    let candidates = match (unsigned, longs, decimal) {
        (false, 0, true) => vec![int, long, llong],
        (false, 0, false) => vec![int, uint, long, ulong, llong, ullong],
        (true, 0, _) => vec![uint, ulong, ullong],
        (false, 1, true) => vec![long, llong],
        (false, 1, false) => vec![long, ulong, llong, ullong],
        (true, 1, _) => vec![ulong, ullong],
        (false, _, true) => vec![llong],
        (false, _, false) => vec![llong, ullong],
        (true, _, _) => vec![ullong],
    };
    let value = i128::try_from(value).map_err(|_| malformed())?;
    candidates
        .iter()
        .find(|ty| ty.contains(value))
        .map(|ty| Value::Int(value, *ty))
        .ok_or_else(malformed)
}

fn float_literal(lower: &str) -> Option<Value> {
    let (body, bits) = if let Some(body) = lower.strip_suffix('f') {
        if lower.starts_with("0x") || !body.is_empty() {
            (body, 32)
        } else {
            return None;
        }
    } else if lower.ends_with('l') {
        // long double has no Rust counterpart
        return None;
    } else {
        (lower, 64)
    };
    let value = if let Some(hex) = body.strip_prefix("0x") {
        hex_float(hex)?
    } else {
        body.parse::<f64>().ok()?
    };
    Some(Value::Float(value, bits))
}

fn hex_float(hex: &str) -> Option<f64> {
    let (mantissa, exponent) = hex.split_once('p')?;
    let exponent = exponent.parse::<i32>().ok()?;
    let (int, frac) = mantissa.split_once('.').unwrap_or((mantissa, ""));
    let mut value = 0f64;
    for c in int.chars() {
        value = value * 16.0 + c.to_digit(16)? as f64;
    }
    let mut scale = 1.0 / 16.0;
    for c in frac.chars() {
        value += c.to_digit(16)? as f64 * scale;
        scale /= 16.0;
    }
    Some(value * 2f64.powi(exponent))
}

/// Decode the body of a C string or character literal.  Escapes give single bytes, other
/// characters their UTF-8 encoding.
fn unescape_bytes(body: &str, literal: &str) -> Result<Vec<u8>, Unexpandable> {
    let malformed = || Unexpandable::MalformedLiteral(literal.to_string());
    let mut bytes = Vec::with_capacity(body.len());
    let mut chars = body.chars().peekable();
    while let Some(c) = chars.next() {
        if c != '\\' {
            bytes.extend_from_slice(c.encode_utf8(&mut [0; 4]).as_bytes());
            continue;
        }
        let escape = chars.next().ok_or_else(malformed)?;
        let byte = match escape {
            'n' => b'\n',
            't' => b'\t',
            'r' => b'\r',
            'a' => 0x07,
            'b' => 0x08,
            'f' => 0x0c,
            'v' => 0x0b,
            '\\' | '\'' | '"' | '?' => escape as u8,
            '0'..='7' => {
                let mut value = escape.to_digit(8).unwrap_or(0);
                for _ in 0..2 {
                    let Some(digit) = chars.peek().and_then(|c| c.to_digit(8)) else { break };
                    value = value * 8 + digit;
                    chars.next();
                }
                u8::try_from(value).map_err(|_| malformed())?
            }
            'x' => {
                let mut value = 0u32;
                let mut digits = 0;
                while let Some(digit) = chars.peek().and_then(|c| c.to_digit(16)) {
                    value = value.checked_mul(16).and_then(|v| v.checked_add(digit)).ok_or_else(malformed)?;
                    digits += 1;
                    chars.next();
                }
                if digits == 0 {
                    return Err(malformed());
                }
                u8::try_from(value).map_err(|_| malformed())?
            }
            'u' | 'U' => {
                let len = if escape == 'u' { 4 } else { 8 };
                let hex = (0..len).map(|_| chars.next()).collect::<Option<String>>().ok_or_else(malformed)?;
                let c = u32::from_str_radix(&hex, 16)
                    .ok()
                    .and_then(char::from_u32)
                    .ok_or_else(malformed)?;
                bytes.extend_from_slice(c.encode_utf8(&mut [0; 4]).as_bytes());
                continue;
            }
            _ => return Err(malformed()),
        };
        bytes.push(byte);
    }
    Ok(bytes)
}

fn string_literal(text: &str) -> Result<Vec<u8>, Unexpandable> {
    let body = text
        .strip_prefix("u8")
        .unwrap_or(text)
        .strip_prefix('"')
        .and_then(|s| s.strip_suffix('"'))
        .ok_or_else(|| Unexpandable::MalformedLiteral(text.to_string()))?;
    unescape_bytes(body, text)
}

fn char_literal(text: &str, model: IntModel) -> Result<Value, Unexpandable> {
    let body = text
        .strip_prefix('\'')
        .and_then(|s| s.strip_suffix('\''))
        .ok_or_else(|| Unexpandable::MalformedLiteral(text.to_string()))?;
    let bytes = unescape_bytes(body, text)?;
    let [byte] = bytes.as_slice() else {
        return Err(Unexpandable::MalformedLiteral(text.to_string()));
    };
    // a char literal has type int, holding the value of a `char`
    let value = if model.char_signed { *byte as i8 as i128 } else { *byte as i128 };
    Ok(Value::Int(value, model.int()))
}

#[cfg(test)]
mod tests {
    use super::*;

    /// A tiny tokenizer, good enough for test inputs.
    fn lex(src: &str) -> Vec<Token> {
        const PUNCT: &[&str] = &[
            "<<", ">>", "<=", ">=", "==", "!=", "&&", "||", "(", ")", "+", "-", "*", "/", "%",
            "<", ">", "&", "^", "|", "~", "!", "?", ":", ",", "{", "}", ";", "*",
        ];
        const KEYWORDS: &[&str] =
            &["unsigned", "signed", "int", "long", "short", "char", "sizeof", "_Bool", "void"];
        let mut out = Vec::new();
        let chars = src.chars().collect::<Vec<_>>();
        let mut i = 0;
        while i < chars.len() {
            let c = chars[i];
            if c.is_whitespace() {
                i += 1;
            } else if c == '"' || c == '\'' {
                let start = i;
                i += 1;
                while chars[i] != c {
                    if chars[i] == '\\' {
                        i += 1;
                    }
                    i += 1;
                }
                i += 1;
                out.push(Token::new(TokenKind::Literal, chars[start..i].iter().collect::<String>()));
            } else if c.is_ascii_digit() || (c == '.' && chars.get(i + 1).is_some_and(char::is_ascii_digit)) {
                let start = i;
                while i < chars.len()
                    && (chars[i].is_ascii_alphanumeric()
                        || chars[i] == '.'
                        || ((chars[i] == '+' || chars[i] == '-')
                            && matches!(chars[i - 1], 'e' | 'E' | 'p' | 'P')))
                {
                    i += 1;
                }
                out.push(Token::new(TokenKind::Literal, chars[start..i].iter().collect::<String>()));
            } else if c.is_alphabetic() || c == '_' {
                let start = i;
                while i < chars.len() && (chars[i].is_alphanumeric() || chars[i] == '_') {
                    i += 1;
                }
                let word = chars[start..i].iter().collect::<String>();
                let kind = if KEYWORDS.contains(&word.as_str()) {
                    TokenKind::Keyword
                } else {
                    TokenKind::Identifier
                };
                out.push(Token::new(kind, word));
            } else {
                let rest = chars[i..].iter().collect::<String>();
                let p = PUNCT.iter().find(|p| rest.starts_with(*p)).expect("unknown punctuation");
                out.push(Token::new(TokenKind::Punctuation, *p));
                i += p.len();
            }
        }
        out
    }

    fn def(name: &str, body: &str) -> MacroDef {
        MacroDef { name: name.into(), header: "test.h".into(), tokens: lex(body), function_like: false }
    }

    struct Fixture {
        typedefs: BTreeMap<String, IntType>,
        enums: BTreeMap<String, (i128, IntType)>,
    }

    impl Fixture {
        fn new() -> Self {
            let mut typedefs = BTreeMap::new();
            typedefs.insert("Oid".to_string(), IntType::U32);
            typedefs.insert("int64".to_string(), IntType::I64);
            typedefs.insert("uint8".to_string(), IntType::new(8, false));
            let mut enums = BTreeMap::new();
            enums.insert("T_Query".to_string(), (57, IntType::U32));
            Fixture { typedefs, enums }
        }

        fn table(&self, defs: Vec<MacroDef>) -> MacroTable<'_> {
            MacroTable::new(defs, &self.typedefs, &self.enums, IntModel::LP64)
        }

        fn eval(&self, body: &str) -> Result<Value, Unexpandable> {
            self.table(vec![def("X", body)]).evaluate("X")
        }
    }

    fn int(v: i128, bits: u16, signed: bool) -> Result<Value, Unexpandable> {
        Ok(Value::Int(v, IntType::new(bits, signed)))
    }

    #[test]
    fn literal_types() {
        let f = Fixture::new();
        assert_eq!(f.eval("100"), int(100, 32, true));
        assert_eq!(f.eval("0x7FFFFFFF"), int(0x7FFF_FFFF, 32, true));
        assert_eq!(f.eval("0xFFFFFFFF"), int(0xFFFF_FFFF, 32, false));
        assert_eq!(f.eval("4294967295"), int(4_294_967_295, 64, true));
        assert_eq!(f.eval("010"), int(8, 32, true));
        assert_eq!(f.eval("0"), int(0, 32, true));
        assert_eq!(f.eval("0b101"), int(5, 32, true));
        assert_eq!(f.eval("1U"), int(1, 32, false));
        assert_eq!(f.eval("1L"), int(1, 64, true));
        assert_eq!(f.eval("1ULL"), int(1, 64, false));
        assert_eq!(f.eval("0xFFFFFFFFFFFFFFFF"), int(u64::MAX as i128, 64, false));
        assert!(matches!(f.eval("1QQ"), Err(Unexpandable::MalformedLiteral(_))));
        assert!(matches!(f.eval("0x"), Err(Unexpandable::MalformedLiteral(_))));
    }

    #[test]
    fn arithmetic_follows_c() {
        let f = Fixture::new();
        assert_eq!(f.eval("1 + 2 * 3"), int(7, 32, true));
        assert_eq!(f.eval("(1 + 2) * 3"), int(9, 32, true));
        assert_eq!(f.eval("-7 / 2"), int(-3, 32, true));
        assert_eq!(f.eval("-7 % 2"), int(-1, 32, true));
        assert_eq!(f.eval("1 << 4 | 1"), int(17, 32, true));
        assert_eq!(f.eval("-1 < 0U"), int(0, 32, true));
        assert_eq!(f.eval("0U - 1"), int(u32::MAX as i128, 32, false));
        assert_eq!(f.eval("0x7FFFFFFF + 1"), int(i32::MIN as i128, 32, true));
        assert_eq!(f.eval("1L + 1U"), int(2, 64, true));
        assert_eq!(f.eval("~0"), int(-1, 32, true));
        assert_eq!(f.eval("!5 || 3 > 2 && 1"), int(1, 32, true));
        assert_eq!(f.eval("1 ? 2 : 3U"), int(2, 32, false));
        assert_eq!(f.eval("0 ? 1 : 2 ? 3 : 4"), int(3, 32, true));
        assert_eq!(f.eval("1 / 0"), Err(Unexpandable::DivisionByZero));
        assert_eq!(f.eval("1 << 32"), Err(Unexpandable::ShiftOutOfRange));
        assert_eq!(f.eval("1L << 32"), int(1 << 32, 64, true));
    }

    #[test]
    fn casts() {
        let f = Fixture::new();
        assert_eq!(f.eval("((Oid) 0)"), int(0, 32, false));
        assert_eq!(f.eval("(Oid) -1"), int(u32::MAX as i128, 32, false));
        assert_eq!(f.eval("(uint8) 0x1FF"), int(0xFF, 8, false));
        assert_eq!(f.eval("(unsigned long long) 1"), int(1, 64, false));
        assert_eq!(f.eval("(short) 65535"), int(-1, 16, true));
        assert_eq!(f.eval("(int64) 1 << 40"), int(1 << 40, 64, true));
        assert_eq!(f.eval("(char) 200"), int(-56, 8, true));
        assert_eq!(f.eval("(_Bool) 2"), int(1, 8, false));
        assert_eq!(f.eval("(_Bool) 256"), int(1, 8, false));
        assert_eq!(f.eval("(_Bool) 0.5"), int(1, 8, false));
        assert_eq!(f.eval("(_Bool) 0"), int(0, 8, false));
    }

    #[test]
    fn floats_chars_and_strings() {
        let f = Fixture::new();
        assert_eq!(f.eval("1.5"), Ok(Value::Float(1.5, 64)));
        assert_eq!(f.eval("2.0f"), Ok(Value::Float(2.0, 32)));
        assert_eq!(f.eval("1e3"), Ok(Value::Float(1000.0, 64)));
        assert_eq!(f.eval("0x1p4"), Ok(Value::Float(16.0, 64)));
        assert_eq!(f.eval("1.0 / 4"), Ok(Value::Float(0.25, 64)));
        assert!(matches!(f.eval("1.0L"), Err(Unexpandable::MalformedLiteral(_))));
        assert_eq!(f.eval("'a'"), int(97, 32, true));
        assert_eq!(f.eval("'\\n'"), int(10, 32, true));
        assert_eq!(f.eval("\"pg_\" \"catalog\""), Ok(Value::Str(b"pg_catalog".to_vec())));
        assert_eq!(f.eval("\"tab\\there\""), Ok(Value::Str(b"tab\there".to_vec())));
    }

    #[test]
    fn c_escapes() {
        let f = Fixture::new();
        assert_eq!(f.eval("'\\0'"), int(0, 32, true));
        assert_eq!(f.eval("'\\x7'"), int(7, 32, true));
        assert_eq!(f.eval("'\\101'"), int(65, 32, true));
        assert_eq!(f.eval("'\\xff'"), int(-1, 32, true));
        assert_eq!(f.eval("\"a\\0b\""), Ok(Value::Str(b"a\0b".to_vec())));
        assert_eq!(f.eval("\"\\0123\""), Ok(Value::Str(b"\x0a3".to_vec())));
        assert_eq!(f.eval("\"é\""), Ok(Value::Str(vec![195, 169])));
        assert_eq!(f.eval("\"\\u00e9\""), Ok(Value::Str(vec![195, 169])));
        assert!(matches!(f.eval("'\\400'"), Err(Unexpandable::MalformedLiteral(_))));
        assert!(matches!(f.eval("'\\x'"), Err(Unexpandable::MalformedLiteral(_))));
        assert!(matches!(f.eval("'\\q'"), Err(Unexpandable::MalformedLiteral(_))));
    }

    #[test]
    fn untaken_operands_are_not_evaluated() {
        let f = Fixture::new();
        assert_eq!(f.eval("1 ? 1 : 1 / 0"), int(1, 32, true));
        assert_eq!(f.eval("0 ? 1 % 0 : 2"), int(2, 32, true));
        assert_eq!(f.eval("0 && 1 / 0"), int(0, 32, true));
        assert_eq!(f.eval("1 || 1 << 99"), int(1, 32, true));
        assert_eq!(f.eval("1 && 1 / 0"), Err(Unexpandable::DivisionByZero));
        assert_eq!(f.eval("0 ? 1 : 1 / 0"), Err(Unexpandable::DivisionByZero));
        // unknown names are still refused
        assert!(matches!(f.eval("1 ? 1 : MISSING"), Err(Unexpandable::UnknownIdentifier(_))));
    }

    #[test]
    fn references_to_other_macros_and_enums() {
        let f = Fixture::new();
        let mut table = f.table(vec![
            def("BLCKSZ", "8192"),
            def("MaxHeapTuplesPerPage", "((int) ((BLCKSZ - 24) / 28))"),
            def("FIRST_NODE", "T_Query"),
            def("ALIAS", "BLCKSZ"),
        ]);
        assert_eq!(table.evaluate("MaxHeapTuplesPerPage"), int(291, 32, true));
        assert_eq!(table.evaluate("FIRST_NODE"), int(57, 32, false));
        assert_eq!(table.evaluate("ALIAS"), int(8192, 32, true));
    }

    #[test]
    fn unexpandable_reasons() {
        let f = Fixture::new();
        let mut function_like = def("F", "x + 1");
        function_like.function_like = true;
        let mut table = f.table(vec![
            function_like,
            def("CALL", "palloc(16)"),
            def("UNKNOWN", "NOT_DEFINED + 1"),
            def("EMPTY", ""),
            def("SELF", "SELF + 1"),
            def("A", "B"),
            def("B", "A"),
            def("STMT", "do { } while (0)"),
            def("SIZE", "sizeof(int)"),
            def("USES_FN", "F"),
            def("POINTER", "((void *) 0)"),
            def("TRAILING", "1 2"),
            def("OPEN", "(1 + 2"),
        ]);
        assert_eq!(table.evaluate("F"), Err(Unexpandable::FunctionLike));
        assert_eq!(table.evaluate("CALL"), Err(Unexpandable::Call("palloc".into())));
        assert_eq!(table.evaluate("UNKNOWN"), Err(Unexpandable::UnknownIdentifier("NOT_DEFINED".into())));
        assert_eq!(table.evaluate("EMPTY"), Err(Unexpandable::Empty));
        assert_eq!(table.evaluate("SELF"), Err(Unexpandable::Recursive));
        assert_eq!(table.evaluate("A"), Err(Unexpandable::Recursive));
        assert!(matches!(table.evaluate("STMT"), Err(Unexpandable::UnknownIdentifier(_) | Unexpandable::UnexpectedToken(_))));
        assert_eq!(table.evaluate("SIZE"), Err(Unexpandable::Call("sizeof".into())));
        assert_eq!(table.evaluate("USES_FN"), Err(Unexpandable::Call("F".into())));
        assert!(matches!(table.evaluate("POINTER"), Err(Unexpandable::UnexpectedToken(_))));
        assert_eq!(table.evaluate("TRAILING"), Err(Unexpandable::UnexpectedToken("2".into())));
        assert_eq!(table.evaluate("OPEN"), Err(Unexpandable::Truncated));
    }

    #[test]
    fn wrapping() {
        assert_eq!(wrap(256, IntType::new(8, false)), 0);
        assert_eq!(wrap(255, IntType::new(8, true)), -1);
        assert_eq!(wrap(-1, IntType::U64), u64::MAX as i128);
        assert_eq!(wrap(i64::MAX as i128 + 1, IntType::I64), i64::MIN as i128);
    }
}
