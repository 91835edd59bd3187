use crate::bytecode::compile::{CompileResult, Compiler, byte, short};
use crate::bytecode::compile_error::{CompileErrorKind, CompilerError};
use crate::bytecode::op::{Instruction, OpCode};
use crate::frontend::token::{Token, TokenKind};
use crate::lang::scope::{FunctionHeader, FunctionKind, Variable};
use crate::lang::types::{Type, primitive};

use super::access::{MemoryReference, Operand, Storage};

/// Binding power, weakest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub(super) enum Precedence {
    None,
    Or,
    And,
    Equality,
    Comparison,
    Term,
    Factor,
    Unary,
}

impl Precedence {
    fn of(kind: TokenKind) -> Precedence {
        match kind {
            TokenKind::Or => Precedence::Or,
            TokenKind::And => Precedence::And,
            TokenKind::EqualEqual | TokenKind::BangEqual => Precedence::Equality,
            TokenKind::Less
            | TokenKind::LessEqual
            | TokenKind::Greater
            | TokenKind::GreaterEqual => Precedence::Comparison,
            TokenKind::Plus | TokenKind::Minus => Precedence::Term,
            TokenKind::Star | TokenKind::Slash | TokenKind::Percent => Precedence::Factor,
            _ => Precedence::None,
        }
    }

    fn next(self) -> Precedence {
        match self {
            Precedence::None => Precedence::Or,
            Precedence::Or => Precedence::And,
            Precedence::And => Precedence::Equality,
            Precedence::Equality => Precedence::Comparison,
            Precedence::Comparison => Precedence::Term,
            Precedence::Term => Precedence::Factor,
            Precedence::Factor | Precedence::Unary => Precedence::Unary,
        }
    }
}

/// Opcode for an arithmetic operator (or its compound form) on `ty`.
pub(super) fn arithmetic(op: TokenKind, ty: &Type) -> Option<OpCode> {
    let opcode = match (op, ty) {
        (TokenKind::Plus | TokenKind::PlusEqual, Type::Int) => OpCode::AddInt,
        (TokenKind::Minus | TokenKind::MinusEqual, Type::Int) => OpCode::SubtractInt,
        (TokenKind::Star | TokenKind::StarEqual, Type::Int) => OpCode::MultiplyInt,
        (TokenKind::Slash | TokenKind::SlashEqual, Type::Int) => OpCode::DivideInt,
        (TokenKind::Percent, Type::Int) => OpCode::ModuloInt,
        (TokenKind::Plus | TokenKind::PlusEqual, Type::Float) => OpCode::AddFloat,
        (TokenKind::Minus | TokenKind::MinusEqual, Type::Float) => OpCode::SubtractFloat,
        (TokenKind::Star | TokenKind::StarEqual, Type::Float) => OpCode::MultiplyFloat,
        (TokenKind::Slash | TokenKind::SlashEqual, Type::Float) => OpCode::DivideFloat,
        _ => return None,
    };
    Some(opcode)
}

fn comparison(op: TokenKind, ty: &Type) -> Option<OpCode> {
    let opcode = match (op, ty) {
        (TokenKind::Less, Type::Int) => OpCode::LessInt,
        (TokenKind::LessEqual, Type::Int) => OpCode::LessEqualInt,
        (TokenKind::Greater, Type::Int) => OpCode::GreaterInt,
        (TokenKind::GreaterEqual, Type::Int) => OpCode::GreaterEqualInt,
        (TokenKind::Less, Type::Float) => OpCode::LessFloat,
        (TokenKind::LessEqual, Type::Float) => OpCode::LessEqualFloat,
        (TokenKind::Greater, Type::Float) => OpCode::GreaterFloat,
        (TokenKind::GreaterEqual, Type::Float) => OpCode::GreaterEqualFloat,
        _ => return None,
    };
    Some(opcode)
}

impl Compiler {
    pub(super) fn expression(&mut self) -> CompileResult<Type> {
        self.precedence(Precedence::Or)
    }

    fn precedence(&mut self, min: Precedence) -> CompileResult<Type> {
        let token = self.current().clone();
        let operand = self.prefix_operand()?;
        self.continue_expression(operand, min, &token)
    }

    /// Loads an already parsed operand and folds in every infix operator
    /// binding at least as tightly as `min`.
    pub(super) fn continue_expression(
        &mut self,
        operand: Operand,
        min: Precedence,
        token: &Token,
    ) -> CompileResult<Type> {
        let mut left = self.load(operand, token)?;
        loop {
            let precedence = Precedence::of(self.kind());
            if precedence == Precedence::None || precedence < min {
                return Ok(left);
            }
            let op = self.advance();
            let right = self.precedence(precedence.next())?;
            left = self.binary(&op, left, right)?;
        }
    }

    fn binary(&mut self, op: &Token, left: Type, right: Type) -> CompileResult<Type> {
        if left != right {
            return Err(self.operand_error(op, &left, &right));
        }
        match op.kind {
            TokenKind::And | TokenKind::Or if left == Type::Bool => {
                self.emit_op(if op.kind == TokenKind::And {
                    OpCode::And
                } else {
                    OpCode::Or
                });
                Ok(Type::Bool)
            }
            TokenKind::EqualEqual | TokenKind::BangEqual if left != Type::Void => {
                let words = byte(self.words_of(&left, op)?, op, "compared value")?;
                let opcode = if op.kind == TokenKind::EqualEqual {
                    OpCode::Equal
                } else {
                    OpCode::NotEqual
                };
                self.emit(Instruction::bytes(opcode, words, 0, 0));
                Ok(Type::Bool)
            }
            kind => {
                if let Some(opcode) = comparison(kind, &left) {
                    self.emit_op(opcode);
                    Ok(Type::Bool)
                } else if let Some(opcode) = arithmetic(kind, &left) {
                    self.emit_op(opcode);
                    Ok(left)
                } else {
                    Err(self.operand_error(op, &left, &right))
                }
            }
        }
    }

    fn operand_error(&self, op: &Token, left: &Type, right: &Type) -> CompilerError {
        self.invalid_operands(op, self.type_name(left), self.type_name(right))
    }

    pub(super) fn invalid_operands(&self, op: &Token, left: String, right: String) -> CompilerError {
        CompilerError::new(
            op,
            CompileErrorKind::InvalidOperands {
                op: op.lexeme.clone(),
                left,
                right,
            },
        )
    }

    /// Unary operators, then a primary with its accessor chain.
    pub(super) fn prefix_operand(&mut self) -> CompileResult<Operand> {
        match self.kind() {
            TokenKind::Minus => {
                let op = self.advance();
                let ty = self.precedence(Precedence::Unary)?;
                let opcode = match ty {
                    Type::Int => OpCode::NegateInt,
                    Type::Float => OpCode::NegateFloat,
                    _ => {
                        let name = self.type_name(&ty);
                        return Err(self.invalid_operands(&op, name.clone(), name));
                    }
                };
                self.emit_op(opcode);
                Ok(Operand::Value(ty))
            }
            TokenKind::Not => {
                let op = self.advance();
                let ty = self.precedence(Precedence::Unary)?;
                self.expect_type(&op, &Type::Bool, &ty)?;
                self.emit_op(OpCode::Not);
                Ok(Operand::Value(Type::Bool))
            }
            TokenKind::New => {
                let op = self.advance();
                let ty = self.precedence(Precedence::Unary)?;
                if ty == Type::Void {
                    return Err(CompilerError::mismatch(&op, "a value", "Void"));
                }
                let words = short(self.words_of(&ty, &op)?, &op, "heap block")?;
                self.emit(Instruction::byte_short(OpCode::New, 0, words));
                Ok(Operand::Value(Type::Pointer(Box::new(ty))))
            }
            _ => self.postfix_operand(),
        }
    }

    fn postfix_operand(&mut self) -> CompileResult<Operand> {
        let mut operand = self.primary()?;
        loop {
            operand = match self.kind() {
                TokenKind::Dot => self.member(operand)?,
                TokenKind::LeftBracket => self.index(operand)?,
                _ => return Ok(operand),
            };
        }
    }

    fn primary(&mut self) -> CompileResult<Operand> {
        let token = self.current().clone();
        match token.kind {
            TokenKind::Integer => {
                self.advance();
                let value = parse_integer(&token)?;
                self.emit_integer(value, &token)?;
                Ok(Operand::Value(Type::Int))
            }
            TokenKind::Float => {
                self.advance();
                let value: f32 = token.lexeme.parse().map_err(|_| literal_error(&token))?;
                let index = self.add_constant(value.to_bits(), &token)?;
                self.emit(Instruction::byte_short(OpCode::LoadConstant, 0, index));
                Ok(Operand::Value(Type::Float))
            }
            TokenKind::String => {
                self.advance();
                let index = self.add_string(&token.lexeme, &token)?;
                self.emit(Instruction::byte_short(OpCode::LoadHeapConstant, 0, index));
                Ok(Operand::Value(Type::String))
            }
            TokenKind::True | TokenKind::False => {
                self.advance();
                let value = (token.kind == TokenKind::True) as i32;
                self.emit(Instruction::immediate(OpCode::PushImmediate, value));
                Ok(Operand::Value(Type::Bool))
            }
            TokenKind::LeftParen => {
                self.advance();
                let ty = self.expression()?;
                self.consume(TokenKind::RightParen, "')'")?;
                Ok(Operand::Value(ty))
            }
            TokenKind::LeftBrace => self.span_literal(),
            TokenKind::Identifier => self.identifier_operand(),
            _ => Err(CompilerError::expected(&token, "an expression")),
        }
    }

    fn identifier_operand(&mut self) -> CompileResult<Operand> {
        let token = self.current().clone();
        let name = token.lexeme.as_str();

        if let Some(variable) = self.scopes.lookup_variable(self.scope(), name).cloned() {
            self.advance();
            return self.variable_operand(variable, &token);
        }

        if self.kind_at(self.cursor + 1) == TokenKind::LeftParen {
            if name == "Int" || name == "Float" {
                return self.conversion();
            }
            let Some(header) = self.scopes.lookup_function(self.scope(), name).cloned() else {
                return Err(CompilerError::new(
                    &token,
                    CompileErrorKind::UnknownFunction {
                        name: name.to_string(),
                    },
                ));
            };
            self.advance();
            let returns = self.call(&header, None, &token)?;
            return Ok(Operand::Value(returns));
        }

        if self.is_type_name(name) {
            return self.type_literal();
        }
        Err(CompilerError::new(
            &token,
            CompileErrorKind::UnknownIdentifier {
                name: name.to_string(),
            },
        ))
    }

    /// References are followed right away; the variable then names the
    /// referenced storage.
    fn variable_operand(&mut self, variable: Variable, token: &Token) -> CompileResult<Operand> {
        let storage = if variable.global {
            Storage::Global
        } else {
            Storage::Frame
        };
        let slot = MemoryReference {
            ty: variable.ty.clone(),
            storage,
            offset: variable.offset,
        };
        match variable.ty {
            Type::Reference(inner) => {
                self.load(Operand::Location(slot), token)?;
                Ok(Operand::Location(MemoryReference::dynamic(*inner)))
            }
            _ => Ok(Operand::Location(slot)),
        }
    }

    fn is_type_name(&self, name: &str) -> bool {
        self.bindings
            .last()
            .is_some_and(|bindings| bindings.contains_key(name))
            || primitive(name).is_some()
            || self.types.lookup(name).is_some()
    }

    /// `Int(x)` and `Float(x)`.
    fn conversion(&mut self) -> CompileResult<Operand> {
        let token = self.advance();
        let target = if token.lexeme == "Int" {
            Type::Int
        } else {
            Type::Float
        };
        self.consume(TokenKind::LeftParen, "'('")?;
        let argument = self.current().clone();
        let ty = self.expression()?;
        self.consume(TokenKind::RightParen, "')'")?;
        match (&target, &ty) {
            (Type::Int, Type::Float) => {
                self.emit_op(OpCode::FloatToInt);
            }
            (Type::Float, Type::Int) => {
                self.emit_op(OpCode::IntToFloat);
            }
            (Type::Int, Type::Int | Type::Bool) | (Type::Float, Type::Float) => {}
            _ => {
                return Err(CompilerError::mismatch(
                    &argument,
                    "Int or Float",
                    self.type_name(&ty),
                ));
            }
        }
        Ok(Operand::Value(target))
    }

    /// Pushes the arguments (and the receiver address for methods), then
    /// calls. By-reference parameters take the address of their argument.
    pub(super) fn call(
        &mut self,
        header: &FunctionHeader,
        receiver: Option<&MemoryReference>,
        token: &Token,
    ) -> CompileResult<Type> {
        self.consume(TokenKind::LeftParen, "'('")?;
        let mut param_words = 0u32;
        if let Some(receiver) = receiver {
            self.address_of(receiver, token)?;
            param_words += 1;
        }

        let mut found = 0;
        if !self.check(TokenKind::RightParen) {
            loop {
                let argument = self.current().clone();
                match header.parameters.get(found).map(|p| p.ty.clone()) {
                    Some(Type::Reference(inner)) => {
                        let operand = self.prefix_operand()?;
                        let target = self.location(operand, &argument, "reference argument")?;
                        self.expect_type(&argument, &inner, &target.ty)?;
                        self.address_of(&target, &argument)?;
                        param_words += 1;
                    }
                    Some(expected) => {
                        let ty = self.expression()?;
                        self.expect_type(&argument, &expected, &ty)?;
                        param_words += self.words_of(&ty, &argument)?;
                    }
                    None => {
                        self.expression()?;
                    }
                }
                found += 1;
                if !self.matches(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenKind::RightParen, "')'")?;

        if found != header.parameters.len() {
            return Err(CompilerError::new(
                token,
                CompileErrorKind::ArityMismatch {
                    name: header.name.clone(),
                    expected: header.parameters.len(),
                    found,
                },
            ));
        }
        let param_words = byte(param_words, token, "argument list")?;
        match header.kind {
            FunctionKind::Script { chunk } => {
                self.emit(Instruction::byte_short(OpCode::Call, param_words, chunk))
            }
            FunctionKind::External { index } => {
                self.emit(Instruction::byte_short(OpCode::CallExternal, param_words, index))
            }
        };
        Ok(header.returns.clone())
    }

    /// `{ a, b, c }`: elements pushed in order form the span.
    fn span_literal(&mut self) -> CompileResult<Operand> {
        let open = self.advance();
        if self.check(TokenKind::RightBrace) {
            return Err(CompilerError::expected(self.current(), "a span element"));
        }
        let first = self.current().clone();
        let element = self.expression()?;
        if element == Type::Void {
            return Err(CompilerError::mismatch(&first, "a value", "Void"));
        }
        let mut length = 1u32;
        while self.matches(TokenKind::Comma) {
            let token = self.current().clone();
            let ty = self.expression()?;
            self.expect_type(&token, &element, &ty)?;
            length += 1;
        }
        self.consume(TokenKind::RightBrace, "'}'")?;
        let length = short(length, &open, "span length")?;
        Ok(Operand::Value(Type::Span(Box::new(element), length)))
    }

    /// A type name in expression position: a structure literal, a
    /// zero-filled span or an empty list.
    fn type_literal(&mut self) -> CompileResult<Operand> {
        let token = self.current().clone();
        let ty = self.type_expr(false)?;
        if self.check(TokenKind::LeftBrace) {
            let Type::Structure(id) = ty else {
                return Err(CompilerError::mismatch(&token, "a structure", self.type_name(&ty)));
            };
            return self.structure_literal(id, &token);
        }
        match &ty {
            Type::Span(..) => {
                let words = short(self.words_of(&ty, &token)?, &token, "span size")?;
                self.emit(Instruction::byte_short(OpCode::PushZero, 0, words));
                Ok(Operand::Value(ty))
            }
            Type::List(element) => {
                let words = byte(self.words_of(element, &token)?, &token, "list element")?;
                self.emit(Instruction::byte_short(OpCode::ListNew, words, 4));
                Ok(Operand::Value(ty))
            }
            _ => Err(CompilerError::expected(self.current(), "'{'")),
        }
    }

    /// `T { field = value, ... }`: zero-filled, then each named field stored
    /// into place. Fields left out stay zero.
    fn structure_literal(&mut self, id: usize, token: &Token) -> CompileResult<Operand> {
        self.consume(TokenKind::LeftBrace, "'{'")?;
        let structure = self.types.structure(id).clone();
        let total = structure.word_length;
        self.emit(Instruction::byte_short(
            OpCode::PushZero,
            0,
            short(total, token, "structure size")?,
        ));

        if !self.check(TokenKind::RightBrace) {
            loop {
                let name = self.identifier("a field name")?;
                let Some(field) = structure.field(&name.lexeme) else {
                    return Err(CompilerError::new(
                        &name,
                        CompileErrorKind::UnknownMember {
                            ty: structure.name.clone(),
                            member: name.lexeme.clone(),
                        },
                    ));
                };
                self.consume(TokenKind::Equal, "'='")?;
                let value = self.current().clone();
                let ty = self.expression()?;
                self.expect_type(&value, &field.ty, &ty)?;
                let words = byte(self.words_of(&ty, &value)?, &value, "field value")?;
                let depth = short(total - field.offset, token, "structure size")?;
                self.emit(Instruction::byte_short(OpCode::StoreTop, words, depth));
                if !self.matches(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenKind::RightBrace, "'}'")?;
        Ok(Operand::Value(Type::Structure(id)))
    }

    pub(super) fn type_exists(&self, name: &str) -> bool {
        primitive(name).is_some() || self.types.lookup(name).is_some()
    }
}

/// Decimal or `0x` hexadecimal; anything up to `u32::MAX` is accepted and
/// reinterpreted as a signed word.
fn parse_integer(token: &Token) -> CompileResult<i32> {
    let text = token.lexeme.as_str();
    let value = match text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => text.parse::<u64>(),
    }
    .map_err(|_| literal_error(token))?;
    u32::try_from(value)
        .map(|word| word as i32)
        .map_err(|_| literal_error(token))
}

fn literal_error(token: &Token) -> CompilerError {
    CompilerError::new(
        token,
        CompileErrorKind::LiteralOutOfRange {
            literal: token.lexeme.clone(),
        },
    )
}
