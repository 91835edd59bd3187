//! Storage locations and accessor chains (`.field`, `.N`, `[i]`).
//!
//! A location is resolved step by step while the chain is parsed. Frame and
//! global locations stay symbolic until they are loaded or stored; once an
//! address has to be computed at run time (through a reference, a pointer, a
//! list or a dynamic index) it lives on the stack and the location becomes
//! [`Storage::Dynamic`].

use crate::bytecode::compile::{CompileResult, Compiler, byte, short};
use crate::bytecode::compile_error::{CompileErrorKind, CompilerError};
use crate::bytecode::op::{Instruction, OpCode};
use crate::frontend::token::{Token, TokenKind};
use crate::lang::types::Type;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum Storage {
    /// Offset from the current frame base.
    Frame,
    /// Absolute stack index of a top-level variable.
    Global,
    /// Address on top of the stack, plus `offset`.
    Dynamic,
}

#[derive(Debug, Clone, PartialEq)]
pub(super) struct MemoryReference {
    pub ty: Type,
    pub storage: Storage,
    pub offset: u32,
}

impl MemoryReference {
    pub fn dynamic(ty: Type) -> Self {
        MemoryReference {
            ty,
            storage: Storage::Dynamic,
            offset: 0,
        }
    }

    pub fn is_dynamic(&self) -> bool {
        self.storage == Storage::Dynamic
    }
}

/// A parsed operand before it is loaded: a place that can still be
/// assigned, or a value already computed on the stack.
#[derive(Debug, Clone, PartialEq)]
pub(super) enum Operand {
    Location(MemoryReference),
    Value(Type),
}

impl Operand {
    pub fn ty(&self) -> &Type {
        match self {
            Operand::Location(reference) => &reference.ty,
            Operand::Value(ty) => ty,
        }
    }
}

impl Compiler {
    /// Leaves the operand's value on the stack.
    pub(super) fn load(&mut self, operand: Operand, token: &Token) -> CompileResult<Type> {
        let reference = match operand {
            Operand::Value(ty) => return Ok(ty),
            Operand::Location(reference) => reference,
        };
        let words = byte(self.words_of(&reference.ty, token)?, token, "loaded value")?;
        let offset = short(reference.offset, token, "variable offset")?;
        let op = match reference.storage {
            Storage::Frame => OpCode::LoadVariable,
            Storage::Global => OpCode::LoadGlobal,
            Storage::Dynamic => OpCode::LoadIndirect,
        };
        self.emit(Instruction::byte_short(op, words, offset));
        Ok(reference.ty)
    }

    /// Pops a value of the target's type into it. A dynamic target expects
    /// its address below the value.
    pub(super) fn store(&mut self, target: &MemoryReference, token: &Token) -> CompileResult<()> {
        let words = byte(self.words_of(&target.ty, token)?, token, "stored value")?;
        let offset = short(target.offset, token, "variable offset")?;
        let op = match target.storage {
            Storage::Frame => OpCode::StoreVariable,
            Storage::Global => OpCode::StoreGlobal,
            Storage::Dynamic => OpCode::StoreIndirect,
        };
        self.emit(Instruction::byte_short(op, words, offset));
        Ok(())
    }

    /// Pushes the absolute address of a location.
    pub(super) fn address_of(
        &mut self,
        reference: &MemoryReference,
        token: &Token,
    ) -> CompileResult<()> {
        let offset = short(reference.offset, token, "variable offset")?;
        match reference.storage {
            Storage::Frame => {
                self.emit(Instruction::byte_short(OpCode::AddressOf, 0, offset));
            }
            Storage::Global => {
                self.emit(Instruction::byte_short(OpCode::AddressOf, 1, offset));
            }
            Storage::Dynamic if offset > 0 => {
                self.emit(Instruction::byte_short(OpCode::OffsetAddress, 0, offset));
            }
            Storage::Dynamic => {}
        }
        Ok(())
    }

    pub(super) fn location(
        &self,
        operand: Operand,
        token: &Token,
        what: &str,
    ) -> CompileResult<MemoryReference> {
        match operand {
            Operand::Location(reference) => Ok(reference),
            Operand::Value(_) => Err(CompilerError::new(
                token,
                CompileErrorKind::NotAssignable {
                    target: format!("this {}", what),
                },
            )),
        }
    }

    /// Drops whatever the operand left on the stack.
    fn discard(&mut self, operand: &Operand, token: &Token) -> CompileResult<()> {
        match operand {
            Operand::Location(reference) if reference.is_dynamic() => self.emit_pop(1, token),
            Operand::Location(_) => Ok(()),
            Operand::Value(ty) => {
                let words = self.words_of(ty, token)?;
                self.emit_pop(words, token)
            }
        }
    }

    /// Follows a pointer: its value becomes the address of the pointee.
    fn deref(&mut self, operand: Operand, token: &Token) -> CompileResult<Operand> {
        match operand.ty().clone() {
            Type::Pointer(inner) => {
                self.load(operand, token)?;
                Ok(Operand::Location(MemoryReference::dynamic(*inner)))
            }
            _ => Ok(operand),
        }
    }

    /// Narrows an operand to the `ty` part that starts `offset` words in.
    fn select(
        &mut self,
        operand: Operand,
        offset: u32,
        ty: Type,
        token: &Token,
    ) -> CompileResult<Operand> {
        match operand {
            Operand::Location(mut reference) => {
                reference.offset += offset;
                reference.ty = ty;
                Ok(Operand::Location(reference))
            }
            Operand::Value(whole) => {
                let total = byte(self.words_of(&whole, token)?, token, "selected value")?;
                let words = byte(self.words_of(&ty, token)?, token, "selected value")?;
                let offset = byte(offset, token, "selected value")?;
                self.emit(Instruction::bytes(OpCode::Select, total, offset, words));
                Ok(Operand::Value(ty))
            }
        }
    }

    /// `.field`, `.N`, `.length`, `.push(x)` and `.Method(args)`.
    pub(super) fn member(&mut self, operand: Operand) -> CompileResult<Operand> {
        let dot = self.advance();
        let operand = self.deref(operand, &dot)?;
        let token = self.advance();
        match token.kind {
            TokenKind::Integer => self.span_element(operand, &token),
            TokenKind::Identifier if self.check(TokenKind::LeftParen) => {
                self.member_call(operand, &token)
            }
            TokenKind::Identifier => self.field(operand, &token),
            _ => Err(CompilerError::expected(&token, "a member name")),
        }
    }

    fn unknown_member(&self, ty: &Type, token: &Token) -> CompilerError {
        CompilerError::new(
            token,
            CompileErrorKind::UnknownMember {
                ty: self.type_name(ty),
                member: token.lexeme.clone(),
            },
        )
    }

    fn field(&mut self, operand: Operand, token: &Token) -> CompileResult<Operand> {
        let ty = operand.ty().clone();
        match &ty {
            Type::Structure(id) => {
                let Some(field) = self.types.structure(*id).field(&token.lexeme).cloned() else {
                    return Err(self.unknown_member(&ty, token));
                };
                self.select(operand, field.offset, field.ty, token)
            }
            Type::Span(_, length) if token.lexeme == "length" => {
                self.discard(&operand, token)?;
                self.emit_integer(*length as i32, token)?;
                Ok(Operand::Value(Type::Int))
            }
            Type::List(_) if token.lexeme == "length" => {
                self.load(operand, token)?;
                self.emit_op(OpCode::ListLength);
                Ok(Operand::Value(Type::Int))
            }
            _ => Err(self.unknown_member(&ty, token)),
        }
    }

    /// `.N` on a span; the index is checked here.
    fn span_element(&mut self, operand: Operand, token: &Token) -> CompileResult<Operand> {
        let Type::Span(element, length) = operand.ty().clone() else {
            return Err(CompilerError::new(
                token,
                CompileErrorKind::NotIndexable {
                    ty: self.type_name(operand.ty()),
                },
            ));
        };
        let index: u32 = token.lexeme.parse().map_err(|_| {
            CompilerError::new(
                token,
                CompileErrorKind::LiteralOutOfRange {
                    literal: token.lexeme.clone(),
                },
            )
        })?;
        if index >= length as u32 {
            return Err(CompilerError::new(
                token,
                CompileErrorKind::IndexOutOfBounds {
                    index: index as i64,
                    length: length as u32,
                },
            ));
        }
        let words = self.words_of(&element, token)?;
        self.select(operand, index * words, *element, token)
    }

    fn member_call(&mut self, operand: Operand, name: &Token) -> CompileResult<Operand> {
        let ty = operand.ty().clone();
        match &ty {
            Type::List(element) if name.lexeme == "push" => {
                let list = self.location(operand, name, "list")?;
                self.address_of(&list, name)?;
                self.consume(TokenKind::LeftParen, "'('")?;
                let value = self.current().clone();
                let found = self.expression()?;
                self.expect_type(&value, element, &found)?;
                self.consume(TokenKind::RightParen, "')'")?;
                let words = byte(self.words_of(element, name)?, name, "list element")?;
                self.emit(Instruction::bytes(OpCode::ListPush, words, 0, 0));
                Ok(Operand::Value(Type::Void))
            }
            Type::Structure(id) => {
                let Some(header) = self.types.structure(*id).method(&name.lexeme).cloned() else {
                    return Err(self.unknown_member(&ty, name));
                };
                let receiver = self.location(operand, name, "method receiver")?;
                let returns = self.call(&header, Some(&receiver), name)?;
                Ok(Operand::Value(returns))
            }
            _ => Err(self.unknown_member(&ty, name)),
        }
    }

    /// `[i]` on a span or list. The result is always a dynamic location.
    pub(super) fn index(&mut self, operand: Operand) -> CompileResult<Operand> {
        let bracket = self.advance();
        let operand = self.deref(operand, &bracket)?;
        let ty = operand.ty().clone();
        match ty {
            Type::Span(element, length) => {
                let span = self.location(operand, &bracket, "temporary span")?;
                let offset = if span.is_dynamic() {
                    span.offset
                } else {
                    self.address_of(&span, &bracket)?;
                    0
                };
                let words = byte(self.words_of(&element, &bracket)?, &bracket, "span element")?;
                self.index_expression()?;
                self.emit(Instruction::byte_short(OpCode::IndexAddress, words, length));
                Ok(Operand::Location(MemoryReference {
                    ty: *element,
                    storage: Storage::Dynamic,
                    offset,
                }))
            }
            Type::List(element) => {
                self.load(operand, &bracket)?;
                let words = byte(self.words_of(&element, &bracket)?, &bracket, "list element")?;
                self.index_expression()?;
                self.emit(Instruction::bytes(OpCode::ListIndex, words, 0, 0));
                Ok(Operand::Location(MemoryReference::dynamic(*element)))
            }
            other => Err(CompilerError::new(
                &bracket,
                CompileErrorKind::NotIndexable {
                    ty: self.type_name(&other),
                },
            )),
        }
    }

    fn index_expression(&mut self) -> CompileResult<()> {
        let token = self.current().clone();
        let ty = self.expression()?;
        self.expect_type(&token, &Type::Int, &ty)?;
        self.consume(TokenKind::RightBracket, "']'")?;
        Ok(())
    }
}
