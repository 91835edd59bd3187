use crate::bytecode::compile::{CompileResult, Compiler, ControlStructure, byte, short};
use crate::bytecode::compile_error::CompilerError;
use crate::bytecode::op::{Instruction, OpCode};
use crate::frontend::token::{Token, TokenKind};
use crate::lang::types::Type;

use super::access::{MemoryReference, Operand};
use super::expr::{Precedence, arithmetic};

impl Compiler {
    pub(super) fn statement(&mut self, depth: usize) -> CompileResult<()> {
        match self.kind() {
            TokenKind::Var => self.var_declaration(),
            TokenKind::If => self.if_statement(depth),
            TokenKind::While => self.while_statement(depth),
            TokenKind::Loop => self.loop_statement(depth),
            TokenKind::Break => self.break_statement(),
            TokenKind::Continue => self.continue_statement(),
            TokenKind::Return => self.return_statement(),
            TokenKind::Yield => self.yield_statement(),
            TokenKind::Free => self.free_statement(),
            TokenKind::Function => {
                self.require_top_level("function declaration")?;
                self.function_declaration(depth)
            }
            TokenKind::Structure => {
                self.require_top_level("structure declaration")?;
                self.structure_declaration(depth)
            }
            TokenKind::External => {
                self.require_top_level("external declaration")?;
                self.external_declaration()
            }
            _ => self.expression_statement(),
        }
    }

    fn require_top_level(&self, construct: &str) -> CompileResult<()> {
        if self.is_top_level() {
            Ok(())
        } else {
            Err(CompilerError::invalid_position(
                self.current(),
                construct,
                "is only allowed at the top level",
            ))
        }
    }

    fn var_declaration(&mut self) -> CompileResult<()> {
        self.advance();
        let name = self.identifier("a variable name")?;
        self.consume(TokenKind::Equal, "'='")?;
        let value = self.current().clone();
        let ty = self.expression()?;
        if ty == Type::Void {
            return Err(CompilerError::mismatch(&value, "a value", "Void"));
        }
        self.declare(&name, ty)?;
        self.end_statement()
    }

    fn condition(&mut self) -> CompileResult<()> {
        let token = self.current().clone();
        let ty = self.expression()?;
        self.expect_type(&token, &Type::Bool, &ty)
    }

    fn if_statement(&mut self, depth: usize) -> CompileResult<()> {
        let token = self.advance();
        self.condition()?;
        self.consume(TokenKind::Then, "'then'")?;
        let skip = self.emit_jump(OpCode::JumpIfFalse);
        self.body(depth)?;

        if self.else_follows(depth) {
            let exit = self.emit_jump(OpCode::Jump);
            self.patch_jump(skip, &token)?;
            self.body(depth)?;
            self.patch_jump(exit, &token)
        } else {
            self.patch_jump(skip, &token)
        }
    }

    /// Consumes `else` when it continues the current line or starts the next
    /// line at the `if`'s own depth.
    fn else_follows(&mut self, depth: usize) -> bool {
        let same_line = self
            .cursor
            .checked_sub(1)
            .is_some_and(|at| self.kind_at(at) != TokenKind::StatementTerminator);
        if same_line && self.matches(TokenKind::Else) {
            return true;
        }
        let level = self.indentation();
        if level == depth && self.kind_at(self.cursor + level) == TokenKind::Else {
            self.cursor += level + 1;
            return true;
        }
        false
    }

    fn while_statement(&mut self, depth: usize) -> CompileResult<()> {
        let token = self.advance();
        let start = self.here();
        self.condition()?;
        let exit = self.emit_jump(OpCode::JumpIfFalse);
        self.loop_body(start, depth, &token)?;
        self.patch_jump(exit, &token)?;
        self.close_loop(&token)
    }

    fn loop_statement(&mut self, depth: usize) -> CompileResult<()> {
        let token = self.advance();
        let start = self.here();
        self.loop_body(start, depth, &token)?;
        self.close_loop(&token)
    }

    fn loop_body(&mut self, start: usize, depth: usize, token: &Token) -> CompileResult<()> {
        let scope_words = self.scope_words();
        self.builder().controls.push(ControlStructure {
            start,
            breaks: Vec::new(),
            scope_words,
        });
        self.body(depth)?;
        self.emit_loop(start, token)
    }

    fn close_loop(&mut self, token: &Token) -> CompileResult<()> {
        let Some(control) = self.builder().controls.pop() else {
            return Ok(());
        };
        for at in control.breaks {
            self.patch_jump(at, token)?;
        }
        Ok(())
    }

    /// Pops what the loop body declared so far; the jump leaves the scopes
    /// without passing their `Pop`.
    fn unwind_to_loop(&mut self, token: &Token) -> CompileResult<usize> {
        let Some(control) = self.builder_ref().controls.last() else {
            return Err(CompilerError::invalid_position(
                token,
                token.lexeme.clone(),
                "is only allowed inside a loop",
            ));
        };
        let (start, words) = (control.start, self.scope_words() - control.scope_words);
        self.emit_pop(words, token)?;
        Ok(start)
    }

    fn break_statement(&mut self) -> CompileResult<()> {
        let token = self.advance();
        self.unwind_to_loop(&token)?;
        let at = self.emit_jump(OpCode::Jump);
        if let Some(control) = self.builder().controls.last_mut() {
            control.breaks.push(at);
        }
        self.end_statement()
    }

    fn continue_statement(&mut self) -> CompileResult<()> {
        let token = self.advance();
        let start = self.unwind_to_loop(&token)?;
        self.emit_loop(start, &token)?;
        self.end_statement()
    }

    fn return_statement(&mut self) -> CompileResult<()> {
        let token = self.advance();
        let returns = self.builder_ref().returns.clone();
        let in_entry = self.nested.is_empty();

        if self.at_statement_end() {
            if in_entry {
                self.emit_op(OpCode::Halt);
            } else if returns != Type::Void {
                return Err(CompilerError::mismatch(
                    &token,
                    self.type_name(&returns),
                    "Void",
                ));
            } else {
                self.emit(Instruction::bytes(OpCode::Return, 0, 0, 0));
            }
            return self.end_statement();
        }

        if in_entry {
            return Err(CompilerError::invalid_position(
                &token,
                "return value",
                "is only allowed inside a function",
            ));
        }
        let value = self.current().clone();
        let ty = self.expression()?;
        self.expect_type(&value, &returns, &ty)?;
        let words = byte(self.words_of(&ty, &value)?, &value, "return value")?;
        self.emit(Instruction::bytes(OpCode::Return, words, 0, 0));
        self.end_statement()
    }

    fn yield_statement(&mut self) -> CompileResult<()> {
        self.advance();
        if self.at_statement_end() {
            self.emit(Instruction::immediate(OpCode::PushImmediate, 0));
        } else {
            let token = self.current().clone();
            let ty = self.expression()?;
            self.expect_type(&token, &Type::Float, &ty)?;
        }
        self.emit_op(OpCode::Yield);
        self.end_statement()
    }

    fn free_statement(&mut self) -> CompileResult<()> {
        let token = self.advance();
        let operand = self.prefix_operand()?;
        let target = self.location(operand, &token, "free target")?;
        match target.ty.clone() {
            Type::List(element) => {
                let words = self.words_of(&element, &token)?;
                self.address_of(&target, &token)?;
                let words = byte(words, &token, "list element")?;
                self.emit(Instruction::bytes(OpCode::ListFree, words, 0, 0));
            }
            Type::Pointer(inner) => {
                let words = short(self.words_of(&inner, &token)?, &token, "heap block")?;
                self.address_of(&target, &token)?;
                self.emit(Instruction::byte_short(OpCode::FreeHeap, 0, words));
            }
            other => {
                return Err(CompilerError::mismatch(
                    &token,
                    "a list or pointer",
                    self.type_name(&other),
                ));
            }
        }
        self.end_statement()
    }

    /// Assignment, compound assignment, `++`/`--`, or an expression whose
    /// value is discarded.
    fn expression_statement(&mut self) -> CompileResult<()> {
        let token = self.current().clone();
        let operand = self.prefix_operand()?;
        match self.kind() {
            TokenKind::Equal => self.assignment(operand, &token)?,
            TokenKind::PlusEqual
            | TokenKind::MinusEqual
            | TokenKind::StarEqual
            | TokenKind::SlashEqual => self.compound_assignment(operand, &token)?,
            TokenKind::PlusPlus | TokenKind::MinusMinus => self.increment(operand, &token)?,
            _ => {
                let ty = self.continue_expression(operand, Precedence::Or, &token)?;
                let words = self.words_of(&ty, &token)?;
                self.emit_pop(words, &token)?;
            }
        }
        self.end_statement()
    }

    fn assignment(&mut self, operand: Operand, token: &Token) -> CompileResult<()> {
        self.advance();
        let target = self.location(operand, token, "assignment target")?;
        let value = self.current().clone();
        let ty = self.expression()?;
        self.expect_type(&value, &target.ty, &ty)?;
        self.store(&target, token)
    }

    fn compound_assignment(&mut self, operand: Operand, token: &Token) -> CompileResult<()> {
        let op = self.advance();
        let target = self.location(operand, token, "assignment target")?;
        let Some(opcode) = arithmetic(op.kind, &target.ty) else {
            let name = self.type_name(&target.ty);
            return Err(self.invalid_operands(&op, name.clone(), name));
        };
        self.load_for_update(&target, token)?;
        let value = self.current().clone();
        let ty = self.expression()?;
        self.expect_type(&value, &target.ty, &ty)?;
        self.emit_op(opcode);
        self.store(&target, token)
    }

    fn increment(&mut self, operand: Operand, token: &Token) -> CompileResult<()> {
        let op = self.advance();
        let target = self.location(operand, token, "increment target")?;
        self.expect_type(&op, &Type::Int, &target.ty)?;
        self.load_for_update(&target, token)?;
        self.emit(Instruction::immediate(OpCode::PushImmediate, 1));
        self.emit_op(if op.kind == TokenKind::PlusPlus {
            OpCode::AddInt
        } else {
            OpCode::SubtractInt
        });
        self.store(&target, token)
    }

    fn load_for_update(&mut self, target: &MemoryReference, token: &Token) -> CompileResult<()> {
        if target.is_dynamic() {
            // keep the address for the store
            self.emit(Instruction::bytes(OpCode::Duplicate, 1, 0, 0));
        }
        self.load(Operand::Location(target.clone()), token)?;
        Ok(())
    }
}
