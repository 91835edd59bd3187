//! Single-pass compiler: tokens in, bytecode out, no syntax tree in between.
//!
//! Every expression handler emits its instructions as soon as it has parsed
//! them and returns the [`Type`] of the value it left on the stack. Between
//! statements the value stack holds exactly the variables declared in the
//! open scopes, so a variable's frame offset is known at declaration time and
//! leaving a scope is a single `Pop`.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::debug;

use crate::bytecode::compile_error::{CompileErrorKind, CompilerError};
use crate::bytecode::ir::{ByteCode, Program, encode_string};
use crate::bytecode::op::{Instruction, OpCode};
use crate::frontend::lexer::Module;
use crate::frontend::token::{Span, Token, TokenKind};
use crate::lang::scope::{ScopeError, ScopeId, ScopeKind, ScopeTree, Variable};
use crate::lang::types::{LayoutError, Type, TypeTable};

mod access;
mod expr;
mod stmt;
mod structure;

pub type CompileResult<T> = Result<T, CompilerError>;

/// Generic instantiations nested deeper than this are rejected.
const MAX_INSTANTIATION_DEPTH: usize = 32;

/// A `while` or `loop` whose end is not known yet.
struct ControlStructure {
    /// `continue` jumps here.
    start: usize,
    /// Pending `break` jumps, patched when the loop closes.
    breaks: Vec<usize>,
    /// Frame words live when the loop was entered.
    scope_words: u32,
}

/// The chunk currently receiving instructions.
struct FunctionBuilder {
    chunk: usize,
    code: ByteCode,
    scope: ScopeId,
    returns: Type,
    controls: Vec<ControlStructure>,
}

impl FunctionBuilder {
    fn new(chunk: usize, name: &str, scope: ScopeId, returns: Type) -> Self {
        FunctionBuilder {
            chunk,
            code: ByteCode::new(name),
            scope,
            returns,
            controls: Vec::new(),
        }
    }
}

pub struct Compiler {
    types: TypeTable,
    scopes: ScopeTree,
    /// Top-level code of every module added so far.
    entry: FunctionBuilder,
    /// Functions being compiled, innermost last. Methods of a generic
    /// structure are compiled while the code that instantiated it is still
    /// open.
    nested: Vec<FunctionBuilder>,
    /// One slot per declared function; filled when its body is finished.
    chunks: Vec<ByteCode>,
    externals: Vec<String>,
    tokens: Arc<[Token]>,
    cursor: usize,
    eof: Token,
    /// Type parameter names in effect, innermost last.
    bindings: Vec<HashMap<String, Type>>,
    instantiation_depth: usize,
}

impl Default for Compiler {
    fn default() -> Self {
        Self::new()
    }
}

impl Compiler {
    pub fn new() -> Self {
        let entry = FunctionBuilder::new(0, "<entry>", ScopeTree::GLOBAL, Type::Void);
        Compiler {
            types: TypeTable::new(),
            scopes: ScopeTree::new(),
            entry,
            nested: Vec::new(),
            chunks: vec![ByteCode::new("<entry>")],
            externals: Vec::new(),
            tokens: Arc::from(Vec::new()),
            cursor: 0,
            eof: Token::new(TokenKind::EndOfFile, "", Span::default(), Arc::from("")),
            bindings: Vec::new(),
            instantiation_depth: 0,
        }
    }

    /// Compiles a tokenized module. Top-level statements are appended to the
    /// entry chunk, so modules run in the order they were added.
    pub fn add_module(&mut self, module: &Module) -> CompileResult<()> {
        debug!(module = %module.name, tokens = module.tokens.len(), "compiling module");
        self.tokens = Arc::from(module.tokens.as_slice());
        self.cursor = 0;
        let end = module.tokens.last().map(|t| t.span).unwrap_or_default();
        self.eof = Token::new(TokenKind::EndOfFile, "", end, module.name.clone());

        self.statements(0)?;
        let level = self.indentation();
        if self.kind_at(self.cursor + level) != TokenKind::EndOfFile {
            return Err(CompilerError::expected(self.current(), "end of file"));
        }
        debug!(
            module = %module.name,
            instructions = self.entry.code.instructions.len(),
            "module compiled"
        );
        Ok(())
    }

    /// Finishes the entry chunk with `Halt` and hands out the program.
    pub fn build(mut self) -> Program {
        self.entry
            .code
            .instructions
            .push(Instruction::none(OpCode::Halt));
        self.chunks[0] = self.entry.code;
        let program = Program {
            chunks: self.chunks,
            entry_point: 0,
            externals: self.externals,
        };
        debug!(
            chunks = program.chunks.len(),
            instructions = program.instruction_count(),
            "program built"
        );
        program
    }

    // =========================================================================
    // Tokens
    // =========================================================================

    fn current(&self) -> &Token {
        self.tokens.get(self.cursor).unwrap_or(&self.eof)
    }

    fn kind(&self) -> TokenKind {
        self.current().kind
    }

    fn kind_at(&self, index: usize) -> TokenKind {
        self.tokens.get(index).map_or(TokenKind::EndOfFile, |t| t.kind)
    }

    fn advance(&mut self) -> Token {
        let token = self.current().clone();
        if self.cursor < self.tokens.len() {
            self.cursor += 1;
        }
        token
    }

    fn check(&self, kind: TokenKind) -> bool {
        self.kind() == kind
    }

    fn matches(&mut self, kind: TokenKind) -> bool {
        if self.check(kind) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn consume(&mut self, kind: TokenKind, expected: &str) -> CompileResult<Token> {
        if self.check(kind) {
            Ok(self.advance())
        } else {
            Err(CompilerError::expected(self.current(), expected))
        }
    }

    fn identifier(&mut self, what: &str) -> CompileResult<Token> {
        self.consume(TokenKind::Identifier, what)
    }

    /// Number of `Indent` tokens leading the line at the cursor.
    fn indentation(&self) -> usize {
        let mut level = 0;
        while self.kind_at(self.cursor + level) == TokenKind::Indent {
            level += 1;
        }
        level
    }

    fn at_statement_end(&self) -> bool {
        matches!(
            self.kind(),
            TokenKind::StatementTerminator | TokenKind::Else | TokenKind::EndOfFile
        )
    }

    /// An inline `then` body may be cut short by `else` on the same line; the
    /// `if` consumes it.
    fn end_statement(&mut self) -> CompileResult<()> {
        match self.kind() {
            TokenKind::StatementTerminator => {
                self.advance();
                Ok(())
            }
            TokenKind::Else | TokenKind::EndOfFile => Ok(()),
            _ => Err(CompilerError::expected(self.current(), "end of statement")),
        }
    }

    /// Skips the rest of the line and every line indented deeper than
    /// `depth`.
    fn skip_block(&mut self, depth: usize) {
        self.skip_line();
        loop {
            let level = self.indentation();
            if level <= depth || self.kind_at(self.cursor + level) == TokenKind::EndOfFile {
                return;
            }
            self.skip_line();
        }
    }

    fn skip_line(&mut self) {
        while !matches!(
            self.kind(),
            TokenKind::StatementTerminator | TokenKind::EndOfFile
        ) {
            self.advance();
        }
        self.matches(TokenKind::StatementTerminator);
    }

    // =========================================================================
    // Blocks
    // =========================================================================

    /// Compiles lines at exactly `depth` until a shallower line or the end of
    /// the module.
    fn statements(&mut self, depth: usize) -> CompileResult<()> {
        loop {
            let level = self.indentation();
            if level < depth || self.kind_at(self.cursor + level) == TokenKind::EndOfFile {
                return Ok(());
            }
            if level > depth {
                let token = self.tokens[self.cursor + level].clone();
                return Err(CompilerError::new(
                    &token,
                    CompileErrorKind::UnexpectedIndentation,
                ));
            }
            self.cursor += level;
            self.statement(depth)?;
        }
    }

    /// A non-empty run of lines at `depth`.
    fn block(&mut self, depth: usize) -> CompileResult<()> {
        let level = self.indentation();
        if level != depth || self.kind_at(self.cursor + level) == TokenKind::EndOfFile {
            let token = self.tokens.get(self.cursor + level).unwrap_or(&self.eof);
            return Err(CompilerError::new(token, CompileErrorKind::ExpectedBlock));
        }
        self.statements(depth)
    }

    /// The body of a statement header on a line at `depth`: either one inline
    /// statement or, after the line break, a block one level deeper. Either
    /// way the body gets its own scope.
    fn body(&mut self, depth: usize) -> CompileResult<()> {
        let scope = self.enter_block();
        if self.matches(TokenKind::StatementTerminator) {
            self.block(depth + 1)?;
        } else {
            self.statement(depth)?;
        }
        self.exit_block(scope)
    }

    fn is_top_level(&self) -> bool {
        self.nested.is_empty() && self.entry.scope == ScopeTree::GLOBAL
    }

    // =========================================================================
    // Builders and scopes
    // =========================================================================

    fn builder(&mut self) -> &mut FunctionBuilder {
        self.nested.last_mut().unwrap_or(&mut self.entry)
    }

    fn builder_ref(&self) -> &FunctionBuilder {
        self.nested.last().unwrap_or(&self.entry)
    }

    fn scope(&self) -> ScopeId {
        self.builder_ref().scope
    }

    /// Words the open scopes of the current frame occupy.
    fn scope_words(&self) -> u32 {
        self.scopes.word_length(self.scope())
    }

    fn enter_block(&mut self) -> ScopeId {
        let parent = self.scope();
        let scope = self.scopes.enter(parent, ScopeKind::Block);
        self.builder().scope = scope;
        scope
    }

    fn exit_block(&mut self, scope: ScopeId) -> CompileResult<()> {
        let parent = self.scopes.get(scope).parent.unwrap_or(ScopeTree::GLOBAL);
        let words = self.scopes.exit(scope);
        self.builder().scope = parent;
        let token = self.current().clone();
        self.emit_pop(words, &token)
    }

    fn declare(&mut self, name: &Token, ty: Type) -> CompileResult<Variable> {
        let words = self.words_of(&ty, name)?;
        let scope = self.scope();
        self.scopes
            .declare_variable(scope, &name.lexeme, ty, words)
            .map_err(|e| redeclared(name, e))
    }

    // =========================================================================
    // Emission
    // =========================================================================

    fn here(&self) -> usize {
        self.builder_ref().code.instructions.len()
    }

    fn emit(&mut self, instruction: Instruction) -> usize {
        let code = &mut self.builder().code.instructions;
        code.push(instruction);
        code.len() - 1
    }

    fn emit_op(&mut self, op: OpCode) -> usize {
        self.emit(Instruction::none(op))
    }

    fn emit_pop(&mut self, words: u32, token: &Token) -> CompileResult<()> {
        if words > 0 {
            let count = short(words, token, "scope size")?;
            self.emit(Instruction::byte_short(OpCode::Pop, 0, count));
        }
        Ok(())
    }

    /// Emits a forward jump with a placeholder displacement.
    fn emit_jump(&mut self, op: OpCode) -> usize {
        self.emit(Instruction::signed(op, 0))
    }

    /// Points the jump at `at` to the next instruction to be emitted.
    fn patch_jump(&mut self, at: usize, token: &Token) -> CompileResult<()> {
        let displacement = displacement(at, self.here(), token)?;
        let code = &mut self.builder().code.instructions;
        code[at] = code[at].with_signed(displacement);
        Ok(())
    }

    fn emit_loop(&mut self, start: usize, token: &Token) -> CompileResult<()> {
        let offset = displacement(self.here(), start, token)?;
        self.emit(Instruction::signed(OpCode::Jump, offset));
        Ok(())
    }

    fn emit_integer(&mut self, value: i32, token: &Token) -> CompileResult<()> {
        if (crate::bytecode::op::IMMEDIATE_MIN..=crate::bytecode::op::IMMEDIATE_MAX)
            .contains(&value)
        {
            self.emit(Instruction::immediate(OpCode::PushImmediate, value));
        } else {
            let index = self.add_constant(value as u32, token)?;
            self.emit(Instruction::byte_short(OpCode::LoadConstant, 0, index));
        }
        Ok(())
    }

    /// Adds a one-word constant, reusing an equal word already in the pool.
    fn add_constant(&mut self, word: u32, token: &Token) -> CompileResult<u16> {
        let constants = &mut self.builder().code.constants;
        let index = match constants.iter().position(|w| *w == word) {
            Some(index) => index,
            None => {
                constants.push(word);
                constants.len() - 1
            }
        };
        short(index as u32, token, "constant pool")
    }

    fn add_string(&mut self, text: &str, token: &Token) -> CompileResult<u16> {
        let constants = &mut self.builder().code.constants;
        let index = constants.len();
        constants.extend(encode_string(text));
        short(index as u32, token, "constant pool")
    }

    // =========================================================================
    // Types
    // =========================================================================

    fn words_of(&self, ty: &Type, token: &Token) -> CompileResult<u32> {
        self.types
            .word_length(ty)
            .map_err(|e| self.layout_error(token, e))
    }

    fn layout_error(&self, token: &Token, error: LayoutError) -> CompilerError {
        let kind = match error {
            LayoutError::UnresolvedPlaceholder(_) => CompileErrorKind::UnresolvedPlaceholder {
                name: token.lexeme.clone(),
            },
            LayoutError::Recursive(name) => CompileErrorKind::RecursiveStructure { name },
            LayoutError::TooLarge => CompileErrorKind::TooLarge {
                what: "type size".to_string(),
            },
        };
        CompilerError::new(token, kind)
    }

    fn type_name(&self, ty: &Type) -> String {
        self.types.name_of(ty)
    }

    fn expect_type(&self, token: &Token, expected: &Type, found: &Type) -> CompileResult<()> {
        if expected == found {
            Ok(())
        } else {
            Err(CompilerError::mismatch(
                token,
                self.type_name(expected),
                self.type_name(found),
            ))
        }
    }
}

fn redeclared(token: &Token, error: ScopeError) -> CompilerError {
    let ScopeError::Redeclared(name) = error;
    CompilerError::new(token, CompileErrorKind::Redeclaration { name })
}

/// Displacement of a jump at `at` landing on `target`; the machine applies it
/// after advancing past the jump.
fn displacement(at: usize, target: usize, token: &Token) -> CompileResult<i16> {
    let distance = target as i64 - at as i64 - 1;
    i16::try_from(distance).map_err(|_| CompilerError::too_large(token, "jump distance"))
}

fn byte(value: u32, token: &Token, what: &str) -> CompileResult<u8> {
    u8::try_from(value).map_err(|_| CompilerError::too_large(token, what))
}

fn short(value: u32, token: &Token, what: &str) -> CompileResult<u16> {
    u16::try_from(value).map_err(|_| CompilerError::too_large(token, what))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::op::Instruction as I;
    use crate::frontend::lexer::Tokenizer;

    fn compile(source: &str) -> CompileResult<Program> {
        let mut module = Module::new("test", source);
        Tokenizer::tokenize_module(&mut module).unwrap();
        let mut compiler = Compiler::new();
        compiler.add_module(&module)?;
        Ok(compiler.build())
    }

    fn entry(source: &str) -> Vec<Instruction> {
        let program = compile(source).unwrap();
        program.chunks[program.entry_point].instructions.clone()
    }

    fn error_kind(source: &str) -> CompileErrorKind {
        match compile(source) {
            Ok(program) => panic!("expected a compile error, got {:?}", program.chunks),
            Err(e) => e.kind,
        }
    }

    // =========================================================================
    // Emission shape
    // =========================================================================

    #[test]
    fn test_var_pushes_in_place() {
        assert_eq!(
            entry("var a = 1\nvar b = a"),
            vec![
                I::immediate(OpCode::PushImmediate, 1),
                I::byte_short(OpCode::LoadGlobal, 1, 0),
                I::none(OpCode::Halt),
            ]
        );
    }

    #[test]
    fn test_block_scope_is_popped() {
        let code = entry("var a = 1\nif a > 0 then\n    var b = 2\n    var c = 3");
        assert!(code.contains(&I::byte_short(OpCode::Pop, 0, 2)));
    }

    #[test]
    fn test_if_jump_is_patched() {
        let code = entry("var a = 5\nif a > 0 then a = a + 1");
        let jump = code
            .iter()
            .position(|i| i.opcode() == Some(OpCode::JumpIfFalse))
            .unwrap();
        let target = jump as i64 + 1 + code[jump].signed_short() as i64;
        // lands on the Halt after the body
        assert_eq!(code[target as usize].opcode(), Some(OpCode::Halt));
    }

    #[test]
    fn test_while_jumps_back_to_condition() {
        let code = entry("var x = 2\nwhile x < 10000 x = x * x");
        let back = code
            .iter()
            .rposition(|i| i.opcode() == Some(OpCode::Jump))
            .unwrap();
        let target = back as i64 + 1 + code[back].signed_short() as i64;
        assert_eq!(target, 1);
    }

    #[test]
    fn test_large_integer_uses_constant() {
        let program = compile("var a = 100000000").unwrap();
        let chunk = &program.chunks[0];
        assert_eq!(chunk.instructions[0].opcode(), Some(OpCode::LoadConstant));
        assert_eq!(chunk.constants, vec![100_000_000]);
    }

    #[test]
    fn test_function_gets_own_chunk() {
        let program =
            compile("function Add(Int a, Int b) returns Int\n    return a + b\nvar r = Add(3, 5)")
                .unwrap();
        assert_eq!(program.chunks.len(), 2);
        assert_eq!(program.chunks[1].name, "Add");
        assert!(
            program.chunks[0]
                .instructions
                .contains(&I::byte_short(OpCode::Call, 2, 1))
        );
    }

    #[test]
    fn test_compile_is_deterministic() {
        let source = "structure P\n    field Int x\n    function Get() returns Int\n        return self.x\nvar p = P { x = 4 }\nvar s = \"hi\"\nvar n = p.Get()";
        let a = compile(source).unwrap().to_bytes().unwrap();
        let b = compile(source).unwrap().to_bytes().unwrap();
        assert_eq!(a, b);
    }

    // =========================================================================
    // Errors
    // =========================================================================

    #[test]
    fn test_redeclaration_fails() {
        assert_eq!(
            error_kind("var a = 1\nvar a = 2"),
            CompileErrorKind::Redeclaration {
                name: "a".to_string()
            }
        );
    }

    #[test]
    fn test_child_scope_variable_not_visible() {
        assert_eq!(
            error_kind("if true then\n    var inner = 1\nvar x = inner"),
            CompileErrorKind::UnknownIdentifier {
                name: "inner".to_string()
            }
        );
    }

    #[test]
    fn test_type_mismatch() {
        assert!(matches!(
            error_kind("var a = 1\na = 2.0"),
            CompileErrorKind::TypeMismatch { .. }
        ));
    }

    #[test]
    fn test_mixed_operands_rejected() {
        assert!(matches!(
            error_kind("var a = 1 + 2.0"),
            CompileErrorKind::InvalidOperands { .. }
        ));
    }

    #[test]
    fn test_arity_mismatch() {
        assert_eq!(
            error_kind("function F(Int a)\n    a = 1\nF(1, 2)"),
            CompileErrorKind::ArityMismatch {
                name: "F".to_string(),
                expected: 1,
                found: 2
            }
        );
    }

    #[test]
    fn test_assign_to_rvalue_rejected() {
        assert!(matches!(
            error_kind("var a = 1\n(a + 1) = 2"),
            CompileErrorKind::NotAssignable { .. }
        ));
    }

    #[test]
    fn test_break_outside_loop() {
        assert!(matches!(
            error_kind("break"),
            CompileErrorKind::InvalidPosition { .. }
        ));
    }

    #[test]
    fn test_unexpected_indentation() {
        assert_eq!(
            error_kind("var a = 1\n        var b = 2"),
            CompileErrorKind::UnexpectedIndentation
        );
    }

    #[test]
    fn test_missing_block() {
        assert_eq!(
            error_kind("var a = 1\nwhile a < 3\nvar b = 2"),
            CompileErrorKind::ExpectedBlock
        );
    }

    #[test]
    fn test_span_literal_index_out_of_bounds() {
        assert_eq!(
            error_kind("var s = { 1, 2 }\nvar x = s.2"),
            CompileErrorKind::IndexOutOfBounds {
                index: 2,
                length: 2
            }
        );
    }

    #[test]
    fn test_wrong_type_argument_count() {
        assert_eq!(
            error_kind("structure Pair<A, B>\n    field A first\n    field B second\nvar p = Pair<Int> { first = 1 }"),
            CompileErrorKind::TypeArgumentCount {
                name: "Pair".to_string(),
                expected: 2,
                found: 1
            }
        );
    }

    #[test]
    fn test_recursive_structure_rejected() {
        assert!(matches!(
            error_kind("structure Node\n    field Int value\n    field Node next"),
            CompileErrorKind::RecursiveStructure { .. }
        ));
    }
}
