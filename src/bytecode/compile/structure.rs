//! Declarations: functions, externals, structures and generic templates,
//! plus the type syntax they share.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, trace};

use crate::bytecode::compile::{
    CompileResult, Compiler, FunctionBuilder, MAX_INSTANTIATION_DEPTH, byte, redeclared, short,
};
use crate::bytecode::compile_error::{CompileErrorKind, CompilerError};
use crate::bytecode::ir::ByteCode;
use crate::bytecode::op::{Instruction, OpCode};
use crate::frontend::token::{Token, TokenKind};
use crate::lang::scope::{FunctionHeader, FunctionKind, Parameter, ScopeKind, ScopeTree};
use crate::lang::types::{
    FieldTemplate, StructureId, StructureTemplate, TemplateId, Type, TypeName, primitive,
};

impl Compiler {
    // =========================================================================
    // Type syntax
    // =========================================================================

    /// `Name`, `Name<T, ...>`, then any suffixes: `<N>` span, `[]` list and,
    /// where a value cannot follow, `*` pointer and `&` reference.
    pub(super) fn type_expr(&mut self, allow_indirection: bool) -> CompileResult<Type> {
        let token = self.identifier("a type name")?;
        let mut ty = self.named_type(&token)?;
        loop {
            match self.kind() {
                TokenKind::Less
                    if self.kind_at(self.cursor + 1) == TokenKind::Integer
                        && self.kind_at(self.cursor + 2) == TokenKind::Greater =>
                {
                    self.advance();
                    let length = self.advance();
                    self.advance();
                    let length: u16 = length.lexeme.parse().map_err(|_| {
                        CompilerError::new(
                            &length,
                            CompileErrorKind::LiteralOutOfRange {
                                literal: length.lexeme.clone(),
                            },
                        )
                    })?;
                    ty = Type::Span(Box::new(ty), length);
                }
                TokenKind::LeftBracket
                    if self.kind_at(self.cursor + 1) == TokenKind::RightBracket =>
                {
                    self.advance();
                    self.advance();
                    ty = Type::List(Box::new(ty));
                }
                TokenKind::Star if allow_indirection => {
                    self.advance();
                    ty = Type::Pointer(Box::new(ty));
                }
                TokenKind::Ampersand if allow_indirection => {
                    self.advance();
                    ty = Type::Reference(Box::new(ty));
                }
                _ => return Ok(ty),
            }
        }
    }

    fn named_type(&mut self, token: &Token) -> CompileResult<Type> {
        let name = token.lexeme.as_str();
        if let Some(ty) = self.bindings.last().and_then(|b| b.get(name)).cloned() {
            return Ok(ty);
        }
        if let Some(ty) = primitive(name) {
            return Ok(ty);
        }
        match self.types.lookup(name) {
            Some(TypeName::Structure(id)) => Ok(Type::Structure(id)),
            Some(TypeName::Template(template)) => {
                self.consume(TokenKind::Less, "'<'")?;
                let mut arguments = Vec::new();
                loop {
                    arguments.push(self.type_expr(true)?);
                    if !self.matches(TokenKind::Comma) {
                        break;
                    }
                }
                self.consume(TokenKind::Greater, "'>'")?;
                self.apply_template(template, arguments, token)
            }
            None => Err(CompilerError::new(
                token,
                CompileErrorKind::UnknownType {
                    name: name.to_string(),
                },
            )),
        }
    }

    /// Concrete arguments instantiate right away; arguments that still name
    /// a type parameter wait for the enclosing template's instantiation.
    fn apply_template(
        &mut self,
        template: TemplateId,
        arguments: Vec<Type>,
        token: &Token,
    ) -> CompileResult<Type> {
        if arguments.iter().any(Type::contains_placeholder) {
            self.check_argument_count(template, arguments.len(), token)?;
            return Ok(Type::Generic(template, arguments));
        }
        Ok(Type::Structure(self.instantiate(template, arguments, token)?))
    }

    fn check_argument_count(
        &self,
        template: TemplateId,
        found: usize,
        token: &Token,
    ) -> CompileResult<()> {
        let template = self.types.template(template);
        if template.placeholders.len() == found {
            return Ok(());
        }
        Err(CompilerError::new(
            token,
            CompileErrorKind::TypeArgumentCount {
                name: template.name.clone(),
                expected: template.placeholders.len(),
                found,
            },
        ))
    }

    /// Replaces every pending [`Type::Generic`] with its instantiation.
    fn resolve(&mut self, ty: Type, token: &Token) -> CompileResult<Type> {
        Ok(match ty {
            Type::Generic(template, arguments) => {
                let arguments = arguments
                    .into_iter()
                    .map(|argument| self.resolve(argument, token))
                    .collect::<CompileResult<Vec<_>>>()?;
                Type::Structure(self.instantiate(template, arguments, token)?)
            }
            Type::Span(element, length) => Type::Span(Box::new(self.resolve(*element, token)?), length),
            Type::List(element) => Type::List(Box::new(self.resolve(*element, token)?)),
            Type::Pointer(element) => Type::Pointer(Box::new(self.resolve(*element, token)?)),
            Type::Reference(element) => Type::Reference(Box::new(self.resolve(*element, token)?)),
            Type::Placeholder(_) => {
                return Err(CompilerError::new(
                    token,
                    CompileErrorKind::UnresolvedPlaceholder {
                        name: token.lexeme.clone(),
                    },
                ));
            }
            other => other,
        })
    }

    // =========================================================================
    // Generic instantiation
    // =========================================================================

    /// One concrete structure per distinct argument list. Methods are
    /// compiled again for every instantiation because field offsets differ.
    fn instantiate(
        &mut self,
        template: TemplateId,
        arguments: Vec<Type>,
        token: &Token,
    ) -> CompileResult<StructureId> {
        if let Some(id) = self.types.instance(template, &arguments) {
            return Ok(id);
        }
        self.check_argument_count(template, arguments.len(), token)?;
        let definition = self.types.template(template).clone();
        if arguments.iter().any(Type::contains_placeholder) {
            return Err(CompilerError::new(
                token,
                CompileErrorKind::UnresolvedPlaceholder {
                    name: definition.name.clone(),
                },
            ));
        }
        if self.instantiation_depth >= MAX_INSTANTIATION_DEPTH {
            return Err(CompilerError::too_large(token, "generic instantiation depth"));
        }

        self.instantiation_depth += 1;
        let result = self.instantiate_template(template, &definition, arguments, token);
        self.instantiation_depth -= 1;
        result
    }

    fn instantiate_template(
        &mut self,
        template: TemplateId,
        definition: &StructureTemplate,
        arguments: Vec<Type>,
        token: &Token,
    ) -> CompileResult<StructureId> {
        let name = format!(
            "{}<{}>",
            definition.name,
            arguments
                .iter()
                .map(|ty| self.type_name(ty))
                .collect::<Vec<_>>()
                .join(", ")
        );
        let id = self.types.add_structure(name.clone(), false);
        // recorded first so that fields can point back at this instance
        self.types.record_instance(template, arguments.clone(), id);

        let mut fields = Vec::with_capacity(definition.fields.len());
        for field in &definition.fields {
            let ty = field.ty.substitute(&arguments);
            if ty.contains_placeholder() {
                return Err(CompilerError::new(
                    &field.token,
                    CompileErrorKind::UnresolvedPlaceholder {
                        name: definition.name.clone(),
                    },
                ));
            }
            let ty = self.resolve(ty, &field.token)?;
            fields.push((field.name.clone(), ty));
        }
        self.types
            .set_fields(id, fields)
            .map_err(|e| self.layout_error(token, e))?;
        debug!(structure = %name, "template instantiated");

        let bindings = definition
            .placeholders
            .iter()
            .cloned()
            .zip(arguments)
            .collect();
        self.compile_methods(
            id,
            &definition.methods,
            definition.member_depth,
            definition.tokens.clone(),
            bindings,
        )?;
        Ok(id)
    }

    // =========================================================================
    // Functions
    // =========================================================================

    /// `function Name(Type a, ...) [returns Type]`
    fn function_signature(&mut self) -> CompileResult<(Token, Vec<Parameter>, Type)> {
        self.consume(TokenKind::Function, "'function'")?;
        let name = self.identifier("a function name")?;
        self.consume(TokenKind::LeftParen, "'('")?;
        let mut parameters: Vec<Parameter> = Vec::new();
        if !self.check(TokenKind::RightParen) {
            loop {
                let token = self.current().clone();
                let ty = self.type_expr(true)?;
                if ty == Type::Void {
                    return Err(CompilerError::mismatch(&token, "a parameter type", "Void"));
                }
                let parameter = self.identifier("a parameter name")?;
                if parameters.iter().any(|p| p.name == parameter.lexeme) {
                    return Err(CompilerError::new(
                        &parameter,
                        CompileErrorKind::Redeclaration {
                            name: parameter.lexeme.clone(),
                        },
                    ));
                }
                parameters.push(Parameter {
                    name: parameter.lexeme,
                    ty,
                });
                if !self.matches(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenKind::RightParen, "')'")?;

        let returns = if self.matches(TokenKind::Returns) {
            let token = self.current().clone();
            let ty = self.type_expr(true)?;
            if matches!(ty, Type::Reference(_)) {
                return Err(CompilerError::mismatch(&token, "a value type", self.type_name(&ty)));
            }
            ty
        } else {
            Type::Void
        };
        Ok((name, parameters, returns))
    }

    fn reserve_chunk(&mut self, name: &str, token: &Token) -> CompileResult<u16> {
        let index = short(self.chunks.len() as u32, token, "function count")?;
        self.chunks.push(ByteCode::new(name));
        Ok(index)
    }

    pub(super) fn function_declaration(&mut self, depth: usize) -> CompileResult<()> {
        let (name, parameters, returns) = self.function_signature()?;
        let chunk = self.reserve_chunk(&name.lexeme, &name)?;
        let header = FunctionHeader {
            name: name.lexeme.clone(),
            parameters,
            returns,
            kind: FunctionKind::Script { chunk },
            receiver: None,
        };
        // declared before the body so that it can call itself
        self.scopes
            .declare_function(ScopeTree::GLOBAL, header.clone())
            .map_err(|e| redeclared(&name, e))?;
        self.function_body(&header, depth, &name)
    }

    pub(super) fn external_declaration(&mut self) -> CompileResult<()> {
        self.advance();
        let (name, parameters, returns) = self.function_signature()?;
        let index = short(self.externals.len() as u32, &name, "external table")?;
        let header = FunctionHeader {
            name: name.lexeme.clone(),
            parameters,
            returns,
            kind: FunctionKind::External { index },
            receiver: None,
        };
        self.scopes
            .declare_function(ScopeTree::GLOBAL, header)
            .map_err(|e| redeclared(&name, e))?;
        self.externals.push(name.lexeme.clone());
        debug!(external = %name.lexeme, index, "external function declared");
        self.end_statement()
    }

    /// Compiles a body into the header's chunk. Parameters (after `self` for
    /// methods) occupy the first frame words, in order.
    fn function_body(
        &mut self,
        header: &FunctionHeader,
        depth: usize,
        name: &Token,
    ) -> CompileResult<()> {
        let FunctionKind::Script { chunk } = header.kind else {
            return Ok(());
        };
        let chunk = chunk as usize;
        let scope = self.scopes.enter(ScopeTree::GLOBAL, ScopeKind::Function);
        let display = self.chunks[chunk].name.clone();
        self.nested.push(FunctionBuilder::new(
            chunk,
            &display,
            scope,
            header.returns.clone(),
        ));

        if let Some(owner) = header.receiver {
            let this = Token::new(TokenKind::Identifier, "self", name.span, name.module.clone());
            self.declare(&this, Type::Reference(Box::new(Type::Structure(owner))))?;
        }
        for parameter in &header.parameters {
            let token = Token::new(
                TokenKind::Identifier,
                parameter.name.clone(),
                name.span,
                name.module.clone(),
            );
            self.declare(&token, parameter.ty.clone())?;
        }

        if self.matches(TokenKind::StatementTerminator) {
            self.block(depth + 1)?;
        } else {
            self.statement(depth)?;
        }

        // falling off the end returns a zero value
        if header.returns == Type::Void {
            self.emit(Instruction::bytes(OpCode::Return, 0, 0, 0));
        } else {
            let words = self.words_of(&header.returns, name)?;
            self.emit(Instruction::byte_short(
                OpCode::PushZero,
                0,
                short(words, name, "return value")?,
            ));
            self.emit(Instruction::bytes(
                OpCode::Return,
                byte(words, name, "return value")?,
                0,
                0,
            ));
        }

        if let Some(builder) = self.nested.pop() {
            self.scopes.exit(builder.scope);
            debug!(
                function = %builder.code.name,
                chunk = builder.chunk,
                instructions = builder.code.instructions.len(),
                "function compiled"
            );
            self.chunks[builder.chunk] = builder.code;
        }
        Ok(())
    }

    // =========================================================================
    // Structures
    // =========================================================================

    pub(super) fn structure_declaration(&mut self, depth: usize) -> CompileResult<()> {
        self.advance();
        let name = self.identifier("a structure name")?;
        if self.type_exists(&name.lexeme) {
            return Err(redeclared_type(&name));
        }
        let mut placeholders: Vec<String> = Vec::new();
        if self.matches(TokenKind::Less) {
            loop {
                let parameter = self.identifier("a type parameter")?;
                if placeholders.contains(&parameter.lexeme) || self.type_exists(&parameter.lexeme)
                {
                    return Err(redeclared_type(&parameter));
                }
                placeholders.push(parameter.lexeme);
                if !self.matches(TokenKind::Comma) {
                    break;
                }
            }
            self.consume(TokenKind::Greater, "'>'")?;
        }
        self.consume(TokenKind::StatementTerminator, "end of line")?;
        let member_depth = depth + 1;

        if placeholders.is_empty() {
            self.structure(name, member_depth)
        } else {
            self.template(name, placeholders, member_depth)
        }
    }

    fn structure(&mut self, name: Token, member_depth: usize) -> CompileResult<()> {
        let id = self.types.add_structure(name.lexeme.clone(), true);
        self.bindings.push(HashMap::new());
        let members = self.structure_members(member_depth);
        self.bindings.pop();
        let (fields, methods) = members?;

        let fields = fields.into_iter().map(|f| (f.name, f.ty)).collect();
        self.types
            .set_fields(id, fields)
            .map_err(|e| self.layout_error(&name, e))?;
        debug!(
            structure = %name.lexeme,
            words = self.types.structure(id).word_length,
            methods = methods.len(),
            "structure declared"
        );
        let tokens = self.tokens.clone();
        self.compile_methods(id, &methods, member_depth, tokens, HashMap::new())
    }

    /// Registers the template before reading its members so that fields can
    /// mention it (through a pointer).
    fn template(
        &mut self,
        name: Token,
        placeholders: Vec<String>,
        member_depth: usize,
    ) -> CompileResult<()> {
        byte(placeholders.len() as u32, &name, "type parameter list")?;
        let bindings = placeholders
            .iter()
            .enumerate()
            .map(|(index, p)| (p.clone(), Type::Placeholder(index as u8)))
            .collect();
        let template = self.types.add_template(StructureTemplate {
            name: name.lexeme.clone(),
            placeholders,
            fields: Vec::new(),
            methods: Vec::new(),
            member_depth,
            tokens: self.tokens.clone(),
            token: name.clone(),
        });

        self.bindings.push(bindings);
        let members = self.structure_members(member_depth);
        self.bindings.pop();
        let (fields, methods) = members?;

        debug!(
            template = %name.lexeme,
            fields = fields.len(),
            methods = methods.len(),
            "structure template declared"
        );
        let definition = self.types.template_mut(template);
        definition.fields = fields;
        definition.methods = methods;
        Ok(())
    }

    /// Reads `field` lines and records where each `function` member starts;
    /// method bodies are compiled once the layout is known.
    fn structure_members(
        &mut self,
        depth: usize,
    ) -> CompileResult<(Vec<FieldTemplate>, Vec<usize>)> {
        let level = self.indentation();
        if level != depth || self.kind_at(self.cursor + level) == TokenKind::EndOfFile {
            let token = self.tokens.get(self.cursor + level).unwrap_or(&self.eof);
            return Err(CompilerError::new(token, CompileErrorKind::ExpectedBlock));
        }

        let mut fields: Vec<FieldTemplate> = Vec::new();
        let mut methods = Vec::new();
        loop {
            let level = self.indentation();
            if level < depth || self.kind_at(self.cursor + level) == TokenKind::EndOfFile {
                break;
            }
            if level > depth {
                let token = self.tokens[self.cursor + level].clone();
                return Err(CompilerError::new(
                    &token,
                    CompileErrorKind::UnexpectedIndentation,
                ));
            }
            self.cursor += level;
            match self.kind() {
                TokenKind::Field => {
                    self.advance();
                    let token = self.current().clone();
                    let ty = self.type_expr(true)?;
                    if matches!(ty, Type::Void | Type::Reference(_)) {
                        return Err(CompilerError::mismatch(
                            &token,
                            "a field type",
                            self.type_name(&ty),
                        ));
                    }
                    let field = self.identifier("a field name")?;
                    if fields.iter().any(|f| f.name == field.lexeme) {
                        return Err(redeclared_type(&field));
                    }
                    fields.push(FieldTemplate {
                        name: field.lexeme.clone(),
                        ty,
                        token: field,
                    });
                    self.end_statement()?;
                }
                TokenKind::Function => {
                    methods.push(self.cursor);
                    self.skip_block(depth);
                }
                _ => {
                    return Err(CompilerError::expected(
                        self.current(),
                        "'field' or 'function'",
                    ));
                }
            }
        }
        Ok((fields, methods))
    }

    /// Declares every method header first, so methods can call each other,
    /// then compiles the bodies. Reads from `tokens`, which for a template
    /// is the module it was declared in.
    fn compile_methods(
        &mut self,
        id: StructureId,
        cursors: &[usize],
        depth: usize,
        tokens: Arc<[Token]>,
        bindings: HashMap<String, Type>,
    ) -> CompileResult<()> {
        let saved_tokens = std::mem::replace(&mut self.tokens, tokens);
        let saved_cursor = self.cursor;
        self.bindings.push(bindings);
        let result = self.method_bodies(id, cursors, depth);
        self.bindings.pop();
        self.tokens = saved_tokens;
        self.cursor = saved_cursor;
        result
    }

    fn method_bodies(&mut self, id: StructureId, cursors: &[usize], depth: usize) -> CompileResult<()> {
        let owner = self.types.structure(id).name.clone();
        let mut pending = Vec::with_capacity(cursors.len());
        for &cursor in cursors {
            self.cursor = cursor;
            let (name, parameters, returns) = self.function_signature()?;
            let structure = self.types.structure(id);
            if structure.method(&name.lexeme).is_some() || structure.field(&name.lexeme).is_some() {
                return Err(redeclared_type(&name));
            }
            let chunk = self.reserve_chunk(&format!("{}.{}", owner, name.lexeme), &name)?;
            let header = FunctionHeader {
                name: name.lexeme.clone(),
                parameters,
                returns,
                kind: FunctionKind::Script { chunk },
                receiver: Some(id),
            };
            trace!(structure = %owner, method = %header.name, chunk, "method declared");
            self.types.structure_mut(id).methods.push(header.clone());
            pending.push((header, name, self.cursor));
        }
        for (header, name, body) in pending {
            self.cursor = body;
            self.function_body(&header, depth, &name)?;
        }
        Ok(())
    }
}

fn redeclared_type(token: &Token) -> CompilerError {
    CompilerError::new(
        token,
        CompileErrorKind::Redeclaration {
            name: token.lexeme.clone(),
        },
    )
}
