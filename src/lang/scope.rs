use std::collections::HashMap;

use crate::lang::types::{StructureId, Type};

pub type ScopeId = usize;

#[derive(Debug, Clone, PartialEq)]
pub struct Parameter {
    pub name: String,
    pub ty: Type,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FunctionKind {
    /// Compiled into `Program::chunks[chunk]`.
    Script { chunk: u16 },
    /// Host callable at `index` of the machine's external table.
    External { index: u16 },
}

#[derive(Debug, Clone, PartialEq)]
pub struct FunctionHeader {
    pub name: String,
    pub parameters: Vec<Parameter>,
    pub returns: Type,
    pub kind: FunctionKind,
    /// Set for methods, which take an implicit `self` reference first.
    pub receiver: Option<StructureId>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Variable {
    pub ty: Type,
    /// Word offset from the owning frame's base.
    pub offset: u32,
    /// Declared in the entry chunk's frame, whose base is stack index 0.
    pub global: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScopeKind {
    Global,
    Function,
    Block,
}

#[derive(Debug)]
pub struct Scope {
    pub parent: Option<ScopeId>,
    pub kind: ScopeKind,
    pub variables: HashMap<String, Variable>,
    pub functions: HashMap<String, FunctionHeader>,
    pub depth: usize,
    /// Words occupied by this scope and its enclosing scopes of the same frame.
    pub word_length: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScopeError {
    Redeclared(String),
}

/// Lexical scopes as a stack of frames; a scope's parent is always below it.
///
/// Exiting a scope drops it: scopes are compile-time bookkeeping only.
#[derive(Debug)]
pub struct ScopeTree {
    scopes: Vec<Scope>,
}

impl Default for ScopeTree {
    fn default() -> Self {
        Self::new()
    }
}

impl ScopeTree {
    pub const GLOBAL: ScopeId = 0;

    pub fn new() -> Self {
        ScopeTree {
            scopes: vec![Scope {
                parent: None,
                kind: ScopeKind::Global,
                variables: HashMap::new(),
                functions: HashMap::new(),
                depth: 0,
                word_length: 0,
            }],
        }
    }

    pub fn get(&self, id: ScopeId) -> &Scope {
        &self.scopes[id]
    }

    /// Opens a child of `parent`. Block scopes continue the parent's frame;
    /// function scopes start a fresh frame at offset zero.
    pub fn enter(&mut self, parent: ScopeId, kind: ScopeKind) -> ScopeId {
        let outer = &self.scopes[parent];
        let word_length = match kind {
            ScopeKind::Block => outer.word_length,
            ScopeKind::Function | ScopeKind::Global => 0,
        };
        let depth = outer.depth + 1;
        self.scopes.push(Scope {
            parent: Some(parent),
            kind,
            variables: HashMap::new(),
            functions: HashMap::new(),
            depth,
            word_length,
        });
        self.scopes.len() - 1
    }

    /// Closes `id` and returns the words it added on top of its parent's
    /// frame, which the caller pops.
    pub fn exit(&mut self, id: ScopeId) -> u32 {
        debug_assert_eq!(id, self.scopes.len() - 1, "scopes must close in order");
        let Some(scope) = self.scopes.pop() else {
            return 0;
        };
        match (scope.kind, scope.parent) {
            (ScopeKind::Block, Some(parent)) => {
                scope.word_length - self.scopes[parent].word_length
            }
            _ => scope.word_length,
        }
    }

    /// The nearest enclosing function or global scope: the frame owner.
    pub fn frame_root(&self, mut id: ScopeId) -> ScopeId {
        loop {
            let scope = &self.scopes[id];
            match (scope.kind, scope.parent) {
                (ScopeKind::Block, Some(parent)) => id = parent,
                _ => return id,
            }
        }
    }

    pub fn declare_variable(
        &mut self,
        id: ScopeId,
        name: &str,
        ty: Type,
        words: u32,
    ) -> Result<Variable, ScopeError> {
        let global = self.scopes[self.frame_root(id)].kind == ScopeKind::Global;
        let scope = &mut self.scopes[id];
        if scope.variables.contains_key(name) {
            return Err(ScopeError::Redeclared(name.to_string()));
        }
        let variable = Variable {
            ty,
            offset: scope.word_length,
            global,
        };
        scope.word_length += words;
        scope.variables.insert(name.to_string(), variable.clone());
        Ok(variable)
    }

    pub fn declare_function(
        &mut self,
        id: ScopeId,
        header: FunctionHeader,
    ) -> Result<(), ScopeError> {
        let scope = &mut self.scopes[id];
        if scope.functions.contains_key(&header.name) {
            return Err(ScopeError::Redeclared(header.name));
        }
        scope.functions.insert(header.name.clone(), header);
        Ok(())
    }

    /// Walks parents until `name` is found.
    pub fn lookup_variable(&self, mut id: ScopeId, name: &str) -> Option<&Variable> {
        loop {
            let scope = &self.scopes[id];
            if let Some(variable) = scope.variables.get(name) {
                return Some(variable);
            }
            id = scope.parent?;
        }
    }

    pub fn lookup_function(&self, mut id: ScopeId, name: &str) -> Option<&FunctionHeader> {
        loop {
            let scope = &self.scopes[id];
            if let Some(header) = scope.functions.get(name) {
                return Some(header);
            }
            id = scope.parent?;
        }
    }

    pub fn word_length(&self, id: ScopeId) -> u32 {
        self.scopes[id].word_length
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_block_variables_follow_parent() {
        let mut tree = ScopeTree::new();
        let a = tree
            .declare_variable(ScopeTree::GLOBAL, "a", Type::Int, 1)
            .unwrap();
        let block = tree.enter(ScopeTree::GLOBAL, ScopeKind::Block);
        let b = tree.declare_variable(block, "b", Type::Int, 2).unwrap();
        assert_eq!(a.offset, 0);
        assert_eq!(b.offset, 1);
        assert!(b.global);
        assert_eq!(tree.exit(block), 2);
    }

    #[test]
    fn test_child_variable_invisible_after_exit() {
        let mut tree = ScopeTree::new();
        let block = tree.enter(ScopeTree::GLOBAL, ScopeKind::Block);
        tree.declare_variable(block, "inner", Type::Int, 1).unwrap();
        assert!(tree.lookup_variable(block, "inner").is_some());
        tree.exit(block);
        assert!(tree.lookup_variable(ScopeTree::GLOBAL, "inner").is_none());

        // the sibling reuses the slot
        let sibling = tree.enter(ScopeTree::GLOBAL, ScopeKind::Block);
        let reused = tree.declare_variable(sibling, "other", Type::Int, 1).unwrap();
        assert_eq!(reused.offset, 0);
    }

    #[test]
    fn test_redeclaration_in_same_scope_fails() {
        let mut tree = ScopeTree::new();
        tree.declare_variable(ScopeTree::GLOBAL, "a", Type::Int, 1)
            .unwrap();
        assert_eq!(
            tree.declare_variable(ScopeTree::GLOBAL, "a", Type::Float, 1),
            Err(ScopeError::Redeclared("a".to_string()))
        );
    }

    #[test]
    fn test_shadowing_in_child_scope() {
        let mut tree = ScopeTree::new();
        tree.declare_variable(ScopeTree::GLOBAL, "a", Type::Int, 1)
            .unwrap();
        let block = tree.enter(ScopeTree::GLOBAL, ScopeKind::Block);
        tree.declare_variable(block, "a", Type::Float, 1).unwrap();
        assert_eq!(tree.lookup_variable(block, "a").map(|v| &v.ty), Some(&Type::Float));
    }

    #[test]
    fn test_function_scope_starts_new_frame() {
        let mut tree = ScopeTree::new();
        tree.declare_variable(ScopeTree::GLOBAL, "g", Type::Int, 3)
            .unwrap();
        let function = tree.enter(ScopeTree::GLOBAL, ScopeKind::Function);
        let param = tree.declare_variable(function, "p", Type::Int, 1).unwrap();
        assert_eq!(param.offset, 0);
        assert!(!param.global);
        assert!(tree.lookup_variable(function, "g").is_some_and(|v| v.global));
    }

    #[test]
    fn test_function_lookup_walks_parents() {
        let mut tree = ScopeTree::new();
        let header = FunctionHeader {
            name: "Add".to_string(),
            parameters: vec![],
            returns: Type::Int,
            kind: FunctionKind::Script { chunk: 1 },
            receiver: None,
        };
        tree.declare_function(ScopeTree::GLOBAL, header.clone()).unwrap();
        let function = tree.enter(ScopeTree::GLOBAL, ScopeKind::Function);
        let block = tree.enter(function, ScopeKind::Block);
        assert_eq!(tree.lookup_function(block, "Add"), Some(&header));
        assert_eq!(
            tree.declare_function(ScopeTree::GLOBAL, header),
            Err(ScopeError::Redeclared("Add".to_string()))
        );
    }
}
