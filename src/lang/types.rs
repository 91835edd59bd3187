//! The closed set of script types and their word layouts.
//!
//! Every concrete type has a deterministic size in words. Structures live in a
//! [`TypeTable`] and are referenced by [`StructureId`]; generic structures are
//! kept as [`StructureTemplate`]s until instantiated with concrete arguments.

use std::collections::HashMap;
use std::sync::Arc;

use crate::frontend::token::Token;
use crate::lang::scope::FunctionHeader;

pub type StructureId = usize;
pub type TemplateId = usize;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Type {
    Void,
    Bool,
    Int,
    Float,
    String,
    /// `N` contiguous elements stored inline.
    Span(Box<Type>, u16),
    /// Heap-backed growable array referenced by one word.
    List(Box<Type>),
    /// Heap reference.
    Pointer(Box<Type>),
    /// Stack reference, used for `self` and by-reference parameters.
    Reference(Box<Type>),
    Structure(StructureId),
    /// Type parameter of a structure template, by position.
    Placeholder(u8),
    /// A template applied to arguments that still mention placeholders;
    /// becomes a [`Type::Structure`] once the arguments are substituted.
    Generic(TemplateId, Vec<Type>),
}

impl Type {
    pub fn contains_placeholder(&self) -> bool {
        self.first_placeholder().is_some()
    }

    pub fn first_placeholder(&self) -> Option<u8> {
        match self {
            Type::Placeholder(index) => Some(*index),
            Type::Span(element, _)
            | Type::List(element)
            | Type::Pointer(element)
            | Type::Reference(element) => element.first_placeholder(),
            Type::Generic(_, arguments) => arguments.iter().find_map(Type::first_placeholder),
            _ => None,
        }
    }

    /// Replaces every placeholder with the matching argument.
    pub fn substitute(&self, arguments: &[Type]) -> Type {
        match self {
            Type::Placeholder(index) => arguments
                .get(*index as usize)
                .cloned()
                .unwrap_or_else(|| self.clone()),
            Type::Span(element, length) => {
                Type::Span(Box::new(element.substitute(arguments)), *length)
            }
            Type::List(element) => Type::List(Box::new(element.substitute(arguments))),
            Type::Pointer(element) => Type::Pointer(Box::new(element.substitute(arguments))),
            Type::Reference(element) => Type::Reference(Box::new(element.substitute(arguments))),
            Type::Generic(template, inner) => Type::Generic(
                *template,
                inner.iter().map(|ty| ty.substitute(arguments)).collect(),
            ),
            other => other.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Field {
    pub name: String,
    pub ty: Type,
    /// Word offset from the start of the structure.
    pub offset: u32,
}

#[derive(Debug, Clone)]
pub struct StructureType {
    /// Display name; instantiations read `Pair<Int, Float>`.
    pub name: String,
    pub fields: Vec<Field>,
    pub methods: Vec<FunctionHeader>,
    pub word_length: u32,
    /// False until the fields have been laid out; an incomplete structure
    /// has no size yet.
    pub complete: bool,
}

impl StructureType {
    pub fn field(&self, name: &str) -> Option<&Field> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn method(&self, name: &str) -> Option<&FunctionHeader> {
        self.methods.iter().find(|m| m.name == name)
    }
}

#[derive(Debug, Clone)]
pub struct FieldTemplate {
    pub name: String,
    /// May mention [`Type::Placeholder`]s.
    pub ty: Type,
    pub token: Token,
}

/// A structure definition waiting for type arguments.
///
/// Method bodies are not stored as code: each instantiation re-reads them from
/// `tokens` starting at the recorded cursor, because field offsets differ per
/// instantiation.
#[derive(Debug, Clone)]
pub struct StructureTemplate {
    pub name: String,
    pub placeholders: Vec<String>,
    pub fields: Vec<FieldTemplate>,
    /// Cursor of each `function` member within `tokens`.
    pub methods: Vec<usize>,
    /// Indentation depth of the member lines.
    pub member_depth: usize,
    pub tokens: Arc<[Token]>,
    pub token: Token,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypeName {
    Structure(StructureId),
    Template(TemplateId),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LayoutError {
    UnresolvedPlaceholder(u8),
    Recursive(String),
    TooLarge,
}

#[derive(Debug, Default)]
pub struct TypeTable {
    structures: Vec<StructureType>,
    templates: Vec<StructureTemplate>,
    names: HashMap<String, TypeName>,
    instances: HashMap<(TemplateId, Vec<Type>), StructureId>,
}

impl TypeTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lookup(&self, name: &str) -> Option<TypeName> {
        self.names.get(name).copied()
    }

    pub fn structure(&self, id: StructureId) -> &StructureType {
        &self.structures[id]
    }

    pub fn structure_mut(&mut self, id: StructureId) -> &mut StructureType {
        &mut self.structures[id]
    }

    pub fn template(&self, id: TemplateId) -> &StructureTemplate {
        &self.templates[id]
    }

    pub fn template_mut(&mut self, id: TemplateId) -> &mut StructureTemplate {
        &mut self.templates[id]
    }

    /// Adds an empty structure; fields are filled in by [`TypeTable::set_fields`].
    /// Named structures are registered for lookup, instantiations are not.
    pub fn add_structure(&mut self, name: String, register: bool) -> StructureId {
        let id = self.structures.len();
        if register {
            self.names.insert(name.clone(), TypeName::Structure(id));
        }
        self.structures.push(StructureType {
            name,
            fields: Vec::new(),
            methods: Vec::new(),
            word_length: 0,
            complete: false,
        });
        id
    }

    pub fn add_template(&mut self, template: StructureTemplate) -> TemplateId {
        let id = self.templates.len();
        self.names.insert(template.name.clone(), TypeName::Template(id));
        self.templates.push(template);
        id
    }

    pub fn instance(&self, template: TemplateId, arguments: &[Type]) -> Option<StructureId> {
        self.instances
            .get(&(template, arguments.to_vec()))
            .copied()
    }

    pub fn record_instance(&mut self, template: TemplateId, arguments: Vec<Type>, id: StructureId) {
        self.instances.insert((template, arguments), id);
    }

    /// Lays out `fields` in declaration order and stores them on `id`.
    pub fn set_fields(
        &mut self,
        id: StructureId,
        fields: Vec<(String, Type)>,
    ) -> Result<(), LayoutError> {
        let mut offset = 0u32;
        let mut laid_out = Vec::with_capacity(fields.len());
        for (name, ty) in fields {
            let words = self.word_length(&ty)?;
            laid_out.push(Field { name, ty, offset });
            offset = offset.checked_add(words).ok_or(LayoutError::TooLarge)?;
        }
        let structure = &mut self.structures[id];
        structure.fields = laid_out;
        structure.word_length = offset;
        structure.complete = true;
        Ok(())
    }

    pub fn word_length(&self, ty: &Type) -> Result<u32, LayoutError> {
        Ok(match ty {
            Type::Void => 0,
            Type::Bool | Type::Int | Type::Float | Type::String => 1,
            Type::List(_) | Type::Pointer(_) | Type::Reference(_) => 1,
            Type::Span(element, length) => self
                .word_length(element)?
                .checked_mul(*length as u32)
                .ok_or(LayoutError::TooLarge)?,
            Type::Structure(id) => {
                let structure = &self.structures[*id];
                if !structure.complete {
                    return Err(LayoutError::Recursive(structure.name.clone()));
                }
                structure.word_length
            }
            Type::Placeholder(index) => return Err(LayoutError::UnresolvedPlaceholder(*index)),
            Type::Generic(..) => {
                return Err(LayoutError::UnresolvedPlaceholder(
                    ty.first_placeholder().unwrap_or(0),
                ));
            }
        })
    }

    pub fn name_of(&self, ty: &Type) -> String {
        match ty {
            Type::Void => "Void".to_string(),
            Type::Bool => "Bool".to_string(),
            Type::Int => "Int".to_string(),
            Type::Float => "Float".to_string(),
            Type::String => "String".to_string(),
            Type::Span(element, length) => format!("{}<{}>", self.name_of(element), length),
            Type::List(element) => format!("{}[]", self.name_of(element)),
            Type::Pointer(element) => format!("{}*", self.name_of(element)),
            Type::Reference(element) => format!("{}&", self.name_of(element)),
            Type::Structure(id) => self.structures[*id].name.clone(),
            Type::Placeholder(index) => format!("${}", index),
            Type::Generic(template, arguments) => format!(
                "{}<{}>",
                self.templates[*template].name,
                arguments
                    .iter()
                    .map(|ty| self.name_of(ty))
                    .collect::<Vec<_>>()
                    .join(", ")
            ),
        }
    }
}

pub fn primitive(name: &str) -> Option<Type> {
    Some(match name {
        "Void" => Type::Void,
        "Bool" => Type::Bool,
        "Int" => Type::Int,
        "Float" => Type::Float,
        "String" => Type::String,
        _ => return None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn point(table: &mut TypeTable) -> StructureId {
        let id = table.add_structure("Point".to_string(), true);
        table
            .set_fields(
                id,
                vec![("x".to_string(), Type::Int), ("y".to_string(), Type::Float)],
            )
            .unwrap();
        id
    }

    #[test]
    fn test_primitive_word_lengths() {
        let table = TypeTable::new();
        assert_eq!(table.word_length(&Type::Void), Ok(0));
        assert_eq!(table.word_length(&Type::Int), Ok(1));
        assert_eq!(table.word_length(&Type::String), Ok(1));
        assert_eq!(table.word_length(&Type::List(Box::new(Type::Int))), Ok(1));
    }

    #[test]
    fn test_span_word_length() {
        let mut table = TypeTable::new();
        let id = point(&mut table);
        let span = Type::Span(Box::new(Type::Structure(id)), 3);
        assert_eq!(table.word_length(&span), Ok(6));
    }

    #[test]
    fn test_field_offsets() {
        let mut table = TypeTable::new();
        let inner = point(&mut table);
        let outer = table.add_structure("Segment".to_string(), true);
        table
            .set_fields(
                outer,
                vec![
                    ("id".to_string(), Type::Int),
                    ("from".to_string(), Type::Structure(inner)),
                    ("to".to_string(), Type::Structure(inner)),
                ],
            )
            .unwrap();
        let segment = table.structure(outer);
        assert_eq!(segment.word_length, 5);
        assert_eq!(segment.field("from").map(|f| f.offset), Some(1));
        assert_eq!(segment.field("to").map(|f| f.offset), Some(3));
    }

    #[test]
    fn test_recursive_structure_rejected() {
        let mut table = TypeTable::new();
        let id = table.add_structure("Node".to_string(), true);
        let err = table
            .set_fields(id, vec![("next".to_string(), Type::Structure(id))])
            .unwrap_err();
        assert_eq!(err, LayoutError::Recursive("Node".to_string()));

        // through a pointer is fine
        table
            .set_fields(
                id,
                vec![("next".to_string(), Type::Pointer(Box::new(Type::Structure(id))))],
            )
            .unwrap();
    }

    #[test]
    fn test_substitute_placeholders() {
        let template = Type::List(Box::new(Type::Span(Box::new(Type::Placeholder(1)), 2)));
        let concrete = template.substitute(&[Type::Int, Type::Float]);
        assert_eq!(
            concrete,
            Type::List(Box::new(Type::Span(Box::new(Type::Float), 2)))
        );
        assert!(template.contains_placeholder());
        assert!(!concrete.contains_placeholder());
    }

    #[test]
    fn test_placeholder_has_no_layout() {
        let table = TypeTable::new();
        assert_eq!(
            table.word_length(&Type::Placeholder(0)),
            Err(LayoutError::UnresolvedPlaceholder(0))
        );
    }

    #[test]
    fn test_incomplete_structure_has_no_size() {
        let mut table = TypeTable::new();
        let outer = table.add_structure("Outer".to_string(), true);
        let inner = table.add_structure("Inner".to_string(), true);
        let err = table
            .set_fields(inner, vec![("back".to_string(), Type::Structure(outer))])
            .unwrap_err();
        assert_eq!(err, LayoutError::Recursive("Outer".to_string()));
    }

    #[test]
    fn test_generic_substitution() {
        let pending = Type::Pointer(Box::new(Type::Generic(3, vec![Type::Placeholder(0)])));
        assert_eq!(pending.first_placeholder(), Some(0));
        assert_eq!(
            pending.substitute(&[Type::Int]),
            Type::Pointer(Box::new(Type::Generic(3, vec![Type::Int])))
        );
    }

    #[test]
    fn test_type_names() {
        let mut table = TypeTable::new();
        let id = point(&mut table);
        let ty = Type::List(Box::new(Type::Span(Box::new(Type::Structure(id)), 4)));
        assert_eq!(table.name_of(&ty), "Point<4>[]");
    }
}
