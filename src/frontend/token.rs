use std::sync::Arc;

/// 1-based source position of a token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Span {
    pub line: usize,
    pub col: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TokenKind {
    // Literals
    Integer,
    Float,
    String,
    True,
    False,

    Identifier,

    // Declarations
    Var,
    Function,
    Returns,
    Structure,
    Field,
    External,

    // Control flow
    If,
    Then,
    Else,
    While,
    Loop,
    Break,
    Continue,
    Return,
    Yield,

    // Heap
    New,
    Free,

    // Logic
    And,
    Or,
    Not,

    // Operators
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
    Equal,
    EqualEqual,
    BangEqual,
    Less,
    LessEqual,
    Greater,
    GreaterEqual,
    PlusEqual,
    MinusEqual,
    StarEqual,
    SlashEqual,
    PlusPlus,
    MinusMinus,
    Ampersand,

    // Delimiters
    LeftParen,
    RightParen,
    LeftBrace,
    RightBrace,
    LeftBracket,
    RightBracket,
    Comma,
    Dot,

    // Formatting
    NewLine,
    Indent,
    StatementTerminator,
    EndOfFile,
}

/// Registered operator symbols. Scanning tries the longest length first so
/// that `>=` wins over `>`.
pub const SYMBOLS: &[(&str, TokenKind)] = &[
    ("==", TokenKind::EqualEqual),
    ("!=", TokenKind::BangEqual),
    ("<=", TokenKind::LessEqual),
    (">=", TokenKind::GreaterEqual),
    ("+=", TokenKind::PlusEqual),
    ("-=", TokenKind::MinusEqual),
    ("*=", TokenKind::StarEqual),
    ("/=", TokenKind::SlashEqual),
    ("++", TokenKind::PlusPlus),
    ("--", TokenKind::MinusMinus),
    ("+", TokenKind::Plus),
    ("-", TokenKind::Minus),
    ("*", TokenKind::Star),
    ("/", TokenKind::Slash),
    ("%", TokenKind::Percent),
    ("=", TokenKind::Equal),
    ("<", TokenKind::Less),
    (">", TokenKind::Greater),
    ("&", TokenKind::Ampersand),
    ("(", TokenKind::LeftParen),
    (")", TokenKind::RightParen),
    ("{", TokenKind::LeftBrace),
    ("}", TokenKind::RightBrace),
    ("[", TokenKind::LeftBracket),
    ("]", TokenKind::RightBracket),
    (",", TokenKind::Comma),
    (".", TokenKind::Dot),
];

pub fn keyword(ident: &str) -> Option<TokenKind> {
    let kind = match ident {
        "true" => TokenKind::True,
        "false" => TokenKind::False,
        "var" => TokenKind::Var,
        "function" => TokenKind::Function,
        "returns" => TokenKind::Returns,
        "structure" => TokenKind::Structure,
        "field" => TokenKind::Field,
        "external" => TokenKind::External,
        "if" => TokenKind::If,
        "then" => TokenKind::Then,
        "else" => TokenKind::Else,
        "while" => TokenKind::While,
        "loop" => TokenKind::Loop,
        "break" => TokenKind::Break,
        "continue" => TokenKind::Continue,
        "return" => TokenKind::Return,
        "yield" => TokenKind::Yield,
        "new" => TokenKind::New,
        "free" => TokenKind::Free,
        "and" => TokenKind::And,
        "or" => TokenKind::Or,
        "not" => TokenKind::Not,
        _ => return None,
    };
    Some(kind)
}

impl TokenKind {
    /// Formatting tokens carry layout, not meaning.
    pub fn is_formatting(self) -> bool {
        matches!(
            self,
            TokenKind::NewLine
                | TokenKind::Indent
                | TokenKind::StatementTerminator
                | TokenKind::EndOfFile
        )
    }
}

/// A lexed token. Immutable once produced, apart from the formatting pass
/// rewriting `NewLine` into `StatementTerminator`.
#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    pub kind: TokenKind,
    pub lexeme: String,
    pub span: Span,
    /// Name of the module the token was read from.
    pub module: Arc<str>,
}

impl Token {
    pub fn new(kind: TokenKind, lexeme: impl Into<String>, span: Span, module: Arc<str>) -> Self {
        Token {
            kind,
            lexeme: lexeme.into(),
            span,
            module,
        }
    }
}

impl std::fmt::Display for TokenKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            TokenKind::Integer => "integer",
            TokenKind::Float => "float",
            TokenKind::String => "string",
            TokenKind::True => "true",
            TokenKind::False => "false",
            TokenKind::Identifier => "identifier",
            TokenKind::Var => "var",
            TokenKind::Function => "function",
            TokenKind::Returns => "returns",
            TokenKind::Structure => "structure",
            TokenKind::Field => "field",
            TokenKind::External => "external",
            TokenKind::If => "if",
            TokenKind::Then => "then",
            TokenKind::Else => "else",
            TokenKind::While => "while",
            TokenKind::Loop => "loop",
            TokenKind::Break => "break",
            TokenKind::Continue => "continue",
            TokenKind::Return => "return",
            TokenKind::Yield => "yield",
            TokenKind::New => "new",
            TokenKind::Free => "free",
            TokenKind::And => "and",
            TokenKind::Or => "or",
            TokenKind::Not => "not",
            TokenKind::NewLine => "newline",
            TokenKind::Indent => "indent",
            TokenKind::StatementTerminator => "end of statement",
            TokenKind::EndOfFile => "end of file",
            other => {
                return match SYMBOLS.iter().find(|(_, kind)| kind == other) {
                    Some((symbol, _)) => write!(f, "'{}'", symbol),
                    None => write!(f, "{:?}", other),
                };
            }
        };
        write!(f, "{}", text)
    }
}

impl std::fmt::Display for Token {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.kind {
            TokenKind::Identifier | TokenKind::Integer | TokenKind::Float => {
                write!(f, "'{}'", self.lexeme)
            }
            TokenKind::String => write!(f, "\"{}\"", self.lexeme),
            other => write!(f, "{}", other),
        }
    }
}
