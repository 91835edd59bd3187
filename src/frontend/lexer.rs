use std::sync::Arc;

use thiserror::Error;
use tracing::debug;

use crate::frontend::token::{SYMBOLS, Span, Token, TokenKind, keyword};

/// Spaces that make up one level of block nesting.
pub const INDENT_WIDTH: usize = 4;

#[derive(Debug, Clone, Error)]
#[error("{}:{}: {message}", .span.line, .span.col)]
pub struct TokenizerError {
    pub message: String,
    pub span: Span,
}

impl TokenizerError {
    fn new(message: impl Into<String>, span: Span) -> Self {
        TokenizerError {
            message: message.into(),
            span,
        }
    }

    /// Formats the error with the offending source line and a caret under
    /// the reported column.
    pub fn render(&self, source: &str) -> String {
        render_caret(source, self.span, &self.message)
    }
}

/// Shared by the tokenizer and compiler diagnostics.
pub fn render_caret(source: &str, span: Span, message: &str) -> String {
    let line_text = source.lines().nth(span.line.saturating_sub(1)).unwrap_or("");
    let gutter = format!("{} | ", span.line);
    format!(
        "{}:{}: {}\n{}{}\n{}^",
        span.line,
        span.col,
        message,
        gutter,
        line_text,
        " ".repeat(gutter.len() + span.col.saturating_sub(1))
    )
}

/// One compiled unit: its name, its source text and, once tokenized, the
/// tokens it owns.
#[derive(Debug, Clone)]
pub struct Module {
    pub name: Arc<str>,
    pub source: String,
    pub tokens: Vec<Token>,
}

impl Module {
    pub fn new(name: &str, source: impl Into<String>) -> Self {
        Module {
            name: Arc::from(name),
            source: source.into(),
            tokens: Vec::new(),
        }
    }
}

pub struct Tokenizer {
    source: Vec<char>,
    module: Arc<str>,
    pos: usize,
    line: usize,
    col: usize,
    /// Open `(`, `[` and `{` count; line breaks inside brackets are ignored.
    nesting: usize,
    longest_symbol: usize,
}

impl Tokenizer {
    pub fn new(source: &str, module: Arc<str>) -> Self {
        Tokenizer {
            source: source.chars().collect(),
            module,
            pos: 0,
            line: 1,
            col: 1,
            nesting: 0,
            longest_symbol: SYMBOLS
                .iter()
                .map(|(symbol, _)| symbol.chars().count())
                .max()
                .unwrap_or(1),
        }
    }

    /// Tokenizes a module in place: raw scan followed by formatting cleanup.
    pub fn tokenize_module(module: &mut Module) -> Result<(), TokenizerError> {
        let mut tokenizer = Tokenizer::new(&module.source, module.name.clone());
        let raw = tokenizer.tokenize()?;
        module.tokens = clean_formatting(raw);
        debug!(module = %module.name, tokens = module.tokens.len(), "module tokenized");
        Ok(())
    }

    fn current(&self) -> Option<char> {
        self.source.get(self.pos).copied()
    }

    fn peek(&self) -> Option<char> {
        self.source.get(self.pos + 1).copied()
    }

    fn advance(&mut self) -> Option<char> {
        let ch = self.current();
        if ch == Some('\n') {
            self.line += 1;
            self.col = 1;
        } else {
            self.col += 1;
        }
        self.pos += 1;
        ch
    }

    fn span(&self) -> Span {
        Span {
            line: self.line,
            col: self.col,
        }
    }

    fn token(&self, kind: TokenKind, lexeme: impl Into<String>, span: Span) -> Token {
        Token::new(kind, lexeme, span, self.module.clone())
    }

    /// Spaces degrade to `Indent` tokens, one per full run of four.
    fn read_whitespace(&mut self, tokens: &mut Vec<Token>) {
        let mut run = 0;
        let mut run_start = self.span();
        while let Some(ch) = self.current() {
            match ch {
                ' ' => {
                    if run == 0 {
                        run_start = self.span();
                    }
                    run += 1;
                    self.advance();
                    if run == INDENT_WIDTH {
                        if self.nesting == 0 {
                            tokens.push(self.token(TokenKind::Indent, "    ", run_start));
                        }
                        run = 0;
                    }
                }
                '\t' => {
                    let span = self.span();
                    self.advance();
                    run = 0;
                    if self.nesting == 0 {
                        tokens.push(self.token(TokenKind::Indent, "\t", span));
                    }
                }
                '\r' => {
                    self.advance();
                }
                _ => break,
            }
        }
    }

    fn skip_comment(&mut self) {
        while let Some(ch) = self.current() {
            if ch == '\n' {
                break;
            }
            self.advance();
        }
    }

    fn read_string(&mut self) -> Result<Token, TokenizerError> {
        let start = self.span();
        self.advance();

        let mut string = String::new();
        loop {
            match self.current() {
                Some('"') => {
                    self.advance();
                    return Ok(self.token(TokenKind::String, string, start));
                }
                Some('\\') => {
                    self.advance();
                    match self.current() {
                        Some('n') => string.push('\n'),
                        Some('t') => string.push('\t'),
                        Some('r') => string.push('\r'),
                        Some('\\') => string.push('\\'),
                        Some('"') => string.push('"'),
                        Some(ch) => {
                            return Err(TokenizerError::new(
                                format!("unknown escape sequence: \\{}", ch),
                                self.span(),
                            ));
                        }
                        None => {
                            return Err(TokenizerError::new(
                                "unexpected end of file in escape sequence",
                                self.span(),
                            ));
                        }
                    }
                    self.advance();
                }
                Some('\n') | None => {
                    return Err(TokenizerError::new("unterminated string literal", start));
                }
                Some(ch) => {
                    string.push(ch);
                    self.advance();
                }
            }
        }
    }

    /// Reads an unsigned number. A fraction is only accepted when `allow_fraction`
    /// is set, so `pair.0.1` stays two member accesses.
    fn read_number(&mut self, allow_fraction: bool) -> Token {
        let start = self.span();

        if self.current() == Some('0') && matches!(self.peek(), Some('x') | Some('X')) {
            let mut lexeme = String::from("0x");
            self.advance();
            self.advance();
            while let Some(ch) = self.current() {
                if ch.is_ascii_hexdigit() {
                    lexeme.push(ch);
                    self.advance();
                } else {
                    break;
                }
            }
            return self.token(TokenKind::Integer, lexeme, start);
        }

        let mut digits = String::new();
        let mut kind = TokenKind::Integer;
        while let Some(ch) = self.current() {
            if ch.is_ascii_digit() {
                digits.push(ch);
                self.advance();
            } else if ch == '.'
                && allow_fraction
                && kind == TokenKind::Integer
                && self.peek().is_some_and(|c| c.is_ascii_digit())
            {
                kind = TokenKind::Float;
                digits.push('.');
                self.advance();
            } else {
                break;
            }
        }
        self.token(kind, digits, start)
    }

    fn read_identifier(&mut self) -> Token {
        let start = self.span();
        let mut ident = String::new();
        while let Some(ch) = self.current() {
            if ch.is_alphanumeric() || ch == '_' {
                ident.push(ch);
                self.advance();
            } else {
                break;
            }
        }
        let kind = keyword(&ident).unwrap_or(TokenKind::Identifier);
        self.token(kind, ident, start)
    }

    /// Longest registered symbol starting at the cursor.
    fn read_symbol(&mut self) -> Option<Token> {
        let start = self.span();
        for len in (1..=self.longest_symbol).rev() {
            let end = self.pos + len;
            if end > self.source.len() {
                continue;
            }
            let candidate: String = self.source[self.pos..end].iter().collect();
            if let Some((symbol, kind)) = SYMBOLS.iter().find(|(s, _)| *s == candidate) {
                for _ in 0..len {
                    self.advance();
                }
                match kind {
                    TokenKind::LeftParen | TokenKind::LeftBracket | TokenKind::LeftBrace => {
                        self.nesting += 1
                    }
                    TokenKind::RightParen | TokenKind::RightBracket | TokenKind::RightBrace => {
                        self.nesting = self.nesting.saturating_sub(1)
                    }
                    _ => {}
                }
                return Some(self.token(*kind, *symbol, start));
            }
        }
        None
    }

    /// Raw scan. Formatting tokens (`NewLine`, `Indent`) are still present;
    /// see [`clean_formatting`].
    pub fn tokenize(&mut self) -> Result<Vec<Token>, TokenizerError> {
        let mut tokens = Vec::new();

        loop {
            self.read_whitespace(&mut tokens);
            let span = self.span();

            match self.current() {
                None => {
                    tokens.push(self.token(TokenKind::EndOfFile, "", span));
                    break;
                }
                Some('\n') => {
                    self.advance();
                    if self.nesting == 0 {
                        tokens.push(self.token(TokenKind::NewLine, "\n", span));
                    }
                }
                Some('/') if self.peek() == Some('/') => self.skip_comment(),
                Some('"') => tokens.push(self.read_string()?),
                Some(ch) if ch.is_ascii_digit() => {
                    let after_dot = tokens.last().is_some_and(|t| t.kind == TokenKind::Dot);
                    tokens.push(self.read_number(!after_dot));
                }
                Some(ch) if ch.is_alphabetic() || ch == '_' => {
                    tokens.push(self.read_identifier());
                }
                Some(ch) => match self.read_symbol() {
                    Some(token) => tokens.push(token),
                    None => {
                        return Err(TokenizerError::new(
                            format!("unexpected character: '{}'", ch),
                            span,
                        ));
                    }
                },
            }
        }

        Ok(tokens)
    }
}

/// Splits raw tokens into lines; the `NewLine` (or `EndOfFile`) token ends
/// each line and is kept as its last element.
fn split_lines(tokens: Vec<Token>) -> Vec<Vec<Token>> {
    let mut lines = Vec::new();
    let mut line = Vec::new();
    for token in tokens {
        let ends = matches!(token.kind, TokenKind::NewLine | TokenKind::EndOfFile);
        line.push(token);
        if ends {
            lines.push(std::mem::take(&mut line));
        }
    }
    if !line.is_empty() {
        lines.push(line);
    }
    lines
}

fn leading_indents(line: &[Token]) -> usize {
    line.iter().take_while(|t| t.kind == TokenKind::Indent).count()
}

fn has_content(line: &[Token]) -> bool {
    line.iter().any(|t| !t.kind.is_formatting())
}

/// Normalizes layout so the compiler only sees statement terminators and
/// line-leading indentation.
///
/// 1. indentation below the file's base level is stripped;
/// 2. blank lines are dropped and the newline ending a content line becomes a
///    `StatementTerminator`;
/// 3. `Indent` tokens that do not lead a line are dropped.
pub fn clean_formatting(tokens: Vec<Token>) -> Vec<Token> {
    let mut lines = split_lines(tokens);

    // 1
    let base = lines
        .iter()
        .filter(|line| has_content(line))
        .map(|line| leading_indents(line))
        .min()
        .unwrap_or(0);
    for line in lines.iter_mut().filter(|line| has_content(line)) {
        line.drain(..base);
    }

    // 2
    let mut out = Vec::new();
    let mut eof = None;
    for mut line in lines {
        if line.last().is_some_and(|t| t.kind == TokenKind::EndOfFile) {
            eof = line.pop();
        }
        if !has_content(&line) {
            continue;
        }
        match line.last_mut() {
            Some(last) if last.kind == TokenKind::NewLine => {
                last.kind = TokenKind::StatementTerminator;
            }
            Some(last) => {
                let terminator = Token::new(
                    TokenKind::StatementTerminator,
                    "",
                    eof.as_ref().map(|t| t.span).unwrap_or(last.span),
                    last.module.clone(),
                );
                line.push(terminator);
            }
            None => {}
        }
        out.extend(line);
    }
    if let Some(eof) = eof {
        out.push(eof);
    }

    // 3
    let mut cleaned: Vec<Token> = Vec::with_capacity(out.len());
    for token in out {
        if token.kind == TokenKind::Indent {
            let leads_line = match cleaned.last() {
                None => true,
                Some(prev) => matches!(
                    prev.kind,
                    TokenKind::StatementTerminator | TokenKind::Indent
                ),
            };
            if !leads_line {
                continue;
            }
        }
        cleaned.push(token);
    }
    cleaned
}

#[cfg(test)]
mod tests {
    use super::*;

    fn module_tokens(source: &str) -> Vec<Token> {
        let mut module = Module::new("test", source);
        Tokenizer::tokenize_module(&mut module).unwrap();
        module.tokens
    }

    fn kinds(source: &str) -> Vec<TokenKind> {
        module_tokens(source).into_iter().map(|t| t.kind).collect()
    }

    fn raw_kinds(source: &str) -> Vec<TokenKind> {
        Tokenizer::new(source, Arc::from("test"))
            .tokenize()
            .unwrap()
            .into_iter()
            .map(|t| t.kind)
            .collect()
    }

    fn error(source: &str) -> TokenizerError {
        Tokenizer::new(source, Arc::from("test"))
            .tokenize()
            .unwrap_err()
    }

    use TokenKind::*;

    #[test]
    fn test_var_declaration() {
        assert_eq!(
            kinds("var a = 1 - 20"),
            vec![
                Var,
                Identifier,
                Equal,
                Integer,
                Minus,
                Integer,
                StatementTerminator,
                EndOfFile
            ]
        );
    }

    #[test]
    fn test_longest_symbol_wins() {
        assert_eq!(
            raw_kinds(">= > == = != <= ++ += +"),
            vec![
                GreaterEqual,
                Greater,
                EqualEqual,
                Equal,
                BangEqual,
                LessEqual,
                PlusPlus,
                PlusEqual,
                Plus,
                EndOfFile
            ]
        );
    }

    #[test]
    fn test_keywords_vs_identifiers() {
        assert_eq!(
            raw_kinds("if iff while whiles returns return"),
            vec![If, Identifier, While, Identifier, Returns, Return, EndOfFile]
        );
    }

    #[test]
    fn test_numbers() {
        let tokens = module_tokens("3.25 42 0x2A");
        assert_eq!(tokens[0].kind, Float);
        assert_eq!(tokens[0].lexeme, "3.25");
        assert_eq!(tokens[1].kind, Integer);
        assert_eq!(tokens[2].lexeme, "0x2A");
    }

    #[test]
    fn test_member_index_is_not_a_float() {
        assert_eq!(
            raw_kinds("pair.0.1"),
            vec![Identifier, Dot, Integer, Dot, Integer, EndOfFile]
        );
    }

    #[test]
    fn test_string_escapes() {
        let tokens = module_tokens(r#""a\nb\t\"c\"""#);
        assert_eq!(tokens[0].kind, String);
        assert_eq!(tokens[0].lexeme, "a\nb\t\"c\"");
    }

    #[test]
    fn test_unterminated_string_error() {
        let err = error("var s = \"hello\nworld\"");
        assert!(err.message.contains("unterminated"), "msg was: {}", err);
        assert_eq!(err.span, Span { line: 1, col: 9 });
    }

    #[test]
    fn test_unexpected_character_error() {
        let err = error("var a = 1 @ 2");
        assert!(err.message.contains("unexpected character"), "msg was: {}", err);
        assert_eq!(err.span.col, 11);
    }

    #[test]
    fn test_caret_rendering() {
        let source = "var a = 1\nvar b = $";
        let err = error(source);
        let rendered = err.render(source);
        assert!(rendered.contains("2 | var b = $"), "{}", rendered);
        assert!(rendered.ends_with(&format!("{}^", " ".repeat(12))), "{:?}", rendered);
    }

    #[test]
    fn test_comments_are_dropped() {
        assert_eq!(
            kinds("// heading\nvar a = 1 // trailing\n"),
            vec![
                Var,
                Identifier,
                Equal,
                Integer,
                StatementTerminator,
                EndOfFile
            ]
        );
    }

    #[test]
    fn test_raw_indentation_tokens() {
        assert_eq!(
            raw_kinds("a\n    b\n"),
            vec![Identifier, NewLine, Indent, Identifier, NewLine, EndOfFile]
        );
    }

    #[test]
    fn test_blank_lines_dropped() {
        assert_eq!(
            kinds("a\n\n        \nb"),
            vec![
                Identifier,
                StatementTerminator,
                Identifier,
                StatementTerminator,
                EndOfFile
            ]
        );
    }

    #[test]
    fn test_base_indentation_stripped() {
        assert_eq!(
            kinds("    a\n        b\n    c\n"),
            vec![
                Identifier,
                StatementTerminator,
                Indent,
                Identifier,
                StatementTerminator,
                Identifier,
                StatementTerminator,
                EndOfFile
            ]
        );
    }

    #[test]
    fn test_mid_line_indentation_dropped() {
        assert_eq!(
            kinds("a        = 1"),
            vec![
                Identifier,
                Equal,
                Integer,
                StatementTerminator,
                EndOfFile
            ]
        );
    }

    #[test]
    fn test_nested_block_indentation() {
        assert_eq!(
            kinds("while x\n    if y then\n        z\n"),
            vec![
                While,
                Identifier,
                StatementTerminator,
                Indent,
                If,
                Identifier,
                Then,
                StatementTerminator,
                Indent,
                Indent,
                Identifier,
                StatementTerminator,
                EndOfFile
            ]
        );
    }

    #[test]
    fn test_newlines_inside_brackets_continue_the_line() {
        assert_eq!(
            kinds("var p = Point {\n    x = 1,\n    y = 2 }\n"),
            vec![
                Var,
                Identifier,
                Equal,
                Identifier,
                LeftBrace,
                Identifier,
                Equal,
                Integer,
                Comma,
                Identifier,
                Equal,
                Integer,
                RightBrace,
                StatementTerminator,
                EndOfFile
            ]
        );
    }

    #[test]
    fn test_spans_and_module() {
        let tokens = module_tokens("var a = 1\n  a = 2\n");
        assert_eq!(tokens[0].span, Span { line: 1, col: 1 });
        assert_eq!(tokens[5].span, Span { line: 2, col: 3 });
        assert_eq!(&*tokens[5].module, "test");
    }
}
