use crate::frontend::token::{Token, TokenKind};

pub struct TokenDumper {
    pub color: bool,
    pub show_formatting: bool, // if false, Indent/StatementTerminator are skipped
}

impl Default for TokenDumper {
    fn default() -> Self {
        Self {
            color: true,
            show_formatting: true,
        }
    }
}

impl TokenDumper {
    // ANSI colors
    const RESET: &'static str = "\x1b[0m";
    const DIM: &'static str = "\x1b[2m";
    const GRN: &'static str = "\x1b[32m";
    const YEL: &'static str = "\x1b[33m";
    const CYN: &'static str = "\x1b[36m";
    const MAG: &'static str = "\x1b[35m";

    pub fn new() -> Self {
        Self::default()
    }

    pub fn no_color(mut self) -> Self {
        self.color = false;
        self
    }

    pub fn pretty(mut self) -> Self {
        self.show_formatting = false;
        self
    }

    pub fn dump(&self, tokens: &[Token]) {
        print!("{}", self.dump_to_string(tokens));
    }

    pub fn dump_to_string(&self, tokens: &[Token]) -> String {
        tokens
            .iter()
            .filter(|t| self.show_formatting || !t.kind.is_formatting())
            .map(|t| self.format_one(t) + "\n")
            .collect()
    }

    fn format_one(&self, token: &Token) -> String {
        let colr = if self.color { self.color(token.kind) } else { "" };
        let reset = if self.color { Self::RESET } else { "" };

        let text = match token.kind {
            TokenKind::StatementTerminator => "END".to_string(),
            TokenKind::Indent => "INDENT".to_string(),
            TokenKind::EndOfFile => "EOF".to_string(),
            TokenKind::String => format!("{:?}", token.lexeme),
            _ => token.lexeme.clone(),
        };
        format!(
            "[{:02}:{:02}] {}{:<8} {}{}",
            token.span.line,
            token.span.col,
            colr,
            self.kind(token.kind),
            text,
            reset
        )
    }

    fn kind(&self, kind: TokenKind) -> &'static str {
        use TokenKind::*;
        match kind {
            NewLine | StatementTerminator => "NEWLINE",
            Indent => "INDENT",
            EndOfFile => "EOF",

            Integer => "INT",
            Float => "FLOAT",
            String => "STRING",
            True | False => "BOOL",

            Identifier => "IDENT",

            LeftParen | RightParen => "PAREN",
            LeftBracket | RightBracket => "BRACKET",
            LeftBrace | RightBrace => "BRACE",
            Comma | Dot => "PUNCT",

            Plus | Minus | Star | Slash | Percent | Equal | PlusEqual | MinusEqual
            | StarEqual | SlashEqual | PlusPlus | MinusMinus | Ampersand => "OP",
            EqualEqual | BangEqual | Less | LessEqual | Greater | GreaterEqual => "CMP",

            // everything else = keyword
            _ => "KEYWORD",
        }
    }

    fn color(&self, kind: TokenKind) -> &'static str {
        match self.kind(kind) {
            "NEWLINE" | "INDENT" | "EOF" => Self::DIM,
            "STRING" => Self::GRN,
            "INT" | "FLOAT" | "BOOL" => Self::CYN,
            "IDENT" => Self::YEL,
            "OP" | "CMP" => Self::MAG,
            _ => Self::RESET,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frontend::lexer::{Module, Tokenizer};

    fn tokens(source: &str) -> Vec<Token> {
        let mut module = Module::new("test", source);
        Tokenizer::tokenize_module(&mut module).unwrap();
        module.tokens
    }

    #[test]
    fn test_plain_dump() {
        let output = TokenDumper::new().no_color().dump_to_string(&tokens("var a = 1"));
        assert!(output.contains("[01:01] KEYWORD  var"));
        assert!(output.contains("IDENT    a"));
        assert!(output.contains("INT      1"));
        assert!(!output.contains("\x1b["));
    }

    #[test]
    fn test_pretty_skips_layout() {
        let output = TokenDumper::new()
            .no_color()
            .pretty()
            .dump_to_string(&tokens("if true then\n    var a = 1"));
        assert!(!output.contains("INDENT"));
        assert!(!output.contains("EOF"));
    }
}
