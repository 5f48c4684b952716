use std::iter::Peekable;
use std::str::Chars;

use super::Diagnostic;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TokenKind {
    Int(i64),
    Str(String),
    Ident(String),
    Fn,
    Let,
    If,
    Else,
    While,
    For,
    In,
    Return,
    Break,
    Continue,
    True,
    False,
    Nil,
    LParen,
    RParen,
    LBrace,
    RBrace,
    LBracket,
    RBracket,
    Comma,
    Semicolon,
    DotDot,
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
    Bang,
    Assign,
    EqEq,
    NotEq,
    Lt,
    Le,
    Gt,
    Ge,
    AndAnd,
    OrOr,
    Eof,
}

impl TokenKind {
    /// Human readable form used in diagnostics
    pub fn describe(&self) -> String {
        match self {
            TokenKind::Int(v) => format!("integer {v}"),
            TokenKind::Str(_) => "string literal".to_string(),
            TokenKind::Ident(name) => format!("identifier '{name}'"),
            TokenKind::Eof => "end of file".to_string(),
            other => format!("'{}'", other.symbol()),
        }
    }

    fn symbol(&self) -> &'static str {
        match self {
            TokenKind::Fn => "fn",
            TokenKind::Let => "let",
            TokenKind::If => "if",
            TokenKind::Else => "else",
            TokenKind::While => "while",
            TokenKind::For => "for",
            TokenKind::In => "in",
            TokenKind::Return => "return",
            TokenKind::Break => "break",
            TokenKind::Continue => "continue",
            TokenKind::True => "true",
            TokenKind::False => "false",
            TokenKind::Nil => "nil",
            TokenKind::LParen => "(",
            TokenKind::RParen => ")",
            TokenKind::LBrace => "{",
            TokenKind::RBrace => "}",
            TokenKind::LBracket => "[",
            TokenKind::RBracket => "]",
            TokenKind::Comma => ",",
            TokenKind::Semicolon => ";",
            TokenKind::DotDot => "..",
            TokenKind::Plus => "+",
            TokenKind::Minus => "-",
            TokenKind::Star => "*",
            TokenKind::Slash => "/",
            TokenKind::Percent => "%",
            TokenKind::Bang => "!",
            TokenKind::Assign => "=",
            TokenKind::EqEq => "==",
            TokenKind::NotEq => "!=",
            TokenKind::Lt => "<",
            TokenKind::Le => "<=",
            TokenKind::Gt => ">",
            TokenKind::Ge => ">=",
            TokenKind::AndAnd => "&&",
            TokenKind::OrOr => "||",
            TokenKind::Int(_) | TokenKind::Str(_) | TokenKind::Ident(_) | TokenKind::Eof => "",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Token {
    pub kind: TokenKind,
    pub line: u32,
    pub column: u32,
}

struct Lexer<'a> {
    unit: &'a str,
    chars: Peekable<Chars<'a>>,
    line: u32,
    column: u32,
}

/// Splits source text into tokens, always ending with [`TokenKind::Eof`]
///
/// Lexical errors are pushed to `diagnostics` and the offending characters
/// are skipped, so one pass reports every bad character.
pub fn tokenize(unit: &str, text: &str, diagnostics: &mut Vec<Diagnostic>) -> Vec<Token> {
    let mut lexer = Lexer {
        unit,
        chars: text.chars().peekable(),
        line: 1,
        column: 1,
    };
    let mut tokens = Vec::new();

    loop {
        lexer.skip_trivia(diagnostics);
        let (line, column) = (lexer.line, lexer.column);
        let Some(c) = lexer.bump() else {
            tokens.push(Token {
                kind: TokenKind::Eof,
                line,
                column,
            });
            return tokens;
        };

        let kind = match c {
            '(' => TokenKind::LParen,
            ')' => TokenKind::RParen,
            '{' => TokenKind::LBrace,
            '}' => TokenKind::RBrace,
            '[' => TokenKind::LBracket,
            ']' => TokenKind::RBracket,
            ',' => TokenKind::Comma,
            ';' => TokenKind::Semicolon,
            '+' => TokenKind::Plus,
            '-' => TokenKind::Minus,
            '*' => TokenKind::Star,
            '/' => TokenKind::Slash,
            '%' => TokenKind::Percent,
            '.' if lexer.eat('.') => TokenKind::DotDot,
            '!' if lexer.eat('=') => TokenKind::NotEq,
            '!' => TokenKind::Bang,
            '=' if lexer.eat('=') => TokenKind::EqEq,
            '=' => TokenKind::Assign,
            '<' if lexer.eat('=') => TokenKind::Le,
            '<' => TokenKind::Lt,
            '>' if lexer.eat('=') => TokenKind::Ge,
            '>' => TokenKind::Gt,
            '&' if lexer.eat('&') => TokenKind::AndAnd,
            '|' if lexer.eat('|') => TokenKind::OrOr,
            '"' => match lexer.string(line, column, diagnostics) {
                Some(s) => TokenKind::Str(s),
                None => continue,
            },
            c if c.is_ascii_digit() => match lexer.number(c, line, column, diagnostics) {
                Some(v) => TokenKind::Int(v),
                None => continue,
            },
            c if c.is_alphabetic() || c == '_' => lexer.word(c),
            other => {
                diagnostics.push(Diagnostic::error(
                    unit,
                    line,
                    column,
                    format!("unexpected character '{other}'"),
                ));
                continue;
            }
        };

        tokens.push(Token { kind, line, column });
    }
}

impl Lexer<'_> {
    fn bump(&mut self) -> Option<char> {
        let c = self.chars.next()?;
        if c == '\n' {
            self.line += 1;
            self.column = 1;
        } else {
            self.column += 1;
        }
        Some(c)
    }

    fn eat(&mut self, expected: char) -> bool {
        if self.chars.peek() == Some(&expected) {
            self.bump();
            true
        } else {
            false
        }
    }

    fn skip_trivia(&mut self, diagnostics: &mut Vec<Diagnostic>) {
        loop {
            match self.chars.peek().copied() {
                Some(c) if c.is_whitespace() => {
                    self.bump();
                }
                Some('/') => {
                    let mut ahead = self.chars.clone();
                    ahead.next();
                    match ahead.peek() {
                        Some('/') => {
                            while let Some(c) = self.bump() {
                                if c == '\n' {
                                    break;
                                }
                            }
                        }
                        Some('*') => self.block_comment(diagnostics),
                        _ => return,
                    }
                }
                _ => return,
            }
        }
    }

    fn block_comment(&mut self, diagnostics: &mut Vec<Diagnostic>) {
        let (line, column) = (self.line, self.column);
        self.bump();
        self.bump();
        while let Some(c) = self.bump() {
            if c == '*' && self.eat('/') {
                return;
            }
        }
        diagnostics.push(Diagnostic::error(
            self.unit,
            line,
            column,
            "unterminated block comment",
        ));
    }

    fn string(&mut self, line: u32, column: u32, diagnostics: &mut Vec<Diagnostic>) -> Option<String> {
        let mut value = String::new();
        loop {
            match self.bump() {
                None | Some('\n') => {
                    diagnostics.push(Diagnostic::error(
                        self.unit,
                        line,
                        column,
                        "unterminated string literal",
                    ));
                    return None;
                }
                Some('"') => return Some(value),
                Some('\\') => {
                    let (esc_line, esc_column) = (self.line, self.column);
                    match self.bump() {
                        Some('n') => value.push('\n'),
                        Some('t') => value.push('\t'),
                        Some('r') => value.push('\r'),
                        Some('0') => value.push('\0'),
                        Some('\\') => value.push('\\'),
                        Some('"') => value.push('"'),
                        Some(other) => diagnostics.push(Diagnostic::error(
                            self.unit,
                            esc_line,
                            esc_column - 1,
                            format!("unknown escape sequence '\\{other}'"),
                        )),
                        None => {}
                    }
                }
                Some(c) => value.push(c),
            }
        }
    }

    fn number(
        &mut self,
        first: char,
        line: u32,
        column: u32,
        diagnostics: &mut Vec<Diagnostic>,
    ) -> Option<i64> {
        let mut digits = String::from(first);
        while let Some(&c) = self.chars.peek() {
            if c.is_ascii_digit() || c == '_' {
                self.bump();
                if c != '_' {
                    digits.push(c);
                }
            } else {
                break;
            }
        }
        match digits.parse() {
            Ok(v) => Some(v),
            Err(_) => {
                diagnostics.push(Diagnostic::error(
                    self.unit,
                    line,
                    column,
                    format!("integer literal {digits} is out of range"),
                ));
                None
            }
        }
    }

    fn word(&mut self, first: char) -> TokenKind {
        let mut word = String::from(first);
        while let Some(&c) = self.chars.peek() {
            if c.is_alphanumeric() || c == '_' {
                self.bump();
                word.push(c);
            } else {
                break;
            }
        }
        match word.as_str() {
            "fn" => TokenKind::Fn,
            "let" => TokenKind::Let,
            "if" => TokenKind::If,
            "else" => TokenKind::Else,
            "while" => TokenKind::While,
            "for" => TokenKind::For,
            "in" => TokenKind::In,
            "return" => TokenKind::Return,
            "break" => TokenKind::Break,
            "continue" => TokenKind::Continue,
            "true" => TokenKind::True,
            "false" => TokenKind::False,
            "nil" => TokenKind::Nil,
            _ => TokenKind::Ident(word),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn kinds(text: &str) -> Vec<TokenKind> {
        let mut diags = Vec::new();
        let tokens = tokenize("T", text, &mut diags);
        assert!(diags.is_empty(), "unexpected diagnostics: {diags:?}");
        tokens.into_iter().map(|t| t.kind).collect()
    }

    #[test]
    fn test_operators_and_keywords() {
        assert_eq!(
            kinds("fn f(a) { return a <= 1_000 && !b || c != \"x\\n\"; } 0..n"),
            vec![
                TokenKind::Fn,
                TokenKind::Ident("f".into()),
                TokenKind::LParen,
                TokenKind::Ident("a".into()),
                TokenKind::RParen,
                TokenKind::LBrace,
                TokenKind::Return,
                TokenKind::Ident("a".into()),
                TokenKind::Le,
                TokenKind::Int(1000),
                TokenKind::AndAnd,
                TokenKind::Bang,
                TokenKind::Ident("b".into()),
                TokenKind::OrOr,
                TokenKind::Ident("c".into()),
                TokenKind::NotEq,
                TokenKind::Str("x\n".into()),
                TokenKind::Semicolon,
                TokenKind::RBrace,
                TokenKind::Int(0),
                TokenKind::DotDot,
                TokenKind::Ident("n".into()),
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn test_comments_and_positions() {
        let mut diags = Vec::new();
        let tokens = tokenize("T", "// line\n/* block\n */ let x", &mut diags);
        assert!(diags.is_empty());
        assert_eq!(tokens[0].kind, TokenKind::Let);
        assert_eq!((tokens[0].line, tokens[0].column), (3, 5));
        assert_eq!((tokens[1].line, tokens[1].column), (3, 9));
    }

    #[test]
    fn test_lexical_errors_are_collected() {
        let mut diags = Vec::new();
        let tokens = tokenize("T", "let @ = \"open\n# 99999999999999999999", &mut diags);
        let messages: Vec<_> = diags.iter().map(|d| d.message.as_str()).collect();
        assert_eq!(
            messages,
            vec![
                "unexpected character '@'",
                "unterminated string literal",
                "unexpected character '#'",
                "integer literal 99999999999999999999 is out of range",
            ]
        );
        assert_eq!(tokens.last().unwrap().kind, TokenKind::Eof);
    }
}
