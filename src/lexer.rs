//! Tokenizer for the C subset: keywords, identifiers, integer/char/string
//! literals with escapes, and punctuation, terminated by `Eof`.

use crate::error::LexError;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Keyword {
    Int,
    Char,
    Unsigned,
    Void,
    If,
    Else,
    While,
    For,
    Return,
    Struct,
    Switch,
    Case,
    Default,
    Break,
    Continue,
    Asm,
    Volatile,
    Const,
    Static,
    Extern,
}

impl Keyword {
    fn from_str(s: &str) -> Option<Keyword> {
        Some(match s {
            "int" => Keyword::Int,
            "char" => Keyword::Char,
            "unsigned" => Keyword::Unsigned,
            "void" => Keyword::Void,
            "if" => Keyword::If,
            "else" => Keyword::Else,
            "while" => Keyword::While,
            "for" => Keyword::For,
            "return" => Keyword::Return,
            "struct" => Keyword::Struct,
            "switch" => Keyword::Switch,
            "case" => Keyword::Case,
            "default" => Keyword::Default,
            "break" => Keyword::Break,
            "continue" => Keyword::Continue,
            "asm" => Keyword::Asm,
            "volatile" => Keyword::Volatile,
            "const" => Keyword::Const,
            "static" => Keyword::Static,
            "extern" => Keyword::Extern,
            _ => return None,
        })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Punct {
    LParen,
    RParen,
    LBrace,
    RBrace,
    LBracket,
    RBracket,
    Semicolon,
    Comma,
    Dot,
    Arrow,
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
    Assign,
    PlusAssign,
    MinusAssign,
    StarAssign,
    SlashAssign,
    EqEq,
    Ne,
    Lt,
    Gt,
    Le,
    Ge,
    AndAnd,
    OrOr,
    Not,
    Amp,
    Pipe,
    Caret,
    Tilde,
    Shl,
    Shr,
    PlusPlus,
    MinusMinus,
    Colon,
}

#[derive(Clone, Debug, PartialEq)]
pub enum TokenKind {
    IntLiteral(i64),
    UnsignedLiteral(u64),
    CharLiteral(u8),
    StringLiteral(String),
    Identifier(String),
    Keyword(Keyword),
    Punct(Punct),
    Eof,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Token {
    pub kind: TokenKind,
    pub lexeme: String,
    pub line: usize,
}

pub struct Lexer {
    chars: Vec<char>,
    pos: usize,
    line: usize,
}

impl Lexer {
    pub fn new(src: &str) -> Self {
        Lexer {
            chars: src.chars().collect(),
            pos: 0,
            line: 1,
        }
    }

    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn peek_at(&self, offset: usize) -> Option<char> {
        self.chars.get(self.pos + offset).copied()
    }

    fn advance(&mut self) -> Option<char> {
        let c = self.peek()?;
        self.pos += 1;
        if c == '\n' {
            self.line += 1;
        }
        Some(c)
    }

    pub fn tokenize(mut self) -> Result<Vec<Token>, LexError> {
        let mut tokens = Vec::new();
        loop {
            self.skip_whitespace_and_comments()?;
            let line = self.line;
            let Some(c) = self.peek() else {
                tokens.push(Token {
                    kind: TokenKind::Eof,
                    lexeme: String::new(),
                    line,
                });
                break;
            };

            if c.is_ascii_digit() {
                tokens.push(self.lex_number(line)?);
            } else if c.is_alphabetic() || c == '_' {
                tokens.push(self.lex_identifier(line));
            } else if c == '"' {
                tokens.push(self.lex_string(line)?);
            } else if c == '\'' {
                tokens.push(self.lex_char(line)?);
            } else {
                tokens.push(self.lex_punct(line)?);
            }
        }
        Ok(tokens)
    }

    fn skip_whitespace_and_comments(&mut self) -> Result<(), LexError> {
        loop {
            match self.peek() {
                Some(c) if c.is_whitespace() => {
                    self.advance();
                }
                Some('/') if self.peek_at(1) == Some('/') => {
                    while let Some(c) = self.peek() {
                        if c == '\n' {
                            break;
                        }
                        self.advance();
                    }
                }
                Some('/') if self.peek_at(1) == Some('*') => {
                    let start_line = self.line;
                    self.advance();
                    self.advance();
                    let mut closed = false;
                    while let Some(c) = self.peek() {
                        if c == '*' && self.peek_at(1) == Some('/') {
                            self.advance();
                            self.advance();
                            closed = true;
                            break;
                        }
                        self.advance();
                    }
                    if !closed {
                        return Err(LexError::UnterminatedComment { line: start_line });
                    }
                }
                _ => break,
            }
        }
        Ok(())
    }

    fn lex_number(&mut self, line: usize) -> Result<Token, LexError> {
        let start = self.pos;
        if self.peek() == Some('0') && matches!(self.peek_at(1), Some('x') | Some('X')) {
            self.advance();
            self.advance();
            let hex_start = self.pos;
            while self.peek().map(|c| c.is_ascii_hexdigit()).unwrap_or(false) {
                self.advance();
            }
            let hex_text: String = self.chars[hex_start..self.pos].iter().collect();
            let value = u64::from_str_radix(&hex_text, 16).map_err(|_| LexError::InvalidNumber {
                line,
                text: hex_text.clone(),
            })?;
            let unsigned = self.consume_unsigned_suffix();
            let lexeme: String = self.chars[start..self.pos].iter().collect();
            return Ok(Token {
                kind: if unsigned {
                    TokenKind::UnsignedLiteral(value)
                } else {
                    TokenKind::IntLiteral(value as i64)
                },
                lexeme,
                line,
            });
        }
        while self.peek().map(|c| c.is_ascii_digit()).unwrap_or(false) {
            self.advance();
        }
        let digits: String = self.chars[start..self.pos].iter().collect();
        let value: u64 = digits.parse().map_err(|_| LexError::InvalidNumber {
            line,
            text: digits.clone(),
        })?;
        let unsigned = self.consume_unsigned_suffix();
        let lexeme: String = self.chars[start..self.pos].iter().collect();
        Ok(Token {
            kind: if unsigned {
                TokenKind::UnsignedLiteral(value)
            } else {
                TokenKind::IntLiteral(value as i64)
            },
            lexeme,
            line,
        })
    }

    fn consume_unsigned_suffix(&mut self) -> bool {
        if matches!(self.peek(), Some('u') | Some('U')) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn lex_identifier(&mut self, line: usize) -> Token {
        let start = self.pos;
        while self.peek().map(|c| c.is_alphanumeric() || c == '_').unwrap_or(false) {
            self.advance();
        }
        let text: String = self.chars[start..self.pos].iter().collect();
        let kind = match Keyword::from_str(&text) {
            Some(k) => TokenKind::Keyword(k),
            None => TokenKind::Identifier(text.clone()),
        };
        Token {
            kind,
            lexeme: text,
            line,
        }
    }

    fn read_escape(&mut self, line: usize) -> Result<u8, LexError> {
        match self.advance() {
            Some('n') => Ok(b'\n'),
            Some('r') => Ok(b'\r'),
            Some('t') => Ok(b'\t'),
            Some('0') => Ok(0),
            Some('\\') => Ok(b'\\'),
            Some('\'') => Ok(b'\''),
            Some('"') => Ok(b'"'),
            Some(other) => Ok(other as u8),
            None => Err(LexError::UnterminatedChar { line }),
        }
    }

    fn lex_string(&mut self, line: usize) -> Result<Token, LexError> {
        self.advance(); // opening quote
        let mut value = String::new();
        loop {
            match self.peek() {
                None => return Err(LexError::UnterminatedString { line }),
                Some('"') => {
                    self.advance();
                    break;
                }
                Some('\\') => {
                    self.advance();
                    value.push(self.read_escape(line)? as char);
                }
                Some(c) => {
                    value.push(c);
                    self.advance();
                }
            }
        }
        Ok(Token {
            lexeme: value.clone(),
            kind: TokenKind::StringLiteral(value),
            line,
        })
    }

    fn lex_char(&mut self, line: usize) -> Result<Token, LexError> {
        self.advance(); // opening quote
        let value = match self.peek() {
            None => return Err(LexError::UnterminatedChar { line }),
            Some('\\') => {
                self.advance();
                self.read_escape(line)?
            }
            Some(c) => {
                self.advance();
                c as u8
            }
        };
        if self.peek() != Some('\'') {
            return Err(LexError::UnterminatedChar { line });
        }
        self.advance();
        Ok(Token {
            lexeme: (value as char).to_string(),
            kind: TokenKind::CharLiteral(value),
            line,
        })
    }

    fn lex_punct(&mut self, line: usize) -> Result<Token, LexError> {
        let two = |a: char, b: char| -> bool { self.peek() == Some(a) && self.peek_at(1) == Some(b) };
        macro_rules! two_char {
            ($a:expr, $b:expr, $kind:expr) => {
                if two($a, $b) {
                    self.advance();
                    self.advance();
                    return Ok(Token {
                        kind: $kind,
                        lexeme: format!("{}{}", $a, $b),
                        line,
                    });
                }
            };
        }
        two_char!('=', '=', TokenKind::Punct(Punct::EqEq));
        two_char!('!', '=', TokenKind::Punct(Punct::Ne));
        two_char!('<', '=', TokenKind::Punct(Punct::Le));
        two_char!('>', '=', TokenKind::Punct(Punct::Ge));
        two_char!('&', '&', TokenKind::Punct(Punct::AndAnd));
        two_char!('|', '|', TokenKind::Punct(Punct::OrOr));
        two_char!('<', '<', TokenKind::Punct(Punct::Shl));
        two_char!('>', '>', TokenKind::Punct(Punct::Shr));
        two_char!('+', '+', TokenKind::Punct(Punct::PlusPlus));
        two_char!('-', '-', TokenKind::Punct(Punct::MinusMinus));
        two_char!('+', '=', TokenKind::Punct(Punct::PlusAssign));
        two_char!('-', '=', TokenKind::Punct(Punct::MinusAssign));
        two_char!('*', '=', TokenKind::Punct(Punct::StarAssign));
        two_char!('/', '=', TokenKind::Punct(Punct::SlashAssign));
        two_char!('-', '>', TokenKind::Punct(Punct::Arrow));

        let c = self.advance().unwrap();
        let kind = match c {
            '(' => Punct::LParen,
            ')' => Punct::RParen,
            '{' => Punct::LBrace,
            '}' => Punct::RBrace,
            '[' => Punct::LBracket,
            ']' => Punct::RBracket,
            ';' => Punct::Semicolon,
            ',' => Punct::Comma,
            ':' => Punct::Colon,
            '.' => Punct::Dot,
            '+' => Punct::Plus,
            '-' => Punct::Minus,
            '*' => Punct::Star,
            '/' => Punct::Slash,
            '%' => Punct::Percent,
            '=' => Punct::Assign,
            '<' => Punct::Lt,
            '>' => Punct::Gt,
            '!' => Punct::Not,
            '&' => Punct::Amp,
            '|' => Punct::Pipe,
            '^' => Punct::Caret,
            '~' => Punct::Tilde,
            other => return Err(LexError::UnexpectedChar { line, ch: other }),
        };
        Ok(Token {
            kind: TokenKind::Punct(kind),
            lexeme: c.to_string(),
            line,
        })
    }
}

/// Convenience wrapper tokenizing a whole source string.
pub fn tokenize(src: &str) -> Result<Vec<Token>, LexError> {
    Lexer::new(src).tokenize()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unsigned_suffix_produces_distinct_token() {
        let tokens = tokenize("10u").unwrap();
        assert_eq!(tokens[0].kind, TokenKind::UnsignedLiteral(10));
    }

    #[test]
    fn hex_literal_parses() {
        let tokens = tokenize("0xFFF6").unwrap();
        assert_eq!(tokens[0].kind, TokenKind::IntLiteral(0xFFF6));
    }

    #[test]
    fn keyword_table_covers_spec_keywords() {
        let src = "int char unsigned void if else while for return struct switch case default break continue asm volatile const static extern";
        let tokens = tokenize(src).unwrap();
        assert_eq!(tokens.len(), 21); // 20 keywords + Eof
        assert!(matches!(tokens[0].kind, TokenKind::Keyword(Keyword::Int)));
    }

    #[test]
    fn unterminated_block_comment_is_an_error() {
        let err = tokenize("/* never closes").unwrap_err();
        assert!(matches!(err, LexError::UnterminatedComment { .. }));
    }

    #[test]
    fn string_literal_handles_escapes() {
        let tokens = tokenize("\"a\\nb\"").unwrap();
        assert_eq!(tokens[0].kind, TokenKind::StringLiteral("a\nb".to_string()));
    }

    #[test]
    fn line_spanning_comment_skips_correctly() {
        let src = "int x; // comment\nint y;\n";
        let tokens = tokenize(src).unwrap();
        let y_line = tokens.iter().find(|t| t.lexeme == "y").unwrap().line;
        assert_eq!(y_line, 2);
    }
}
