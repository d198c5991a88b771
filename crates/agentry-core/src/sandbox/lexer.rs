//! Tokenizer for the function language.

use super::error::{SandboxError, SandboxResult};

#[derive(Debug, Clone, PartialEq)]
pub enum Token {
    Number(f64),
    Str(String),
    Ident(String),
    // keywords
    Let,
    If,
    Else,
    While,
    For,
    In,
    Return,
    Break,
    Continue,
    Import,
    True,
    False,
    Null,
    // punctuation
    LParen,
    RParen,
    LBrace,
    RBrace,
    LBracket,
    RBracket,
    Comma,
    Colon,
    Semicolon,
    Dot,
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
    Bang,
    Assign,
    Eq,
    NotEq,
    Lt,
    LtEq,
    Gt,
    GtEq,
    AndAnd,
    OrOr,
    Eof,
}

/// A token and the line it starts on.
#[derive(Debug, Clone, PartialEq)]
pub struct Spanned {
    pub token: Token,
    pub line: usize,
}

fn keyword(word: &str) -> Option<Token> {
    Some(match word {
        "let" => Token::Let,
        "if" => Token::If,
        "else" => Token::Else,
        "while" => Token::While,
        "for" => Token::For,
        "in" => Token::In,
        "return" => Token::Return,
        "break" => Token::Break,
        "continue" => Token::Continue,
        "import" => Token::Import,
        "true" => Token::True,
        "false" => Token::False,
        "null" => Token::Null,
        _ => return None,
    })
}

pub fn tokenize(source: &str) -> SandboxResult<Vec<Spanned>> {
    let chars: Vec<char> = source.chars().collect();
    let mut tokens = Vec::new();
    let mut line = 1;
    let mut i = 0;

    let syntax = |line: usize, message: String| SandboxError::Syntax { line, message };

    while i < chars.len() {
        let c = chars[i];
        match c {
            '\n' => {
                line += 1;
                i += 1;
            }
            c if c.is_whitespace() => i += 1,
            '/' if chars.get(i + 1) == Some(&'/') => {
                while i < chars.len() && chars[i] != '\n' {
                    i += 1;
                }
            }
            '0'..='9' => {
                let start = i;
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                    // `1.foo` is not a number continuation
                    if chars[i] == '.' && !chars.get(i + 1).is_some_and(|d| d.is_ascii_digit()) {
                        break;
                    }
                    i += 1;
                }
                let text: String = chars[start..i].iter().collect();
                let value = text
                    .parse::<f64>()
                    .map_err(|_| syntax(line, format!("invalid number '{text}'")))?;
                tokens.push(Spanned {
                    token: Token::Number(value),
                    line,
                });
            }
            '"' | '\'' => {
                let quote = c;
                let start_line = line;
                i += 1;
                let mut text = String::new();
                loop {
                    let Some(&ch) = chars.get(i) else {
                        return Err(syntax(start_line, "unterminated string".to_string()));
                    };
                    i += 1;
                    match ch {
                        ch if ch == quote => break,
                        '\\' => {
                            let escaped = chars
                                .get(i)
                                .ok_or_else(|| syntax(line, "unterminated escape".to_string()))?;
                            i += 1;
                            text.push(match escaped {
                                'n' => '\n',
                                't' => '\t',
                                'r' => '\r',
                                '0' => '\0',
                                other => *other,
                            });
                        }
                        '\n' => {
                            line += 1;
                            text.push('\n');
                        }
                        other => text.push(other),
                    }
                }
                tokens.push(Spanned {
                    token: Token::Str(text),
                    line: start_line,
                });
            }
            c if c.is_alphabetic() || c == '_' => {
                let start = i;
                while i < chars.len() && (chars[i].is_alphanumeric() || chars[i] == '_') {
                    i += 1;
                }
                let word: String = chars[start..i].iter().collect();
                let token = keyword(&word).unwrap_or(Token::Ident(word));
                tokens.push(Spanned { token, line });
            }
            _ => {
                let next = chars.get(i + 1).copied();
                let (token, width) = match (c, next) {
                    ('=', Some('=')) => (Token::Eq, 2),
                    ('!', Some('=')) => (Token::NotEq, 2),
                    ('<', Some('=')) => (Token::LtEq, 2),
                    ('>', Some('=')) => (Token::GtEq, 2),
                    ('&', Some('&')) => (Token::AndAnd, 2),
                    ('|', Some('|')) => (Token::OrOr, 2),
                    ('(', _) => (Token::LParen, 1),
                    (')', _) => (Token::RParen, 1),
                    ('{', _) => (Token::LBrace, 1),
                    ('}', _) => (Token::RBrace, 1),
                    ('[', _) => (Token::LBracket, 1),
                    (']', _) => (Token::RBracket, 1),
                    (',', _) => (Token::Comma, 1),
                    (':', _) => (Token::Colon, 1),
                    (';', _) => (Token::Semicolon, 1),
                    ('.', _) => (Token::Dot, 1),
                    ('+', _) => (Token::Plus, 1),
                    ('-', _) => (Token::Minus, 1),
                    ('*', _) => (Token::Star, 1),
                    ('/', _) => (Token::Slash, 1),
                    ('%', _) => (Token::Percent, 1),
                    ('!', _) => (Token::Bang, 1),
                    ('=', _) => (Token::Assign, 1),
                    ('<', _) => (Token::Lt, 1),
                    ('>', _) => (Token::Gt, 1),
                    _ => return Err(syntax(line, format!("unexpected character '{c}'"))),
                };
                tokens.push(Spanned { token, line });
                i += width;
            }
        }
    }

    tokens.push(Spanned {
        token: Token::Eof,
        line,
    });
    Ok(tokens)
}
