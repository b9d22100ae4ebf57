//! Tokenizer for endpoint scripts

use super::ExecutionError;

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Token {
    Ident(String),
    Str(String),
    Num(f64),
    Dot,
    Comma,
    LParen,
    RParen,
    Plus,
    Assign,
    /// `;` or a newline
    Separator,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Spanned {
    pub token: Token,
    pub line: usize,
}

pub(crate) fn tokenize(source: &str) -> Result<Vec<Spanned>, ExecutionError> {
    let mut tokens = Vec::new();
    let mut chars = source.chars().peekable();
    let mut line = 1;

    while let Some(&c) = chars.peek() {
        let token = match c {
            '\n' => {
                chars.next();
                line += 1;
                Token::Separator
            }
            ';' => {
                chars.next();
                Token::Separator
            }
            c if c.is_whitespace() => {
                chars.next();
                continue;
            }
            '/' => {
                chars.next();
                if chars.peek() != Some(&'/') {
                    return Err(syntax(line, "unexpected '/'"));
                }
                while let Some(&c) = chars.peek() {
                    if c == '\n' {
                        break;
                    }
                    chars.next();
                }
                continue;
            }
            '.' => {
                chars.next();
                Token::Dot
            }
            ',' => {
                chars.next();
                Token::Comma
            }
            '(' => {
                chars.next();
                Token::LParen
            }
            ')' => {
                chars.next();
                Token::RParen
            }
            '+' => {
                chars.next();
                Token::Plus
            }
            '=' => {
                chars.next();
                Token::Assign
            }
            '"' | '\'' | '`' => {
                chars.next();
                let mut text = String::new();
                loop {
                    match chars.next() {
                        None => return Err(syntax(line, "unterminated string")),
                        Some(q) if q == c => break,
                        Some('\\') => match chars.next() {
                            Some('n') => text.push('\n'),
                            Some('t') => text.push('\t'),
                            Some(other) => text.push(other),
                            None => return Err(syntax(line, "unterminated string")),
                        },
                        Some('\n') => {
                            line += 1;
                            text.push('\n');
                        }
                        Some(other) => text.push(other),
                    }
                }
                Token::Str(text)
            }
            c if c.is_ascii_digit() => {
                let mut digits = String::new();
                while let Some(&d) = chars.peek() {
                    if d.is_ascii_digit() || d == '.' {
                        digits.push(d);
                        chars.next();
                    } else {
                        break;
                    }
                }
                let value = digits
                    .parse::<f64>()
                    .map_err(|_| syntax(line, &format!("invalid number '{}'", digits)))?;
                Token::Num(value)
            }
            c if c.is_alphabetic() || c == '_' || c == '$' => {
                let mut ident = String::new();
                while let Some(&d) = chars.peek() {
                    if d.is_alphanumeric() || d == '_' || d == '$' {
                        ident.push(d);
                        chars.next();
                    } else {
                        break;
                    }
                }
                Token::Ident(ident)
            }
            other => return Err(syntax(line, &format!("unexpected character '{}'", other))),
        };
        tokens.push(Spanned { token, line });
    }

    Ok(tokens)
}

pub(crate) fn syntax(line: usize, message: &str) -> ExecutionError {
    ExecutionError::new(format!("SyntaxError (line {}): {}", line, message))
}
