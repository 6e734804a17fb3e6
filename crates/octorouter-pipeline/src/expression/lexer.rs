//! Tokenizer for filter expressions.

use super::ExpressionError;

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Token {
    Identifier(String),
    /// `%name` or ``%`name` ``
    Variable(String),
    /// `$this`
    This,
    Str(String),
    Number(f64),
    OpenParen,
    CloseParen,
    OpenBracket,
    CloseBracket,
    OpenBrace,
    CloseBrace,
    Dot,
    Comma,
    Pipe,
    Eq,
    NotEq,
    Lt,
    Gt,
    Le,
    Ge,
    Minus,
    Eof,
}

pub(crate) struct Lexer<'a> {
    input: &'a str,
    chars: std::iter::Peekable<std::str::CharIndices<'a>>,
}

impl<'a> Lexer<'a> {
    pub(crate) fn new(input: &'a str) -> Self {
        Self {
            input,
            chars: input.char_indices().peekable(),
        }
    }

    fn skip_whitespace(&mut self) {
        while self.chars.next_if(|(_, c)| c.is_whitespace()).is_some() {}
    }

    fn error(&self, message: impl Into<String>) -> ExpressionError {
        ExpressionError::syntax(self.input, message)
    }

    /// Reads up to the closing `quote`, handling backslash escapes.
    fn read_quoted(&mut self, quote: char) -> Result<String, ExpressionError> {
        let mut value = String::new();
        while let Some((_, c)) = self.chars.next() {
            match c {
                '\\' => match self.chars.next() {
                    Some((_, 'n')) => value.push('\n'),
                    Some((_, 'r')) => value.push('\r'),
                    Some((_, 't')) => value.push('\t'),
                    Some((_, other)) => value.push(other),
                    None => break,
                },
                c if c == quote => return Ok(value),
                c => value.push(c),
            }
        }
        Err(self.error("unterminated string literal"))
    }

    fn read_word(&mut self, start: usize) -> &'a str {
        let mut end = self.input.len();
        while let Some(&(idx, c)) = self.chars.peek() {
            if c.is_alphanumeric() || c == '_' {
                self.chars.next();
            } else {
                end = idx;
                break;
            }
        }
        &self.input[start..end]
    }

    pub(crate) fn next_token(&mut self) -> Result<Token, ExpressionError> {
        self.skip_whitespace();

        let Some((start, ch)) = self.chars.next() else {
            return Ok(Token::Eof);
        };

        let token = match ch {
            '(' => Token::OpenParen,
            ')' => Token::CloseParen,
            '[' => Token::OpenBracket,
            ']' => Token::CloseBracket,
            '{' => Token::OpenBrace,
            '}' => Token::CloseBrace,
            '.' => Token::Dot,
            ',' => Token::Comma,
            '|' => Token::Pipe,
            '-' => Token::Minus,
            '=' => Token::Eq,
            '!' => {
                if self.chars.next_if(|(_, c)| *c == '=').is_none() {
                    return Err(self.error("expected '=' after '!'"));
                }
                Token::NotEq
            }
            '<' => {
                if self.chars.next_if(|(_, c)| *c == '=').is_some() {
                    Token::Le
                } else {
                    Token::Lt
                }
            }
            '>' => {
                if self.chars.next_if(|(_, c)| *c == '=').is_some() {
                    Token::Ge
                } else {
                    Token::Gt
                }
            }
            '\'' => Token::Str(self.read_quoted('\'')?),
            '`' => Token::Identifier(self.read_quoted('`')?),
            '%' => match self.chars.peek() {
                Some(&(_, '`')) => {
                    self.chars.next();
                    Token::Variable(self.read_quoted('`')?)
                }
                Some(&(idx, c)) if c.is_alphabetic() || c == '_' => {
                    self.chars.next();
                    Token::Variable(self.read_word(idx).to_string())
                }
                _ => return Err(self.error("expected variable name after '%'")),
            },
            '$' => {
                let word = self.read_word(start + 1);
                if word != "this" {
                    return Err(self.error(format!("unknown special variable '${word}'")));
                }
                Token::This
            }
            c if c.is_ascii_digit() => {
                let mut end = self.input.len();
                let mut seen_dot = false;
                while let Some(&(idx, c)) = self.chars.peek() {
                    if c.is_ascii_digit() {
                        self.chars.next();
                    } else if c == '.' && !seen_dot && self.digit_follows(idx) {
                        seen_dot = true;
                        self.chars.next();
                    } else {
                        end = idx;
                        break;
                    }
                }
                let text = &self.input[start..end];
                Token::Number(
                    text.parse()
                        .map_err(|_| self.error(format!("invalid number '{text}'")))?,
                )
            }
            c if c.is_alphabetic() || c == '_' => {
                Token::Identifier(self.read_word(start).to_string())
            }
            other => return Err(self.error(format!("unexpected character '{other}'"))),
        };
        Ok(token)
    }

    /// `1.5` is a number but `1.exists()` is not.
    fn digit_follows(&self, dot_idx: usize) -> bool {
        self.input[dot_idx + 1..]
            .chars()
            .next()
            .is_some_and(|c| c.is_ascii_digit())
    }
}
