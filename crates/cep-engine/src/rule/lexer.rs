//! 조건식 토크나이저
//!
//! SQL 조건식 텍스트를 [`Token`] 목록으로 나눕니다. 각 토큰은 원문에서의
//! 바이트 오프셋을 함께 가지며, 컴파일 에러 위치 보고에 쓰입니다.

use crate::error::CepError;

/// 토큰 종류
#[derive(Debug, Clone, PartialEq)]
pub enum TokenKind {
    /// 식별자 또는 키워드 (키워드 판별은 파서가 대소문자 무시로 수행)
    Ident(String),
    /// 따옴표로 감싼 식별자 (`"col"`, `` `col` ``), 키워드로 해석되지 않음
    QuotedIdent(String),
    /// 작은따옴표 문자열 리터럴 (`''` 이스케이프 해제됨)
    Str(String),
    /// 정수 리터럴
    Integer(i64),
    /// 실수 리터럴
    Float(f64),
    /// `=`
    Eq,
    /// `!=` 또는 `<>`
    Ne,
    /// `>`
    Gt,
    /// `>=`
    Ge,
    /// `<`
    Lt,
    /// `<=`
    Le,
    /// `(`
    LParen,
    /// `)`
    RParen,
    /// `,`
    Comma,
    /// `.`
    Dot,
    /// `*`
    Star,
    /// `;`
    Semicolon,
}

/// 위치 정보를 가진 토큰
#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    /// 토큰 종류
    pub kind: TokenKind,
    /// 원문 바이트 오프셋
    pub offset: usize,
}

impl Token {
    /// 키워드(대소문자 무시)인지 확인합니다. 따옴표 식별자는 키워드가 아닙니다.
    pub fn is_keyword(&self, keyword: &str) -> bool {
        matches!(&self.kind, TokenKind::Ident(s) if s.eq_ignore_ascii_case(keyword))
    }
}

/// 조건식 텍스트를 토큰으로 분리합니다.
pub fn tokenize(input: &str) -> Result<Vec<Token>, CepError> {
    let bytes = input.as_bytes();
    let mut tokens = Vec::new();
    let mut pos = 0;

    while pos < bytes.len() {
        let c = bytes[pos];
        let start = pos;

        if c.is_ascii_whitespace() {
            pos += 1;
            continue;
        }

        let simple = match c {
            b'(' => Some(TokenKind::LParen),
            b')' => Some(TokenKind::RParen),
            b',' => Some(TokenKind::Comma),
            b'*' => Some(TokenKind::Star),
            b';' => Some(TokenKind::Semicolon),
            b'=' => Some(TokenKind::Eq),
            _ => None,
        };
        if let Some(kind) = simple {
            tokens.push(Token { kind, offset: start });
            pos += 1;
            continue;
        }

        let kind = match c {
            b'!' => {
                if bytes.get(pos + 1) == Some(&b'=') {
                    pos += 2;
                    TokenKind::Ne
                } else {
                    return Err(CepError::compile(start, "expected '=' after '!'"));
                }
            }
            b'<' => match bytes.get(pos + 1) {
                Some(b'=') => {
                    pos += 2;
                    TokenKind::Le
                }
                Some(b'>') => {
                    pos += 2;
                    TokenKind::Ne
                }
                _ => {
                    pos += 1;
                    TokenKind::Lt
                }
            },
            b'>' => {
                if bytes.get(pos + 1) == Some(&b'=') {
                    pos += 2;
                    TokenKind::Ge
                } else {
                    pos += 1;
                    TokenKind::Gt
                }
            }
            b'\'' => {
                let (value, next) = read_quoted(input, pos, '\'')?;
                pos = next;
                TokenKind::Str(value)
            }
            b'"' | b'`' => {
                let (value, next) = read_quoted(input, pos, c as char)?;
                pos = next;
                if value.is_empty() {
                    return Err(CepError::compile(start, "empty quoted identifier"));
                }
                TokenKind::QuotedIdent(value)
            }
            b'.' if !bytes.get(pos + 1).is_some_and(u8::is_ascii_digit) => {
                pos += 1;
                TokenKind::Dot
            }
            b'-' | b'.' | b'0'..=b'9' => {
                let (kind, next) = read_number(input, pos)?;
                pos = next;
                kind
            }
            c if c == b'_'
                || c.is_ascii_alphabetic()
                || (!c.is_ascii() && input[pos..].starts_with(char::is_alphabetic)) =>
            {
                let end = input[pos..]
                    .char_indices()
                    .find(|(_, ch)| !(ch.is_alphanumeric() || *ch == '_' || *ch == '$'))
                    .map_or(input.len(), |(i, _)| pos + i);
                let ident = input[pos..end].to_owned();
                pos = end;
                TokenKind::Ident(ident)
            }
            _ => {
                let ch = input[pos..].chars().next().unwrap_or('?');
                return Err(CepError::compile(start, format!("unexpected character '{ch}'")));
            }
        };

        tokens.push(Token {
            kind,
            offset: start,
        });
    }

    Ok(tokens)
}

/// 따옴표로 감싼 구간을 읽습니다. 같은 따옴표 두 개는 따옴표 한 개로 해석됩니다.
fn read_quoted(input: &str, start: usize, quote: char) -> Result<(String, usize), CepError> {
    let mut value = String::new();
    let mut chars = input[start + 1..].char_indices().peekable();

    while let Some((i, ch)) = chars.next() {
        if ch == quote {
            if let Some(&(_, next)) = chars.peek()
                && next == quote
            {
                value.push(quote);
                chars.next();
                continue;
            }
            return Ok((value, start + 1 + i + ch.len_utf8()));
        }
        value.push(ch);
    }

    Err(CepError::compile(start, format!("unterminated {quote}-quoted text")))
}

/// 숫자 리터럴을 읽습니다. `-` 접두, 소수점, 지수 표기를 허용합니다.
fn read_number(input: &str, start: usize) -> Result<(TokenKind, usize), CepError> {
    let bytes = input.as_bytes();
    let mut pos = start;
    if bytes[pos] == b'-' {
        pos += 1;
    }
    let digits_start = pos;
    let mut is_float = false;

    while pos < bytes.len() {
        match bytes[pos] {
            b'0'..=b'9' => pos += 1,
            b'.' if !is_float => {
                is_float = true;
                pos += 1;
            }
            b'e' | b'E' => {
                is_float = true;
                pos += 1;
                if matches!(bytes.get(pos), Some(b'+' | b'-')) {
                    pos += 1;
                }
            }
            _ => break,
        }
    }

    let text = &input[start..pos];
    if pos == digits_start || text == "-." || text == "." {
        return Err(CepError::compile(start, "expected a number"));
    }
    if bytes
        .get(pos)
        .is_some_and(|b| b.is_ascii_alphabetic() || *b == b'_')
    {
        return Err(CepError::compile(pos, format!("invalid number '{text}...'")));
    }

    let kind = if is_float {
        TokenKind::Float(
            text.parse::<f64>()
                .map_err(|e| CepError::compile(start, format!("invalid number '{text}': {e}")))?,
        )
    } else {
        TokenKind::Integer(
            text.parse::<i64>()
                .map_err(|e| CepError::compile(start, format!("invalid integer '{text}': {e}")))?,
        )
    };
    Ok((kind, pos))
}
