//! 규칙 컴파일러 -- SQL 조건식을 [`ConditionNode`] 트리로 변환합니다.
//!
//! 조건식만 주어지거나 `SELECT ... FROM ... WHERE <조건식>` 전체 문장이 주어질 수
//! 있습니다. 지원하지 않는 구문은 모두 컴파일 에러이며 규칙은 등록되지 않습니다.
//!
//! # 문법
//! ```text
//! statement := [SELECT projection FROM table WHERE] or [';']
//! or        := and (OR and)*
//! and       := primary (AND primary)*
//! primary   := '(' or ')'
//!            | column op literal
//!            | column [NOT] IN '(' literal (',' literal)* ')'
//!            | column [NOT] LIKE string
//! ```

use super::condition::{CompareOp, ConditionNode, Literal, LikePattern};
use super::lexer::{Token, TokenKind, tokenize};
use super::types::{CompiledRule, RuleDefinition};
use crate::error::CepError;

/// 조건식 텍스트 최대 크기
pub const MAX_PREDICATE_BYTES: usize = 64 * 1024;
/// 괄호 최대 중첩 깊이
pub const MAX_NESTING_DEPTH: usize = 64;

/// 컬럼 이름으로 쓸 수 없는 키워드
const RESERVED: &[&str] = &["AND", "OR", "NOT", "IN", "LIKE", "SELECT", "FROM", "WHERE"];
/// WHERE 뒤에 올 수 있지만 지원하지 않는 절
const UNSUPPORTED_CLAUSES: &[&str] = &[
    "GROUP", "ORDER", "HAVING", "LIMIT", "OFFSET", "UNION", "JOIN", "WINDOW",
];

/// 조건식 텍스트를 조건 트리로 컴파일합니다.
///
/// # Errors
/// 구문 오류, 지원하지 않는 구문, 크기/깊이 제한 초과 시 [`CepError::Compile`],
/// LIKE 패턴이 유효한 정규식으로 바뀌지 않으면 [`CepError::Regex`]를 반환합니다.
pub fn compile_predicate(text: &str) -> Result<ConditionNode, CepError> {
    if text.len() > MAX_PREDICATE_BYTES {
        return Err(CepError::compile(
            MAX_PREDICATE_BYTES,
            format!("predicate exceeds {MAX_PREDICATE_BYTES} bytes"),
        ));
    }

    let tokens = tokenize(text)?;
    let mut parser = Parser {
        tokens: &tokens,
        pos: 0,
        depth: 0,
        end: text.len(),
    };
    parser.statement()
}

/// 규칙 정의를 컴파일합니다.
///
/// 이름이 비어 있으면 규칙 ID를 이름으로 사용합니다.
pub fn compile_rule(rule_id: &str, definition: &RuleDefinition) -> Result<CompiledRule, CepError> {
    definition.validate(rule_id)?;
    let condition = compile_predicate(&definition.sql)?;

    let name = if definition.name.trim().is_empty() {
        rule_id.to_owned()
    } else {
        definition.name.clone()
    };

    Ok(CompiledRule {
        id: rule_id.to_owned(),
        name,
        severity: definition.severity,
        description: definition.description.clone(),
        enabled: definition.enabled,
        sql: definition.sql.clone(),
        condition,
    })
}

struct Parser<'a> {
    tokens: &'a [Token],
    pos: usize,
    depth: usize,
    end: usize,
}

impl<'a> Parser<'a> {
    fn statement(&mut self) -> Result<ConditionNode, CepError> {
        if self.peek_keyword("SELECT") {
            self.select_prefix()?;
        }

        if self.peek().is_none() {
            return Err(CepError::compile(self.end, "empty predicate"));
        }

        let node = self.or_expr()?;

        if let Some(token) = self.peek()
            && token.kind == TokenKind::Semicolon
        {
            self.pos += 1;
        }

        match self.peek() {
            None => Ok(node),
            Some(token) => Err(self.trailing_error(token)),
        }
    }

    /// `SELECT projection FROM table WHERE` 를 소비합니다.
    fn select_prefix(&mut self) -> Result<(), CepError> {
        self.pos += 1;

        // projection: 괄호 밖의 FROM까지 건너뜀
        let mut parens = 0usize;
        loop {
            let Some(token) = self.peek() else {
                return Err(CepError::compile(self.end, "SELECT without FROM"));
            };
            match token.kind {
                TokenKind::LParen => parens += 1,
                TokenKind::RParen => parens = parens.saturating_sub(1),
                _ if parens == 0 && token.is_keyword("FROM") => break,
                _ => {}
            }
            self.pos += 1;
        }
        self.pos += 1;

        // table: ident ('.' ident)* [AS] [alias]
        self.column_name()
            .map_err(|e| retarget(e, "expected table name after FROM"))?;
        if self.peek_keyword("AS") {
            self.pos += 1;
        }
        if let Some(token) = self.peek()
            && matches!(token.kind, TokenKind::Ident(_) | TokenKind::QuotedIdent(_))
            && !token.is_keyword("WHERE")
            && !is_clause_keyword(token)
        {
            self.pos += 1;
        }

        match self.peek() {
            Some(token) if token.is_keyword("WHERE") => {
                self.pos += 1;
                Ok(())
            }
            None => Err(CepError::compile(self.end, "SELECT statement has no WHERE clause")),
            Some(token) => Err(self.trailing_error(token)),
        }
    }

    fn or_expr(&mut self) -> Result<ConditionNode, CepError> {
        let mut operands = vec![self.and_expr()?];
        while self.peek_keyword("OR") {
            self.pos += 1;
            operands.push(self.and_expr()?);
        }
        Ok(fold_balanced(operands, ConditionNode::or))
    }

    fn and_expr(&mut self) -> Result<ConditionNode, CepError> {
        let mut operands = vec![self.primary()?];
        while self.peek_keyword("AND") {
            self.pos += 1;
            operands.push(self.primary()?);
        }
        Ok(fold_balanced(operands, ConditionNode::and))
    }

    fn primary(&mut self) -> Result<ConditionNode, CepError> {
        let Some(token) = self.peek() else {
            return Err(CepError::compile(self.end, "unexpected end of predicate"));
        };

        if token.kind == TokenKind::LParen {
            if self.depth >= MAX_NESTING_DEPTH {
                return Err(CepError::compile(
                    token.offset,
                    format!("nesting deeper than {MAX_NESTING_DEPTH}"),
                ));
            }
            self.pos += 1;
            self.depth += 1;
            let inner = self.or_expr()?;
            self.expect(TokenKind::RParen, "expected ')'")?;
            self.depth -= 1;
            return Ok(inner);
        }

        if token.is_keyword("NOT") {
            return Err(CepError::compile(
                token.offset,
                "NOT is only supported as NOT IN / NOT LIKE",
            ));
        }

        let field = self.column_name()?;
        self.condition_for(field)
    }

    fn condition_for(&mut self, field: String) -> Result<ConditionNode, CepError> {
        let Some(token) = self.peek() else {
            return Err(CepError::compile(self.end, format!("expected operator after '{field}'")));
        };
        let offset = token.offset;

        let op = match token.kind {
            TokenKind::Eq => Some(CompareOp::Eq),
            TokenKind::Ne => Some(CompareOp::Ne),
            TokenKind::Gt => Some(CompareOp::Gt),
            TokenKind::Ge => Some(CompareOp::Ge),
            TokenKind::Lt => Some(CompareOp::Lt),
            TokenKind::Le => Some(CompareOp::Le),
            _ => None,
        };
        if let Some(op) = op {
            self.pos += 1;
            let literal = self.literal()?;
            return Ok(ConditionNode::Comparison { field, op, literal });
        }

        let negated = token.is_keyword("NOT");
        if negated {
            self.pos += 1;
        }

        if self.peek_keyword("IN") {
            self.pos += 1;
            let values = self.literal_list()?;
            return Ok(ConditionNode::SetMembership {
                field,
                values,
                negated,
            });
        }

        if self.peek_keyword("LIKE") {
            self.pos += 1;
            let pattern_offset = self.peek().map_or(self.end, |t| t.offset);
            let pattern = match self.literal()? {
                Literal::String(s) => s,
                _ => {
                    return Err(CepError::compile(
                        pattern_offset,
                        "LIKE pattern must be a string literal",
                    ));
                }
            };
            return Ok(ConditionNode::PatternMatch {
                field,
                pattern: LikePattern::compile(&pattern)?,
                negated,
            });
        }

        let found = self.peek().map_or(self.end, |t| t.offset);
        let reason = if negated {
            "expected IN or LIKE after NOT".to_owned()
        } else if token.is_keyword("IS") || token.is_keyword("BETWEEN") {
            format!("unsupported operator after '{field}'")
        } else {
            format!("expected operator after '{field}'")
        };
        Err(CepError::compile(if negated { found } else { offset }, reason))
    }

    /// 컬럼 참조를 읽습니다. 한정 이름(`e.userId`)은 마지막 구간만 사용합니다.
    fn column_name(&mut self) -> Result<String, CepError> {
        let mut name = self.identifier()?;
        while let Some(token) = self.peek()
            && token.kind == TokenKind::Dot
        {
            self.pos += 1;
            name = self.identifier()?;
        }
        Ok(name)
    }

    fn identifier(&mut self) -> Result<String, CepError> {
        let Some(token) = self.peek() else {
            return Err(CepError::compile(self.end, "expected column name"));
        };
        match &token.kind {
            TokenKind::Ident(name) => {
                if RESERVED.iter().any(|kw| name.eq_ignore_ascii_case(kw)) {
                    return Err(CepError::compile(
                        token.offset,
                        format!("unexpected keyword '{name}'"),
                    ));
                }
                self.pos += 1;
                Ok(name.clone())
            }
            TokenKind::QuotedIdent(name) => {
                self.pos += 1;
                Ok(name.clone())
            }
            _ => Err(CepError::compile(token.offset, "expected column name")),
        }
    }

    fn literal(&mut self) -> Result<Literal, CepError> {
        let Some(token) = self.peek() else {
            return Err(CepError::compile(self.end, "expected literal"));
        };
        let literal = match &token.kind {
            TokenKind::Str(s) => Literal::String(s.clone()),
            TokenKind::Integer(i) => Literal::Integer(*i),
            TokenKind::Float(v) => Literal::Float(*v),
            TokenKind::Ident(word) if word.eq_ignore_ascii_case("NULL") => {
                return Err(CepError::compile(token.offset, "NULL literals are not supported"));
            }
            _ => return Err(CepError::compile(token.offset, "expected literal")),
        };
        self.pos += 1;
        Ok(literal)
    }

    fn literal_list(&mut self) -> Result<Vec<Literal>, CepError> {
        self.expect(TokenKind::LParen, "expected '(' after IN")?;
        if let Some(token) = self.peek()
            && token.kind == TokenKind::RParen
        {
            return Err(CepError::compile(token.offset, "IN list must not be empty"));
        }

        let mut values = vec![self.literal()?];
        loop {
            match self.peek() {
                Some(token) if token.kind == TokenKind::Comma => {
                    self.pos += 1;
                    values.push(self.literal()?);
                }
                Some(token) if token.kind == TokenKind::RParen => {
                    self.pos += 1;
                    return Ok(values);
                }
                Some(token) => {
                    return Err(CepError::compile(token.offset, "expected ',' or ')' in IN list"));
                }
                None => return Err(CepError::compile(self.end, "unterminated IN list")),
            }
        }
    }

    fn expect(&mut self, kind: TokenKind, reason: &str) -> Result<(), CepError> {
        match self.peek() {
            Some(token) if token.kind == kind => {
                self.pos += 1;
                Ok(())
            }
            Some(token) => Err(CepError::compile(token.offset, reason)),
            None => Err(CepError::compile(self.end, reason)),
        }
    }

    fn trailing_error(&self, token: &Token) -> CepError {
        if is_clause_keyword(token) {
            CepError::compile(token.offset, "unsupported clause after WHERE predicate")
        } else if token.kind == TokenKind::RParen {
            CepError::compile(token.offset, "unbalanced ')'")
        } else {
            CepError::compile(token.offset, "unexpected trailing input")
        }
    }

    fn peek(&self) -> Option<&'a Token> {
        self.tokens.get(self.pos)
    }

    fn peek_keyword(&self, keyword: &str) -> bool {
        self.peek().is_some_and(|t| t.is_keyword(keyword))
    }
}

/// 컴파일 에러의 위치는 유지하고 사유만 바꿉니다.
fn retarget(err: CepError, reason: &str) -> CepError {
    match err {
        CepError::Compile { offset, .. } => CepError::compile(offset, reason),
        other => other,
    }
}

fn is_clause_keyword(token: &Token) -> bool {
    UNSUPPORTED_CLAUSES.iter().any(|kw| token.is_keyword(kw))
}

/// 피연산자 목록을 왼쪽부터의 순서를 유지한 균형 트리로 결합합니다.
///
/// 긴 AND/OR 체인이 깊은 재귀를 만들지 않도록 합니다.
fn fold_balanced(
    mut operands: Vec<ConditionNode>,
    combine: fn(ConditionNode, ConditionNode) -> ConditionNode,
) -> ConditionNode {
    if operands.len() == 1
        && let Some(only) = operands.pop()
    {
        return only;
    }
    let right = operands.split_off(operands.len() / 2);
    combine(fold_balanced(operands, combine), fold_balanced(right, combine))
}
