//! 조건 트리 -- 컴파일된 규칙 조건식의 닫힌 변형 집합
//!
//! 평가기는 [`ConditionNode`]의 모든 변형을 빠짐없이 `match`로 처리합니다.
//! 트리는 한 번 만들어지면 변경되지 않습니다.

use std::borrow::Cow;
use std::fmt;

use regex::Regex;

use crate::error::CepError;

/// 조건 트리 노드
#[derive(Debug, Clone, PartialEq)]
pub enum ConditionNode {
    /// `left AND right`
    Conjunction(Box<ConditionNode>, Box<ConditionNode>),
    /// `left OR right`
    Disjunction(Box<ConditionNode>, Box<ConditionNode>),
    /// `field <op> literal`
    Comparison {
        /// 필드 이름 (별칭 포함)
        field: String,
        /// 비교 연산자
        op: CompareOp,
        /// 비교 대상 리터럴
        literal: Literal,
    },
    /// `field [NOT] IN (v1, v2, ...)`
    SetMembership {
        /// 필드 이름
        field: String,
        /// 후보 값 목록
        values: Vec<Literal>,
        /// `NOT IN` 여부
        negated: bool,
    },
    /// `field [NOT] LIKE 'pattern'`
    PatternMatch {
        /// 필드 이름
        field: String,
        /// 컴파일된 LIKE 패턴
        pattern: LikePattern,
        /// `NOT LIKE` 여부
        negated: bool,
    },
}

impl ConditionNode {
    /// 두 노드를 AND로 결합합니다.
    pub fn and(left: ConditionNode, right: ConditionNode) -> Self {
        Self::Conjunction(Box::new(left), Box::new(right))
    }

    /// 두 노드를 OR로 결합합니다.
    pub fn or(left: ConditionNode, right: ConditionNode) -> Self {
        Self::Disjunction(Box::new(left), Box::new(right))
    }

    /// 트리가 참조하는 필드 이름 목록 (중복 포함, 왼쪽부터)
    pub fn fields(&self) -> Vec<&str> {
        let mut out = Vec::new();
        self.collect_fields(&mut out);
        out
    }

    fn collect_fields<'a>(&'a self, out: &mut Vec<&'a str>) {
        match self {
            Self::Conjunction(l, r) | Self::Disjunction(l, r) => {
                l.collect_fields(out);
                r.collect_fields(out);
            }
            Self::Comparison { field, .. }
            | Self::SetMembership { field, .. }
            | Self::PatternMatch { field, .. } => out.push(field),
        }
    }
}

impl fmt::Display for ConditionNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Conjunction(l, r) => write!(f, "({l} AND {r})"),
            Self::Disjunction(l, r) => write!(f, "({l} OR {r})"),
            Self::Comparison { field, op, literal } => write!(f, "{field} {op} {literal}"),
            Self::SetMembership {
                field,
                values,
                negated,
            } => {
                write!(f, "{field} {}IN (", if *negated { "NOT " } else { "" })?;
                for (i, v) in values.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{v}")?;
                }
                f.write_str(")")
            }
            Self::PatternMatch {
                field,
                pattern,
                negated,
            } => write!(
                f,
                "{field} {}LIKE {}",
                if *negated { "NOT " } else { "" },
                Literal::String(pattern.source().to_owned())
            ),
        }
    }
}

/// 비교 연산자
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    /// `=`
    Eq,
    /// `!=` / `<>`
    Ne,
    /// `>`
    Gt,
    /// `>=`
    Ge,
    /// `<`
    Lt,
    /// `<=`
    Le,
}

impl CompareOp {
    /// 숫자 비교 연산자인지 여부
    pub fn is_numeric(self) -> bool {
        !matches!(self, Self::Eq | Self::Ne)
    }

    /// 연산자 표기
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Eq => "=",
            Self::Ne => "!=",
            Self::Gt => ">",
            Self::Ge => ">=",
            Self::Lt => "<",
            Self::Le => "<=",
        }
    }
}

impl fmt::Display for CompareOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 조건식 리터럴
#[derive(Debug, Clone, PartialEq)]
pub enum Literal {
    /// 작은따옴표 문자열
    String(String),
    /// 정수
    Integer(i64),
    /// 실수
    Float(f64),
}

impl Literal {
    /// 문자열 비교에 쓰이는 텍스트 표현
    ///
    /// 실수는 규칙 작성 도구가 저장하는 JVM 표기를 따릅니다.
    /// 소수부가 항상 있고 (`2.0` -> `"2.0"`), `1e-3 <= |v| < 1e7` 밖이면 지수 표기입니다
    /// (`1e7` -> `"1.0E7"`).
    pub fn as_text(&self) -> Cow<'_, str> {
        match self {
            Self::String(s) => Cow::Borrowed(s),
            Self::Integer(i) => Cow::Owned(i.to_string()),
            Self::Float(v) => Cow::Owned(float_text(*v)),
        }
    }

    /// 숫자 비교에 쓰이는 값. 숫자로 읽을 수 없는 문자열은 0입니다.
    pub fn as_number(&self) -> f64 {
        match self {
            Self::String(s) => s.trim().parse::<f64>().unwrap_or(0.0),
            Self::Integer(i) => *i as f64,
            Self::Float(v) => *v,
        }
    }
}

fn float_text(v: f64) -> String {
    if v.is_nan() {
        return "NaN".to_owned();
    }
    if v.is_infinite() {
        return if v > 0.0 { "Infinity" } else { "-Infinity" }.to_owned();
    }

    let magnitude = v.abs();
    if magnitude == 0.0 || (1e-3..1e7).contains(&magnitude) {
        let mut text = v.to_string();
        if !text.contains('.') {
            text.push_str(".0");
        }
        return text;
    }

    let sci = format!("{v:e}");
    let (mantissa, exponent) = sci.split_once('e').unwrap_or((sci.as_str(), "0"));
    if mantissa.contains('.') {
        format!("{mantissa}E{exponent}")
    } else {
        format!("{mantissa}.0E{exponent}")
    }
}

impl fmt::Display for Literal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::String(s) => write!(f, "'{}'", s.replace('\'', "''")),
            Self::Integer(i) => write!(f, "{i}"),
            Self::Float(v) => write!(f, "{v:?}"),
        }
    }
}

/// 컴파일된 LIKE 패턴
///
/// `%`는 임의 길이 문자열, `_`는 정확히 한 문자에 대응합니다.
/// 그 외 문자는 이스케이프하지 않으므로 `.` 등은 정규식 메타문자로 동작합니다.
/// 패턴은 값 전체에 매칭되어야 하며, `.`은 `\r`, `\n`에 매칭되지 않습니다.
#[derive(Debug, Clone)]
pub struct LikePattern {
    source: String,
    regex: Regex,
}

impl LikePattern {
    /// LIKE 패턴 텍스트를 컴파일합니다.
    pub fn compile(source: &str) -> Result<Self, CepError> {
        let body = source.replace('%', ".*").replace('_', ".");
        let regex = Regex::new(&format!("^(?R:{body})$"))?;
        Ok(Self {
            source: source.to_owned(),
            regex,
        })
    }

    /// 원본 패턴 텍스트
    pub fn source(&self) -> &str {
        &self.source
    }

    /// 값 전체가 패턴에 매칭되는지 검사합니다.
    pub fn is_match(&self, value: &str) -> bool {
        self.regex.is_match(value)
    }
}

impl PartialEq for LikePattern {
    fn eq(&self, other: &Self) -> bool {
        self.source == other.source
    }
}
