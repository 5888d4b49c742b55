//! 조건 평가기 -- 조건 트리를 정규화된 이벤트에 대해 평가합니다.
//!
//! 평가는 고전적인 3값 논리가 아닙니다. 필드가 없을 때:
//!
//! | 조건 | 결과 |
//! |------|------|
//! | `=`, `IN`, `LIKE`, `NOT LIKE` | false |
//! | `!=`, `NOT IN` | true |
//! | `>`, `>=`, `<`, `<=` | 값을 0으로 보고 비교 |
//!
//! AND/OR은 왼쪽부터 단락 평가합니다. 평가는 실패하지 않습니다.

use super::condition::{CompareOp, ConditionNode, Literal};
use crate::normalizer::NormalizedEvent;

/// 조건 트리가 이벤트에 매칭되는지 평가합니다.
pub fn matches(node: &ConditionNode, event: &NormalizedEvent) -> bool {
    match node {
        ConditionNode::Conjunction(left, right) => matches(left, event) && matches(right, event),
        ConditionNode::Disjunction(left, right) => matches(left, event) || matches(right, event),
        ConditionNode::Comparison { field, op, literal } => compare(event, field, *op, literal),
        ConditionNode::SetMembership {
            field,
            values,
            negated,
        } => match event.resolve(field) {
            None => *negated,
            Some(actual) => values.iter().any(|v| v.as_text() == actual) != *negated,
        },
        ConditionNode::PatternMatch {
            field,
            pattern,
            negated,
        } => match event.resolve(field) {
            None => false,
            Some(actual) => pattern.is_match(&actual) != *negated,
        },
    }
}

fn compare(event: &NormalizedEvent, field: &str, op: CompareOp, literal: &Literal) -> bool {
    if op.is_numeric() {
        let actual = event.resolve_number(field);
        let expected = literal.as_number();
        return match op {
            CompareOp::Gt => actual > expected,
            CompareOp::Ge => actual >= expected,
            CompareOp::Lt => actual < expected,
            _ => actual <= expected,
        };
    }

    let actual = event.resolve(field);
    match op {
        CompareOp::Ne => actual.is_none_or(|actual| actual != literal.as_text()),
        _ => actual.is_some_and(|actual| actual == literal.as_text()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rule::compiler::compile_predicate;
    use chrono::Utc;

    fn event() -> NormalizedEvent {
        let mut e = NormalizedEvent::new("M-1", Utc::now());
        e.user_id = Some("alice".to_owned());
        e.action = Some("COPY".to_owned());
        e.file_size = 2_000_000;
        e.hour = 23;
        e.ext.insert("fname".to_owned(), "report.pdf".to_owned());
        e.ext.insert("riskScore".to_owned(), "7.5".to_owned());
        e
    }

    fn eval(text: &str, e: &NormalizedEvent) -> bool {
        matches(&compile_predicate(text).unwrap(), e)
    }

    #[test]
    fn conjunction_with_numeric_comparison() {
        let mut e = event();
        assert!(eval("userId = 'alice' AND fileSize > 1000000", &e));
        e.file_size = 500;
        assert!(!eval("userId = 'alice' AND fileSize > 1000000", &e));
    }

    #[test]
    fn disjunction() {
        let e = event();
        assert!(eval("userId = 'bob' OR action = 'COPY'", &e));
        assert!(!eval("userId = 'bob' OR action = 'MOVE'", &e));
    }

    #[test]
    fn numeric_operators() {
        let e = event();
        assert!(eval("hour >= 23", &e));
        assert!(!eval("hour > 23", &e));
        assert!(eval("hour <= 23", &e));
        assert!(eval("hour < 24", &e));
        assert!(eval("riskScore > 7", &e));
        assert!(eval("riskScore < 7.6", &e));
    }

    #[test]
    fn numeric_comparison_of_absent_field_uses_zero() {
        let e = event();
        assert!(eval("missing < 1", &e));
        assert!(!eval("missing > 0", &e));
        assert!(eval("missing >= 0", &e));
    }

    #[test]
    fn string_literal_in_numeric_comparison() {
        let e = event();
        assert!(eval("fileSize > '1000'", &e));
        assert!(eval("fileSize > 'abc'", &e));
    }

    #[test]
    fn equality_against_number_literal_uses_text() {
        let e = event();
        assert!(eval("hour = 23", &e));
        assert!(eval("hour = '23'", &e));
        assert!(!eval("hour = 23.5", &e));
    }

    #[test]
    fn whole_float_literal_keeps_fraction_in_text() {
        let mut e = event();
        e.ext.insert("ratio".to_owned(), "2.0".to_owned());
        assert!(eval("ratio = 2.0", &e));
        assert!(!eval("hour = 23.0", &e));
        assert!(eval("ratio IN (2.0, 3.0)", &e));
    }

    #[test]
    fn absent_field_equality_is_false_inequality_true() {
        let e = event();
        assert!(!eval("outcome = 'success'", &e));
        assert!(eval("outcome != 'success'", &e));
        assert!(eval("outcome <> 'success'", &e));
    }

    #[test]
    fn present_field_inequality() {
        let e = event();
        assert!(!eval("userId != 'alice'", &e));
        assert!(eval("userId != 'bob'", &e));
    }

    #[test]
    fn set_membership() {
        let mut e = event();
        assert!(eval("action IN ('COPY', 'MOVE')", &e));
        e.action = Some("DELETE".to_owned());
        assert!(!eval("action IN ('COPY', 'MOVE')", &e));
        assert!(eval("action NOT IN ('COPY', 'MOVE')", &e));
        e.action = None;
        assert!(!eval("action IN ('COPY', 'MOVE')", &e));
        assert!(eval("action NOT IN ('COPY', 'MOVE')", &e));
    }

    #[test]
    fn pattern_match() {
        let mut e = event();
        assert!(eval("fname LIKE '%.pdf'", &e));
        assert!(!eval("fname NOT LIKE '%.pdf'", &e));
        e.ext.insert("fname".to_owned(), "report.docx".to_owned());
        assert!(!eval("fname LIKE '%.pdf'", &e));
        assert!(eval("fname NOT LIKE '%.pdf'", &e));
    }

    #[test]
    fn pattern_match_on_absent_field_is_false_even_negated() {
        let e = event();
        assert!(!eval("missing LIKE '%'", &e));
        assert!(!eval("missing NOT LIKE 'x'", &e));
    }

    #[test]
    fn aliases_resolve_same_field() {
        let e = event();
        assert!(eval("suid = 'alice' AND act = 'COPY' AND fsize >= 2000000", &e));
    }

    #[test]
    fn short_circuit_and_or() {
        let e = event();
        assert!(!eval("userId = 'bob' AND fname LIKE '%'", &e));
        assert!(eval("userId = 'alice' OR missing = 'x'", &e));
    }

    mod proptests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn absent_field_equality_false_inequality_true(
                field in "[a-z][a-zA-Z0-9]{0,12}",
                literal in "[a-zA-Z0-9 ]{0,16}"
            ) {
                let e = NormalizedEvent::new("M-1", Utc::now());
                prop_assume!(e.resolve(&field).is_none());
                let (Ok(eq), Ok(ne)) = (
                    compile_predicate(&format!("{field} = '{literal}'")),
                    compile_predicate(&format!("{field} != '{literal}'")),
                ) else {
                    // 예약어와 겹치는 필드 이름
                    return Ok(());
                };
                prop_assert!(!matches(&eq, &e));
                prop_assert!(matches(&ne, &e));
            }

            #[test]
            fn recompiled_predicate_evaluates_identically(
                user in "(alice|bob|carol)",
                action in "(COPY|MOVE|PRINT|DELETE)",
                size in 0i64..5_000_000,
                hour in 0u32..24
            ) {
                let text = "userId = 'alice' AND (action IN ('COPY', 'MOVE') OR fileSize > 1000000) AND hour >= 18";
                let first = compile_predicate(text).unwrap();
                let second = compile_predicate(text).unwrap();

                let mut e = NormalizedEvent::new("M-1", Utc::now());
                e.user_id = Some(user);
                e.action = Some(action);
                e.file_size = size;
                e.hour = hour;
                prop_assert_eq!(matches(&first, &e), matches(&second, &e));
            }

            #[test]
            fn arbitrary_text_never_panics(text in "\\PC{0,200}") {
                let _ = compile_predicate(&text);
            }
        }
    }
}
