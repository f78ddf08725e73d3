//! Choice rule evaluation.
//!
//! Rules are tried in declaration order; the first match wins. A comparison
//! against a value of the wrong JSON type (or a missing value) is simply
//! false, so a Choice never fails on odd input. It falls through to
//! `default`, or reports no match.

use complyflow_types::workflow::{ChoiceRule, ChoiceState, ChoiceTest};
use serde_json::Value;

use super::path::{JsonPath, PathError};

/// Pick the next state for `state` given `input`.
///
/// Returns `Ok(None)` when no rule matches and no default is declared.
pub fn evaluate_choice<'a>(
    state: &'a ChoiceState,
    input: &Value,
) -> Result<Option<&'a str>, PathError> {
    for rule in &state.choices {
        if rule_matches(rule, input)? {
            return Ok(Some(rule.next.as_str()));
        }
    }
    Ok(state.default.as_deref())
}

/// Whether a single rule matches `input`.
pub fn rule_matches(rule: &ChoiceRule, input: &Value) -> Result<bool, PathError> {
    let value = JsonPath::parse(&rule.variable)?.read(input);
    Ok(rule.tests().iter().all(|test| test_matches(test, value)))
}

fn test_matches(test: &ChoiceTest<'_>, value: Option<&Value>) -> bool {
    match test {
        ChoiceTest::IsPresent(expected) => value.is_some() == *expected,
        ChoiceTest::StringEquals(expected) => {
            value.and_then(Value::as_str).is_some_and(|v| v == *expected)
        }
        ChoiceTest::BooleanEquals(expected) => {
            value.and_then(Value::as_bool).is_some_and(|v| v == *expected)
        }
        ChoiceTest::NumericEquals(n) => numeric(value, |v| v == *n),
        ChoiceTest::NumericLessThan(n) => numeric(value, |v| v < *n),
        ChoiceTest::NumericLessThanEquals(n) => numeric(value, |v| v <= *n),
        ChoiceTest::NumericGreaterThan(n) => numeric(value, |v| v > *n),
        ChoiceTest::NumericGreaterThanEquals(n) => numeric(value, |v| v >= *n),
    }
}

fn numeric(value: Option<&Value>, cmp: impl Fn(f64) -> bool) -> bool {
    value.and_then(Value::as_f64).is_some_and(cmp)
}
