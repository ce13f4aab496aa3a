use std::cmp::Ordering;

use chrono::{DateTime, Duration, Months, NaiveDate, NaiveDateTime, Utc};
use regex::Regex;
use unicode_normalization::{char::is_combining_mark, UnicodeNormalization};

use crate::{
    error::InconclusiveMatchError,
    models::{AttributeValue, ConditionValue, Operator, Properties, PropertyRule, Value},
};

/// Evaluate a single property rule against `properties`.
///
/// Returns an error if the rule's key is missing from `properties`: the server may know the value
/// even though the caller didn't pass it. Negation is applied to definite results only.
pub fn match_property(
    rule: &PropertyRule,
    properties: &Properties,
    now: DateTime<Utc>,
) -> Result<bool, InconclusiveMatchError> {
    let value = properties
        .get(&rule.key)
        .ok_or_else(|| InconclusiveMatchError::MissingProperty(rule.key.clone()))?;

    let matched = rule.operator.eval(value, rule.value.as_ref(), now);
    Ok(matched != rule.negation)
}

impl Operator {
    /// Applying `Operator` to the values. Returns `false` if the operator cannot be applied or
    /// there's a misconfiguration.
    pub fn eval(
        &self,
        attribute: &AttributeValue,
        condition_value: Option<&ConditionValue>,
        now: DateTime<Utc>,
    ) -> bool {
        self.try_eval(attribute, condition_value, now)
            .unwrap_or(false)
    }

    /// Try applying `Operator` to the values, returning `None` if the operator cannot be applied.
    fn try_eval(
        &self,
        attribute: &AttributeValue,
        condition_value: Option<&ConditionValue>,
        now: DateTime<Utc>,
    ) -> Option<bool> {
        if *attribute == AttributeValue::Null {
            return Some(*self == Self::IsNot);
        }

        match self {
            Self::IsSet => Some(true),
            Self::IsNotSet => Some(false),

            Self::Exact | Self::IsNot => {
                let s = casefold(&attribute_to_string(attribute));
                let is_exact = match condition_value? {
                    ConditionValue::Single(v) => casefold(&value_to_string(v)) == s,
                    ConditionValue::Multiple(values) => values
                        .iter()
                        .any(|v| casefold(&value_to_string(v)) == s),
                };
                Some(if *self == Self::Exact {
                    is_exact
                } else {
                    !is_exact
                })
            }

            Self::Icontains | Self::NotIcontains => {
                let s = casefold(&attribute_to_string(attribute));
                let needle = casefold(&value_to_string(single(condition_value)?));
                let contains = s.contains(&needle);
                Some(if *self == Self::Icontains {
                    contains
                } else {
                    !contains
                })
            }

            Self::Regex | Self::NotRegex => {
                let regex = Regex::new(&value_to_string(single(condition_value)?)).ok()?;
                let matches = regex.is_match(&attribute_to_string(attribute));
                Some(if *self == Self::Regex {
                    matches
                } else {
                    !matches
                })
            }

            Self::Gt | Self::Gte | Self::Lt | Self::Lte => {
                let expected = single(condition_value)?;

                let ordering = match (attribute_to_number(attribute), value_to_number(expected)) {
                    (Some(a), Some(e)) => a.partial_cmp(&e)?,
                    // Fall back to comparing string representations.
                    _ => attribute_to_string(attribute).cmp(&value_to_string(expected)),
                };

                Some(match self {
                    Self::Gt => ordering == Ordering::Greater,
                    Self::Gte => ordering != Ordering::Less,
                    Self::Lt => ordering == Ordering::Less,
                    Self::Lte => ordering != Ordering::Greater,
                    _ => {
                        // unreachable
                        return None;
                    }
                })
            }

            Self::IsDateBefore | Self::IsDateAfter => {
                let expected = match single(condition_value)? {
                    Value::String(s) => parse_relative_date(s, now).or_else(|| parse_date(s))?,
                    Value::Number(n) => timestamp_to_date(*n)?,
                    Value::Boolean(_) => return None,
                };
                let actual = match attribute {
                    AttributeValue::String(s) => match s.trim().parse::<f64>() {
                        Ok(seconds) => timestamp_to_date(seconds)?,
                        Err(_) => parse_date(s)?,
                    },
                    AttributeValue::Number(n) => timestamp_to_date(*n)?,
                    _ => return None,
                };

                Some(if *self == Self::IsDateBefore {
                    actual < expected
                } else {
                    actual > expected
                })
            }

            // Resolved by the cohort resolver and the flag evaluator.
            Self::In | Self::FlagEvaluatesTo => None,

            Self::Unknown => None,
        }
    }
}

fn single(condition_value: Option<&ConditionValue>) -> Option<&Value> {
    match condition_value? {
        ConditionValue::Single(v) => Some(v),
        ConditionValue::Multiple(_) => None,
    }
}

/// Unicode case folding: NFD decomposition without combining marks, upper-cased then lower-cased.
///
/// `"Straße"` folds to `"strasse"` and `"İstanbul"` to `"istanbul"`.
pub(crate) fn casefold(s: &str) -> String {
    s.nfd()
        .filter(|c| !is_combining_mark(*c))
        .collect::<String>()
        .to_uppercase()
        .to_lowercase()
}

pub(crate) fn attribute_to_string(value: &AttributeValue) -> String {
    match value {
        AttributeValue::String(s) => s.clone(),
        AttributeValue::Number(n) => n.to_string(),
        AttributeValue::Boolean(b) => b.to_string(),
        AttributeValue::Null => "null".to_owned(),
    }
}

pub(crate) fn value_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        Value::Boolean(b) => b.to_string(),
    }
}

fn attribute_to_number(value: &AttributeValue) -> Option<f64> {
    match value {
        AttributeValue::Number(n) => Some(*n),
        AttributeValue::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn value_to_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => Some(*n),
        Value::String(s) => s.trim().parse().ok(),
        Value::Boolean(_) => None,
    }
}

fn timestamp_to_date(seconds: f64) -> Option<DateTime<Utc>> {
    if !seconds.is_finite() {
        return None;
    }
    DateTime::from_timestamp_millis((seconds * 1000.0) as i64)
}

/// Parse expressions like `-7d` or `2w` as that long before `now`. Units are hours, days,
/// weeks, months and years.
fn parse_relative_date(s: &str, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let s = s.strip_prefix('-').unwrap_or(s);
    let unit = s.chars().last()?;
    let digits = &s[..s.len() - unit.len_utf8()];
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let amount: u32 = digits.parse().ok()?;
    if amount >= 10_000 {
        return None;
    }

    match unit {
        'h' => now.checked_sub_signed(Duration::hours(i64::from(amount))),
        'd' => now.checked_sub_signed(Duration::days(i64::from(amount))),
        'w' => now.checked_sub_signed(Duration::weeks(i64::from(amount))),
        'm' => now.checked_sub_months(Months::new(amount)),
        'y' => now.checked_sub_months(Months::new(amount.checked_mul(12)?)),
        _ => None,
    }
}

/// Parse an absolute timestamp. Values without an offset are read as UTC.
pub(crate) fn parse_date(s: &str) -> Option<DateTime<Utc>> {
    let s = s.trim();

    if let Ok(date) = DateTime::parse_from_rfc3339(s) {
        return Some(date.with_timezone(&Utc));
    }
    for format in ["%Y-%m-%d %H:%M:%S %:z", "%Y-%m-%d %H:%M:%S%:z"] {
        if let Ok(date) = DateTime::parse_from_str(s, format) {
            return Some(date.with_timezone(&Utc));
        }
    }
    for format in ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"] {
        if let Ok(date) = NaiveDateTime::parse_from_str(s, format) {
            return Some(date.and_utc());
        }
    }
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .ok()
        .and_then(|date| date.and_hms_opt(0, 0, 0))
        .map(|date| date.and_utc())
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use chrono::{TimeZone, Utc};

    use super::*;
    use crate::models::PropertyType;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap()
    }

    fn rule(key: &str, operator: Operator, value: impl Into<ConditionValue>) -> PropertyRule {
        PropertyRule {
            key: key.to_owned(),
            value: Some(value.into()),
            operator,
            property_type: PropertyType::Person,
            negation: false,
            dependency_chain: None,
        }
    }

    fn props<const N: usize>(entries: [(&str, AttributeValue); N]) -> Properties {
        entries
            .into_iter()
            .map(|(k, v)| (k.to_owned(), v))
            .collect()
    }

    #[test]
    fn exact_single_and_list() {
        let single = rule("key", Operator::Exact, "value");
        assert!(match_property(&single, &props([("key", "value".into())]), now()).unwrap());
        assert!(!match_property(&single, &props([("key", "value2".into())]), now()).unwrap());

        let list = rule("key", Operator::Exact, vec!["value1", "value2", "value3"]);
        assert!(match_property(&list, &props([("key", "value2".into())]), now()).unwrap());
        assert!(!match_property(&list, &props([("key", "value4".into())]), now()).unwrap());
    }

    #[test]
    fn exact_compares_numbers_and_booleans_as_strings() {
        assert!(Operator::Exact.eval(&42.0.into(), Some(&vec![Value::from("42")].into()), now()));
        assert!(Operator::Exact.eval(&true.into(), Some(&"true".into()), now()));
        assert!(Operator::Exact.eval(&"5".into(), Some(&5.0.into()), now()));
        assert!(!Operator::Exact.eval(&1.0.into(), Some(&"true".into()), now()));
    }

    #[test]
    fn exact_uses_unicode_casefold() {
        assert!(Operator::Exact.eval(&"Straße".into(), Some(&"strasse".into()), now()));
        assert!(Operator::Exact.eval(&"ſun".into(), Some(&"sun".into()), now()));
        assert!(Operator::Exact.eval(&"İstanbul".into(), Some(&"istanbul".into()), now()));
        assert!(Operator::Exact.eval(&"VALUE".into(), Some(&"value".into()), now()));
    }

    #[test]
    fn is_not() {
        let list = rule("key", Operator::IsNot, vec!["value1", "value2"]);
        assert!(!match_property(&list, &props([("key", "value1".into())]), now()).unwrap());
        assert!(match_property(&list, &props([("key", "value3".into())]), now()).unwrap());
    }

    #[test]
    fn null_value_only_matches_is_not() {
        let p = props([("key", AttributeValue::Null)]);
        assert!(match_property(&rule("key", Operator::IsNot, "x"), &p, now()).unwrap());
        for operator in [
            Operator::Exact,
            Operator::IsSet,
            Operator::Icontains,
            Operator::NotIcontains,
            Operator::Regex,
            Operator::NotRegex,
            Operator::Gt,
            Operator::Lt,
            Operator::IsDateBefore,
        ] {
            assert!(
                !match_property(&rule("key", operator, "x"), &p, now()).unwrap(),
                "{operator:?} should not match null"
            );
        }
    }

    #[test]
    fn missing_key_is_inconclusive() {
        for operator in [Operator::Exact, Operator::IsSet, Operator::IsNotSet, Operator::Gt] {
            assert_eq!(
                match_property(&rule("key", operator, "x"), &props([("other", 1.0.into())]), now()),
                Err(InconclusiveMatchError::MissingProperty("key".into()))
            );
        }
    }

    #[test]
    fn is_set_and_is_not_set() {
        let p = props([("key", "anything".into())]);
        assert!(match_property(&rule("key", Operator::IsSet, "is_set"), &p, now()).unwrap());
        assert!(!match_property(&rule("key", Operator::IsNotSet, "is_not_set"), &p, now()).unwrap());
    }

    #[test]
    fn icontains() {
        assert!(Operator::Icontains.eval(&"Test@Example.com".into(), Some(&"example".into()), now()));
        assert!(!Operator::Icontains.eval(&"test@posthog.com".into(), Some(&"example".into()), now()));
        assert!(Operator::NotIcontains.eval(&"test@example.com".into(), Some(&".net".into()), now()));
        assert!(!Operator::NotIcontains.eval(&"test@example.NET".into(), Some(&".net".into()), now()));
        assert!(Operator::Icontains.eval(&2.75.into(), Some(&"2.7".into()), now()));
    }

    #[test]
    fn regex() {
        assert!(Operator::Regex.eval(&"test@example.com".into(), Some(&"^test.*".into()), now()));
        assert!(!Operator::Regex.eval(&"example@test.com".into(), Some(&"^test.*".into()), now()));
        assert!(Operator::Regex.eval(&"a@b.com".into(), Some(&r"\w+@\w+\.\w+".into()), now()));
        assert!(Operator::NotRegex.eval(&"a@gmail.com".into(), Some(&"@yahoo.com$".into()), now()));
        assert!(!Operator::NotRegex.eval(&"a@yahoo.com".into(), Some(&"@yahoo.com$".into()), now()));
        assert!(Operator::Regex.eval(&42.0.into(), Some(&"^4".into()), now()));
    }

    #[test]
    fn invalid_regex_never_matches() {
        assert!(!Operator::Regex.eval(&"anything".into(), Some(&"(unclosed".into()), now()));
        assert!(!Operator::NotRegex.eval(&"anything".into(), Some(&"(unclosed".into()), now()));
    }

    #[test]
    fn gte() {
        assert!(Operator::Gte.eval(&18.0.into(), Some(&18.0.into()), now()));
        assert!(!Operator::Gte.eval(&17.0.into(), Some(&18.0.into()), now()));
    }
    #[test]
    fn gt() {
        assert!(Operator::Gt.eval(&19.0.into(), Some(&18.0.into()), now()));
        assert!(!Operator::Gt.eval(&18.0.into(), Some(&18.0.into()), now()));
    }
    #[test]
    fn lte() {
        assert!(Operator::Lte.eval(&18.0.into(), Some(&18.0.into()), now()));
        assert!(!Operator::Lte.eval(&19.0.into(), Some(&18.0.into()), now()));
    }
    #[test]
    fn lt() {
        assert!(Operator::Lt.eval(&17.0.into(), Some(&18.0.into()), now()));
        assert!(!Operator::Lt.eval(&18.0.into(), Some(&18.0.into()), now()));
    }

    #[test]
    fn numeric_comparison_parses_strings() {
        assert!(Operator::Gt.eval(&"100".into(), Some(&"20".into()), now()));
        assert!(Operator::Lt.eval(&"9".into(), Some(&10.0.into()), now()));
    }

    #[test]
    fn non_numeric_comparison_is_lexicographic() {
        assert!(Operator::Gt.eval(&"banana".into(), Some(&"apple".into()), now()));
        assert!(Operator::Lt.eval(&"abc".into(), Some(&"abd".into()), now()));
        assert!(Operator::Gt.eval(&"v10".into(), Some(&5.0.into()), now()));
    }

    #[test]
    fn unknown_and_resolver_operators_never_match() {
        for operator in [Operator::Unknown, Operator::In, Operator::FlagEvaluatesTo] {
            assert!(!operator.eval(&"x".into(), Some(&"x".into()), now()));
        }
    }

    #[test]
    fn negation_inverts_definite_results_only() {
        let mut negated = rule("key", Operator::Exact, "value");
        negated.negation = true;
        assert!(!match_property(&negated, &props([("key", "value".into())]), now()).unwrap());
        assert!(match_property(&negated, &props([("key", "other".into())]), now()).unwrap());
        assert!(match_property(&negated, &HashMap::new(), now()).is_err());
    }

    #[test]
    fn absolute_date_formats() {
        let expected = Utc.with_ymd_and_hms(2022, 5, 1, 0, 0, 0).unwrap();
        assert_eq!(parse_date("2022-05-01"), Some(expected));
        assert_eq!(parse_date("2022-05-01T00:00:00Z"), Some(expected));
        assert_eq!(parse_date("2022-05-01T02:00:00+02:00"), Some(expected));
        assert_eq!(parse_date("2022-05-01 02:00:00 +02:00"), Some(expected));
        assert_eq!(parse_date("2022-05-01 02:00:00+02:00"), Some(expected));
        assert_eq!(parse_date("2022-05-01 00:00:00"), Some(expected));
        assert_eq!(parse_date("2022-05-01T00:00:00"), Some(expected));
        assert_eq!(parse_date("yesterday"), None);
    }

    #[test]
    fn date_before_and_after() {
        let before = rule("signup", Operator::IsDateBefore, "2022-05-01");
        assert!(match_property(&before, &props([("signup", "2022-03-01".into())]), now()).unwrap());
        assert!(!match_property(&before, &props([("signup", "2022-05-30".into())]), now()).unwrap());
        assert!(!match_property(&before, &props([("signup", "2022-05-01".into())]), now()).unwrap());

        let after = rule("signup", Operator::IsDateAfter, "2022-05-01 00:00:00 +00:00");
        assert!(match_property(&after, &props([("signup", "2022-05-30".into())]), now()).unwrap());
        assert!(!match_property(&after, &props([("signup", "2022-03-01".into())]), now()).unwrap());
    }

    #[test]
    fn numeric_property_dates_are_unix_seconds() {
        let before = rule("ts", Operator::IsDateBefore, "2022-05-01");
        let march = Utc.with_ymd_and_hms(2022, 3, 1, 0, 0, 0).unwrap().timestamp();
        assert!(match_property(&before, &props([("ts", (march as f64).into())]), now()).unwrap());
        assert!(match_property(&before, &props([("ts", march.to_string().as_str().into())]), now()).unwrap());

        let june = Utc.with_ymd_and_hms(2022, 6, 1, 0, 0, 0).unwrap().timestamp();
        assert!(!match_property(&before, &props([("ts", june.to_string().as_str().into())]), now()).unwrap());
    }

    #[test]
    fn relative_dates() {
        let before = rule("signup", Operator::IsDateBefore, "-1d");
        assert!(match_property(&before, &props([("signup", "2024-05-30".into())]), now()).unwrap());
        assert!(!match_property(&before, &props([("signup", "2024-06-01T06:00:00Z".into())]), now()).unwrap());

        let after = rule("signup", Operator::IsDateAfter, "2w");
        assert!(match_property(&after, &props([("signup", "2024-05-25".into())]), now()).unwrap());
        assert!(!match_property(&after, &props([("signup", "2024-05-01".into())]), now()).unwrap());

        assert_eq!(
            parse_relative_date("1m", now()),
            Some(Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap())
        );
        assert_eq!(
            parse_relative_date("-2y", now()),
            Some(Utc.with_ymd_and_hms(2022, 6, 1, 12, 0, 0).unwrap())
        );
        assert_eq!(
            parse_relative_date("3h", now()),
            Some(Utc.with_ymd_and_hms(2024, 6, 1, 9, 0, 0).unwrap())
        );
    }

    #[test]
    fn invalid_relative_dates() {
        assert_eq!(parse_relative_date("10000d", now()), None);
        assert_eq!(parse_relative_date("1x", now()), None);
        assert_eq!(parse_relative_date("d", now()), None);
        assert_eq!(parse_relative_date("-1.5d", now()), None);
    }

    #[test]
    fn unparseable_dates_never_match() {
        let before = rule("signup", Operator::IsDateBefore, "not a date");
        assert!(!match_property(&before, &props([("signup", "2022-03-01".into())]), now()).unwrap());

        let before = rule("signup", Operator::IsDateBefore, "2022-05-01");
        assert!(!match_property(&before, &props([("signup", "garbage".into())]), now()).unwrap());
        assert!(!match_property(&before, &props([("signup", true.into())]), now()).unwrap());
    }

    #[test]
    fn missing_expected_value_never_matches() {
        let mut r = rule("key", Operator::Exact, "value");
        r.value = None;
        assert!(!match_property(&r, &props([("key", "value".into())]), now()).unwrap());
    }
}
