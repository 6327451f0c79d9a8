//! End-date resolution: variable expressions and business calendars.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveDateTime, Utc, Weekday};
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Calendar used when an end date names none.
pub const DEFAULT_CALENDAR: &str = "default";
pub const WORKDAY_CALENDAR: &str = "workday";

/// Parse an instant in RFC 3339, `YYYY-MM-DDTHH:MM:SS[.fff]` (UTC) or
/// `YYYY-MM-DD` (midnight UTC).
pub fn parse_instant(text: &str) -> Result<DateTime<Utc>, ConfigError> {
    let text = text.trim();
    if let Ok(at) = DateTime::parse_from_rfc3339(text) {
        return Ok(at.with_timezone(&Utc));
    }
    if let Ok(naive) = NaiveDateTime::parse_from_str(text, "%Y-%m-%dT%H:%M:%S%.f") {
        return Ok(naive.and_utc());
    }
    if let Ok(date) = NaiveDate::parse_from_str(text, "%Y-%m-%d") {
        if let Some(midnight) = date.and_hms_opt(0, 0, 0) {
            return Ok(midnight.and_utc());
        }
    }
    Err(ConfigError::InvalidDate(text.to_string()))
}

/// Turns a textual end date into an instant.
pub trait BusinessCalendar: Send + Sync {
    fn name(&self) -> &str;

    fn resolve_end_date(&self, text: &str) -> Result<DateTime<Utc>, ConfigError>;
}

/// Plain date parsing.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultCalendar;

impl BusinessCalendar for DefaultCalendar {
    fn name(&self) -> &str {
        DEFAULT_CALENDAR
    }

    fn resolve_end_date(&self, text: &str) -> Result<DateTime<Utc>, ConfigError> {
        parse_instant(text)
    }
}

/// Moves Saturday and Sunday instants to the following Monday, same time of day.
#[derive(Debug, Default, Clone, Copy)]
pub struct WorkdayCalendar;

impl BusinessCalendar for WorkdayCalendar {
    fn name(&self) -> &str {
        WORKDAY_CALENDAR
    }

    fn resolve_end_date(&self, text: &str) -> Result<DateTime<Utc>, ConfigError> {
        let at = parse_instant(text)?;
        let shift = match at.weekday() {
            Weekday::Sat => 2,
            Weekday::Sun => 1,
            _ => 0,
        };
        Ok(at + Duration::days(shift))
    }
}

/// Calendars by name. Starts with `default` and `workday`.
#[derive(Clone)]
pub struct CalendarRegistry {
    calendars: HashMap<String, Arc<dyn BusinessCalendar>>,
}

impl Default for CalendarRegistry {
    fn default() -> Self {
        let mut registry = Self::empty();
        registry.register(DefaultCalendar);
        registry.register(WorkdayCalendar);
        registry
    }
}

impl std::fmt::Debug for CalendarRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names: Vec<&String> = self.calendars.keys().collect();
        names.sort();
        f.debug_struct("CalendarRegistry").field("calendars", &names).finish()
    }
}

impl CalendarRegistry {
    pub fn empty() -> Self {
        Self {
            calendars: HashMap::new(),
        }
    }

    /// Register a calendar, replacing one with the same name.
    pub fn register<C>(&mut self, calendar: C)
    where
        C: BusinessCalendar + 'static,
    {
        self.calendars
            .insert(calendar.name().to_string(), Arc::new(calendar));
    }

    pub fn get(&self, name: &str) -> Result<Arc<dyn BusinessCalendar>, ConfigError> {
        self.calendars
            .get(name)
            .cloned()
            .ok_or_else(|| ConfigError::UnknownCalendar(name.to_string()))
    }
}

/// Value of a process variable as seen by end-date expressions.
#[derive(Debug, Clone, PartialEq)]
pub enum ExpressionValue {
    Text(String),
    Instant(DateTime<Utc>),
    Number(f64),
    Bool(bool),
    Null,
    Structured(serde_json::Value),
}

impl ExpressionValue {
    pub fn type_name(&self) -> &'static str {
        match self {
            ExpressionValue::Text(_) => "text",
            ExpressionValue::Instant(_) => "instant",
            ExpressionValue::Number(_) => "number",
            ExpressionValue::Bool(_) => "boolean",
            ExpressionValue::Null => "null",
            ExpressionValue::Structured(_) => "structured",
        }
    }
}

impl From<serde_json::Value> for ExpressionValue {
    fn from(value: serde_json::Value) -> Self {
        match value {
            serde_json::Value::String(s) => ExpressionValue::Text(s),
            serde_json::Value::Number(n) => ExpressionValue::Number(n.as_f64().unwrap_or(f64::NAN)),
            serde_json::Value::Bool(b) => ExpressionValue::Bool(b),
            serde_json::Value::Null => ExpressionValue::Null,
            other => ExpressionValue::Structured(other),
        }
    }
}

/// Variables visible to the job being scheduled.
pub trait VariableScope {
    fn variable(&self, name: &str) -> Option<ExpressionValue>;
}

/// A scope without variables.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoVariables;

impl VariableScope for NoVariables {
    fn variable(&self, _name: &str) -> Option<ExpressionValue> {
        None
    }
}

impl VariableScope for HashMap<String, ExpressionValue> {
    fn variable(&self, name: &str) -> Option<ExpressionValue> {
        self.get(name).cloned()
    }
}

impl VariableScope for serde_json::Map<String, serde_json::Value> {
    fn variable(&self, name: &str) -> Option<ExpressionValue> {
        self.get(name).cloned().map(ExpressionValue::from)
    }
}

/// End date of a recurring timer: a literal date or `${variable}`, and an
/// optional calendar name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndDateSpec {
    pub expression: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub calendar: Option<String>,
}

impl EndDateSpec {
    pub fn literal(expression: impl Into<String>) -> Self {
        Self {
            expression: expression.into(),
            calendar: None,
        }
    }

    pub fn with_calendar(mut self, calendar: impl Into<String>) -> Self {
        self.calendar = Some(calendar.into());
        self
    }
}

/// Evaluate `${name}` against the scope; anything else is literal text.
pub fn evaluate(expression: &str, scope: &dyn VariableScope) -> Result<ExpressionValue, ConfigError> {
    let trimmed = expression.trim();
    let Some(name) = trimmed
        .strip_prefix("${")
        .and_then(|rest| rest.strip_suffix('}'))
    else {
        return Ok(ExpressionValue::Text(trimmed.to_string()));
    };

    let name = name.trim();
    if name.is_empty() || !name.chars().all(|c| c.is_alphanumeric() || c == '_' || c == '.') {
        return Err(ConfigError::Expression {
            expression: expression.to_string(),
            reason: "expected a variable name".to_string(),
        });
    }

    scope.variable(name).ok_or_else(|| ConfigError::Expression {
        expression: expression.to_string(),
        reason: format!("unknown variable '{name}'"),
    })
}

/// Resolve an end date: text goes through the calendar, instants are used as
/// is, anything else is rejected.
pub fn resolve_end_date(
    spec: &EndDateSpec,
    scope: &dyn VariableScope,
    calendars: &CalendarRegistry,
) -> Result<DateTime<Utc>, ConfigError> {
    match evaluate(&spec.expression, scope)? {
        ExpressionValue::Text(text) => {
            let calendar = calendars.get(spec.calendar.as_deref().unwrap_or(DEFAULT_CALENDAR))?;
            calendar.resolve_end_date(&text)
        }
        ExpressionValue::Instant(at) => Ok(at),
        other => Err(ConfigError::UnsupportedEndDateType {
            expression: spec.expression.clone(),
            found: other.type_name().to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn vars(pairs: Vec<(&str, ExpressionValue)>) -> HashMap<String, ExpressionValue> {
        pairs.into_iter().map(|(k, v)| (k.to_string(), v)).collect()
    }

    #[test]
    fn parses_supported_instant_forms() {
        let expected = Utc.with_ymd_and_hms(2024, 5, 4, 10, 30, 0).unwrap();
        assert_eq!(parse_instant("2024-05-04T10:30:00Z").unwrap(), expected);
        assert_eq!(parse_instant("2024-05-04T12:30:00+02:00").unwrap(), expected);
        assert_eq!(parse_instant("2024-05-04T10:30:00").unwrap(), expected);
        assert_eq!(
            parse_instant("2024-05-04").unwrap(),
            Utc.with_ymd_and_hms(2024, 5, 4, 0, 0, 0).unwrap()
        );
        assert!(matches!(parse_instant("next week"), Err(ConfigError::InvalidDate(_))));
    }

    #[test]
    fn literal_end_date_uses_default_calendar() {
        let spec = EndDateSpec::literal("2024-05-04T10:30:00Z");
        let end = resolve_end_date(&spec, &NoVariables, &CalendarRegistry::default()).unwrap();
        assert_eq!(end, Utc.with_ymd_and_hms(2024, 5, 4, 10, 30, 0).unwrap());
    }

    #[test]
    fn workday_calendar_moves_weekend_to_monday() {
        // 2024-05-04 is a Saturday.
        let spec = EndDateSpec::literal("2024-05-04T10:30:00Z").with_calendar(WORKDAY_CALENDAR);
        let end = resolve_end_date(&spec, &NoVariables, &CalendarRegistry::default()).unwrap();
        assert_eq!(end, Utc.with_ymd_and_hms(2024, 5, 6, 10, 30, 0).unwrap());
    }

    #[test]
    fn variable_holding_instant_is_used_directly() {
        let at = Utc.with_ymd_and_hms(2030, 1, 1, 0, 0, 0).unwrap();
        let scope = vars(vec![("deadline", ExpressionValue::Instant(at))]);
        let spec = EndDateSpec::literal("${deadline}");
        assert_eq!(
            resolve_end_date(&spec, &scope, &CalendarRegistry::default()).unwrap(),
            at
        );
    }

    #[test]
    fn variable_holding_text_goes_through_calendar() {
        let scope = vars(vec![("deadline", ExpressionValue::Text("2030-01-01".into()))]);
        let spec = EndDateSpec::literal("${deadline}");
        assert_eq!(
            resolve_end_date(&spec, &scope, &CalendarRegistry::default()).unwrap(),
            Utc.with_ymd_and_hms(2030, 1, 1, 0, 0, 0).unwrap()
        );
    }

    #[test]
    fn other_types_fail_fast() {
        let scope = vars(vec![("deadline", ExpressionValue::Number(42.0))]);
        let err = resolve_end_date(
            &EndDateSpec::literal("${deadline}"),
            &scope,
            &CalendarRegistry::default(),
        )
        .unwrap_err();
        assert_eq!(
            err,
            ConfigError::UnsupportedEndDateType {
                expression: "${deadline}".into(),
                found: "number".into(),
            }
        );
    }

    #[test]
    fn unknown_variable_and_calendar_are_errors() {
        let registry = CalendarRegistry::default();
        assert!(matches!(
            resolve_end_date(&EndDateSpec::literal("${missing}"), &NoVariables, &registry),
            Err(ConfigError::Expression { .. })
        ));
        assert!(matches!(
            resolve_end_date(
                &EndDateSpec::literal("2030-01-01").with_calendar("lunar"),
                &NoVariables,
                &registry
            ),
            Err(ConfigError::UnknownCalendar(_))
        ));
    }

    #[test]
    fn json_variables_are_visible() {
        let mut map = serde_json::Map::new();
        map.insert("end".into(), serde_json::json!("2030-01-01T00:00:00Z"));
        assert_eq!(
            evaluate("${end}", &map).unwrap(),
            ExpressionValue::Text("2030-01-01T00:00:00Z".into())
        );
    }
}
