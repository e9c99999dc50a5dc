// ABOUTME: Record sanitization against destination column metadata
// ABOUTME: Drops unknown keys, nulls empty non-text values, coerces numeric-looking strings

use serde_json::{Number, Value};

use crate::remote::Record;

/// Coarse type family of a destination column.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnKind {
    Text,
    Integer,
    Float,
    /// numeric/decimal: validated but kept as text so no precision is lost
    Decimal,
    Boolean,
    Other,
}

impl ColumnKind {
    /// Classify a type as rendered by `format_type()`.
    pub fn from_sql_type(sql_type: &str) -> Self {
        let base = sql_type
            .split('(')
            .next()
            .unwrap_or(sql_type)
            .trim()
            .to_ascii_lowercase();

        match base.as_str() {
            "text" | "character varying" | "varchar" | "character" | "char" | "bpchar"
            | "name" | "citext" => ColumnKind::Text,
            "smallint" | "integer" | "bigint" | "int2" | "int4" | "int8" => ColumnKind::Integer,
            "real" | "double precision" | "float4" | "float8" => ColumnKind::Float,
            "numeric" | "decimal" => ColumnKind::Decimal,
            "boolean" | "bool" => ColumnKind::Boolean,
            _ => ColumnKind::Other,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Column {
    pub name: String,
    pub sql_type: String,
    /// `sql_type` without its modifier, e.g. `character varying` for
    /// `character varying(64)`
    pub base_type: String,
    pub kind: ColumnKind,
}

impl Column {
    pub fn new(name: &str, sql_type: &str) -> Self {
        Self {
            name: name.to_string(),
            sql_type: sql_type.to_string(),
            base_type: strip_type_modifier(sql_type),
            kind: ColumnKind::from_sql_type(sql_type),
        }
    }
}

/// Drop `(n)` / `(p,s)` modifiers. Values are cast to the base type only, so
/// the column's own length or precision check applies on assignment.
pub fn strip_type_modifier(sql_type: &str) -> String {
    let mut base = String::with_capacity(sql_type.len());
    let mut depth = 0u32;
    for ch in sql_type.chars() {
        match ch {
            '(' => depth += 1,
            ')' => depth = depth.saturating_sub(1),
            _ if depth == 0 => base.push(ch),
            _ => {}
        }
    }
    base.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Destination table metadata, columns in attribute order.
#[derive(Debug, Clone)]
pub struct TableSchema {
    pub schema: String,
    pub table: String,
    pub columns: Vec<Column>,
}

impl TableSchema {
    pub fn column(&self, name: &str) -> Option<&Column> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn qualified_name(&self) -> String {
        crate::utils::qualified_table(&self.schema, &self.table)
    }

    /// Keep known columns only and coerce values to their column's family.
    pub fn sanitize(&self, record: &Record) -> Record {
        let mut clean = Record::new();
        for (key, value) in record {
            let Some(column) = self.column(key) else {
                continue;
            };
            clean.insert(key.clone(), coerce(column.kind, value.clone()));
        }
        clean
    }
}

/// Coerce one value. Values that cannot be coerced are returned unchanged
/// and left for the store's own type validation.
pub fn coerce(kind: ColumnKind, value: Value) -> Value {
    if kind == ColumnKind::Text {
        return value;
    }

    if matches!(&value, Value::String(s) if s.is_empty()) {
        return Value::Null;
    }

    match kind {
        ColumnKind::Text | ColumnKind::Other => value,
        ColumnKind::Integer => coerce_integer(value),
        ColumnKind::Float => coerce_float(value),
        ColumnKind::Decimal => match value {
            Value::String(s) if s.trim().parse::<f64>().is_ok() => {
                Value::String(s.trim().to_string())
            }
            other => other,
        },
        ColumnKind::Boolean => coerce_boolean(value),
    }
}

fn coerce_integer(value: Value) -> Value {
    let as_float = match &value {
        Value::String(s) => {
            let trimmed = s.trim();
            if let Ok(i) = trimmed.parse::<i64>() {
                return Value::from(i);
            }
            trimmed.parse::<f64>().ok()
        }
        Value::Number(n) if n.is_f64() => n.as_f64(),
        Value::Bool(b) => return Value::from(i64::from(*b)),
        _ => None,
    };

    match as_float {
        Some(f) if f.is_finite() && f.fract() == 0.0 && f.abs() < 9_007_199_254_740_992.0 => {
            Value::from(f as i64)
        }
        _ => value,
    }
}

fn coerce_float(value: Value) -> Value {
    match &value {
        Value::String(s) => s
            .trim()
            .parse::<f64>()
            .ok()
            .and_then(Number::from_f64)
            .map(Value::Number)
            .unwrap_or(value),
        _ => value,
    }
}

fn coerce_boolean(value: Value) -> Value {
    let parsed = match &value {
        Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
            "true" | "t" | "yes" | "y" | "1" => Some(true),
            "false" | "f" | "no" | "n" | "0" => Some(false),
            _ => None,
        },
        Value::Number(n) => match n.as_i64() {
            Some(1) => Some(true),
            Some(0) => Some(false),
            _ => None,
        },
        _ => None,
    };
    parsed.map(Value::Bool).unwrap_or(value)
}

/// Text form bound to statement parameters; `None` binds SQL NULL.
pub fn to_sql_text(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Number(n) => Some(n.to_string()),
        other => Some(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn citizen_schema() -> TableSchema {
        TableSchema {
            schema: "public".to_string(),
            table: "ml_citizen_master".to_string(),
            columns: vec![
                Column::new("citizen_id", "character varying(64)"),
                Column::new("age", "integer"),
                Column::new("income", "double precision"),
                Column::new("land_area", "numeric(12,4)"),
                Column::new("is_minority", "boolean"),
                Column::new("dob", "date"),
                Column::new("remarks", "text"),
            ],
        }
    }

    fn record(value: serde_json::Value) -> Record {
        value.as_object().unwrap().clone()
    }

    #[test]
    fn test_column_kind_classification() {
        assert_eq!(ColumnKind::from_sql_type("character varying(100)"), ColumnKind::Text);
        assert_eq!(ColumnKind::from_sql_type("bigint"), ColumnKind::Integer);
        assert_eq!(ColumnKind::from_sql_type("numeric(10,2)"), ColumnKind::Decimal);
        assert_eq!(ColumnKind::from_sql_type("double precision"), ColumnKind::Float);
        assert_eq!(ColumnKind::from_sql_type("boolean"), ColumnKind::Boolean);
        assert_eq!(
            ColumnKind::from_sql_type("timestamp without time zone"),
            ColumnKind::Other
        );
    }

    #[test]
    fn test_sanitize_drops_unknown_columns() {
        let clean = citizen_schema().sanitize(&record(json!({
            "citizen_id": "C1",
            "favourite_colour": "green",
            "age": "41"
        })));
        assert_eq!(clean.len(), 2);
        assert!(!clean.contains_key("favourite_colour"));
        assert_eq!(clean["age"], json!(41));
    }

    #[test]
    fn test_empty_strings_become_null_only_for_non_text() {
        let clean = citizen_schema().sanitize(&record(json!({
            "citizen_id": "C1",
            "age": "",
            "dob": "",
            "remarks": ""
        })));
        assert_eq!(clean["age"], Value::Null);
        assert_eq!(clean["dob"], Value::Null);
        assert_eq!(clean["remarks"], json!(""));
    }

    #[test]
    fn test_whitespace_only_strings_are_not_nulled() {
        let clean = citizen_schema().sanitize(&record(json!({
            "citizen_id": "C1",
            "age": "  ",
            "dob": " "
        })));
        assert_eq!(clean["age"], json!("  "));
        assert_eq!(clean["dob"], json!(" "));
    }

    #[test]
    fn test_strip_type_modifier() {
        assert_eq!(strip_type_modifier("character varying(64)"), "character varying");
        assert_eq!(strip_type_modifier("numeric(10,2)"), "numeric");
        assert_eq!(
            strip_type_modifier("timestamp(3) without time zone"),
            "timestamp without time zone"
        );
        assert_eq!(strip_type_modifier("character varying(20)[]"), "character varying[]");
        assert_eq!(strip_type_modifier("integer"), "integer");
        assert_eq!(Column::new("name", "character(2)").base_type, "character");
    }

    #[test]
    fn test_numeric_coercion() {
        assert_eq!(coerce(ColumnKind::Integer, json!("12.0")), json!(12));
        assert_eq!(coerce(ColumnKind::Integer, json!(" 7 ")), json!(7));
        assert_eq!(coerce(ColumnKind::Integer, json!(3.0)), json!(3));
        assert_eq!(coerce(ColumnKind::Float, json!("2.5")), json!(2.5));
        assert_eq!(coerce(ColumnKind::Decimal, json!(" 10.2500 ")), json!("10.2500"));
        assert_eq!(coerce(ColumnKind::Boolean, json!("Yes")), json!(true));
        assert_eq!(coerce(ColumnKind::Boolean, json!("0")), json!(false));
        assert_eq!(coerce(ColumnKind::Boolean, json!(1)), json!(true));
    }

    #[test]
    fn test_failed_coercion_passes_through() {
        assert_eq!(coerce(ColumnKind::Integer, json!("12.5")), json!("12.5"));
        assert_eq!(coerce(ColumnKind::Integer, json!("forty")), json!("forty"));
        assert_eq!(coerce(ColumnKind::Boolean, json!("maybe")), json!("maybe"));
        assert_eq!(coerce(ColumnKind::Decimal, json!("n/a")), json!("n/a"));
        assert_eq!(coerce(ColumnKind::Text, json!(" 12 ")), json!(" 12 "));
    }

    #[test]
    fn test_to_sql_text() {
        assert_eq!(to_sql_text(&Value::Null), None);
        assert_eq!(to_sql_text(&json!(12)), Some("12".to_string()));
        assert_eq!(to_sql_text(&json!(true)), Some("true".to_string()));
        assert_eq!(to_sql_text(&json!("x")), Some("x".to_string()));
        assert_eq!(to_sql_text(&json!({"a": 1})), Some("{\"a\":1}".to_string()));
    }
}
