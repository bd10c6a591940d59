use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A GA4 property the authenticated user can read.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PropertyRecord {
    /// Numeric id without the `properties/` prefix.
    pub id: String,
    pub display_name: String,
    pub create_time: Option<String>,
    pub update_time: Option<String>,
    /// Parent resource, e.g. `accounts/1000`.
    pub parent: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub account_name: Option<String>,
}

/// One report query against a property.
#[derive(Debug, Clone, PartialEq)]
pub struct ReportRequest {
    pub property_id: String,
    pub dimensions: Vec<String>,
    pub metrics: Vec<String>,
    pub date_range_start: String,
    pub date_range_end: String,
    pub dimension_filter: Option<FilterExpression>,
    pub limit: Option<u64>,
}

/// A report row keyed by dimension/metric name; `None` where the row was
/// shorter than the header list.
pub type ReportRow = BTreeMap<String, Option<String>>;

/// Typed GA4 `FilterExpression`. Serializes to the exact wire shape the Data
/// API expects, so it is also what clients send as `dimension_filter`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FilterExpression {
    AndGroup(FilterExpressionList),
    OrGroup(FilterExpressionList),
    NotExpression(Box<FilterExpression>),
    Filter(Filter),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilterExpressionList {
    pub expressions: Vec<FilterExpression>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Filter {
    pub field_name: String,
    #[serde(flatten)]
    pub kind: FilterKind,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FilterKind {
    StringFilter(StringFilter),
    InListFilter(InListFilter),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StringFilter {
    #[serde(default)]
    pub match_type: MatchType,
    pub value: String,
    #[serde(default)]
    pub case_sensitive: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InListFilter {
    pub values: Vec<String>,
    #[serde(default)]
    pub case_sensitive: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MatchType {
    #[default]
    Exact,
    BeginsWith,
    EndsWith,
    Contains,
    FullRegexp,
    PartialRegexp,
}

impl FilterExpression {
    /// Every `fieldName` referenced anywhere in the tree.
    pub fn field_names(&self) -> Vec<&str> {
        let mut out = Vec::new();
        self.collect_fields(&mut out);
        out
    }

    fn collect_fields<'a>(&'a self, out: &mut Vec<&'a str>) {
        match self {
            FilterExpression::AndGroup(list) | FilterExpression::OrGroup(list) => {
                for e in &list.expressions {
                    e.collect_fields(out);
                }
            }
            FilterExpression::NotExpression(inner) => inner.collect_fields(out),
            FilterExpression::Filter(f) => out.push(f.field_name.as_str()),
        }
    }

    /// Decode a client-supplied filter: either a JSON object or a string
    /// containing one.
    pub fn from_value(value: &Value) -> Result<Self, String> {
        let parsed = match value {
            Value::String(raw) => serde_json::from_str(raw),
            other => serde_json::from_value(other.clone()),
        };
        parsed.map_err(|e| format!("invalid dimension_filter: {}", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_filter_expression_wire_shape() {
        let expr = FilterExpression::AndGroup(FilterExpressionList {
            expressions: vec![
                FilterExpression::Filter(Filter {
                    field_name: "country".into(),
                    kind: FilterKind::StringFilter(StringFilter {
                        match_type: MatchType::BeginsWith,
                        value: "United".into(),
                        case_sensitive: false,
                    }),
                }),
                FilterExpression::NotExpression(Box::new(FilterExpression::Filter(Filter {
                    field_name: "deviceCategory".into(),
                    kind: FilterKind::InListFilter(InListFilter {
                        values: vec!["tablet".into()],
                        case_sensitive: true,
                    }),
                }))),
            ],
        });

        assert_eq!(
            serde_json::to_value(&expr).unwrap(),
            json!({
                "andGroup": {"expressions": [
                    {"filter": {"fieldName": "country", "stringFilter": {
                        "matchType": "BEGINS_WITH", "value": "United", "caseSensitive": false}}},
                    {"notExpression": {"filter": {"fieldName": "deviceCategory", "inListFilter": {
                        "values": ["tablet"], "caseSensitive": true}}}}
                ]}
            })
        );
        assert_eq!(expr.field_names(), vec!["country", "deviceCategory"]);
    }

    #[test]
    fn test_filter_from_string_defaults_match_type() {
        let raw = json!(r#"{"filter": {"fieldName": "city", "stringFilter": {"value": "Paris"}}}"#);
        let expr = FilterExpression::from_value(&raw).unwrap();
        match expr {
            FilterExpression::Filter(Filter {
                kind: FilterKind::StringFilter(sf),
                ..
            }) => {
                assert_eq!(sf.match_type, MatchType::Exact);
                assert!(!sf.case_sensitive);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_filter_rejects_unknown_shape() {
        assert!(FilterExpression::from_value(&json!({"between": {}})).is_err());
        assert!(FilterExpression::from_value(&json!("not json")).is_err());
        assert!(FilterExpression::from_value(&json!({"filter": {"fieldName": "city"}})).is_err());
    }
}
