use serde::Serialize;

pub mod fingerprint;
mod filter;
pub mod schema;

pub use filter::{FilterExpression, NumberBounds};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Granularity {
    Full,
    AggregateOnly,
}

impl Granularity {
    pub fn as_str(self) -> &'static str {
        match self {
            Granularity::Full => "FULL",
            Granularity::AggregateOnly => "AGGREGATE_ONLY",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Order {
    Ascending,
    Descending,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OrderBy {
    pub field: String,
    #[serde(rename = "type")]
    pub order: Order,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Page {
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub order_by_fields: Vec<OrderBy>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub offset: Option<u32>,
}

impl Page {
    pub const MAX_LIMIT: u32 = 1_000_000;

    pub fn validate(&self) -> Result<(), &'static str> {
        if let Some(limit) = self.limit
            && !(1..=Self::MAX_LIMIT).contains(&limit)
        {
            return Err("limit out of range");
        }
        Ok(())
    }
}

/// What the backend should compute over the rows matching a filter.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all_fields = "camelCase")]
pub enum Action {
    Aggregated {
        group_by_fields: Vec<String>,
        #[serde(flatten)]
        page: Page,
    },
    Details {
        fields: Vec<String>,
        #[serde(flatten)]
        page: Page,
    },
    Mutations {
        min_proportion: f64,
        #[serde(flatten)]
        page: Page,
    },
    AminoAcidMutations {
        min_proportion: f64,
        #[serde(flatten)]
        page: Page,
    },
}

impl Action {
    pub const DEFAULT_MIN_PROPORTION: f64 = 0.05;

    /// Route segment and metric label for the action.
    pub fn name(&self) -> &'static str {
        match self {
            Action::Aggregated { .. } => "aggregated",
            Action::Details { .. } => "details",
            Action::Mutations { .. } => "nucleotideMutations",
            Action::AminoAcidMutations { .. } => "aminoAcidMutations",
        }
    }

    /// Whether the result only ever contains counts or proportions, never rows.
    pub fn serves_aggregated_data(&self) -> bool {
        !matches!(self, Action::Details { .. })
    }

    /// Metadata fields that appear in the output: group-by fields or selected
    /// detail fields.
    pub fn output_fields(&self) -> &[String] {
        match self {
            Action::Aggregated {
                group_by_fields, ..
            } => group_by_fields,
            Action::Details { fields, .. } => fields,
            Action::Mutations { .. } | Action::AminoAcidMutations { .. } => &[],
        }
    }

    pub fn page(&self) -> &Page {
        match self {
            Action::Aggregated { page, .. }
            | Action::Details { page, .. }
            | Action::Mutations { page, .. }
            | Action::AminoAcidMutations { page, .. } => page,
        }
    }
}

/// A fully compiled request, in the shape the backend accepts on `/query`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BackendQuery {
    pub action: Action,
    pub filter_expression: FilterExpression,
}

impl BackendQuery {
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "action": serde_json::to_value(&self.action).unwrap_or(serde_json::Value::Null),
            "filterExpression": self.filter_expression.to_wire(),
        })
    }

    /// Content hash of the action (including requested fields) and the
    /// canonical filter tree.
    pub fn cache_key(&self) -> String {
        fingerprint::fingerprint(&self.to_json())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BackendInfo {
    pub data_version: String,
    pub backend_version: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn details(fields: &[&str]) -> Action {
        Action::Details {
            fields: fields.iter().map(|f| f.to_string()).collect(),
            page: Page::default(),
        }
    }

    #[test]
    fn action_serializes_with_type_tag_and_flattened_page() {
        let action = Action::Aggregated {
            group_by_fields: vec!["country".to_string()],
            page: Page {
                order_by_fields: vec![OrderBy {
                    field: "count".to_string(),
                    order: Order::Descending,
                }],
                limit: Some(10),
                offset: None,
            },
        };

        assert_eq!(
            serde_json::to_value(&action).expect("action serializes"),
            serde_json::json!({
                "type": "Aggregated",
                "groupByFields": ["country"],
                "orderByFields": [{"field": "count", "type": "descending"}],
                "limit": 10,
            })
        );
    }

    #[test]
    fn only_details_serves_row_level_data() {
        assert!(!details(&["accession"]).serves_aggregated_data());
        assert!(
            Action::Mutations {
                min_proportion: 0.05,
                page: Page::default()
            }
            .serves_aggregated_data()
        );
    }

    #[test]
    fn cache_key_depends_on_requested_fields() {
        let a = BackendQuery {
            action: details(&["date", "country"]),
            filter_expression: FilterExpression::True,
        };
        let b = BackendQuery {
            action: details(&["date"]),
            filter_expression: FilterExpression::True,
        };

        assert_ne!(a.cache_key(), b.cache_key());
        assert_eq!(a.cache_key(), a.clone().cache_key());
        assert!(fingerprint::is_sha256_hex(&a.cache_key()));
    }

    #[test]
    fn page_validate_rejects_zero_limit() {
        let page = Page {
            limit: Some(0),
            ..Page::default()
        };
        assert_eq!(
            page.validate().expect_err("zero limit must fail"),
            "limit out of range"
        );
        Page::default()
            .validate()
            .expect("no limit should be accepted");
    }
}
