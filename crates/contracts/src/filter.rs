use chrono::NaiveDate;
use serde::Serialize;
use serde_json::json;

use crate::fingerprint;

/// The canonical filter expression shared by the compiler, the variant query
/// parser, the access policy and the query cache.
///
/// `And`/`Or` never hold zero children; build them through [`FilterExpression::all`]
/// and [`FilterExpression::any`].
#[derive(Debug, Clone, PartialEq)]
pub enum FilterExpression {
    True,
    And(Vec<FilterExpression>),
    Or(Vec<FilterExpression>),
    Not(Box<FilterExpression>),
    Maybe(Box<FilterExpression>),
    NOf {
        number_of_matchers: usize,
        match_exactly: bool,
        children: Vec<FilterExpression>,
    },
    StringEquals {
        column: String,
        value: String,
    },
    StringSearch {
        column: String,
        pattern: String,
    },
    BooleanEquals {
        column: String,
        value: bool,
    },
    DateBetween {
        column: String,
        from: Option<NaiveDate>,
        to: Option<NaiveDate>,
    },
    NumberBetween {
        column: String,
        bounds: NumberBounds,
    },
    LineageEquals {
        column: String,
        value: String,
        include_sublineages: bool,
    },
    NucleotideSymbolEquals {
        position: u32,
        symbol: String,
    },
    AminoAcidSymbolEquals {
        gene: String,
        position: u32,
        symbol: String,
    },
    /// `value` is an upper-cased pattern where `.*` matches any run of symbols.
    NucleotideInsertionContains {
        position: u32,
        value: String,
    },
    AminoAcidInsertionContains {
        gene: String,
        position: u32,
        value: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum NumberBounds {
    Int { from: Option<i64>, to: Option<i64> },
    Float { from: Option<f64>, to: Option<f64> },
}

impl FilterExpression {
    /// Conjunction of `children`; an empty list is `True`.
    pub fn all(children: Vec<FilterExpression>) -> Self {
        if children.is_empty() {
            FilterExpression::True
        } else {
            FilterExpression::And(children)
        }
    }

    /// Disjunction of `children`. A single child is returned unwrapped and an
    /// empty list has no meaningful disjunction, so it yields `None`.
    pub fn any(mut children: Vec<FilterExpression>) -> Option<Self> {
        match children.len() {
            0 => None,
            1 => children.pop(),
            _ => Some(FilterExpression::Or(children)),
        }
    }

    pub fn negate(child: FilterExpression) -> Self {
        FilterExpression::Not(Box::new(child))
    }

    pub fn maybe(child: FilterExpression) -> Self {
        FilterExpression::Maybe(Box::new(child))
    }

    pub fn is_true(&self) -> bool {
        matches!(self, FilterExpression::True)
    }

    /// Calls `visit` for every metadata column referenced anywhere in the tree.
    /// Mutation predicates reference sequences, not metadata columns.
    pub fn for_each_column<'a>(&'a self, visit: &mut impl FnMut(&'a str)) {
        match self {
            FilterExpression::True
            | FilterExpression::NucleotideSymbolEquals { .. }
            | FilterExpression::AminoAcidSymbolEquals { .. }
            | FilterExpression::NucleotideInsertionContains { .. }
            | FilterExpression::AminoAcidInsertionContains { .. } => {}
            FilterExpression::And(children)
            | FilterExpression::Or(children)
            | FilterExpression::NOf { children, .. } => {
                for child in children {
                    child.for_each_column(visit);
                }
            }
            FilterExpression::Not(child) | FilterExpression::Maybe(child) => {
                child.for_each_column(visit)
            }
            FilterExpression::StringEquals { column, .. }
            | FilterExpression::StringSearch { column, .. }
            | FilterExpression::BooleanEquals { column, .. }
            | FilterExpression::DateBetween { column, .. }
            | FilterExpression::NumberBetween { column, .. }
            | FilterExpression::LineageEquals { column, .. } => visit(column.as_str()),
        }
    }

    pub fn referenced_columns(&self) -> Vec<&str> {
        let mut out = Vec::new();
        self.for_each_column(&mut |column| out.push(column));
        out.sort_unstable();
        out.dedup();
        out
    }

    /// The backend wire form: nested objects tagged by `type`.
    pub fn to_wire(&self) -> serde_json::Value {
        match self {
            FilterExpression::True => json!({ "type": "True" }),
            FilterExpression::And(children) => json!({
                "type": "And",
                "children": children.iter().map(Self::to_wire).collect::<Vec<_>>(),
            }),
            FilterExpression::Or(children) => json!({
                "type": "Or",
                "children": children.iter().map(Self::to_wire).collect::<Vec<_>>(),
            }),
            FilterExpression::Not(child) => json!({ "type": "Not", "child": child.to_wire() }),
            FilterExpression::Maybe(child) => {
                json!({ "type": "Maybe", "child": child.to_wire() })
            }
            FilterExpression::NOf {
                number_of_matchers,
                match_exactly,
                children,
            } => json!({
                "type": "N-Of",
                "numberOfMatchers": number_of_matchers,
                "matchExactly": match_exactly,
                "children": children.iter().map(Self::to_wire).collect::<Vec<_>>(),
            }),
            FilterExpression::StringEquals { column, value } => {
                json!({ "type": "StringEquals", "column": column, "value": value })
            }
            FilterExpression::StringSearch { column, pattern } => {
                json!({ "type": "StringSearch", "column": column, "searchExpression": pattern })
            }
            FilterExpression::BooleanEquals { column, value } => {
                json!({ "type": "BooleanEquals", "column": column, "value": value })
            }
            FilterExpression::DateBetween { column, from, to } => json!({
                "type": "DateBetween",
                "column": column,
                "from": from.map(|d| d.format("%Y-%m-%d").to_string()),
                "to": to.map(|d| d.format("%Y-%m-%d").to_string()),
            }),
            FilterExpression::NumberBetween { column, bounds } => match bounds {
                NumberBounds::Int { from, to } => {
                    json!({ "type": "IntBetween", "column": column, "from": from, "to": to })
                }
                NumberBounds::Float { from, to } => {
                    json!({ "type": "FloatBetween", "column": column, "from": from, "to": to })
                }
            },
            FilterExpression::LineageEquals {
                column,
                value,
                include_sublineages,
            } => json!({
                "type": "Lineage",
                "column": column,
                "value": value,
                "includeSublineages": include_sublineages,
            }),
            FilterExpression::NucleotideSymbolEquals { position, symbol } => {
                json!({ "type": "NucleotideEquals", "position": position, "symbol": symbol })
            }
            FilterExpression::AminoAcidSymbolEquals {
                gene,
                position,
                symbol,
            } => json!({
                "type": "AminoAcidEquals",
                "sequenceName": gene,
                "position": position,
                "symbol": symbol,
            }),
            FilterExpression::NucleotideInsertionContains { position, value } => {
                json!({ "type": "InsertionContains", "position": position, "value": value })
            }
            FilterExpression::AminoAcidInsertionContains {
                gene,
                position,
                value,
            } => json!({
                "type": "AminoAcidInsertionContains",
                "sequenceName": gene,
                "position": position,
                "value": value,
            }),
        }
    }

    /// Stable serialization used as the filter component of cache keys.
    pub fn canonical_string(&self) -> String {
        fingerprint::stable_json(&self.to_wire())
    }
}

impl Serialize for FilterExpression {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        self.to_wire().serialize(serializer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lineage(value: &str) -> FilterExpression {
        FilterExpression::LineageEquals {
            column: "pangoLineage".to_string(),
            value: value.to_string(),
            include_sublineages: true,
        }
    }

    #[test]
    fn all_of_nothing_is_true() {
        assert_eq!(FilterExpression::all(Vec::new()), FilterExpression::True);
    }

    #[test]
    fn any_unwraps_single_child_and_rejects_empty() {
        assert_eq!(FilterExpression::any(Vec::new()), None);
        assert_eq!(
            FilterExpression::any(vec![lineage("B.1")]),
            Some(lineage("B.1"))
        );
        assert!(matches!(
            FilterExpression::any(vec![lineage("B.1"), lineage("A")]),
            Some(FilterExpression::Or(children)) if children.len() == 2
        ));
    }

    #[test]
    fn referenced_columns_walks_nested_nodes() {
        let expr = FilterExpression::And(vec![
            FilterExpression::negate(FilterExpression::StringEquals {
                column: "country".to_string(),
                value: "Switzerland".to_string(),
            }),
            FilterExpression::NOf {
                number_of_matchers: 1,
                match_exactly: false,
                children: vec![
                    FilterExpression::maybe(lineage("B.1")),
                    FilterExpression::NucleotideSymbolEquals {
                        position: 300,
                        symbol: "G".to_string(),
                    },
                ],
            },
        ]);

        assert_eq!(expr.referenced_columns(), vec!["country", "pangoLineage"]);
    }

    #[test]
    fn insertion_wire_form() {
        let expr = FilterExpression::Or(vec![
            FilterExpression::NucleotideInsertionContains {
                position: 22204,
                value: ".*GAG".to_string(),
            },
            FilterExpression::AminoAcidInsertionContains {
                gene: "S".to_string(),
                position: 214,
                value: "EPE".to_string(),
            },
        ]);

        assert_eq!(
            expr.to_wire(),
            json!({
                "type": "Or",
                "children": [
                    {"type": "InsertionContains", "position": 22204, "value": ".*GAG"},
                    {"type": "AminoAcidInsertionContains", "sequenceName": "S", "position": 214, "value": "EPE"},
                ]
            })
        );
        assert!(expr.referenced_columns().is_empty());
    }

    #[test]
    fn wire_form_tags_nodes_by_type() {
        let expr = FilterExpression::And(vec![
            FilterExpression::DateBetween {
                column: "date".to_string(),
                from: NaiveDate::from_ymd_opt(2021, 1, 1),
                to: None,
            },
            FilterExpression::NumberBetween {
                column: "age".to_string(),
                bounds: NumberBounds::Int {
                    from: Some(18),
                    to: Some(65),
                },
            },
        ]);

        assert_eq!(
            expr.to_wire(),
            json!({
                "type": "And",
                "children": [
                    {"type": "DateBetween", "column": "date", "from": "2021-01-01", "to": null},
                    {"type": "IntBetween", "column": "age", "from": 18, "to": 65},
                ]
            })
        );
    }

    #[test]
    fn canonical_string_is_key_order_independent() {
        let expr = FilterExpression::NucleotideSymbolEquals {
            position: 23403,
            symbol: "G".to_string(),
        };
        assert_eq!(
            expr.canonical_string(),
            r#"{"position":23403,"symbol":"G","type":"NucleotideEquals"}"#
        );
    }
}
