use std::collections::HashSet;

use chrono::NaiveDate;
use genq_contracts::schema::{
    FieldDescriptor, FieldKind, FieldSchema, RangeEnd, RangeScalar, VARIANT_QUERY_FIELD,
};
use genq_contracts::{Action, BackendQuery, FilterExpression, NumberBounds, OrderBy, Page};

use crate::lineage::lineage_filter;
use crate::mutation::{parse_insertion_token, parse_mutation_token};
use crate::request::{
    ActionKind, FIELDS_PROPERTY, LIMIT_PROPERTY, MIN_PROPORTION_PROPERTY, OFFSET_PROPERTY,
    ORDER_BY_PROPERTY, RequestFields,
};
use crate::variant::parse_variant_query;
use crate::QueryError;

/// Values supplied for one schema field, possibly merged from several
/// differently-cased request keys.
struct FieldInput<'s, 'r> {
    descriptor: &'s FieldDescriptor,
    key: &'r str,
    values: Vec<&'r str>,
}

/// Lowers request fields into the canonical filter tree.
pub struct FilterCompiler<'s> {
    schema: &'s FieldSchema,
}

impl<'s> FilterCompiler<'s> {
    pub fn new(schema: &'s FieldSchema) -> Self {
        Self { schema }
    }

    pub fn compile(&self, filters: &[(String, Vec<String>)]) -> Result<FilterExpression, QueryError> {
        let inputs = self.resolve_inputs(filters)?;
        self.check_conflicts(&inputs)?;

        let mut nodes = Vec::new();
        let mut merged_ranges: HashSet<&str> = HashSet::new();

        for input in &inputs {
            let column = input.descriptor.name.as_str();
            match &input.descriptor.kind {
                FieldKind::String => nodes.push(any_of(input, |value| {
                    Ok(FilterExpression::StringEquals {
                        column: column.to_string(),
                        value: value.to_string(),
                    })
                })?),
                FieldKind::StringWithRegexSearch(base) => nodes.push(any_of(input, |pattern| {
                    regex::Regex::new(pattern).map_err(|e| {
                        QueryError::validation(
                            input.key,
                            format!("'{pattern}' is not a valid regular expression: {e}"),
                        )
                    })?;
                    Ok(FilterExpression::StringSearch {
                        column: base.clone(),
                        pattern: pattern.to_string(),
                    })
                })?),
                FieldKind::Boolean => nodes.push(any_of(input, |value| {
                    let value = match value.trim().to_ascii_lowercase().as_str() {
                        "true" => true,
                        "false" => false,
                        _ => {
                            return Err(QueryError::validation(
                                input.key,
                                format!("'{value}' is not a valid boolean"),
                            ));
                        }
                    };
                    Ok(FilterExpression::BooleanEquals {
                        column: column.to_string(),
                        value,
                    })
                })?),
                FieldKind::Lineage => nodes.push(any_of(input, |value| {
                    lineage_filter(column, value.trim())
                        .map_err(|message| QueryError::validation(input.key, message))
                })?),
                FieldKind::Date | FieldKind::Int | FieldKind::Float => {
                    let raw = single_value(input)?.ok_or_else(|| {
                        QueryError::validation(input.key, "expected a non-empty value")
                    })?;
                    let scalar = input.descriptor.kind.range_scalar().ok_or_else(|| {
                        QueryError::Internal(format!("{column} has no range scalar"))
                    })?;
                    nodes.push(range_node(
                        column,
                        scalar,
                        Some((input.key, raw)),
                        Some((input.key, raw)),
                    )?);
                }
                kind @ (FieldKind::DateFrom(_)
                | FieldKind::DateTo(_)
                | FieldKind::IntFrom(_)
                | FieldKind::IntTo(_)
                | FieldKind::FloatFrom(_)
                | FieldKind::FloatTo(_)) => {
                    let Some((base, scalar, _)) = kind.range_companion() else {
                        continue;
                    };
                    if !merged_ranges.insert(base) {
                        continue;
                    }
                    let mut from = None;
                    let mut to = None;
                    for companion in &inputs {
                        if let Some((other_base, _, end)) =
                            companion.descriptor.kind.range_companion()
                            && other_base == base
                            && let Some(value) = single_value(companion)?
                        {
                            let bound = Some((companion.key, value));
                            match end {
                                RangeEnd::From => from = bound,
                                RangeEnd::To => to = bound,
                            }
                        }
                    }
                    if from.is_some() || to.is_some() {
                        nodes.push(range_node(base, scalar, from, to)?);
                    }
                }
                FieldKind::MutationQuery(kind) => {
                    for token in list_tokens(&input.values) {
                        nodes.push(parse_mutation_token(token, *kind, self.schema)?);
                    }
                }
                FieldKind::InsertionQuery(kind) => {
                    for token in list_tokens(&input.values) {
                        nodes.push(parse_insertion_token(token, *kind, self.schema)?);
                    }
                }
                FieldKind::VariantQueryLanguage => {
                    let [query] = input.values.as_slice() else {
                        return Err(QueryError::validation(
                            input.key,
                            format!("expected exactly one value, got {}", input.values.len()),
                        ));
                    };
                    if query.trim().is_empty() {
                        return Err(QueryError::validation(input.key, "must not be empty"));
                    }
                    nodes.push(parse_variant_query(query, self.schema)?);
                }
            }
        }

        let expr = FilterExpression::all(nodes);
        check_structure(&expr)?;
        Ok(expr)
    }

    fn resolve_inputs<'r>(
        &self,
        filters: &'r [(String, Vec<String>)],
    ) -> Result<Vec<FieldInput<'s, 'r>>, QueryError> {
        let mut inputs: Vec<FieldInput<'s, 'r>> = Vec::new();
        for (key, values) in filters {
            let descriptor = self.schema.resolve(key).ok_or_else(|| QueryError::UnknownField {
                field: key.clone(),
                valid: self.schema.field_names().join(", "),
            })?;
            if values.is_empty() {
                return Err(QueryError::validation(key, "expected at least one value"));
            }
            match inputs
                .iter_mut()
                .find(|input| input.descriptor.name == descriptor.name)
            {
                Some(existing) => existing.values.extend(values.iter().map(String::as_str)),
                None => inputs.push(FieldInput {
                    descriptor,
                    key,
                    values: values.iter().map(String::as_str).collect(),
                }),
            }
        }
        Ok(inputs)
    }

    fn check_conflicts(&self, inputs: &[FieldInput<'_, '_>]) -> Result<(), QueryError> {
        if let Some(variant) = inputs
            .iter()
            .find(|input| input.descriptor.kind == FieldKind::VariantQueryLanguage)
        {
            let clashing = inputs
                .iter()
                .filter(|input| {
                    matches!(
                        input.descriptor.kind,
                        FieldKind::Lineage | FieldKind::MutationQuery(_)
                    )
                })
                .map(|input| input.key)
                .collect::<Vec<_>>();
            if !clashing.is_empty() {
                return Err(QueryError::validation(
                    variant.key,
                    format!(
                        "{VARIANT_QUERY_FIELD} cannot be combined with other variant filters such as: {}",
                        clashing.join(", ")
                    ),
                ));
            }
        }

        for input in inputs {
            match &input.descriptor.kind {
                FieldKind::Date | FieldKind::Int | FieldKind::Float => {
                    let column = input.descriptor.name.as_str();
                    if let Some(range) = inputs.iter().find(|other| {
                        other
                            .descriptor
                            .kind
                            .range_companion()
                            .is_some_and(|(base, _, _)| base == column)
                    }) {
                        return Err(QueryError::validation(
                            input.key,
                            format!(
                                "cannot filter by exact field '{}' and by range field '{}' at the same time",
                                input.key, range.key
                            ),
                        ));
                    }
                }
                FieldKind::StringWithRegexSearch(base) => {
                    if let Some(equals) = inputs.iter().find(|other| other.descriptor.name == *base) {
                        return Err(QueryError::validation(
                            input.key,
                            format!(
                                "cannot filter for regex '{}' and equality '{}' on the same field",
                                input.key, equals.key
                            ),
                        ));
                    }
                }
                _ => {}
            }
        }
        Ok(())
    }

    /// Validates requested output fields and returns their declared spelling,
    /// without duplicates.
    pub fn output_fields(&self, requested: &[String]) -> Result<Vec<String>, QueryError> {
        let mut out: Vec<String> = Vec::with_capacity(requested.len());
        for field in requested {
            let canonical = self.schema.metadata_field(field).ok_or_else(|| {
                QueryError::UnknownField {
                    field: field.clone(),
                    valid: self.schema.metadata_field_names().join(", "),
                }
            })?;
            if !out.iter().any(|f| f == canonical) {
                out.push(canonical.to_string());
            }
        }
        Ok(out)
    }

    /// Compiles filters and special properties into the query sent to the
    /// backend.
    pub fn compile_request(
        &self,
        kind: ActionKind,
        request: &RequestFields,
    ) -> Result<BackendQuery, QueryError> {
        let filter_expression = self.compile(&request.filters)?;
        let fields = self.output_fields(&request.fields)?;

        let page = Page {
            order_by_fields: self.order_by(kind, &request.order_by)?,
            limit: parse_count(LIMIT_PROPERTY, request.limit.as_deref())?,
            offset: parse_count(OFFSET_PROPERTY, request.offset.as_deref())?,
        };
        page.validate()
            .map_err(|message| QueryError::validation(LIMIT_PROPERTY, message))?;

        if kind.is_mutations() && !fields.is_empty() {
            return Err(QueryError::validation(
                FIELDS_PROPERTY,
                "is not supported for mutation queries",
            ));
        }
        if !kind.is_mutations() && request.min_proportion.is_some() {
            return Err(QueryError::validation(
                MIN_PROPORTION_PROPERTY,
                "is only supported for mutation queries",
            ));
        }

        let action = match kind {
            ActionKind::Aggregated => Action::Aggregated {
                group_by_fields: fields,
                page,
            },
            ActionKind::Details => Action::Details { fields, page },
            ActionKind::NucleotideMutations => Action::Mutations {
                min_proportion: parse_min_proportion(request.min_proportion.as_deref())?,
                page,
            },
            ActionKind::AminoAcidMutations => Action::AminoAcidMutations {
                min_proportion: parse_min_proportion(request.min_proportion.as_deref())?,
                page,
            },
        };

        Ok(BackendQuery {
            action,
            filter_expression,
        })
    }

    fn order_by(&self, kind: ActionKind, order_by: &[OrderBy]) -> Result<Vec<OrderBy>, QueryError> {
        let extra: &[&str] = match kind {
            ActionKind::Aggregated => &["count"],
            ActionKind::Details => &[],
            ActionKind::NucleotideMutations | ActionKind::AminoAcidMutations => {
                &["mutation", "proportion", "count"]
            }
        };

        order_by
            .iter()
            .map(|entry| {
                let metadata = if kind.is_mutations() {
                    None
                } else {
                    self.schema.metadata_field(&entry.field)
                };
                let field = metadata
                    .or_else(|| extra.iter().copied().find(|e| e.eq_ignore_ascii_case(&entry.field)))
                    .ok_or_else(|| {
                    QueryError::validation(
                        ORDER_BY_PROPERTY,
                        format!("cannot order {} results by '{}'", kind.as_str(), entry.field),
                    )
                })?;
                Ok(OrderBy {
                    field: field.to_string(),
                    order: entry.order,
                })
            })
            .collect()
    }
}

/// Or of one leaf per value; a single value yields the bare leaf.
fn any_of(
    input: &FieldInput<'_, '_>,
    mut leaf: impl FnMut(&str) -> Result<FilterExpression, QueryError>,
) -> Result<FilterExpression, QueryError> {
    let children = input
        .values
        .iter()
        .map(|value| leaf(value))
        .collect::<Result<Vec<_>, _>>()?;
    FilterExpression::any(children)
        .ok_or_else(|| QueryError::validation(input.key, "expected at least one value"))
}

/// Range bounds are single-valued; a blank value counts as absent.
fn single_value<'r>(input: &FieldInput<'_, 'r>) -> Result<Option<&'r str>, QueryError> {
    match input.values.as_slice() {
        [value] if value.trim().is_empty() => Ok(None),
        [value] => Ok(Some(value.trim())),
        values => Err(QueryError::validation(
            input.key,
            format!("expected a single value, got {}", values.len()),
        )),
    }
}

fn parse_bound<T>(
    bound: Option<(&str, &str)>,
    expected: &str,
    parse: impl Fn(&str) -> Option<T>,
) -> Result<Option<T>, QueryError> {
    bound
        .map(|(key, raw)| {
            parse(raw).ok_or_else(|| {
                QueryError::validation(key, format!("'{raw}' is not a valid {expected}"))
            })
        })
        .transpose()
}

fn range_node(
    column: &str,
    scalar: RangeScalar,
    from: Option<(&str, &str)>,
    to: Option<(&str, &str)>,
) -> Result<FilterExpression, QueryError> {
    let column = column.to_string();
    Ok(match scalar {
        RangeScalar::Date => {
            let parse = |raw: &str| NaiveDate::parse_from_str(raw, "%Y-%m-%d").ok();
            FilterExpression::DateBetween {
                column,
                from: parse_bound(from, "date (expected YYYY-MM-DD)", parse)?,
                to: parse_bound(to, "date (expected YYYY-MM-DD)", parse)?,
            }
        }
        RangeScalar::Int => {
            let parse = |raw: &str| raw.parse::<i64>().ok();
            FilterExpression::NumberBetween {
                column,
                bounds: NumberBounds::Int {
                    from: parse_bound(from, "integer", parse)?,
                    to: parse_bound(to, "integer", parse)?,
                },
            }
        }
        RangeScalar::Float => {
            let parse = |raw: &str| raw.parse::<f64>().ok().filter(|v| v.is_finite());
            FilterExpression::NumberBetween {
                column,
                bounds: NumberBounds::Float {
                    from: parse_bound(from, "float", parse)?,
                    to: parse_bound(to, "float", parse)?,
                },
            }
        }
    })
}

fn parse_count(property: &str, raw: Option<&str>) -> Result<Option<u32>, QueryError> {
    raw.map(|raw| {
        raw.trim().parse::<u32>().map_err(|_| {
            QueryError::validation(property, format!("'{raw}' is not a valid non-negative integer"))
        })
    })
    .transpose()
}

fn parse_min_proportion(raw: Option<&str>) -> Result<f64, QueryError> {
    let Some(raw) = raw else {
        return Ok(Action::DEFAULT_MIN_PROPORTION);
    };
    match raw.trim().parse::<f64>() {
        Ok(value) if value > 0.0 && value <= 1.0 => Ok(value),
        _ => Err(QueryError::validation(
            MIN_PROPORTION_PROPERTY,
            format!("'{raw}' is not a proportion in (0, 1]"),
        )),
    }
}

/// Comma-separated entries across all values, blanks dropped.
fn list_tokens<'v>(values: &'v [&str]) -> impl Iterator<Item = &'v str> {
    values
        .iter()
        .flat_map(|value| value.split(','))
        .map(str::trim)
        .filter(|token| !token.is_empty())
}

/// Rejects trees that break the IR's structural rules. These can only come
/// from a bug in the compiler or parser, never from user input.
fn check_structure(expr: &FilterExpression) -> Result<(), QueryError> {
    let violation = match expr {
        FilterExpression::And(children) | FilterExpression::Or(children) if children.is_empty() => {
            Some("empty And/Or node".to_string())
        }
        FilterExpression::NOf {
            number_of_matchers,
            children,
            ..
        } if *number_of_matchers == 0 || *number_of_matchers > children.len() => Some(format!(
            "N-of with {number_of_matchers} matchers over {} children",
            children.len()
        )),
        _ => None,
    };
    if let Some(violation) = violation {
        tracing::error!(violation = %violation, "compiled filter violates structural invariant");
        return Err(QueryError::Internal(violation));
    }

    match expr {
        FilterExpression::And(children)
        | FilterExpression::Or(children)
        | FilterExpression::NOf { children, .. } => children.iter().try_for_each(check_structure),
        FilterExpression::Not(child) | FilterExpression::Maybe(child) => check_structure(child),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SCHEMA: &str = r#"{
        "instanceName": "sars-cov-2",
        "primaryKey": "accession",
        "metadata": [
            {"name": "accession", "type": "string"},
            {"name": "date", "type": "date"},
            {"name": "pangoLineage", "type": "pango_lineage"},
            {"name": "country", "type": "string", "allowRegexSearch": true},
            {"name": "age", "type": "int"},
            {"name": "qc", "type": "float"},
            {"name": "isReinfection", "type": "boolean"}
        ],
        "features": [{"name": "variantQuery"}],
        "genes": ["S", "ORF1a"]
    }"#;

    fn schema() -> FieldSchema {
        FieldSchema::from_json_str(SCHEMA).expect("schema is valid")
    }

    fn filters(raw: &[(&str, &[&str])]) -> Vec<(String, Vec<String>)> {
        raw.iter()
            .map(|(k, vs)| (k.to_string(), vs.iter().map(|v| v.to_string()).collect()))
            .collect()
    }

    fn compile(raw: &[(&str, &[&str])]) -> Result<FilterExpression, QueryError> {
        FilterCompiler::new(&schema()).compile(&filters(raw))
    }

    fn date(raw: &str) -> Option<NaiveDate> {
        NaiveDate::parse_from_str(raw, "%Y-%m-%d").ok()
    }

    #[test]
    fn no_filters_compile_to_true() {
        assert_eq!(compile(&[]), Ok(FilterExpression::True));
    }

    #[test]
    fn equality_fields_produce_one_child_each() {
        let expr = compile(&[
            ("country", &["Switzerland"]),
            ("isReinfection", &["TRUE"]),
            ("pangoLineage", &["B.1.617.2*"]),
        ])
        .expect("compiles");

        assert_eq!(
            expr,
            FilterExpression::And(vec![
                FilterExpression::StringEquals {
                    column: "country".to_string(),
                    value: "Switzerland".to_string(),
                },
                FilterExpression::BooleanEquals {
                    column: "isReinfection".to_string(),
                    value: true,
                },
                FilterExpression::LineageEquals {
                    column: "pangoLineage".to_string(),
                    value: "B.1.617.2".to_string(),
                    include_sublineages: true,
                },
            ])
        );
    }

    #[test]
    fn reordering_fields_keeps_the_same_children() {
        let a = compile(&[("country", &["Switzerland"]), ("pangoLineage", &["B.1"])])
            .expect("compiles");
        let b = compile(&[("pangoLineage", &["B.1"]), ("country", &["Switzerland"])])
            .expect("compiles");

        let (FilterExpression::And(mut a), FilterExpression::And(mut b)) = (a, b) else {
            panic!("expected And nodes");
        };
        a.sort_by_key(FilterExpression::canonical_string);
        b.sort_by_key(FilterExpression::canonical_string);
        assert_eq!(a, b);
    }

    #[test]
    fn field_names_are_case_insensitive_and_merge() {
        let expr = compile(&[("COUNTRY", &["Switzerland"]), ("country", &["Germany"])])
            .expect("compiles");
        assert_eq!(
            expr,
            FilterExpression::And(vec![FilterExpression::Or(vec![
                FilterExpression::StringEquals {
                    column: "country".to_string(),
                    value: "Switzerland".to_string(),
                },
                FilterExpression::StringEquals {
                    column: "country".to_string(),
                    value: "Germany".to_string(),
                },
            ])])
        );
    }

    #[test]
    fn date_range_companions_merge_into_one_node() {
        let expr = compile(&[("dateFrom", &["2021-01-01"]), ("dateTo", &["2021-06-01"])])
            .expect("compiles");
        assert_eq!(
            expr,
            FilterExpression::And(vec![FilterExpression::DateBetween {
                column: "date".to_string(),
                from: date("2021-01-01"),
                to: date("2021-06-01"),
            }])
        );
    }

    #[test]
    fn exact_date_is_a_closed_range() {
        let expr = compile(&[("date", &["2021-01-01"])]).expect("compiles");
        assert_eq!(
            expr,
            FilterExpression::And(vec![FilterExpression::DateBetween {
                column: "date".to_string(),
                from: date("2021-01-01"),
                to: date("2021-01-01"),
            }])
        );
    }

    #[test]
    fn blank_range_bounds_are_absent() {
        let expr = compile(&[("ageFrom", &["18"]), ("ageTo", &[""])]).expect("compiles");
        assert_eq!(
            expr,
            FilterExpression::And(vec![FilterExpression::NumberBetween {
                column: "age".to_string(),
                bounds: NumberBounds::Int {
                    from: Some(18),
                    to: None,
                },
            }])
        );
        assert_eq!(compile(&[("qcTo", &[" "])]), Ok(FilterExpression::True));
    }

    #[test]
    fn malformed_range_value_names_field_and_value() {
        let err = compile(&[("dateFrom", &["2021-13-01"])]).expect_err("bad month");
        assert_eq!(
            err,
            QueryError::Validation {
                field: "dateFrom".to_string(),
                message: "'2021-13-01' is not a valid date (expected YYYY-MM-DD)".to_string(),
            }
        );
        assert!(matches!(
            compile(&[("qcFrom", &["abc"])]),
            Err(QueryError::Validation { field, .. }) if field == "qcFrom"
        ));
    }

    #[test]
    fn exact_and_range_on_same_field_conflict() {
        let err = compile(&[("age", &["30"]), ("ageTo", &["40"])]).expect_err("conflict");
        assert!(matches!(err, QueryError::Validation { field, .. } if field == "age"));
    }

    #[test]
    fn regex_fields_validate_the_pattern() {
        let expr = compile(&[("country.regex", &["^Swi"])]).expect("compiles");
        assert_eq!(
            expr,
            FilterExpression::And(vec![FilterExpression::StringSearch {
                column: "country".to_string(),
                pattern: "^Swi".to_string(),
            }])
        );
        assert!(matches!(
            compile(&[("country.regex", &["(unclosed"])]),
            Err(QueryError::Validation { .. })
        ));
        assert!(matches!(
            compile(&[("country", &["Switzerland"]), ("country.regex", &["^G"])]),
            Err(QueryError::Validation { .. })
        ));
    }

    #[test]
    fn lineage_trailing_dot_is_a_validation_error() {
        let err = compile(&[("pangoLineage", &["B.1.617.2."])]).expect_err("trailing dot");
        assert!(matches!(err, QueryError::Validation { field, .. } if field == "pangoLineage"));
    }

    #[test]
    fn boolean_parsing_is_strict() {
        assert!(matches!(
            compile(&[("isReinfection", &["yes"])]),
            Err(QueryError::Validation { .. })
        ));
    }

    #[test]
    fn mutation_lists_produce_one_leaf_per_token() {
        let expr = compile(&[
            ("nucleotideMutations", &["A23403G,300-"]),
            ("aminoAcidMutations", &["S:N501Y"]),
        ])
        .expect("compiles");
        assert_eq!(
            expr,
            FilterExpression::And(vec![
                FilterExpression::NucleotideSymbolEquals {
                    position: 23403,
                    symbol: "G".to_string(),
                },
                FilterExpression::NucleotideSymbolEquals {
                    position: 300,
                    symbol: "-".to_string(),
                },
                FilterExpression::AminoAcidSymbolEquals {
                    gene: "S".to_string(),
                    position: 501,
                    symbol: "Y".to_string(),
                },
            ])
        );
    }

    #[test]
    fn insertion_lists_follow_mutations_in_request_order() {
        let expr = compile(&[
            ("nucleotideMutations", &["300G"]),
            ("nucleotideInsertions", &["ins_22204:?GAG", "ins_100:A"]),
            ("aminoAcidInsertions", &["ins_S:214:EPE"]),
        ])
        .expect("compiles");
        assert_eq!(
            expr,
            FilterExpression::And(vec![
                FilterExpression::NucleotideSymbolEquals {
                    position: 300,
                    symbol: "G".to_string(),
                },
                FilterExpression::NucleotideInsertionContains {
                    position: 22204,
                    value: ".*GAG".to_string(),
                },
                FilterExpression::NucleotideInsertionContains {
                    position: 100,
                    value: "A".to_string(),
                },
                FilterExpression::AminoAcidInsertionContains {
                    gene: "S".to_string(),
                    position: 214,
                    value: "EPE".to_string(),
                },
            ])
        );

        let err = compile(&[("nucleotideInsertions", &["ins_22204"])]).expect_err("no symbols");
        assert!(matches!(err, QueryError::InsertionSyntax { token, .. } if token == "ins_22204"));
    }

    #[test]
    fn insertions_combine_with_variant_query() {
        assert!(
            compile(&[
                ("variantQuery", &["300G"]),
                ("nucleotideInsertions", &["ins_22204:GAG"]),
            ])
            .is_ok()
        );
    }

    #[test]
    fn malformed_mutation_quotes_token() {
        let err = compile(&[("nucleotideMutations", &["300G,23403Z"])]).expect_err("bad symbol");
        assert!(matches!(err, QueryError::MutationSyntax { token, .. } if token == "23403Z"));
    }

    #[test]
    fn variant_query_becomes_one_child() {
        let expr = compile(&[
            ("country", &["Switzerland"]),
            ("variantQuery", &["300G & !400A"]),
        ])
        .expect("compiles");
        let FilterExpression::And(children) = expr else {
            panic!("expected And");
        };
        assert_eq!(children.len(), 2);
        assert!(matches!(children[1], FilterExpression::And(_)));
    }

    #[test]
    fn variant_query_conflicts_with_lineage_and_mutations() {
        assert!(matches!(
            compile(&[("variantQuery", &["300G"]), ("pangoLineage", &["B.1"])]),
            Err(QueryError::Validation { .. })
        ));
        assert!(matches!(
            compile(&[("variantQuery", &["300G"]), ("nucleotideMutations", &["400A"])]),
            Err(QueryError::Validation { .. })
        ));
        assert!(matches!(
            compile(&[("variantQuery", &["  "])]),
            Err(QueryError::Validation { .. })
        ));
    }

    #[test]
    fn variant_query_syntax_errors_propagate() {
        assert!(matches!(
            compile(&[("variantQuery", &["300G &"])]),
            Err(QueryError::Syntax { position: 6, .. })
        ));
    }

    #[test]
    fn unknown_field_is_reported() {
        let err = compile(&[("continent", &["Europe"])]).expect_err("unknown");
        assert!(matches!(err, QueryError::UnknownField { field, .. } if field == "continent"));
    }

    #[test]
    fn output_fields_use_declared_spelling() {
        let schema = schema();
        let compiler = FilterCompiler::new(&schema);
        assert_eq!(
            compiler.output_fields(&["COUNTRY".to_string(), "date".to_string(), "country".to_string()]),
            Ok(vec!["country".to_string(), "date".to_string()])
        );
        assert!(matches!(
            compiler.output_fields(&["dateFrom".to_string()]),
            Err(QueryError::UnknownField { .. })
        ));
    }

    #[test]
    fn compile_request_builds_action() {
        let schema = schema();
        let compiler = FilterCompiler::new(&schema);
        let request = RequestFields::from_pairs(
            [
                ("country", "Switzerland"),
                ("fields", "date"),
                ("orderBy", "COUNT"),
                ("limit", "5"),
            ]
            .map(|(k, v)| (k.to_string(), v.to_string())),
        );

        let query = compiler
            .compile_request(ActionKind::Aggregated, &request)
            .expect("compiles");
        assert_eq!(
            query.action,
            Action::Aggregated {
                group_by_fields: vec!["date".to_string()],
                page: Page {
                    order_by_fields: vec![OrderBy {
                        field: "count".to_string(),
                        order: genq_contracts::Order::Ascending,
                    }],
                    limit: Some(5),
                    offset: None,
                },
            }
        );
    }

    #[test]
    fn compile_request_rejects_misplaced_properties() {
        let schema = schema();
        let compiler = FilterCompiler::new(&schema);

        let mut request = RequestFields::default();
        request.push("minProportion".to_string(), vec!["0.1".to_string()]);
        assert!(compiler.compile_request(ActionKind::Details, &request).is_err());
        assert!(compiler
            .compile_request(ActionKind::NucleotideMutations, &request)
            .is_ok());

        let mut request = RequestFields::default();
        request.push("minProportion".to_string(), vec!["1.5".to_string()]);
        assert!(compiler
            .compile_request(ActionKind::NucleotideMutations, &request)
            .is_err());

        let mut request = RequestFields::default();
        request.push("limit".to_string(), vec!["0".to_string()]);
        assert!(compiler.compile_request(ActionKind::Details, &request).is_err());
    }
}
