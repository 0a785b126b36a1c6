use genq_contracts::FilterExpression;

/// Builds a lineage predicate from a raw value. A trailing `*` or `.*` asks for
/// sublineages and is stripped; a trailing bare `.` is rejected.
pub fn lineage_filter(column: &str, raw: &str) -> Result<FilterExpression, String> {
    let (value, include_sublineages) = if let Some(stem) = raw.strip_suffix(".*") {
        (stem, true)
    } else if let Some(stem) = raw.strip_suffix('*') {
        (stem, true)
    } else if raw.ends_with('.') {
        return Err(format!(
            "invalid lineage: '{raw}' must not end with a dot. Did you mean '{raw}*'?"
        ));
    } else {
        (raw, false)
    };

    if value.is_empty() {
        return Err(format!("invalid lineage: '{raw}' names no lineage"));
    }

    Ok(FilterExpression::LineageEquals {
        column: column.to_string(),
        value: value.to_string(),
        include_sublineages,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn expect(value: &str, include_sublineages: bool) -> FilterExpression {
        FilterExpression::LineageEquals {
            column: "pangoLineage".to_string(),
            value: value.to_string(),
            include_sublineages,
        }
    }

    #[test]
    fn wildcard_suffixes_include_sublineages() {
        assert_eq!(
            lineage_filter("pangoLineage", "B.1.617.2*"),
            Ok(expect("B.1.617.2", true))
        );
        assert_eq!(
            lineage_filter("pangoLineage", "B.1.617.2.*"),
            Ok(expect("B.1.617.2", true))
        );
        assert_eq!(
            lineage_filter("pangoLineage", "B.1.617.2"),
            Ok(expect("B.1.617.2", false))
        );
    }

    #[test]
    fn trailing_dot_suggests_wildcard() {
        let err = lineage_filter("pangoLineage", "B.1.617.2.").expect_err("trailing dot");
        assert!(err.contains("Did you mean 'B.1.617.2.*'?"), "{err}");
    }

    #[test]
    fn bare_wildcard_is_rejected() {
        assert!(lineage_filter("pangoLineage", "*").is_err());
    }
}
