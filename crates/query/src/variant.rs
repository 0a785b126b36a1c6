//! Variant query language.
//!
//! ```text
//! 300G & (400- | 500B) & !600A & MAYBE(700B | 800-) & [3-of: 123A, 234T, 345G]
//! S:N501Y nextcladePangoLineage:jn.1* [exactly-2-of: B.1.1.7, 23403G, ORF1a:3675-]
//! ins_22204:?GAG | ins_S:214:EPE
//! ```
//!
//! A recursive-descent parser built from nom combinators that yields the
//! canonical [`FilterExpression`] directly. `and`/`or` chains are flattened in
//! source order; adjacent terms without an operator are conjoined.

use std::cell::Cell;
use std::num::ParseIntError;

use genq_contracts::FilterExpression;
use genq_contracts::schema::{FieldKind, FieldSchema, SequenceKind};
use nom::{
    IResult,
    branch::alt,
    bytes::complete::{tag, tag_no_case, take_while},
    character::complete::{char, digit1, multispace0, satisfy},
    combinator::{all_consuming, cut, map, map_res, not, opt, recognize},
    error::{ErrorKind, FromExternalError, ParseError},
    multi::{many0, separated_list1},
    sequence::{pair, preceded, terminated, tuple},
};

use crate::QueryError;
use crate::lineage::lineage_filter;
use crate::mutation::{INSERTION_PREFIX, insertion_site, symbol_change};

const KEYWORDS: [&str; 4] = ["and", "or", "not", "maybe"];

/// Deepest allowed nesting of `!`, parentheses, `MAYBE(` and `[n-of:`.
pub const MAX_NESTING_DEPTH: usize = 64;

#[derive(Debug)]
struct Failure<'a> {
    at: &'a str,
    message: String,
}

impl<'a> ParseError<&'a str> for Failure<'a> {
    fn from_error_kind(input: &'a str, _kind: ErrorKind) -> Self {
        let message = if input.trim().is_empty() {
            "unexpected end of query".to_string()
        } else {
            format!("unexpected input '{}'", snippet(input))
        };
        Failure { at: input, message }
    }

    fn append(_input: &'a str, _kind: ErrorKind, other: Self) -> Self {
        other
    }

    // Report whichever alternative got furthest.
    fn or(self, other: Self) -> Self {
        if other.at.len() <= self.at.len() {
            other
        } else {
            self
        }
    }
}

impl<'a> FromExternalError<&'a str, ParseIntError> for Failure<'a> {
    fn from_external_error(input: &'a str, _kind: ErrorKind, e: ParseIntError) -> Self {
        Failure {
            at: input,
            message: format!("invalid number: {e}"),
        }
    }
}

type PResult<'a, T> = IResult<&'a str, T, Failure<'a>>;

fn failure<'a, T>(at: &'a str, message: impl Into<String>) -> PResult<'a, T> {
    Err(nom::Err::Failure(Failure {
        at,
        message: message.into(),
    }))
}

fn snippet(input: &str) -> String {
    let trimmed = input.trim_start();
    let mut out: String = trimmed.chars().take(16).collect();
    if trimmed.chars().count() > 16 {
        out.push('…');
    }
    out
}

fn is_word_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '*')
}

fn boundary(input: &str) -> PResult<'_, ()> {
    not(satisfy(is_word_char))(input)
}

fn space(input: &str) -> PResult<'_, &str> {
    multispace0(input)
}

fn ws<'a, O, F>(inner: F) -> impl FnMut(&'a str) -> PResult<'a, O>
where
    F: FnMut(&'a str) -> PResult<'a, O>,
{
    preceded(space, inner)
}

fn keyword<'a>(word: &'static str) -> impl FnMut(&'a str) -> PResult<'a, &'a str> {
    move |input: &'a str| -> PResult<'a, &'a str> {
        terminated(tag_no_case(word), boundary)(input)
    }
}

fn identifier(input: &str) -> PResult<'_, &str> {
    recognize(pair(
        satisfy(|c: char| c.is_ascii_alphabetic()),
        take_while(|c: char| c.is_ascii_alphanumeric() || c == '_'),
    ))(input)
}

fn lineage_chars(input: &str) -> PResult<'_, &str> {
    recognize(tuple((
        satisfy(|c: char| c.is_ascii_alphabetic()),
        take_while(|c: char| c.is_ascii_alphanumeric() || c == '_' || c == '.'),
        opt(char('*')),
    )))(input)
}

/// A lineage name with an optional trailing wildcard. Keywords are not names.
fn lineage_token(input: &str) -> PResult<'_, &str> {
    let (rest, raw) = lineage_chars(input)?;
    if KEYWORDS.iter().any(|k| raw.eq_ignore_ascii_case(k)) {
        return Err(nom::Err::Error(Failure::from_error_kind(
            input,
            ErrorKind::Verify,
        )));
    }
    let (rest, _) = boundary(rest)?;
    Ok((rest, raw))
}

fn lineage_leaf<'a>(input: &'a str, column: &str) -> PResult<'a, FilterExpression> {
    let (rest, raw) = lineage_token(input)?;
    match lineage_filter(column, raw) {
        Ok(expr) => Ok((rest, expr)),
        Err(message) => failure(input, message),
    }
}

fn chain(
    first: FilterExpression,
    others: Vec<FilterExpression>,
    join: fn(Vec<FilterExpression>) -> FilterExpression,
) -> FilterExpression {
    if others.is_empty() {
        return first;
    }
    let mut children = Vec::with_capacity(others.len() + 1);
    children.push(first);
    children.extend(others);
    join(children)
}

struct VariantParser<'s> {
    schema: &'s FieldSchema,
    depth: Cell<usize>,
}

impl VariantParser<'_> {
    fn expr<'a>(&self, input: &'a str) -> PResult<'a, FilterExpression> {
        let (rest, first) = self.conjunction(input)?;
        let (rest, others) = many0(preceded(
            ws(alt((tag("|"), keyword("or")))),
            cut(|i: &'a str| self.conjunction(i)),
        ))(rest)?;
        Ok((rest, chain(first, others, FilterExpression::Or)))
    }

    fn conjunction<'a>(&self, input: &'a str) -> PResult<'a, FilterExpression> {
        let (rest, first) = self.unary(input)?;
        let (rest, others) = many0(alt((
            preceded(
                ws(alt((tag("&"), keyword("and")))),
                cut(|i: &'a str| self.unary(i)),
            ),
            |i: &'a str| self.unary(i),
        )))(rest)?;
        Ok((rest, chain(first, others, FilterExpression::And)))
    }

    /// Every nested construct re-enters here, so this is where depth is
    /// bounded.
    fn unary<'a>(&self, input: &'a str) -> PResult<'a, FilterExpression> {
        let depth = self.depth.get();
        if depth >= MAX_NESTING_DEPTH {
            return failure(
                input,
                format!("query nests too deeply (more than {MAX_NESTING_DEPTH} levels)"),
            );
        }
        self.depth.set(depth + 1);
        let result = self.unary_inner(input);
        self.depth.set(depth);
        result
    }

    fn unary_inner<'a>(&self, input: &'a str) -> PResult<'a, FilterExpression> {
        alt((
            map(
                preceded(
                    ws(alt((tag("!"), keyword("not")))),
                    cut(|i: &'a str| self.unary(i)),
                ),
                FilterExpression::negate,
            ),
            |i: &'a str| self.primary(i),
        ))(input)
    }

    fn primary<'a>(&self, input: &'a str) -> PResult<'a, FilterExpression> {
        let (input, _) = space(input)?;
        alt((
            preceded(
                char('('),
                cut(terminated(|i: &'a str| self.expr(i), ws(char(')')))),
            ),
            map(
                preceded(
                    pair(keyword("maybe"), ws(char('('))),
                    cut(terminated(|i: &'a str| self.expr(i), ws(char(')')))),
                ),
                FilterExpression::maybe,
            ),
            |i: &'a str| self.n_of(i),
            |i: &'a str| self.leaf(i),
        ))(input)
    }

    fn n_of<'a>(&self, input: &'a str) -> PResult<'a, FilterExpression> {
        let (rest, (_, exactly, n, _)) = tuple((
            char('['),
            map(opt(ws(tag_no_case("exactly-"))), |e: Option<&str>| {
                e.is_some()
            }),
            cut(ws(map_res(digit1, str::parse::<usize>))),
            cut(tag_no_case("-of:")),
        ))(input)?;
        let (rest, children) = cut(separated_list1(
            ws(char(',')),
            |i: &'a str| self.expr(i),
        ))(rest)?;
        let (rest, _) = cut(ws(char(']')))(rest)?;

        if n == 0 || n > children.len() {
            return failure(
                input,
                format!(
                    "N-of needs between 1 and {} matchers, got {n}",
                    children.len()
                ),
            );
        }

        Ok((
            rest,
            FilterExpression::NOf {
                number_of_matchers: n,
                match_exactly: exactly,
                children,
            },
        ))
    }

    fn leaf<'a>(&self, input: &'a str) -> PResult<'a, FilterExpression> {
        alt((
            |i: &'a str| self.insertion_leaf(i),
            |i: &'a str| self.prefixed_leaf(i),
            map(
                terminated(symbol_change(SequenceKind::Nucleotide), boundary),
                |(position, symbol): (u32, String)| FilterExpression::NucleotideSymbolEquals {
                    position,
                    symbol,
                },
            ),
            |i: &'a str| self.bare_lineage(i),
        ))(input)
    }

    /// `ins_<position>:<symbols>` or `ins_<gene>:<position>:<symbols>`.
    /// Committed once the prefix has matched.
    fn insertion_leaf<'a>(&self, input: &'a str) -> PResult<'a, FilterExpression> {
        let (rest, _) = tag_no_case(INSERTION_PREFIX)(input)?;
        let site = |i: &'a str| cut(terminated(insertion_site::<Failure<'a>>, boundary))(i);

        if rest.starts_with(|c: char| c.is_ascii_digit()) {
            let (rest, (position, value)) = site(rest)?;
            return Ok((
                rest,
                FilterExpression::NucleotideInsertionContains { position, value },
            ));
        }

        let (after_gene, name) = cut(terminated(identifier, char(':')))(rest)?;
        let Some(gene) = self.schema.resolve_gene(name) else {
            return failure(rest, format!("'{name}' is not a known gene"));
        };
        let (rest, (position, value)) = site(after_gene)?;
        Ok((
            rest,
            FilterExpression::AminoAcidInsertionContains {
                gene: gene.to_string(),
                position,
                value,
            },
        ))
    }

    /// `<gene>:<mutation>` or `<lineageField>:<lineage>`.
    fn prefixed_leaf<'a>(&self, input: &'a str) -> PResult<'a, FilterExpression> {
        let (rest, name) = terminated(identifier, char(':'))(input)?;

        if let Some(gene) = self.schema.resolve_gene(name) {
            let (rest, (position, symbol)) = cut(terminated(
                symbol_change::<Failure<'a>>(SequenceKind::AminoAcid),
                boundary,
            ))(rest)?;
            return Ok((
                rest,
                FilterExpression::AminoAcidSymbolEquals {
                    gene: gene.to_string(),
                    position,
                    symbol,
                },
            ));
        }

        match self.schema.resolve(name) {
            Some(descriptor) if descriptor.kind == FieldKind::Lineage => {
                cut(|i: &'a str| lineage_leaf(i, &descriptor.name))(rest)
            }
            _ => failure(
                input,
                format!("'{name}' is neither a known gene nor a lineage field"),
            ),
        }
    }

    fn parse_all<'a>(&self, input: &'a str) -> PResult<'a, FilterExpression> {
        all_consuming(terminated(|i: &'a str| self.expr(i), space))(input)
    }

    fn bare_lineage<'a>(&self, input: &'a str) -> PResult<'a, FilterExpression> {
        let (_, _) = lineage_token(input)?;
        match self.schema.default_lineage_field() {
            Some(column) => lineage_leaf(input, column),
            None => failure(input, "this instance has no lineage field to filter on"),
        }
    }
}

/// Parses a variant query into a filter tree.
pub fn parse_variant_query(query: &str, schema: &FieldSchema) -> Result<FilterExpression, QueryError> {
    let parser = VariantParser {
        schema,
        depth: Cell::new(0),
    };

    match parser.parse_all(query) {
        Ok((_, expr)) => Ok(expr),
        Err(nom::Err::Error(e) | nom::Err::Failure(e)) => Err(QueryError::Syntax {
            query: query.to_string(),
            position: query.len() - e.at.len(),
            message: e.message,
        }),
        Err(nom::Err::Incomplete(_)) => Err(QueryError::Syntax {
            query: query.to_string(),
            position: query.len(),
            message: "incomplete query".to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn schema() -> FieldSchema {
        FieldSchema::from_json_str(
            r#"{
                "instanceName": "test",
                "primaryKey": "id",
                "metadata": [
                    {"name": "id", "type": "string"},
                    {"name": "pangoLineage", "type": "pango_lineage"},
                    {"name": "nextcladePangoLineage", "type": "pango_lineage"}
                ],
                "features": [{"name": "variantQuery"}],
                "genes": ["S", "ORF1a"]
            }"#,
        )
        .expect("schema is valid")
    }

    fn parse(query: &str) -> Result<FilterExpression, QueryError> {
        parse_variant_query(query, &schema())
    }

    fn nuc(position: u32, symbol: &str) -> FilterExpression {
        FilterExpression::NucleotideSymbolEquals {
            position,
            symbol: symbol.to_string(),
        }
    }

    fn lineage(column: &str, value: &str, include_sublineages: bool) -> FilterExpression {
        FilterExpression::LineageEquals {
            column: column.to_string(),
            value: value.to_string(),
            include_sublineages,
        }
    }

    #[test]
    fn negation_wraps_single_mutation() {
        assert_eq!(parse("!410A"), Ok(FilterExpression::negate(nuc(410, "A"))));
        assert_eq!(parse("NOT 410A"), Ok(FilterExpression::negate(nuc(410, "A"))));
    }

    #[test]
    fn conjunction_preserves_source_order() {
        let expected = Ok(FilterExpression::And(vec![nuc(300, "G"), nuc(400, "-")]));
        assert_eq!(parse("300G AND 400-"), expected);
        assert_eq!(parse("300G & 400-"), expected);
        assert_eq!(parse("300G 400-"), expected);
    }

    #[test]
    fn chains_are_flattened() {
        assert_eq!(
            parse("300G & 400- & 500B"),
            Ok(FilterExpression::And(vec![
                nuc(300, "G"),
                nuc(400, "-"),
                nuc(500, "B")
            ]))
        );
        assert_eq!(
            parse("300G | 400- or 500B"),
            Ok(FilterExpression::Or(vec![
                nuc(300, "G"),
                nuc(400, "-"),
                nuc(500, "B")
            ]))
        );
    }

    #[test]
    fn and_binds_tighter_than_or() {
        assert_eq!(
            parse("300G & 400- | 500B"),
            Ok(FilterExpression::Or(vec![
                FilterExpression::And(vec![nuc(300, "G"), nuc(400, "-")]),
                nuc(500, "B"),
            ]))
        );
    }

    #[test]
    fn full_example_parses() {
        let expr = parse("300G & (400- | 500B) & !600A & MAYBE(700B | 800-) & [3-of: 123A, 234T, 345G]")
            .expect("example parses");
        let FilterExpression::And(children) = expr else {
            panic!("expected top-level And");
        };
        assert_eq!(children.len(), 5);
        assert_eq!(
            children[3],
            FilterExpression::maybe(FilterExpression::Or(vec![nuc(700, "B"), nuc(800, "-")]))
        );
        assert_eq!(
            children[4],
            FilterExpression::NOf {
                number_of_matchers: 3,
                match_exactly: false,
                children: vec![nuc(123, "A"), nuc(234, "T"), nuc(345, "G")],
            }
        );
    }

    #[test]
    fn exactly_n_of() {
        assert_eq!(
            parse("[exactly-1-of: 300G, B.1.1.7]"),
            Ok(FilterExpression::NOf {
                number_of_matchers: 1,
                match_exactly: true,
                children: vec![nuc(300, "G"), lineage("pangoLineage", "B.1.1.7", false)],
            })
        );
    }

    #[test]
    fn n_of_rejects_more_matchers_than_children() {
        let err = parse("[3-of: 300G, 400A]").expect_err("3 of 2 must fail");
        assert!(matches!(err, QueryError::Syntax { position: 0, .. }), "{err:?}");
    }

    #[test]
    fn lineages_bare_and_prefixed() {
        assert_eq!(
            parse("B.1.617.2*"),
            Ok(lineage("pangoLineage", "B.1.617.2", true))
        );
        assert_eq!(
            parse("nextcladePangoLineage:jn.1*"),
            Ok(lineage("nextcladePangoLineage", "jn.1", true))
        );
        assert_eq!(parse("BA.2.*"), Ok(lineage("pangoLineage", "BA.2", true)));
    }

    #[test]
    fn lineage_with_trailing_dot_is_rejected() {
        let err = parse("300G & B.1.").expect_err("trailing dot");
        match err {
            QueryError::Syntax {
                position, message, ..
            } => {
                assert_eq!(position, 7);
                assert!(message.contains("Did you mean 'B.1.*'?"), "{message}");
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn amino_acid_mutation_resolves_gene() {
        assert_eq!(
            parse("s:n501y"),
            Ok(FilterExpression::AminoAcidSymbolEquals {
                gene: "S".to_string(),
                position: 501,
                symbol: "Y".to_string(),
            })
        );
    }

    #[test]
    fn unknown_prefix_is_an_error() {
        let err = parse("N:203K").expect_err("N is not a gene");
        assert!(matches!(err, QueryError::Syntax { position: 0, .. }), "{err:?}");
    }

    #[test]
    fn mutation_like_lineage_falls_back_to_lineage() {
        assert_eq!(parse("A23.1"), Ok(lineage("pangoLineage", "A23.1", false)));
    }

    #[test]
    fn syntax_errors_carry_position() {
        let err = parse("300G & (400- | 500B").expect_err("unbalanced parenthesis");
        assert!(matches!(err, QueryError::Syntax { position: 19, .. }), "{err:?}");

        let err = parse("300G &").expect_err("dangling operator");
        assert!(matches!(err, QueryError::Syntax { position: 6, .. }), "{err:?}");

        let err = parse("").expect_err("empty query");
        assert!(matches!(err, QueryError::Syntax { position: 0, .. }), "{err:?}");
    }

    #[test]
    fn invalid_symbol_is_a_syntax_error() {
        assert!(matches!(parse("23403Z"), Err(QueryError::Syntax { .. })));
    }

    #[test]
    fn lineage_without_lineage_field_is_rejected() {
        let schema = FieldSchema::from_json_str(
            r#"{"instanceName": "t", "primaryKey": "id",
                "metadata": [{"name": "id", "type": "string"}]}"#,
        )
        .expect("schema is valid");
        assert!(parse_variant_query("300G | 400A", &schema).is_ok());
        assert!(matches!(
            parse_variant_query("B.1", &schema),
            Err(QueryError::Syntax { .. })
        ));
    }

    #[test]
    fn deep_nesting_is_a_syntax_error() {
        let n = 10_000;
        let parens = format!("{}300G{}", "(".repeat(n), ")".repeat(n));
        let negations = format!("{}300G", "!".repeat(n));
        let maybes = format!("{}300G{}", "MAYBE(".repeat(n), ")".repeat(n));
        let n_ofs = format!("{}300G{}", "[1-of: ".repeat(n), "]".repeat(n));

        for query in [parens, negations, maybes, n_ofs] {
            match parse(&query) {
                Err(QueryError::Syntax { message, .. }) => {
                    assert!(message.contains("nests too deeply"), "{message}")
                }
                other => panic!("expected a syntax error, got {other:?}"),
            }
        }
    }

    #[test]
    fn nesting_below_the_limit_parses() {
        let depth = MAX_NESTING_DEPTH / 2;
        let query = format!("{}300G{}", "(".repeat(depth), ")".repeat(depth));
        assert_eq!(parse(&query), Ok(nuc(300, "G")));

        let query = format!("{}300G", "!".repeat(MAX_NESTING_DEPTH - 1));
        assert!(parse(&query).is_ok());
    }

    #[test]
    fn oversized_position_is_not_read_as_lineage() {
        let err = parse("A99999999999G").expect_err("position overflows");
        assert!(matches!(err, QueryError::Syntax { position: 1, .. }), "{err:?}");

        let err = parse("300G | S:N99999999999Y").expect_err("position overflows");
        assert!(matches!(err, QueryError::Syntax { .. }), "{err:?}");
    }

    #[test]
    fn insertions_parse_with_wildcards() {
        assert_eq!(
            parse("ins_22204:?gag | ins_s:214:EPE"),
            Ok(FilterExpression::Or(vec![
                FilterExpression::NucleotideInsertionContains {
                    position: 22204,
                    value: ".*GAG".to_string(),
                },
                FilterExpression::AminoAcidInsertionContains {
                    gene: "S".to_string(),
                    position: 214,
                    value: "EPE".to_string(),
                },
            ]))
        );
    }

    #[test]
    fn malformed_insertions_are_syntax_errors() {
        let err = parse("300G & ins_N:214:EPE").expect_err("N is not a gene");
        assert!(matches!(err, QueryError::Syntax { position: 11, .. }), "{err:?}");

        let err = parse("ins_22204:GA1").expect_err("digit inside insertion");
        assert!(matches!(err, QueryError::Syntax { .. }), "{err:?}");

        let err = parse("ins_22204").expect_err("missing symbols");
        assert!(matches!(err, QueryError::Syntax { .. }), "{err:?}");
    }
}

