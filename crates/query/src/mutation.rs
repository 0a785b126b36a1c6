//! Mutation shorthand: `[from]<position><to>` for nucleotides and
//! `<gene>:[from]<position><to>` for amino acids.
//!
//! Insertions: `ins_<position>:<symbols>` and `ins_<gene>:<position>:<symbols>`,
//! where `?` (or a literal `.*`) stands for any run of symbols.

use std::num::ParseIntError;

use genq_contracts::FilterExpression;
use genq_contracts::schema::{FieldSchema, SequenceKind};
use nom::{
    IResult,
    branch::alt,
    bytes::complete::{tag, tag_no_case, take_while1},
    character::complete::{char, digit1, satisfy},
    combinator::{all_consuming, map, opt, value},
    error::{ErrorKind, FromExternalError, ParseError},
    multi::fold_many1,
    sequence::{preceded, separated_pair, tuple},
};

use crate::QueryError;

pub const INSERTION_PREFIX: &str = "ins_";
/// Backend wildcard for "any run of symbols" inside an insertion.
pub const INSERTION_WILDCARD: &str = ".*";

/// Nucleotide symbols including IUPAC ambiguity codes, gap `-` and unknown `.`.
pub const NUCLEOTIDE_SYMBOLS: &str = "ACGTURYKMSWBDHVN-.";
/// Amino-acid symbols including ambiguity codes, stop `*`, gap `-` and unknown `.`.
pub const AMINO_ACID_SYMBOLS: &str = "ACDEFGHIKLMNPQRSTVWYBZX*-.";

pub fn is_symbol(kind: SequenceKind, c: char) -> bool {
    let alphabet = match kind {
        SequenceKind::Nucleotide => NUCLEOTIDE_SYMBOLS,
        SequenceKind::AminoAcid => AMINO_ACID_SYMBOLS,
    };
    alphabet.contains(c.to_ascii_uppercase())
}

/// Parses `[from]<position><to>` and yields the 1-based position and the
/// upper-cased target symbol. The reference symbol is accepted but not kept.
///
/// Once digits and a target symbol have matched the input is committed to
/// being a mutation: a position that does not fit a `u32` is a hard failure.
pub(crate) fn symbol_change<'a, E>(
    kind: SequenceKind,
) -> impl FnMut(&'a str) -> IResult<&'a str, (u32, String), E>
where
    E: ParseError<&'a str> + FromExternalError<&'a str, ParseIntError>,
{
    move |input| {
        let (rest, (_, digits, to)) = tuple((
            opt(satisfy(move |c| is_symbol(kind, c))),
            digit1,
            satisfy(move |c| is_symbol(kind, c)),
        ))(input)?;
        let position = digits.parse::<u32>().map_err(|err| {
            nom::Err::Failure(E::from_external_error(digits, ErrorKind::MapRes, err))
        })?;
        if position == 0 {
            return Err(nom::Err::Error(E::from_error_kind(digits, ErrorKind::Verify)));
        }
        Ok((rest, (position, to.to_ascii_uppercase().to_string())))
    }
}

/// Parses `<position>:<symbols>` of an insertion. Symbols are upper-cased and
/// `?` becomes [`INSERTION_WILDCARD`].
pub(crate) fn insertion_site<'a, E>(input: &'a str) -> IResult<&'a str, (u32, String), E>
where
    E: ParseError<&'a str> + FromExternalError<&'a str, ParseIntError>,
{
    let (rest, (digits, pattern)) = separated_pair(
        digit1,
        char(':'),
        fold_many1(
            alt((
                value(None, alt((tag(INSERTION_WILDCARD), tag("?")))),
                map(satisfy(|c: char| c.is_ascii_alphabetic()), Some),
            )),
            String::new,
            |mut acc, symbol: Option<char>| {
                match symbol {
                    Some(c) => acc.push(c.to_ascii_uppercase()),
                    None => acc.push_str(INSERTION_WILDCARD),
                }
                acc
            },
        ),
    )(input)?;
    let position = digits.parse::<u32>().map_err(|err| {
        nom::Err::Failure(E::from_external_error(digits, ErrorKind::MapRes, err))
    })?;
    Ok((rest, (position, pattern)))
}

fn parse_change(body: &str, kind: SequenceKind) -> Option<(u32, String)> {
    all_consuming(symbol_change::<nom::error::Error<&str>>(kind))(body)
        .ok()
        .map(|(_, change)| change)
}

/// Strips an optional case-insensitive `MAYBE( … )` wrapper.
fn unwrap_maybe(token: &str) -> (&str, bool) {
    let lower = token.to_ascii_lowercase();
    if lower.starts_with("maybe(") && token.ends_with(')') {
        (token["maybe(".len()..token.len() - 1].trim(), true)
    } else {
        (token, false)
    }
}

/// Compiles one entry of a `nucleotideMutations`/`aminoAcidMutations` list.
pub fn parse_mutation_token(
    raw: &str,
    kind: SequenceKind,
    schema: &FieldSchema,
) -> Result<FilterExpression, QueryError> {
    let (body, maybe) = unwrap_maybe(raw.trim());
    let syntax_error = || QueryError::MutationSyntax {
        token: raw.to_string(),
        kind,
    };

    let leaf = match kind {
        SequenceKind::Nucleotide => {
            let (position, symbol) = parse_change(body, kind).ok_or_else(syntax_error)?;
            FilterExpression::NucleotideSymbolEquals { position, symbol }
        }
        SequenceKind::AminoAcid => {
            let (gene, change) = body.split_once(':').ok_or_else(syntax_error)?;
            let gene = schema.resolve_gene(gene.trim()).ok_or_else(|| {
                QueryError::validation(
                    genq_contracts::schema::AMINO_ACID_MUTATIONS_FIELD,
                    format!(
                        "unknown gene '{}' in '{raw}', known genes are: {}",
                        gene.trim(),
                        schema.genes().join(", ")
                    ),
                )
            })?;
            let (position, symbol) = parse_change(change.trim(), kind).ok_or_else(syntax_error)?;
            FilterExpression::AminoAcidSymbolEquals {
                gene: gene.to_string(),
                position,
                symbol,
            }
        }
    };

    Ok(if maybe {
        FilterExpression::maybe(leaf)
    } else {
        leaf
    })
}

/// Compiles one entry of a `nucleotideInsertions`/`aminoAcidInsertions` list.
pub fn parse_insertion_token(
    raw: &str,
    kind: SequenceKind,
    schema: &FieldSchema,
) -> Result<FilterExpression, QueryError> {
    type E<'a> = nom::error::Error<&'a str>;
    let syntax_error = || QueryError::InsertionSyntax {
        token: raw.to_string(),
        kind,
    };
    let body = raw.trim();

    match kind {
        SequenceKind::Nucleotide => {
            let (_, (position, value)) =
                all_consuming(preceded(tag_no_case(INSERTION_PREFIX), insertion_site::<E<'_>>))(
                    body,
                )
                .map_err(|_| syntax_error())?;
            Ok(FilterExpression::NucleotideInsertionContains { position, value })
        }
        SequenceKind::AminoAcid => {
            let (site, gene) = tuple((
                tag_no_case::<_, _, E<'_>>(INSERTION_PREFIX),
                take_while1(|c: char| c != ':'),
                char(':'),
            ))(body)
            .map(|(site, (_, gene, _))| (site, gene))
            .map_err(|_| syntax_error())?;
            let gene = schema.resolve_gene(gene).ok_or_else(|| {
                QueryError::validation(
                    genq_contracts::schema::AMINO_ACID_INSERTIONS_FIELD,
                    format!(
                        "unknown gene '{gene}' in '{raw}', known genes are: {}",
                        schema.genes().join(", ")
                    ),
                )
            })?;
            let (_, (position, value)) =
                all_consuming(insertion_site::<E<'_>>)(site).map_err(|_| syntax_error())?;
            Ok(FilterExpression::AminoAcidInsertionContains {
                gene: gene.to_string(),
                position,
                value,
            })
        }
    }
}
