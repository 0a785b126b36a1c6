use genq_contracts::{Order, OrderBy};

pub const ACCESS_KEY_PROPERTY: &str = "accessKey";
pub const FIELDS_PROPERTY: &str = "fields";
pub const ORDER_BY_PROPERTY: &str = "orderBy";
pub const LIMIT_PROPERTY: &str = "limit";
pub const OFFSET_PROPERTY: &str = "offset";
pub const MIN_PROPORTION_PROPERTY: &str = "minProportion";

/// Which backend action a request asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionKind {
    Aggregated,
    Details,
    NucleotideMutations,
    AminoAcidMutations,
}

impl ActionKind {
    pub const ALL: [ActionKind; 4] = [
        ActionKind::Aggregated,
        ActionKind::Details,
        ActionKind::NucleotideMutations,
        ActionKind::AminoAcidMutations,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ActionKind::Aggregated => "aggregated",
            ActionKind::Details => "details",
            ActionKind::NucleotideMutations => "nucleotideMutations",
            ActionKind::AminoAcidMutations => "aminoAcidMutations",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.as_str() == name)
    }

    pub fn is_mutations(self) -> bool {
        matches!(
            self,
            ActionKind::NucleotideMutations | ActionKind::AminoAcidMutations
        )
    }
}

/// Raw request properties as extracted by the HTTP layer, before any
/// validation. Special properties are split off; everything else is a filter.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RequestFields {
    pub filters: Vec<(String, Vec<String>)>,
    pub fields: Vec<String>,
    pub order_by: Vec<OrderBy>,
    pub limit: Option<String>,
    pub offset: Option<String>,
    pub min_proportion: Option<String>,
    pub access_key: Option<String>,
}

fn split_list(values: Vec<String>) -> impl Iterator<Item = String> {
    values.into_iter().flat_map(|value| {
        value
            .split(',')
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(str::to_string)
            .collect::<Vec<_>>()
    })
}

impl RequestFields {
    /// Builds from query-string style pairs; repeated keys accumulate.
    pub fn from_pairs<I>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let mut out = RequestFields::default();
        for (key, value) in pairs {
            out.push(key, vec![value]);
        }
        out
    }

    /// Adds one property. `fields` and `orderBy` accept comma separated lists;
    /// scalar properties keep their last value.
    pub fn push(&mut self, key: String, values: Vec<String>) {
        let is = |name: &str| key.eq_ignore_ascii_case(name);

        if is(FIELDS_PROPERTY) {
            self.fields.extend(split_list(values));
        } else if is(ORDER_BY_PROPERTY) {
            self.order_by.extend(split_list(values).map(|field| OrderBy {
                field,
                order: Order::Ascending,
            }));
        } else if is(LIMIT_PROPERTY) {
            self.limit = values.into_iter().last();
        } else if is(OFFSET_PROPERTY) {
            self.offset = values.into_iter().last();
        } else if is(MIN_PROPORTION_PROPERTY) {
            self.min_proportion = values.into_iter().last();
        } else if is(ACCESS_KEY_PROPERTY) {
            self.access_key = values.into_iter().last();
        } else if let Some((_, existing)) = self.filters.iter_mut().find(|(k, _)| *k == key) {
            existing.extend(values);
        } else {
            self.filters.push((key, values));
        }
    }

    pub fn push_order_by(&mut self, order_by: OrderBy) {
        self.order_by.push(order_by);
    }
}
