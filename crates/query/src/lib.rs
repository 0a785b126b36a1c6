//! Request lowering: field/value maps and the variant query language both
//! compile to the canonical [`genq_contracts::FilterExpression`].

mod compiler;
mod error;
mod lineage;
pub mod mutation;
mod request;
mod variant;

pub use compiler::FilterCompiler;
pub use error::QueryError;
pub use lineage::lineage_filter;
pub use request::{
    ACCESS_KEY_PROPERTY, ActionKind, FIELDS_PROPERTY, LIMIT_PROPERTY, MIN_PROPORTION_PROPERTY,
    OFFSET_PROPERTY, ORDER_BY_PROPERTY, RequestFields,
};
pub use variant::parse_variant_query;
