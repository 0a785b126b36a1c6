//! Field vocabulary derived once from the database configuration.
//!
//! Every declared metadata column becomes a [`FieldDescriptor`]; range, regex
//! and query-language companions are synthesized next to it. Lookups are
//! case-insensitive and always hand back the declared spelling.

use std::collections::{HashMap, HashSet};

use serde::Deserialize;

pub const VARIANT_QUERY_FIELD: &str = "variantQuery";
pub const NUCLEOTIDE_MUTATIONS_FIELD: &str = "nucleotideMutations";
pub const AMINO_ACID_MUTATIONS_FIELD: &str = "aminoAcidMutations";
pub const NUCLEOTIDE_INSERTIONS_FIELD: &str = "nucleotideInsertions";
pub const AMINO_ACID_INSERTIONS_FIELD: &str = "aminoAcidInsertions";
pub const REGEX_SUFFIX: &str = ".regex";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OpennessLevel {
    #[default]
    Open,
    Protected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetadataType {
    String,
    PangoLineage,
    Date,
    Int,
    Float,
    Boolean,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetadataDecl {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: MetadataType,
    #[serde(default)]
    pub values_are_unique: bool,
    #[serde(default)]
    pub allow_regex_search: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FeatureDecl {
    pub name: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DatabaseConfig {
    pub instance_name: String,
    #[serde(default)]
    pub openness_level: OpennessLevel,
    pub primary_key: String,
    pub metadata: Vec<MetadataDecl>,
    #[serde(default)]
    pub features: Vec<FeatureDecl>,
    #[serde(default)]
    pub genes: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SequenceKind {
    Nucleotide,
    AminoAcid,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RangeScalar {
    Date,
    Int,
    Float,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RangeEnd {
    From,
    To,
}

/// Semantic kind of a request field. Companion kinds name the base column
/// they belong to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldKind {
    String,
    StringWithRegexSearch(String),
    Date,
    DateFrom(String),
    DateTo(String),
    Int,
    IntFrom(String),
    IntTo(String),
    Float,
    FloatFrom(String),
    FloatTo(String),
    Lineage,
    Boolean,
    MutationQuery(SequenceKind),
    InsertionQuery(SequenceKind),
    VariantQueryLanguage,
}

impl FieldKind {
    /// For `…From`/`…To` kinds: the base column, its scalar type and which end
    /// of the range this field bounds.
    pub fn range_companion(&self) -> Option<(&str, RangeScalar, RangeEnd)> {
        match self {
            FieldKind::DateFrom(base) => Some((base, RangeScalar::Date, RangeEnd::From)),
            FieldKind::DateTo(base) => Some((base, RangeScalar::Date, RangeEnd::To)),
            FieldKind::IntFrom(base) => Some((base, RangeScalar::Int, RangeEnd::From)),
            FieldKind::IntTo(base) => Some((base, RangeScalar::Int, RangeEnd::To)),
            FieldKind::FloatFrom(base) => Some((base, RangeScalar::Float, RangeEnd::From)),
            FieldKind::FloatTo(base) => Some((base, RangeScalar::Float, RangeEnd::To)),
            _ => None,
        }
    }

    pub fn range_scalar(&self) -> Option<RangeScalar> {
        match self {
            FieldKind::Date => Some(RangeScalar::Date),
            FieldKind::Int => Some(RangeScalar::Int),
            FieldKind::Float => Some(RangeScalar::Float),
            other => other.range_companion().map(|(_, scalar, _)| scalar),
        }
    }

    /// True for kinds that correspond to a real metadata column.
    pub fn is_metadata(&self) -> bool {
        matches!(
            self,
            FieldKind::String
                | FieldKind::Date
                | FieldKind::Int
                | FieldKind::Float
                | FieldKind::Lineage
                | FieldKind::Boolean
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldDescriptor {
    pub name: String,
    pub kind: FieldKind,
}

#[derive(Debug, thiserror::Error)]
pub enum SchemaError {
    #[error("invalid database config: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("field name must be non-empty")]
    EmptyFieldName,
    #[error("duplicate field name: {0}")]
    DuplicateField(String),
    #[error("primary key {0} is not a declared metadata field")]
    UnknownPrimaryKey(String),
    #[error("duplicate gene name: {0}")]
    DuplicateGene(String),
}

#[derive(Debug, Clone)]
pub struct FieldSchema {
    instance_name: String,
    openness: OpennessLevel,
    primary_key: String,
    fields: Vec<FieldDescriptor>,
    by_lowercase: HashMap<String, usize>,
    identifying: HashSet<String>,
    genes: Vec<String>,
    default_lineage_field: Option<String>,
}

impl FieldSchema {
    pub fn from_json_str(raw: &str) -> Result<Self, SchemaError> {
        let config: DatabaseConfig = serde_json::from_str(raw)?;
        Self::from_config(config)
    }

    pub fn from_config(config: DatabaseConfig) -> Result<Self, SchemaError> {
        let mut schema = FieldSchema {
            instance_name: config.instance_name,
            openness: config.openness_level,
            primary_key: String::new(),
            fields: Vec::new(),
            by_lowercase: HashMap::new(),
            identifying: HashSet::new(),
            genes: Vec::new(),
            default_lineage_field: None,
        };

        for decl in &config.metadata {
            if decl.name.trim().is_empty() {
                return Err(SchemaError::EmptyFieldName);
            }
            let name = decl.name.clone();
            match decl.kind {
                MetadataType::String => {
                    schema.push(&name, FieldKind::String)?;
                    if decl.allow_regex_search {
                        schema.push(
                            &format!("{name}{REGEX_SUFFIX}"),
                            FieldKind::StringWithRegexSearch(name.clone()),
                        )?;
                    }
                }
                MetadataType::PangoLineage => {
                    schema.push(&name, FieldKind::Lineage)?;
                    if schema.default_lineage_field.is_none() {
                        schema.default_lineage_field = Some(name.clone());
                    }
                }
                MetadataType::Boolean => schema.push(&name, FieldKind::Boolean)?,
                MetadataType::Date => {
                    schema.push(&name, FieldKind::Date)?;
                    schema.push(&format!("{name}From"), FieldKind::DateFrom(name.clone()))?;
                    schema.push(&format!("{name}To"), FieldKind::DateTo(name.clone()))?;
                }
                MetadataType::Int => {
                    schema.push(&name, FieldKind::Int)?;
                    schema.push(&format!("{name}From"), FieldKind::IntFrom(name.clone()))?;
                    schema.push(&format!("{name}To"), FieldKind::IntTo(name.clone()))?;
                }
                MetadataType::Float => {
                    schema.push(&name, FieldKind::Float)?;
                    schema.push(&format!("{name}From"), FieldKind::FloatFrom(name.clone()))?;
                    schema.push(&format!("{name}To"), FieldKind::FloatTo(name.clone()))?;
                }
            }
            if decl.values_are_unique {
                schema.identifying.insert(name);
            }
        }

        if config.features.iter().any(|f| f.name == VARIANT_QUERY_FIELD) {
            schema.push(VARIANT_QUERY_FIELD, FieldKind::VariantQueryLanguage)?;
        }
        schema.push(
            NUCLEOTIDE_MUTATIONS_FIELD,
            FieldKind::MutationQuery(SequenceKind::Nucleotide),
        )?;
        schema.push(
            NUCLEOTIDE_INSERTIONS_FIELD,
            FieldKind::InsertionQuery(SequenceKind::Nucleotide),
        )?;
        if !config.genes.is_empty() {
            schema.push(
                AMINO_ACID_MUTATIONS_FIELD,
                FieldKind::MutationQuery(SequenceKind::AminoAcid),
            )?;
            schema.push(
                AMINO_ACID_INSERTIONS_FIELD,
                FieldKind::InsertionQuery(SequenceKind::AminoAcid),
            )?;
        }

        let mut seen_genes = HashSet::new();
        for gene in config.genes {
            if !seen_genes.insert(gene.to_lowercase()) {
                return Err(SchemaError::DuplicateGene(gene));
            }
            schema.genes.push(gene);
        }

        let primary_key = match schema.resolve(&config.primary_key) {
            Some(descriptor) if descriptor.kind.is_metadata() => descriptor.name.clone(),
            _ => return Err(SchemaError::UnknownPrimaryKey(config.primary_key)),
        };
        schema.identifying.insert(primary_key.clone());
        schema.primary_key = primary_key;

        Ok(schema)
    }

    fn push(&mut self, name: &str, kind: FieldKind) -> Result<(), SchemaError> {
        let key = name.to_lowercase();
        if self.by_lowercase.contains_key(&key) {
            return Err(SchemaError::DuplicateField(name.to_string()));
        }
        self.by_lowercase.insert(key, self.fields.len());
        self.fields.push(FieldDescriptor {
            name: name.to_string(),
            kind,
        });
        Ok(())
    }

    pub fn resolve(&self, name: &str) -> Option<&FieldDescriptor> {
        self.by_lowercase
            .get(&name.to_lowercase())
            .map(|idx| &self.fields[*idx])
    }

    /// Canonical spelling of a metadata column, or `None` for unknown or
    /// synthesized names.
    pub fn metadata_field(&self, name: &str) -> Option<&str> {
        self.resolve(name)
            .filter(|d| d.kind.is_metadata())
            .map(|d| d.name.as_str())
    }

    pub fn metadata_field_names(&self) -> Vec<&str> {
        self.fields
            .iter()
            .filter(|d| d.kind.is_metadata())
            .map(|d| d.name.as_str())
            .collect()
    }

    pub fn field_names(&self) -> Vec<&str> {
        self.fields.iter().map(|d| d.name.as_str()).collect()
    }

    /// Primary key or a column whose values are declared unique per sequence.
    pub fn is_identifying(&self, field: &str) -> bool {
        self.identifying.contains(field)
            || self
                .metadata_field(field)
                .is_some_and(|canonical| self.identifying.contains(canonical))
    }

    pub fn resolve_gene(&self, gene: &str) -> Option<&str> {
        self.genes
            .iter()
            .find(|g| g.eq_ignore_ascii_case(gene))
            .map(String::as_str)
    }

    pub fn genes(&self) -> &[String] {
        &self.genes
    }

    pub fn default_lineage_field(&self) -> Option<&str> {
        self.default_lineage_field.as_deref()
    }

    pub fn primary_key(&self) -> &str {
        &self.primary_key
    }

    pub fn openness(&self) -> OpennessLevel {
        self.openness
    }

    pub fn instance_name(&self) -> &str {
        &self.instance_name
    }
}
