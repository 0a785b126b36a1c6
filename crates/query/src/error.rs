use genq_contracts::schema::SequenceKind;

/// Everything that can go wrong turning request fields into a filter tree.
///
/// All variants except [`QueryError::Internal`] are caused by the caller.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum QueryError {
    #[error("failed to parse variant query '{query}' at position {position}: {message}")]
    Syntax {
        query: String,
        position: usize,
        message: String,
    },
    #[error("invalid {} mutation '{token}'", kind_label(.kind))]
    MutationSyntax { token: String, kind: SequenceKind },
    #[error("invalid {} insertion '{token}'", kind_label(.kind))]
    InsertionSyntax { token: String, kind: SequenceKind },
    #[error("{field}: {message}")]
    Validation { field: String, message: String },
    #[error("unknown field '{field}', known fields are: {valid}")]
    UnknownField { field: String, valid: String },
    #[error("internal error while compiling query: {0}")]
    Internal(String),
}

impl QueryError {
    pub(crate) fn validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        QueryError::Validation {
            field: field.into(),
            message: message.into(),
        }
    }

    pub fn is_internal(&self) -> bool {
        matches!(self, QueryError::Internal(_))
    }
}

fn kind_label(kind: &SequenceKind) -> &'static str {
    match kind {
        SequenceKind::Nucleotide => "nucleotide",
        SequenceKind::AminoAcid => "amino acid",
    }
}
