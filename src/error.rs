use thiserror::Error;

/// Which stage of the MailChimp import a failure occurred in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImportStage {
    Metadata,
    Roster,
    Activity,
}

impl std::fmt::Display for ImportStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ImportStage::Metadata => write!(f, "metadata"),
            ImportStage::Roster => write!(f, "roster"),
            ImportStage::Activity => write!(f, "activity"),
        }
    }
}

/// Raised when the mailing-list API reports an invalid list/credential or
/// returns an incomplete response. Never retried by the pipeline itself.
#[derive(Debug, Error)]
#[error("list import failed during {stage} fetch: {detail}")]
pub struct ImportError {
    pub stage: ImportStage,
    pub detail: String,
}

impl ImportError {
    pub fn new(stage: ImportStage, detail: impl Into<String>) -> Self {
        Self {
            stage,
            detail: detail.into(),
        }
    }
}

/// Any failed database read or write. Writes are transactional: the
/// transaction rolls back before this propagates, never leaving a
/// half-written row.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("connection pool error: {0}")]
    Pool(String),
    #[error("corrupt stored value: {0}")]
    Corrupt(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn import_error_names_the_failed_stage() {
        let err = ImportError::new(ImportStage::Roster, "short page");
        assert_eq!(
            err.to_string(),
            "list import failed during roster fetch: short page"
        );
    }
}
