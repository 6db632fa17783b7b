use common::Taxonomy;

#[derive(Debug, thiserror::Error)]
pub enum CatalogError {
    /// Connection/server-selection failures (spec.md §4.B): the calling
    /// loop sleeps and retries on the next tick.
    #[error("catalog unavailable: {0}")]
    Unavailable(#[source] anyhow::Error),
    #[error("catalog operation failed: {0}")]
    Operation(#[source] anyhow::Error),
    #[error("invalid regex: {0}")]
    InvalidRegex(#[from] regex::Error),
}

impl CatalogError {
    pub fn taxonomy(&self) -> Taxonomy {
        match self {
            Self::Unavailable(_) => Taxonomy::Transient,
            Self::Operation(_) => Taxonomy::Transient,
            Self::InvalidRegex(_) => Taxonomy::Validation,
        }
    }
}

impl From<mongodb::error::Error> for CatalogError {
    fn from(err: mongodb::error::Error) -> Self {
        use mongodb::error::ErrorKind;
        match *err.kind {
            ErrorKind::ServerSelection { .. } | ErrorKind::Io(_) => {
                Self::Unavailable(anyhow::anyhow!(err))
            },
            _ => Self::Operation(anyhow::anyhow!(err)),
        }
    }
}
