//! Shared error and return-code mapping of the driver commands.

/// Process return codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReturnCode {
    Success = 0,
    ConfigError = 1,
    CatalogError = 2,
    IoError = 3,
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("cannot access the catalog store: {source}")]
    CatalogAccess {
        #[from]
        source: sqlx::Error,
    },

    #[error("catalog error: {source}")]
    Catalog {
        #[from]
        source: routing_catalog::interface::Error,
    },

    #[error("harvesting failed: {source}")]
    Harvest {
        #[from]
        source: harvester::Error,
    },

    #[error("harvesting failed for all {attempted} data center(s)")]
    AllCentersFailed { attempted: usize },

    #[error("i/o error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },

    #[error("server error: {source}")]
    Hyper {
        #[from]
        source: hyper::Error,
    },
}

impl Error {
    /// The process return code the error maps to.
    pub fn return_code(&self) -> ReturnCode {
        match self {
            Self::Config(_) => ReturnCode::ConfigError,
            Self::CatalogAccess { .. }
            | Self::Catalog { .. }
            | Self::Harvest { .. }
            | Self::AllCentersFailed { .. } => ReturnCode::CatalogError,
            Self::Io { .. } | Self::Hyper { .. } => ReturnCode::IoError,
        }
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn return_codes_are_stable() {
        assert_eq!(ReturnCode::Success as i32, 0);
        assert_eq!(ReturnCode::ConfigError as i32, 1);
        assert_eq!(ReturnCode::CatalogError as i32, 2);
        assert_eq!(ReturnCode::IoError as i32, 3);

        assert_eq!(
            Error::Config("bad flag".to_string()).return_code(),
            ReturnCode::ConfigError
        );
        assert_eq!(
            Error::Io {
                source: std::io::Error::new(std::io::ErrorKind::Other, "disk full")
            }
            .return_code(),
            ReturnCode::IoError
        );
    }
}
