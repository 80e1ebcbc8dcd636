use thiserror::Error;

#[derive(Error, Debug)]
pub enum StateStoreError {
    #[error("Failed to read state file `{path}`: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },

    #[error("Failed to write state file `{path}`: {source}")]
    Write {
        path: String,
        source: std::io::Error,
    },

    #[error("Failed to parse state file `{path}`: {source}")]
    Parse {
        path: String,
        source: serde_json::Error,
    },
}
