/// Errors reported by the scheduling kernel.
///
/// Contract violations (e.g. removing a task that still has dependencies) are not represented
/// here: they panic.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// The flattened dependencies of a scheduled task contain a cycle.
    #[error("dependency cycle through task of kind '{kind}'")]
    Cycle { kind: String },

    /// Invalid scheduler configuration values.
    #[error("invalid scheduler configuration: {0}")]
    Config(String),

    /// Malformed scheduler configuration document.
    #[error("malformed scheduler configuration: {0}")]
    ConfigParse(#[from] serde_json::Error),

    /// The frame record file could not be written.
    #[error("frame monitor i/o error: {0}")]
    Monitor(#[source] std::io::Error),

    /// A worker thread could not be started.
    #[error("failed to spawn worker thread: {0}")]
    ThreadSpawn(#[source] std::io::Error),
}

impl Error {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
