use thiserror::Error;

pub type Result<T> = std::result::Result<T, TranscodeError>;

#[derive(Debug, Error)]
pub enum TranscodeError {
    /// Source locator uses a scheme no profile can read from.
    #[error("unsupported source: {0}")]
    UnsupportedSource(String),

    /// The pipeline template could not be turned into a running graph.
    #[error("pipeline build failed: {0}")]
    PipelineBuild(String),

    /// Failure reported by the engine after streaming started.
    #[error("engine runtime error: {0}")]
    EngineRuntime(String),

    /// Attach was attempted on an instance that already tore down.
    #[error("pipeline already terminated")]
    Terminated,

    /// A joining client's queue cannot take the cached header.
    #[error("client queue cannot hold {chunks} header chunks")]
    ClientQueueFull { chunks: usize },

    #[error("declared header box exceeds {limit} bytes")]
    HeaderTooLarge { limit: usize },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl TranscodeError {
    pub fn build(msg: impl Into<String>) -> Self {
        Self::PipelineBuild(msg.into())
    }

    pub fn unsupported(msg: impl Into<String>) -> Self {
        Self::UnsupportedSource(msg.into())
    }
}
