use thiserror::Error;

#[derive(Error, Debug)]
pub enum AgentError {
    #[error("failed to load eBPF object for {target}: {reason}")]
    ProgramLoad { target: String, reason: String },

    #[error("failed to attach {program} to {target}: {reason}")]
    Attach {
        program: String,
        target: String,
        reason: String,
    },

    #[error("map {0} not found in eBPF object")]
    MapMissing(String),

    #[error("malformed {kind} record: expected {expected} bytes, got {got}")]
    Decode {
        kind: &'static str,
        expected: usize,
        got: usize,
    },

    #[error("failed to read eBPF object image from {path}: {source}")]
    ImageRead {
        path: String,
        source: std::io::Error,
    },

    #[error("interface {0} has no name in this namespace")]
    UnknownInterface(u32),

    #[error("interface scan failed: {0}")]
    InterfaceScan(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, AgentError>;
