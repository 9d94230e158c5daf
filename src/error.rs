use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    #[error("No home directory")]
    NoHomeDir,

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Task join error: {0}")]
    TaskJoin(String),

    // Planning
    #[error("Circular dependency detected: {}", cycle.join(" -> "))]
    CircularDependency { cycle: Vec<String> },

    #[error("Skill {skill} depends on undeclared skill {dependency}")]
    MissingDependency { skill: String, dependency: String },

    #[error("Skill declared more than once: {0}")]
    DuplicateSkill(String),

    #[error("Skill not found: {0}")]
    SkillNotFound(String),

    #[error("Planning failed: {0}")]
    Planning(String),

    // State
    #[error("Checkpoint not found: {0}")]
    CheckpointNotFound(String),

    #[error("Checkpoint {id} is corrupt: {reason}")]
    CheckpointCorrupt { id: String, reason: String },

    // Orchestrator
    #[error("Cannot {operation} while orchestrator is {state}")]
    InvalidState { operation: String, state: String },

    #[error("Critical step {step} ({skill}) failed: {error}")]
    CriticalStepFailure {
        step: usize,
        skill: String,
        error: String,
    },

    #[error("Execution cancelled: {0}")]
    Cancelled(String),

    #[error("Event sink error: {0}")]
    EventSink(String),

    // Decisions
    #[error("Decision {decision_id} has no option {option_id}")]
    UnknownOption {
        decision_id: String,
        option_id: String,
    },

    #[error("Decision already resolved: {0}")]
    AlreadyResolved(String),

    #[error("Decision not found: {0}")]
    DecisionNotFound(String),
}

pub type Result<T> = std::result::Result<T, Error>;
