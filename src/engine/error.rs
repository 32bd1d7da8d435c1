use ulid::Ulid;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    /// End at or before start.
    InvertedDates,
    TooShort { min_minutes: i64 },
    TooLong { max_hours: i64 },
    /// Exactly one of start/end supplied.
    MissingDate,
    /// Names of every conflicting booking on the stage.
    EventsOverlap(Vec<String>),
    NotFound(Ulid),
    AlreadyExists(Ulid),
    /// A stage, talent or collaborator id absent from the directory.
    UnknownReference { kind: &'static str, id: Ulid },
    LimitExceeded(&'static str),
    WalError(String),
}

impl EngineError {
    /// Rejections of the scheduling pipeline, as opposed to lookups or faults.
    pub fn is_schedule_rejection(&self) -> bool {
        matches!(
            self,
            EngineError::InvertedDates
                | EngineError::TooShort { .. }
                | EngineError::TooLong { .. }
                | EngineError::MissingDate
                | EngineError::EventsOverlap(_)
        )
    }

    /// Metrics label.
    pub fn reason(&self) -> &'static str {
        match self {
            EngineError::InvertedDates => "inverted_dates",
            EngineError::TooShort { .. } => "too_short",
            EngineError::TooLong { .. } => "too_long",
            EngineError::MissingDate => "missing_date",
            EngineError::EventsOverlap(_) => "events_overlap",
            EngineError::NotFound(_) => "not_found",
            EngineError::AlreadyExists(_) => "already_exists",
            EngineError::UnknownReference { .. } => "unknown_reference",
            EngineError::LimitExceeded(_) => "limit_exceeded",
            EngineError::WalError(_) => "wal_error",
        }
    }
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::InvertedDates => write!(f, "end date should be greater than the start date"),
            EngineError::TooShort { min_minutes } => {
                write!(f, "event duration should be at least {min_minutes} minutes")
            }
            EngineError::TooLong { max_hours } => {
                write!(f, "event duration should be at most {max_hours} hours")
            }
            EngineError::MissingDate => {
                write!(f, "start and end should be both null or both set")
            }
            EngineError::EventsOverlap(names) => {
                write!(f, "event overlaps with the following events: {names:?}")
            }
            EngineError::NotFound(id) => write!(f, "not found: {id}"),
            EngineError::AlreadyExists(id) => write!(f, "already exists: {id}"),
            EngineError::UnknownReference { kind, id } => write!(f, "{kind} {id} not found"),
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::WalError(e) => write!(f, "WAL error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}
