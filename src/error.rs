//! Error types for the Parasol runtime

use thiserror::Error;

/// Parasol runtime errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum Error {
    // Call errors
    /// Precondition of a function did not hold for its arguments
    ///
    /// **Triggered by:** Calling a function whose precondition rejects the evaluated arguments
    /// **Example:** `Divide(X, 0)` when the function declares `{Y != 0}`
    /// **Recovery:** Never retried; aborts only the current call chain
    #[error("Precondition violated in {function}: {condition}")]
    PreconditionViolated {
        /// Function name
        function: String,
        /// Description of the failed condition
        condition: String,
    },

    /// Wrong number of arguments supplied to a function
    #[error("Arity mismatch in {function}: expected {expected} arguments, got {got}")]
    ArityMismatch {
        /// Function name
        function: String,
        /// Declared parameter count
        expected: usize,
        /// Supplied argument count
        got: usize,
    },

    // Value errors
    /// Type mismatch error
    ///
    /// **Triggered by:** Operation expecting one type but receiving another
    /// **Example:** `"text" + 5`, `if 3.5 then ...`
    #[error("Type error: expected {expected}, got {got}")]
    TypeError {
        /// Expected type
        expected: String,
        /// Actual type
        got: String,
    },

    /// Division by zero error
    #[error("Division by zero")]
    DivisionByZero,

    /// Invalid operation for given types
    #[error("Invalid operation: {op} on types {left_type} and {right_type}")]
    InvalidOperation {
        /// Operation name
        op: String,
        /// Left operand type
        left_type: String,
        /// Right operand type
        right_type: String,
    },

    // Task errors
    /// A task unit panicked; the panic is re-raised as a failure at its join point
    #[error("Task {task} panicked: {message}")]
    TaskPanicked {
        /// Task identifier
        task: u64,
        /// Panic payload, if it was a string
        message: String,
    },

    /// Work was skipped because a sibling failure raised the cancellation flag
    #[error("Cancelled")]
    Cancelled,

    // Scheduler errors
    /// The operating system refused to start a worker thread
    #[error("Failed to spawn worker thread: {0}")]
    WorkerSpawnFailed(String),

    /// Task submitted to a scheduler that is shutting down
    #[error("Scheduler is shut down")]
    SchedulerShutdown,

    // User-defined
    /// User-defined failure raised by a task body
    #[error("User error: {0}")]
    UserError(String),

    /// General runtime error
    #[error("Runtime error: {0}")]
    RuntimeError(String),
}

/// Error severity classification
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorSeverity {
    /// Fatal error that cannot be recovered from
    Fatal,
    /// Recoverable error that may be handled by the caller
    Recoverable,
    /// Warning that doesn't prevent execution
    Warning,
}

impl Error {
    /// Create a runtime error with a message
    pub fn runtime(msg: impl Into<String>) -> Self {
        Error::RuntimeError(msg.into())
    }

    /// Create a user error with a message
    pub fn user(msg: impl Into<String>) -> Self {
        Error::UserError(msg.into())
    }

    /// Create a precondition violation for `function`
    pub fn precondition(function: impl Into<String>, condition: impl Into<String>) -> Self {
        Error::PreconditionViolated {
            function: function.into(),
            condition: condition.into(),
        }
    }

    /// Classify error severity
    pub fn classify(&self) -> ErrorSeverity {
        match self {
            Error::TaskPanicked { .. } => ErrorSeverity::Fatal,
            Error::WorkerSpawnFailed(_) => ErrorSeverity::Fatal,
            Error::SchedulerShutdown => ErrorSeverity::Fatal,
            Error::DivisionByZero => ErrorSeverity::Fatal,

            Error::PreconditionViolated { .. } => ErrorSeverity::Recoverable,
            Error::ArityMismatch { .. } => ErrorSeverity::Recoverable,
            Error::UserError(_) => ErrorSeverity::Recoverable,

            Error::Cancelled => ErrorSeverity::Warning,
            Error::TypeError { .. } => ErrorSeverity::Warning,

            _ => ErrorSeverity::Recoverable,
        }
    }

    /// True for the bookkeeping error recorded by iterations that were skipped
    /// after a sibling failed; the sibling's error is the one worth reporting.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, Error::Cancelled)
    }
}

/// Result type for Parasol operations
pub type Result<T> = std::result::Result<T, Error>;
