/// Reasons an [`Orchestrator`] refuses to be constructed or started.
///
/// Everything else in this crate reports through [`eyre::Report`]; construction failures get a
/// concrete type because a host process usually wants to tell a misconfiguration apart from a
/// programming error before it accepts traffic.
///
/// [`Orchestrator`]: crate::Orchestrator
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SetupError {
    /// A required collaborator was never supplied.
    #[error("missing required argument: {0}")]
    MissingArgument(&'static str),

    /// A supplied option is malformed.
    #[error("invalid argument `{name}`: {reason}")]
    InvalidArgument { name: &'static str, reason: String },

    /// The process is not in a state where the operation is allowed.
    #[error("invalid state: {0}")]
    InvalidState(String),
}

impl SetupError {
    pub(crate) fn invalid_argument(name: &'static str, reason: impl Into<String>) -> Self {
        SetupError::InvalidArgument {
            name,
            reason: reason.into(),
        }
    }

    /// Returns true for [`SetupError::InvalidState`].
    pub fn is_invalid_state(&self) -> bool {
        matches!(self, SetupError::InvalidState(_))
    }
}
