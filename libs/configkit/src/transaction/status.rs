use parking_lot::Mutex;

use crate::errors::ConfigError;

/// `Open -> Validating -> CommitStarted -> {Committed | Aborted}`
///
/// Validation may return to `Open` when it fails; `Aborted` is reachable from
/// every non-terminal state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransactionState {
    Open,
    Validating,
    CommitStarted,
    Committed,
    Aborted,
}

impl TransactionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, TransactionState::Committed | TransactionState::Aborted)
    }
}

/// Shared, lock-guarded state of one transaction.
#[derive(Debug)]
pub struct TransactionStatus {
    state: Mutex<TransactionState>,
}

impl Default for TransactionStatus {
    fn default() -> Self {
        Self::new()
    }
}

impl TransactionStatus {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(TransactionState::Open),
        }
    }

    pub fn state(&self) -> TransactionState {
        *self.state.lock()
    }

    /// Modules may be created, reconfigured or destroyed only while open.
    pub fn is_modification_allowed(&self) -> bool {
        self.state() == TransactionState::Open
    }

    pub fn is_aborted_or_committed(&self) -> bool {
        self.state().is_terminal()
    }

    pub fn begin_validation(&self) -> Result<(), ConfigError> {
        let mut state = self.state.lock();
        match *state {
            TransactionState::Open => {
                *state = TransactionState::Validating;
                Ok(())
            }
            other => Err(ConfigError::illegal_state(format!(
                "cannot start validation in state {other:?}"
            ))),
        }
    }

    /// Returns to `Open` after a validation pass that did not lead to commit.
    pub fn end_validation(&self) {
        let mut state = self.state.lock();
        if *state == TransactionState::Validating {
            *state = TransactionState::Open;
        }
    }

    /// Single atomic check-and-set; after this point modules are immutable.
    pub fn set_commit_started(&self) -> Result<(), ConfigError> {
        let mut state = self.state.lock();
        match *state {
            TransactionState::Open | TransactionState::Validating => {
                *state = TransactionState::CommitStarted;
                Ok(())
            }
            other => Err(ConfigError::illegal_state(format!(
                "cannot start commit in state {other:?}"
            ))),
        }
    }

    pub fn set_committed(&self) -> Result<(), ConfigError> {
        let mut state = self.state.lock();
        match *state {
            TransactionState::CommitStarted => {
                *state = TransactionState::Committed;
                Ok(())
            }
            other => Err(ConfigError::illegal_state(format!(
                "cannot mark committed in state {other:?}"
            ))),
        }
    }

    pub fn set_aborted(&self) -> Result<(), ConfigError> {
        let mut state = self.state.lock();
        match *state {
            TransactionState::Committed => Err(ConfigError::illegal_state(
                "cannot abort a committed transaction",
            )),
            _ => {
                *state = TransactionState::Aborted;
                Ok(())
            }
        }
    }

    pub fn check_not_committed(&self) -> Result<(), ConfigError> {
        match self.state() {
            TransactionState::Committed => Err(ConfigError::illegal_state(
                "transaction is already committed",
            )),
            _ => Ok(()),
        }
    }

    pub fn check_not_aborted(&self) -> Result<(), ConfigError> {
        match self.state() {
            TransactionState::Aborted => Err(ConfigError::illegal_state(
                "transaction is aborted",
            )),
            _ => Ok(()),
        }
    }

    pub fn check_not_commit_started(&self) -> Result<(), ConfigError> {
        match self.state() {
            TransactionState::CommitStarted | TransactionState::Committed => Err(
                ConfigError::illegal_state("commit was already started"),
            ),
            _ => Ok(()),
        }
    }

    pub fn check_commit_started(&self) -> Result<(), ConfigError> {
        match self.state() {
            TransactionState::CommitStarted | TransactionState::Committed => Ok(()),
            other => Err(ConfigError::illegal_state(format!(
                "commit was not started (state {other:?})"
            ))),
        }
    }
}
