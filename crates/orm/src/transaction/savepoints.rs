//! Transaction nesting state and savepoint naming

use crate::error::{OrmError, OrmResult};

/// Handle for one open transaction level.
///
/// Depth 1 is the outermost transaction; deeper levels are savepoints.
#[derive(Debug, PartialEq, Eq)]
#[must_use = "an open transaction level must be committed or rolled back"]
pub struct AtomicToken {
    depth: usize,
    savepoint: Option<String>,
}

impl AtomicToken {
    pub fn depth(&self) -> usize {
        self.depth
    }

    pub fn savepoint(&self) -> Option<&str> {
        self.savepoint.as_deref()
    }

    pub fn is_outermost(&self) -> bool {
        self.savepoint.is_none()
    }
}

/// Per-session nesting state
#[derive(Debug, Default)]
pub struct TransactionState {
    depth: usize,
    savepoints: Vec<String>,
    sequence: u64,
}

impl TransactionState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn depth(&self) -> usize {
        self.depth
    }

    pub fn is_active(&self) -> bool {
        self.depth > 0
    }

    /// Open savepoint names, outermost first
    pub fn savepoints(&self) -> &[String] {
        &self.savepoints
    }

    /// Token for the next level. The state changes only once `enter`
    /// confirms the store opened it.
    pub(crate) fn plan(&mut self) -> AtomicToken {
        let depth = self.depth + 1;
        if depth == 1 {
            return AtomicToken {
                depth,
                savepoint: None,
            };
        }
        self.sequence += 1;
        AtomicToken {
            depth,
            savepoint: Some(format!("sp_{}_{}", depth, self.sequence)),
        }
    }

    pub(crate) fn enter(&mut self, token: &AtomicToken) {
        self.depth = token.depth;
        if let Some(name) = &token.savepoint {
            self.savepoints.push(name.clone());
        }
    }

    /// Tokens may only close the innermost open level
    pub(crate) fn check_top(&self, token: &AtomicToken) -> OrmResult<()> {
        let top = self.savepoints.last().map(String::as_str);
        if token.depth != self.depth || token.savepoint() != (if token.depth > 1 { top } else { None }) {
            return Err(OrmError::Transaction(format!(
                "out-of-order transaction exit: token at depth {} but innermost open level is {}",
                token.depth, self.depth
            )));
        }
        Ok(())
    }

    pub(crate) fn exit(&mut self) {
        if self.depth > 1 {
            self.savepoints.pop();
        }
        self.depth = self.depth.saturating_sub(1);
    }

    /// Token for the innermost open level
    pub(crate) fn top(&self) -> Option<AtomicToken> {
        match self.depth {
            0 => None,
            1 => Some(AtomicToken {
                depth: 1,
                savepoint: None,
            }),
            depth => Some(AtomicToken {
                depth,
                savepoint: self.savepoints.last().cloned(),
            }),
        }
    }

    pub(crate) fn reset(&mut self) {
        self.depth = 0;
        self.savepoints.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_savepoint_names_are_unique_per_session() {
        let mut state = TransactionState::new();
        let outer = state.plan();
        assert!(outer.is_outermost());
        state.enter(&outer);

        let first = state.plan();
        assert_eq!(first.savepoint(), Some("sp_2_1"));
        state.enter(&first);
        state.check_top(&first).unwrap();
        state.exit();

        let second = state.plan();
        assert_eq!(second.savepoint(), Some("sp_2_2"));
        state.enter(&second);
        assert_eq!(state.savepoints(), ["sp_2_2".to_string()]);
    }

    #[test]
    fn test_check_top_rejects_outer_token() {
        let mut state = TransactionState::new();
        let outer = state.plan();
        state.enter(&outer);
        let inner = state.plan();
        state.enter(&inner);

        assert!(matches!(state.check_top(&outer), Err(OrmError::Transaction(_))));
        assert_eq!(state.top(), Some(inner));
    }

    #[test]
    fn test_failed_open_leaves_state_untouched() {
        let mut state = TransactionState::new();
        let _never_entered = state.plan();
        assert!(!state.is_active());
        assert_eq!(state.top(), None);
    }
}
