use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::db::Database;

/// Admin action staged behind an inline confirm/cancel keyboard.
#[derive(Debug, Clone)]
pub enum PendingAdminAction {
    Broadcast { text: String },
    Cleanup { days: i64 },
}

#[derive(Clone)]
pub struct AppState {
    pub db: Database,
    awaiting_image_prompt: Arc<Mutex<HashSet<i64>>>,
    pending_admin_actions: Arc<Mutex<HashMap<i64, PendingAdminAction>>>,
}

impl AppState {
    pub fn new(db: Database) -> Self {
        AppState {
            db,
            awaiting_image_prompt: Arc::new(Mutex::new(HashSet::new())),
            pending_admin_actions: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Marks the user's next text message as an image prompt. Process
    /// lifetime only; a restart drops the expectation and the user simply
    /// re-issues the command.
    pub fn expect_image_prompt(&self, user_id: i64) {
        self.awaiting_image_prompt.lock().insert(user_id);
    }

    /// Atomically checks and clears the awaiting-image-prompt flag, so two
    /// interleaved messages cannot both claim the same expectation.
    pub fn take_image_prompt_expectation(&self, user_id: i64) -> bool {
        self.awaiting_image_prompt.lock().remove(&user_id)
    }

    pub fn stage_admin_action(&self, admin_id: i64, action: PendingAdminAction) {
        self.pending_admin_actions.lock().insert(admin_id, action);
    }

    pub fn take_admin_action(&self, admin_id: i64) -> Option<PendingAdminAction> {
        self.pending_admin_actions.lock().remove(&admin_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::database::test_database;

    #[tokio::test]
    async fn image_prompt_expectation_is_taken_exactly_once() {
        let state = AppState::new(test_database().await);
        assert!(!state.take_image_prompt_expectation(1));

        state.expect_image_prompt(1);
        assert!(state.take_image_prompt_expectation(1));
        assert!(!state.take_image_prompt_expectation(1));
    }

    #[tokio::test]
    async fn admin_actions_are_staged_per_admin() {
        let state = AppState::new(test_database().await);
        state.stage_admin_action(10, PendingAdminAction::Cleanup { days: 30 });

        assert!(state.take_admin_action(11).is_none());
        match state.take_admin_action(10) {
            Some(PendingAdminAction::Cleanup { days }) => assert_eq!(days, 30),
            other => panic!("unexpected action: {other:?}"),
        }
        assert!(state.take_admin_action(10).is_none());
    }
}
