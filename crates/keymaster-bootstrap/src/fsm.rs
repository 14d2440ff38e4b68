//! The Bootstrap FSM as an explicit tagged enum (spec.md §4.7/§9): transition methods only touch
//! their own data, never a Store or Transport — the engine that drives this (and any future TUI)
//! is a view over it, not its owner.

use keymaster_core::model::{AccountId, KeyId};
use keymaster_core::error::{KeymasterError, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BootstrapState {
    GenerateKey,
    AwaitConfirm,
    VerifyHostKey {
        offered_algorithm: String,
        offered_blob: Vec<u8>,
    },
    TestConnection {
        accepted_blob: Vec<u8>,
    },
    SelectKeys {
        accepted_blob: Vec<u8>,
    },
    ConfirmDeploy {
        accepted_blob: Vec<u8>,
        key_ids: Vec<KeyId>,
    },
    Deploying {
        accepted_blob: Vec<u8>,
        key_ids: Vec<KeyId>,
    },
    Complete {
        account_id: AccountId,
    },
    /// Terminal. Reached from any state on failure.
    Failed {
        reason: String,
    },
    /// The process exited mid-flight with state not in `{Complete, Failed}`; the Reaper assigns
    /// this on recovery rather than guessing which earlier state was in flight.
    Orphaned,
}

#[derive(Debug, Clone)]
pub struct BootstrapFsm {
    pub session_id: String,
    pub state: BootstrapState,
}

impl BootstrapFsm {
    pub fn new(session_id: String) -> Self {
        BootstrapFsm {
            session_id,
            state: BootstrapState::GenerateKey,
        }
    }

    fn invalid_transition(&self, attempted: &str) -> KeymasterError {
        KeymasterError::Internal(format!(
            "bootstrap session {}: cannot {attempted} from {:?}",
            self.session_id, self.state
        ))
    }

    /// The ephemeral key is generated and the temp-public-key row persisted; present the
    /// paste-once command and wait for operator confirmation.
    pub fn await_confirm(&mut self) -> Result<()> {
        match self.state {
            BootstrapState::GenerateKey => {
                self.state = BootstrapState::AwaitConfirm;
                Ok(())
            }
            _ => Err(self.invalid_transition("await_confirm")),
        }
    }

    /// Operator confirmed installation; the remote host key has been fetched (no prior trust).
    pub fn offer_host_key(&mut self, algorithm: String, blob: Vec<u8>) -> Result<()> {
        match self.state {
            BootstrapState::AwaitConfirm => {
                self.state = BootstrapState::VerifyHostKey {
                    offered_algorithm: algorithm,
                    offered_blob: blob,
                };
                Ok(())
            }
            _ => Err(self.invalid_transition("offer_host_key")),
        }
    }

    /// Operator explicitly accepted the displayed fingerprints.
    pub fn accept_host_key(&mut self) -> Result<()> {
        match &self.state {
            BootstrapState::VerifyHostKey { offered_blob, .. } => {
                let blob = offered_blob.clone();
                self.state = BootstrapState::TestConnection { accepted_blob: blob };
                Ok(())
            }
            _ => Err(self.invalid_transition("accept_host_key")),
        }
    }

    /// The pinned test session succeeded; move on to key selection.
    pub fn test_connection_succeeded(&mut self) -> Result<()> {
        match &self.state {
            BootstrapState::TestConnection { accepted_blob } => {
                self.state = BootstrapState::SelectKeys {
                    accepted_blob: accepted_blob.clone(),
                };
                Ok(())
            }
            _ => Err(self.invalid_transition("test_connection_succeeded")),
        }
    }

    /// The test connection failed; spec.md §4.7 sends the flow back to `GenerateKey` rather than
    /// failing outright, since the operator may simply have mistyped the paste command.
    pub fn test_connection_failed(&mut self) -> Result<()> {
        match &self.state {
            BootstrapState::TestConnection { .. } => {
                self.state = BootstrapState::GenerateKey;
                Ok(())
            }
            _ => Err(self.invalid_transition("test_connection_failed")),
        }
    }

    pub fn select_keys(&mut self, key_ids: Vec<KeyId>) -> Result<()> {
        match &self.state {
            BootstrapState::SelectKeys { accepted_blob } => {
                self.state = BootstrapState::ConfirmDeploy {
                    accepted_blob: accepted_blob.clone(),
                    key_ids,
                };
                Ok(())
            }
            _ => Err(self.invalid_transition("select_keys")),
        }
    }

    pub fn begin_deploy(&mut self) -> Result<()> {
        match &self.state {
            BootstrapState::ConfirmDeploy { accepted_blob, key_ids } => {
                self.state = BootstrapState::Deploying {
                    accepted_blob: accepted_blob.clone(),
                    key_ids: key_ids.clone(),
                };
                Ok(())
            }
            _ => Err(self.invalid_transition("begin_deploy")),
        }
    }

    pub fn complete(&mut self, account_id: AccountId) -> Result<()> {
        match &self.state {
            BootstrapState::Deploying { .. } => {
                self.state = BootstrapState::Complete { account_id };
                Ok(())
            }
            _ => Err(self.invalid_transition("complete")),
        }
    }

    /// Any state may fail; this is the one transition with no precondition on the current state.
    pub fn fail(&mut self, reason: impl Into<String>) {
        self.state = BootstrapState::Failed { reason: reason.into() };
    }

    pub fn orphan(&mut self) {
        self.state = BootstrapState::Orphaned;
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self.state, BootstrapState::Complete { .. } | BootstrapState::Failed { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn happy_path_walks_every_state_in_order() {
        let mut fsm = BootstrapFsm::new("s1".into());
        fsm.await_confirm().unwrap();
        fsm.offer_host_key("ssh-ed25519".into(), b"blob".to_vec()).unwrap();
        fsm.accept_host_key().unwrap();
        fsm.test_connection_succeeded().unwrap();
        fsm.select_keys(vec![1, 2]).unwrap();
        fsm.begin_deploy().unwrap();
        fsm.complete(42).unwrap();
        assert!(matches!(fsm.state, BootstrapState::Complete { account_id: 42 }));
        assert!(fsm.is_terminal());
    }

    #[test]
    fn failed_test_connection_returns_to_generate_key() {
        let mut fsm = BootstrapFsm::new("s1".into());
        fsm.await_confirm().unwrap();
        fsm.offer_host_key("ssh-ed25519".into(), b"blob".to_vec()).unwrap();
        fsm.accept_host_key().unwrap();
        fsm.test_connection_failed().unwrap();
        assert_eq!(fsm.state, BootstrapState::GenerateKey);
    }

    #[test]
    fn out_of_order_transition_is_rejected() {
        let mut fsm = BootstrapFsm::new("s1".into());
        assert!(fsm.accept_host_key().is_err());
    }

    #[test]
    fn fail_is_always_available() {
        let mut fsm = BootstrapFsm::new("s1".into());
        fsm.fail("operator aborted");
        assert!(fsm.is_terminal());
    }
}
