//! Fleet orchestration: the Deployer, Auditor, Rotator and the fleet selector resolver, per
//! spec.md §4.5–§4.9. Wires the Store and Transport contracts to the Parallel Runner; owns no
//! persistence or transport details itself.

pub mod auditor;
pub mod deployer;
pub mod rotator;
pub mod selector;

pub use auditor::{AuditOutcome, Auditor};
pub use deployer::{DeployOutcome, Deployer, DEFAULT_DEPLOY_TIMEOUT};
pub use rotator::Rotator;
pub use selector::{resolve, Selector};
