pub mod engine;
pub mod fsm;
pub mod reaper;
pub mod registry;

pub use engine::{BootstrapEngine, HostKeyOffer, PasteInstructions};
pub use fsm::{BootstrapFsm, BootstrapState};
pub use reaper::{recover_from_crash, Reaper};
pub use registry::{BootstrapRegistry, RegistryEntry};
