//! Melody sensor core: a declarative rule engine over observed
//! HTTP/HTTPS/TCP/UDP/ICMP events. Packet capture/reassembly, the decoy
//! TLS server, and config/CLI wiring outside this core are external
//! collaborators (see [`event::ReassembledHttpRequest`] and
//! [`event::DecoyHttpRequest`]); this crate is the evaluator they call
//! into and the log format they consume.

pub mod config;
pub mod error;
pub mod evaluator;
pub mod event;
pub mod field;
pub mod loader;
pub mod management;
pub mod payload;
pub mod primitives;
pub mod projector;
pub mod rule;
pub mod session;

pub use config::MelodyConfig;
pub use error::{MelodyError, Result};
pub use evaluator::{evaluate, EvalBudget};
pub use event::{Event, EventKind, EventPayload};
pub use loader::{load_rules, RuleStore};
pub use management::{ManagementState, ShutdownSignal};
pub use projector::{project, LogRecord};
pub use rule::{MatchGroup, Rule};
pub use session::SessionRegistry;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_library_imports() {
        let _ = std::any::type_name::<MelodyConfig>();
        let _ = std::any::type_name::<Event>();
        let _ = std::any::type_name::<Rule>();
        let _ = std::any::type_name::<RuleStore>();
    }
}
