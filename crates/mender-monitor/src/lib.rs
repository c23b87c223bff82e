//! Failure monitoring: the shared store, the layout router that decides
//! between the full failure list and a selected failure's detail, and the
//! service that acts on retry/escalate intents.

pub mod failure;
pub mod layout;
pub mod service;
pub mod store;

pub use failure::{Failure, FailureInput, FailureStats};
pub use layout::{CenterView, IntentHandler, LayoutView, MonitoringLayout};
pub use service::FailureService;
pub use store::{ActivityEvent, ActivityKind, MonitorStore};
