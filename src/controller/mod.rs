//! # Controller
//!
//! Domain reconcilers run by [`crate::runtime::Driver`].
//!
//! - `rotation`: keeps the persisted CA and serving certificate valid and feeds the providers
//! - `agent`: keeps agent pods in lockstep with the reference control-plane pods
//! - `api_service`: copies the CA bundle into the aggregated API's APIService

pub mod agent;
pub mod api_service;
pub mod rotation;

pub use agent::{AgentController, AgentError, AgentSettings, AGENT_CONTROLLER, AGENT_KEY};
pub use api_service::{ApiServiceController, ApiServiceError, API_SERVICE_CONTROLLER};
pub use rotation::{
    MaterialState, RotationController, RotationError, RotationReport, RotationSettings,
    ROTATION_CONTROLLER,
};
