//! Custom Resource Definitions for Vigil

mod monitoring_agent;
mod types;

pub use monitoring_agent::{
    MonitoringAgent, MonitoringAgentSpec, MonitoringAgentStatus, GATEWAY_IMAGE_PATH,
};
pub use types::{resolve_source, CapabilitySpec, ImageStatus, ResolvedSource, ValueSource};
