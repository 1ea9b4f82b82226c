//! Vigil operator: reconciles MonitoringAgent resources into gateway capabilities

#![deny(missing_docs)]

pub mod controller;
pub mod telemetry;
