//! API models

use serde::{Deserialize, Serialize};

/// Envelope wrapping every successful response body
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataEnvelope<T> {
    pub data: T,
}

/// Instance launch request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LaunchInstanceRequest {
    pub region_name: String,
    pub instance_type_name: String,
    pub ssh_key_names: Vec<String>,
    pub quantity: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

/// Instance launch response payload
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LaunchInstanceData {
    pub instance_ids: Vec<String>,
}

/// Instance termination request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TerminateInstancesRequest {
    pub instance_ids: Vec<String>,
}

/// Instance termination response payload
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TerminateInstancesData {
    #[serde(default)]
    pub terminated_instances: Vec<Instance>,
}

/// Instance lifecycle status as reported by the provider
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstanceStatus {
    Booting,
    Active,
    Unhealthy,
    Terminating,
    Terminated,
    #[serde(other)]
    Unknown,
}

/// Region descriptor
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Region {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
}

/// Instance type descriptor
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceType {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
}

/// Instance info
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Instance {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub ip: Option<String>,
    pub status: InstanceStatus,
    #[serde(default)]
    pub region: Option<Region>,
    #[serde(default)]
    pub instance_type: Option<InstanceType>,
}

/// Error body
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiError {
    pub code: String,
    pub message: String,
    #[serde(default)]
    pub suggestion: Option<String>,
}

/// Error response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: ApiError,
}
