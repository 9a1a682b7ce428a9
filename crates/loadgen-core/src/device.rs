use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// A provisioned device. Read-only for the lifetime of a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Device {
    pub device_id: String,
    pub tenant_id: String,
    /// Defaults to the device id when the registry did not assign one
    #[serde(default)]
    pub auth_id: Option<String>,
    pub password: String,
}

impl Device {
    pub fn new(
        device_id: impl Into<String>,
        tenant_id: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Self {
            device_id: device_id.into(),
            tenant_id: tenant_id.into(),
            auth_id: None,
            password: password.into(),
        }
    }

    pub fn auth_id(&self) -> &str {
        self.auth_id.as_deref().unwrap_or(&self.device_id)
    }

    /// Username presented to protocol adapters: `auth-id@tenant`.
    pub fn username(&self) -> String {
        format!("{}@{}", self.auth_id(), self.tenant_id)
    }
}

/// Load the device list handed over by the provisioning step.
pub fn load_devices(path: impl AsRef<Path>) -> Result<Vec<Device>> {
    let path = path.as_ref();
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read device file {:?}", path))?;
    let devices: Vec<Device> = serde_json::from_str(&contents)
        .with_context(|| format!("Failed to parse device file {:?}", path))?;
    Ok(devices)
}

/// Distinct tenant ids in first-seen order.
pub fn tenant_ids(devices: &[Device]) -> Vec<String> {
    let mut tenants: Vec<String> = Vec::new();
    for device in devices {
        if !tenants.iter().any(|t| t == &device.tenant_id) {
            tenants.push(device.tenant_id.clone());
        }
    }
    tenants
}
