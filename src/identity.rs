//! Identity service, shared by both plugin roles.

use crate::csi::{GetPluginCapabilitiesResponse, GetPluginInfoResponse, PluginCapability, ProbeResponse};

#[derive(Debug, Clone)]
pub struct IdentityService {
    plugin_name: String,
    controller: bool,
}

impl IdentityService {
    /// `controller` tells whether this process serves the controller role.
    pub fn new(plugin_name: impl Into<String>, controller: bool) -> Self {
        Self {
            plugin_name: plugin_name.into(),
            controller,
        }
    }

    pub fn get_plugin_info(&self) -> GetPluginInfoResponse {
        GetPluginInfoResponse {
            name: self.plugin_name.clone(),
            vendor_version: crate::VERSION.to_string(),
        }
    }

    pub fn probe(&self) -> ProbeResponse {
        ProbeResponse { ready: true }
    }

    pub fn get_plugin_capabilities(&self) -> GetPluginCapabilitiesResponse {
        let capabilities = if self.controller {
            vec![PluginCapability::ControllerService]
        } else {
            Vec::new()
        };
        GetPluginCapabilitiesResponse { capabilities }
    }
}
