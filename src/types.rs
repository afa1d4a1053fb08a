//! CNI result payloads written to stdout.

use std::io::{self, Write};
use std::net::IpAddr;
use std::path::Path;

use ipnetwork::IpNetwork;
use serde::Serialize;
use serde_json::Value;

use crate::config::SUPPORTED_VERSIONS;
use crate::configure::ContainerLink;
use crate::error::Error;
use crate::ipam::AddressLease;
use crate::link::LinkPair;

#[derive(Debug, Clone, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AttachResult {
    pub cni_version: String,
    pub interfaces: Vec<Interface>,
    pub ips: Vec<IpConfig>,
    pub routes: Vec<Route>,
    /// passed through from the allocator
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dns: Option<Value>,
}

#[derive(Debug, Clone, Eq, PartialEq, Serialize)]
pub struct Interface {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mac: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sandbox: Option<String>,
}

#[derive(Debug, Clone, Eq, PartialEq, Serialize)]
pub struct IpConfig {
    pub address: IpNetwork,
    pub gateway: IpAddr,
    /// index into `interfaces`
    pub interface: usize,
}

#[derive(Debug, Clone, Eq, PartialEq, Serialize)]
pub struct Route {
    pub dst: IpNetwork,
    pub gw: IpAddr,
}

impl AttachResult {
    pub fn new(
        cni_version: &str,
        pair: &LinkPair,
        if_name: &str,
        netns: &Path,
        container_link: &ContainerLink,
        lease: &AddressLease,
    ) -> Self {
        Self {
            cni_version: cni_version.to_string(),
            interfaces: vec![
                Interface {
                    name: pair.host_name.clone(),
                    mac: pair.host_mac.clone(),
                    sandbox: None,
                },
                Interface {
                    name: if_name.to_string(),
                    mac: container_link.mac.clone(),
                    sandbox: Some(netns.to_string_lossy().to_string()),
                },
            ],
            ips: vec![IpConfig {
                address: lease.address,
                gateway: lease.gateway,
                interface: 1,
            }],
            routes: container_link
                .routes
                .iter()
                .map(|dst| Route {
                    dst: *dst,
                    gw: lease.gateway,
                })
                .collect(),
            dns: lease
                .allocator_state
                .get("dns")
                .filter(|dns| !dns.is_null())
                .cloned(),
        }
    }
}

#[derive(Debug, Clone, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorResult {
    pub cni_version: String,
    pub code: u32,
    pub msg: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub details: String,
}

impl ErrorResult {
    pub fn new(cni_version: &str, container_id: Option<&str>, err: &Error) -> Self {
        let details = err.details();
        let details = match container_id {
            // allocator details already name the container
            Some(container_id) if !matches!(err, Error::AllocatorError { .. }) => {
                if details.is_empty() {
                    format!("container {}", container_id)
                } else {
                    format!("container {}: {}", container_id, details)
                }
            }

            _ => details,
        };

        Self {
            cni_version: cni_version.to_string(),
            code: err.code(),
            msg: err.to_string(),
            details,
        }
    }
}

#[derive(Debug, Clone, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VersionResult {
    pub cni_version: String,
    pub supported_versions: Vec<String>,
}

impl VersionResult {
    pub fn new(cni_version: &str) -> Self {
        Self {
            cni_version: cni_version.to_string(),
            supported_versions: SUPPORTED_VERSIONS.iter().map(|v| v.to_string()).collect(),
        }
    }
}

pub fn write_result<T: Serialize, W: Write>(mut writer: W, result: &T) -> io::Result<()> {
    serde_json::to_writer_pretty(&mut writer, result)?;
    writer.write_all(b"\n")?;

    writer.flush()
}
