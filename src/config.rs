use ipnetwork::IpNetwork;
use serde::Deserialize;
use serde_json::Value;
use tracing::error;

use crate::error::Error;

pub const SUPPORTED_VERSIONS: &[&str] = &["0.3.0", "0.3.1", "0.4.0", "1.0.0"];
pub const LATEST_VERSION: &str = "1.0.0";

const DEFAULT_MTU: u32 = 1500;

/// Network config read from stdin. Unknown keys are ignored.
#[derive(Debug, Clone, Eq, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetConf {
    pub cni_version: String,
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub ipam: IpamConf,
    #[serde(default = "default_mtu")]
    pub mtu: u32,
    /// enable forwarding inside the container netns
    #[serde(default = "default_ip_forward")]
    pub ip_forward: bool,
    #[serde(default)]
    pub routes: Vec<RouteConf>,
}

/// Only the delegate plugin is read, the rest belongs to the allocator.
#[derive(Debug, Clone, Eq, PartialEq, Deserialize)]
pub struct IpamConf {
    #[serde(rename = "type")]
    pub kind: String,
}

#[derive(Debug, Clone, Eq, PartialEq, Deserialize)]
pub struct RouteConf {
    pub dst: IpNetwork,
}

fn default_mtu() -> u32 {
    DEFAULT_MTU
}

// forwarding was always switched on by earlier releases
fn default_ip_forward() -> bool {
    true
}

impl NetConf {
    pub fn parse(raw: &[u8]) -> Result<Self, Error> {
        let conf = serde_json::from_slice::<NetConf>(raw).map_err(|err| {
            error!(%err, "decode network config failed");

            Error::ConfigInvalid(err.to_string())
        })?;

        if !SUPPORTED_VERSIONS.contains(&conf.cni_version.as_str()) {
            error!(cni_version = %conf.cni_version, "unsupported cni version");

            return Err(Error::IncompatibleVersion(conf.cni_version));
        }

        for (field, value) in [
            ("name", &conf.name),
            ("type", &conf.kind),
            ("ipam.type", &conf.ipam.kind),
        ] {
            if value.is_empty() {
                error!(field, "empty config field");

                return Err(Error::ConfigInvalid(format!("empty {}", field)));
            }
        }

        if conf.mtu == 0 {
            error!("zero mtu");

            return Err(Error::ConfigInvalid("zero mtu".to_string()));
        }

        Ok(conf)
    }

    pub fn route_destinations(&self) -> Vec<IpNetwork> {
        self.routes.iter().map(|route| route.dst).collect()
    }
}

/// Best effort version lookup for error payloads, the config may be invalid.
pub fn cni_version_of(raw: &[u8]) -> String {
    serde_json::from_slice::<Value>(raw)
        .ok()
        .and_then(|value| {
            value
                .get("cniVersion")
                .and_then(Value::as_str)
                .map(str::to_string)
        })
        .unwrap_or_else(|| LATEST_VERSION.to_string())
}
