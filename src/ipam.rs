use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use bytes::Bytes;
use ipnetwork::IpNetwork;
use serde::Deserialize;
use serde_json::Value;
use tap::TapFallible;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{error, info, warn};

use crate::error::Error;

const COMMAND_ADD: &str = "ADD";
const COMMAND_DEL: &str = "DEL";

/// Identity of a lease: the same request is used to obtain and release it.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct IpamRequest {
    pub plugin: String,
    pub container_id: String,
    pub netns: Option<PathBuf>,
    pub if_name: String,
    pub cni_path: String,
    pub cni_args: Option<String>,
    pub config: Bytes,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AddressLease {
    pub address: IpNetwork,
    pub gateway: IpAddr,
    /// raw allocator result
    pub allocator_state: Value,
}

#[cfg_attr(test, mockall::automock)]
#[async_trait::async_trait]
pub trait Ipam {
    async fn request_lease(&self, request: &IpamRequest) -> Result<AddressLease, Error>;

    async fn release_lease(&self, request: &IpamRequest) -> Result<(), Error>;
}

// unread fields are kept so the schema stays strict
#[allow(dead_code)]
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
struct IpamResult {
    cni_version: String,
    interfaces: Option<Vec<Value>>,
    ips: Vec<IpamIp>,
    routes: Option<Vec<Value>>,
    dns: Option<Value>,
}

#[allow(dead_code)]
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct IpamIp {
    address: IpNetwork,
    gateway: IpAddr,
    interface: Option<usize>,
    // only set by 0.3.x results
    version: Option<String>,
}

#[derive(Debug, Deserialize)]
struct IpamError {
    code: u32,
    msg: String,
    #[serde(default)]
    details: String,
}

/// Runs the IPAM plugin named in the config as a CNI subprocess.
#[derive(Debug, Default)]
pub struct ExecIpam;

impl ExecIpam {
    fn allocator_error(request: &IpamRequest, command: &'static str, msg: String) -> Error {
        Error::AllocatorError {
            plugin: request.plugin.clone(),
            command,
            code: None,
            msg,
            details: format!("container {}", request.container_id),
        }
    }

    fn find_plugin(request: &IpamRequest, command: &'static str) -> Result<PathBuf, Error> {
        if request.plugin.is_empty() || request.plugin.contains('/') {
            error!(plugin = %request.plugin, "invalid ipam plugin name");

            return Err(Self::allocator_error(
                request,
                command,
                format!("invalid plugin name {:?}", request.plugin),
            ));
        }

        request
            .cni_path
            .split(':')
            .filter(|dir| !dir.is_empty())
            .map(|dir| Path::new(dir).join(&request.plugin))
            .find(|path| path.is_file())
            .ok_or_else(|| {
                error!(plugin = %request.plugin, cni_path = %request.cni_path, "ipam plugin not found");

                Self::allocator_error(
                    request,
                    command,
                    format!(
                        "failed to find plugin {:?} in path [{}]",
                        request.plugin, request.cni_path
                    ),
                )
            })
    }

    async fn exec(&self, request: &IpamRequest, command: &'static str) -> Result<Vec<u8>, Error> {
        let plugin_path = Self::find_plugin(request, command)?;

        let mut cmd = Command::new(&plugin_path);
        cmd.env("CNI_COMMAND", command)
            .env("CNI_CONTAINERID", &request.container_id)
            .env(
                "CNI_NETNS",
                request.netns.as_deref().unwrap_or_else(|| Path::new("")),
            )
            .env("CNI_IFNAME", &request.if_name)
            .env("CNI_PATH", &request.cni_path)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(cni_args) = &request.cni_args {
            cmd.env("CNI_ARGS", cni_args);
        }

        let mut child = cmd
            .spawn()
            .tap_err(|err| error!(%err, ?plugin_path, command, "spawn ipam plugin failed"))
            .map_err(|err| Self::allocator_error(request, command, err.to_string()))?;

        let mut stdin = child.stdin.take().ok_or_else(|| {
            Self::allocator_error(request, command, "ipam plugin stdin not piped".to_string())
        })?;
        let config = request.config.clone();
        let write_config = async move {
            let result = stdin.write_all(&config).await;
            drop(stdin);

            result
        };

        let (write_result, output) = tokio::join!(write_config, child.wait_with_output());

        if let Err(err) = write_result {
            // the exit status below decides, a plugin may exit before reading
            warn!(%err, ?plugin_path, command, "write config to ipam plugin failed");
        }

        let output = output
            .tap_err(|err| error!(%err, ?plugin_path, command, "wait ipam plugin failed"))
            .map_err(|err| Self::allocator_error(request, command, err.to_string()))?;

        if output.status.success() {
            info!(?plugin_path, command, "run ipam plugin done");

            return Ok(output.stdout);
        }

        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();

        match serde_json::from_slice::<IpamError>(&output.stdout) {
            Ok(ipam_err) => {
                error!(
                    ?plugin_path,
                    command,
                    code = ipam_err.code,
                    msg = %ipam_err.msg,
                    %stderr,
                    "ipam plugin reported error"
                );

                Err(Error::AllocatorError {
                    plugin: request.plugin.clone(),
                    command,
                    code: Some(ipam_err.code),
                    msg: ipam_err.msg,
                    details: format!(
                        "container {}: {}",
                        request.container_id, ipam_err.details
                    ),
                })
            }

            Err(_) => {
                error!(?plugin_path, command, status = %output.status, %stderr, "ipam plugin failed");

                let msg = if stderr.is_empty() {
                    format!("plugin exited with {}", output.status)
                } else {
                    stderr
                };

                Err(Self::allocator_error(request, command, msg))
            }
        }
    }
}

impl ExecIpam {
    fn parse_lease(request: &IpamRequest, stdout: &[u8]) -> Result<AddressLease, Error> {
        let protocol_error = |err: serde_json::Error| {
            error!(%err, plugin = %request.plugin, "parse ipam result failed");

            Self::allocator_error(
                request,
                COMMAND_ADD,
                format!("invalid ipam result: {}", err),
            )
        };

        let allocator_state = serde_json::from_slice::<Value>(stdout).map_err(protocol_error)?;
        let result = serde_json::from_value::<IpamResult>(allocator_state.clone())
            .map_err(protocol_error)?;

        let ip = result.ips.into_iter().next().ok_or_else(|| {
            error!(plugin = %request.plugin, "ipam result contains no ip");

            Self::allocator_error(
                request,
                COMMAND_ADD,
                "invalid ipam result: no ips".to_string(),
            )
        })?;

        info!(
            container_id = %request.container_id,
            cni_version = %result.cni_version,
            address = %ip.address,
            gateway = %ip.gateway,
            "parse ipam result done"
        );

        Ok(AddressLease {
            address: ip.address,
            gateway: ip.gateway,
            allocator_state,
        })
    }
}

#[async_trait::async_trait]
impl Ipam for ExecIpam {
    async fn request_lease(&self, request: &IpamRequest) -> Result<AddressLease, Error> {
        let stdout = self.exec(request, COMMAND_ADD).await?;

        // the plugin exited 0, so it holds an allocation even if its result is unusable
        match Self::parse_lease(request, &stdout) {
            Err(err) => {
                warn!(%err, container_id = %request.container_id, "release unusable lease");

                if let Err(release_err) = self.release_lease(request).await {
                    error!(
                        %release_err,
                        container_id = %request.container_id,
                        "release unusable lease failed"
                    );
                }

                Err(err)
            }

            Ok(lease) => {
                info!(container_id = %request.container_id, "request lease done");

                Ok(lease)
            }
        }
    }

    async fn release_lease(&self, request: &IpamRequest) -> Result<(), Error> {
        self.exec(request, COMMAND_DEL).await?;

        info!(container_id = %request.container_id, "release lease done");

        Ok(())
    }
}
