use std::path::PathBuf;

use bytes::Bytes;
use tracing::{error, info, warn};

use crate::config::NetConf;
use crate::configure::{Configure, ConfigureOptions};
use crate::error::Error;
use crate::ipam::{Ipam, IpamRequest};
use crate::link::{self, LinkManage};
use crate::netns::Netns;
use crate::types::AttachResult;

const MAX_IF_NAME_LEN: usize = 15;

/// One plugin invocation as handed over by the runtime.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Invocation {
    pub container_id: String,
    pub netns: Option<PathBuf>,
    pub if_name: String,
    pub cni_path: String,
    pub cni_args: Option<String>,
    pub config: Bytes,
}

impl Invocation {
    fn check(&self) -> Result<(), Error> {
        if self.container_id.is_empty() {
            error!("empty container id");

            return Err(Error::InvalidEnvironment("empty CNI_CONTAINERID".to_string()));
        }

        if self.if_name.is_empty() || self.if_name.len() > MAX_IF_NAME_LEN {
            error!(if_name = %self.if_name, "invalid interface name");

            return Err(Error::InvalidEnvironment(format!(
                "invalid CNI_IFNAME {:?}",
                self.if_name
            )));
        }

        Ok(())
    }

    fn ipam_request(&self, conf: &NetConf) -> IpamRequest {
        IpamRequest {
            plugin: conf.ipam.kind.clone(),
            container_id: self.container_id.clone(),
            netns: self.netns.clone(),
            if_name: self.if_name.clone(),
            cni_path: self.cni_path.clone(),
            cni_args: self.cni_args.clone(),
            config: self.config.clone(),
        }
    }
}

pub struct Plugin<L, C, I> {
    links: L,
    configurator: C,
    ipam: I,
}

impl<L, C, I> Plugin<L, C, I> {
    pub fn new(links: L, configurator: C, ipam: I) -> Self {
        Self {
            links,
            configurator,
            ipam,
        }
    }
}

impl<L, C, I> Plugin<L, C, I>
where
    L: LinkManage,
    C: Configure,
    I: Ipam,
{
    pub async fn attach(&self, invocation: &Invocation) -> Result<AttachResult, Error> {
        invocation.check()?;
        let conf = NetConf::parse(&invocation.config)?;

        let netns_path = invocation.netns.as_ref().ok_or_else(|| {
            error!("empty netns");

            Error::InvalidEnvironment("empty CNI_NETNS".to_string())
        })?;
        let netns = Netns::open(netns_path)?;

        let container_id = &invocation.container_id;
        let if_name = &invocation.if_name;
        let (host, peer) = link::get_link_names(container_id);

        let pair = self.links.create_link_pair(&host, &peer, conf.mtu).await?;

        info!(%container_id, ?pair, "create link pair done");

        if let Err(err) = self
            .links
            .move_to_namespace(&pair.container_name, &netns, if_name)
            .await
        {
            error!(%err, %container_id, host = %pair.host_name, "move peer failed, remove host link");

            if let Err(rollback_err) = self.links.remove_link(&pair.host_name).await {
                error!(%rollback_err, %container_id, host = %pair.host_name, "remove host link failed");
            }

            return Err(err);
        }

        info!(%container_id, %if_name, netns = ?netns.path(), "move peer to netns done");

        let ipam_request = invocation.ipam_request(&conf);
        let lease = self.ipam.request_lease(&ipam_request).await?;

        info!(%container_id, address = %lease.address, gateway = %lease.gateway, "request lease done");

        let options = ConfigureOptions {
            ip_forward: conf.ip_forward,
            routes: conf.route_destinations(),
        };

        let container_link = match self
            .configurator
            .configure(&netns, if_name, &lease, &options)
            .await
        {
            Err(err) => {
                error!(%err, %container_id, "configure netns failed, release lease");

                if let Err(release_err) = self.ipam.release_lease(&ipam_request).await {
                    error!(%release_err, %container_id, "release lease failed");
                }

                return Err(err);
            }

            Ok(container_link) => container_link,
        };

        info!(%container_id, ?container_link, "configure netns done");

        Ok(AttachResult::new(
            &conf.cni_version,
            &pair,
            if_name,
            netns.path(),
            &container_link,
            &lease,
        ))
    }

    pub async fn detach(&self, invocation: &Invocation) -> Result<(), Error> {
        invocation.check()?;
        let conf = NetConf::parse(&invocation.config)?;
        let container_id = &invocation.container_id;

        match self.ipam.release_lease(&invocation.ipam_request(&conf)).await {
            Err(err) if err.is_lease_not_found() => {
                warn!(%err, %container_id, "lease not found, treat as released");

                Ok(())
            }

            Err(err) => {
                error!(%err, %container_id, "release lease failed");

                Err(err)
            }

            Ok(_) => {
                info!(%container_id, "release lease done");

                Ok(())
            }
        }
    }
}
