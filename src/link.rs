use std::io::{Error as IoError, ErrorKind};
use std::os::unix::io::AsRawFd;

use md5::{Digest, Md5};
use nix::errno::Errno;
use tracing::{error, info, warn};

use crate::error::Error;
use crate::netlink::{self, Netlink};
use crate::netns::Netns;

const MAX_NIC_NAME_LEN: usize = 15;

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct LinkPair {
    pub host_name: String,
    /// host side name of the peer until it is moved and renamed
    pub container_name: String,
    pub host_mac: Option<String>,
}

#[cfg_attr(test, mockall::automock)]
#[async_trait::async_trait]
pub trait LinkManage {
    async fn create_link_pair(&self, host: &str, peer: &str, mtu: u32)
        -> Result<LinkPair, Error>;

    /// Move `peer` into `netns`, renaming it to `if_name` on the way.
    async fn move_to_namespace(
        &self,
        peer: &str,
        netns: &Netns,
        if_name: &str,
    ) -> Result<(), Error>;

    async fn remove_link(&self, name: &str) -> Result<(), Error>;
}

/// Manages veth pairs in the host netns.
pub struct VethLinkManager {
    netlink: Netlink,
}

impl VethLinkManager {
    pub fn new() -> Result<Self, Error> {
        let netlink = Netlink::new().map_err(|err| {
            error!(%err, "open host rtnetlink connection failed");

            Error::Netlink { source: err }
        })?;

        Ok(Self { netlink })
    }

    async fn set_mtu(
        &self,
        host: &str,
        peer: &str,
        nic_name: &str,
        mtu: u32,
    ) -> Result<Option<String>, Error> {
        let create_failed = |source: IoError| Error::LinkCreateFailed {
            host: host.to_string(),
            peer: peer.to_string(),
            source,
        };

        let link_message = self
            .netlink
            .get_link(nic_name)
            .await
            .map_err(create_failed)?
            .ok_or_else(|| {
                error!(nic_name, "veth end not exists after create");

                create_failed(IoError::new(
                    ErrorKind::NotFound,
                    format!("veth end {} not exists after create", nic_name),
                ))
            })?;

        self.netlink
            .handle
            .link()
            .set(link_message.header.index)
            .mtu(mtu)
            .execute()
            .await
            .map_err(|err| {
                error!(%err, nic_name, mtu, "set nic mtu failed");

                create_failed(IoError::new(ErrorKind::Other, err))
            })?;

        info!(nic_name, mtu, "set nic mtu done");

        Ok(netlink::link_mac(&link_message))
    }
}

#[async_trait::async_trait]
impl LinkManage for VethLinkManager {
    async fn create_link_pair(&self, host: &str, peer: &str, mtu: u32) -> Result<LinkPair, Error> {
        let exists = self
            .netlink
            .get_link(host)
            .await
            .map_err(|err| Error::LinkCreateFailed {
                host: host.to_string(),
                peer: peer.to_string(),
                source: err,
            })?;
        if exists.is_some() {
            error!(host, "host nic already exists");

            return Err(Error::LinkExists {
                name: host.to_string(),
            });
        }

        self.netlink
            .handle
            .link()
            .add()
            .veth(host.to_string(), peer.to_string())
            .execute()
            .await
            .map_err(|err| {
                error!(%err, host, peer, "add veth failed");

                if netlink::errno_is(&err, Errno::EEXIST) {
                    Error::LinkExists {
                        name: host.to_string(),
                    }
                } else {
                    Error::LinkCreateFailed {
                        host: host.to_string(),
                        peer: peer.to_string(),
                        source: IoError::new(ErrorKind::Other, err),
                    }
                }
            })?;

        info!(host, peer, "add veth done");

        let result = async {
            let host_mac = self.set_mtu(host, peer, host, mtu).await?;
            self.set_mtu(host, peer, peer, mtu).await?;

            Ok::<_, Error>(host_mac)
        }
        .await;

        match result {
            Err(err) => {
                // deleting either end removes the whole pair
                if let Err(rollback_err) = self.remove_link(host).await {
                    error!(%rollback_err, host, "remove half configured veth failed");
                }

                Err(err)
            }

            Ok(host_mac) => Ok(LinkPair {
                host_name: host.to_string(),
                container_name: peer.to_string(),
                host_mac,
            }),
        }
    }

    async fn move_to_namespace(
        &self,
        peer: &str,
        netns: &Netns,
        if_name: &str,
    ) -> Result<(), Error> {
        let move_failed = |source: IoError| Error::NamespaceMoveFailed {
            name: peer.to_string(),
            path: netns.path().to_path_buf(),
            source,
        };

        let link_message = self
            .netlink
            .get_link(peer)
            .await
            .map_err(move_failed)?
            .ok_or_else(|| {
                error!(peer, "peer nic not exists");

                Error::InterfaceNotFound {
                    name: peer.to_string(),
                    source: IoError::new(ErrorKind::NotFound, "peer nic not exists"),
                }
            })?;

        self.netlink
            .handle
            .link()
            .set(link_message.header.index)
            .setns_by_fd(netns.as_raw_fd())
            .name(if_name.to_string())
            .execute()
            .await
            .map_err(|err| {
                error!(%err, peer, if_name, netns = ?netns.path(), "move peer to netns failed");

                move_failed(IoError::new(ErrorKind::Other, err))
            })?;

        info!(peer, if_name, netns = ?netns.path(), "move peer to netns done");

        Ok(())
    }

    async fn remove_link(&self, name: &str) -> Result<(), Error> {
        let link_message = match self
            .netlink
            .get_link(name)
            .await
            .map_err(|err| Error::Netlink { source: err })?
        {
            None => {
                warn!(name, "nic is not exists");

                return Ok(());
            }

            Some(link_message) => link_message,
        };

        self.netlink
            .handle
            .link()
            .del(link_message.header.index)
            .execute()
            .await
            .map_err(|err| {
                error!(%err, name, "delete nic failed");

                Error::Netlink {
                    source: IoError::new(ErrorKind::Other, err),
                }
            })?;

        info!(name, "delete nic done");

        Ok(())
    }
}

/// Derive the host veth name and the temporary peer name from the container id.
///
/// Both fit in `IFNAMSIZ` and only depend on the id, so concurrent attaches
/// for different containers never need to coordinate.
pub fn get_link_names(container_id: &str) -> (String, String) {
    let mut buf = [0u8; 16].into();
    let mut hasher = Md5::new();

    hasher.update(container_id.as_bytes());
    hasher.finalize_into_reset(&mut buf);

    let mut host = format!("veth{:x}", buf);
    host.truncate(MAX_NIC_NAME_LEN);

    hasher.update(format!("{}-peer", container_id).as_bytes());
    hasher.finalize_into(&mut buf);

    let mut peer = format!("tmp{:x}", buf);
    peer.truncate(MAX_NIC_NAME_LEN);

    (host, peer)
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;
    use crate::netns;

    #[test]
    fn link_names_deterministic() {
        assert_eq!(get_link_names("abcdef1234"), get_link_names("abcdef1234"));

        let (host, peer) = get_link_names("abcdef1234");
        assert!(host.starts_with("veth"));
        assert!(peer.starts_with("tmp"));
        assert_eq!(host.len(), MAX_NIC_NAME_LEN);
        assert_eq!(peer.len(), MAX_NIC_NAME_LEN);
        assert_ne!(host, peer);
    }

    #[test]
    fn link_names_share_prefix() {
        // ids sharing the first 8 chars used to map to the same nic
        let ids = [
            "abcdef12-server-pod",
            "abcdef12-client-pod",
            "abcdef1234",
            "abcdef1235",
            "server-pod",
            "client-pod",
        ];

        let hosts = ids
            .iter()
            .map(|id| get_link_names(id).0)
            .collect::<HashSet<_>>();

        assert_eq!(hosts.len(), ids.len());
    }

    #[test]
    fn link_names_long_id() {
        let id = "f".repeat(64);
        let (host, peer) = get_link_names(&id);

        assert!(host.len() <= MAX_NIC_NAME_LEN);
        assert!(peer.len() <= MAX_NIC_NAME_LEN);
    }

    /// needs CAP_NET_ADMIN
    #[tokio::test(flavor = "current_thread")]
    #[ignore]
    async fn create_and_remove_link_pair() {
        let manager = VethLinkManager::new().unwrap();
        let (host, peer) = get_link_names("netter-link-test");

        let pair = manager.create_link_pair(&host, &peer, 1400).await.unwrap();
        assert_eq!(pair.host_name, host);
        assert_eq!(pair.container_name, peer);
        assert!(pair.host_mac.is_some());

        assert!(manager.netlink.get_link(&host).await.unwrap().is_some());
        assert!(manager.netlink.get_link(&peer).await.unwrap().is_some());

        let err = manager
            .create_link_pair(&host, &peer, 1400)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::LinkExists { .. }));

        manager.remove_link(&host).await.unwrap();

        assert!(manager.netlink.get_link(&host).await.unwrap().is_none());
        assert!(manager.netlink.get_link(&peer).await.unwrap().is_none());

        manager.remove_link(&host).await.unwrap();
    }

    /// needs CAP_NET_ADMIN
    #[tokio::test(flavor = "current_thread")]
    #[ignore]
    async fn create_link_pair_rollback() {
        let manager = VethLinkManager::new().unwrap();
        let (host, peer) = get_link_names("netter-rollback-test");

        // veth accepts at most 65535, the pair exists when set mtu fails
        let err = manager
            .create_link_pair(&host, &peer, 70000)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::LinkCreateFailed { .. }));

        assert!(manager.netlink.get_link(&host).await.unwrap().is_none());
        assert!(manager.netlink.get_link(&peer).await.unwrap().is_none());
    }

    /// needs CAP_SYS_ADMIN and CAP_NET_ADMIN
    #[tokio::test(flavor = "current_thread")]
    #[ignore]
    async fn move_to_namespace_and_rename() {
        let manager = VethLinkManager::new().unwrap();
        let netns = netns::scratch_netns();
        let (host, peer) = get_link_names("netter-move-test");

        manager.create_link_pair(&host, &peer, 1400).await.unwrap();
        manager
            .move_to_namespace(&peer, &netns, "eth0")
            .await
            .unwrap();

        assert!(manager.netlink.get_link(&host).await.unwrap().is_some());
        assert!(manager.netlink.get_link(&peer).await.unwrap().is_none());

        {
            let _guard = netns.enter().unwrap();
            let target = Netlink::new().unwrap();

            assert!(target.get_link(&peer).await.unwrap().is_none());
            assert!(target.get_link("eth0").await.unwrap().is_some());
        }

        let err = manager
            .move_to_namespace(&peer, &netns, "eth0")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InterfaceNotFound { .. }));

        // the peer goes with it, even from the other netns
        manager.remove_link(&host).await.unwrap();

        let _guard = netns.enter().unwrap();
        let target = Netlink::new().unwrap();
        assert!(target.get_link("eth0").await.unwrap().is_none());
    }
}
