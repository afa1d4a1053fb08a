use std::fs;
use std::io::{Error as IoError, ErrorKind};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use ipnetwork::IpNetwork;
use tracing::{error, info};

use crate::error::Error;
use crate::ipam::AddressLease;
use crate::netlink::{self, Netlink};
use crate::netns::Netns;

const IPV4_FORWARD: &str = "/proc/sys/net/ipv4/ip_forward";
const IPV6_FORWARD: &str = "/proc/sys/net/ipv6/conf/all/forwarding";

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct ConfigureOptions {
    pub ip_forward: bool,
    /// route destinations, the default route of the lease family when empty
    pub routes: Vec<IpNetwork>,
}

/// The configured endpoint inside the container netns.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct ContainerLink {
    pub index: u32,
    pub mac: Option<String>,
    pub routes: Vec<IpNetwork>,
}

#[cfg_attr(test, mockall::automock)]
#[async_trait::async_trait]
pub trait Configure {
    async fn configure(
        &self,
        netns: &Netns,
        if_name: &str,
        lease: &AddressLease,
        options: &ConfigureOptions,
    ) -> Result<ContainerLink, Error>;
}

#[derive(Debug, Default)]
pub struct NetlinkConfigurator;

#[async_trait::async_trait]
impl Configure for NetlinkConfigurator {
    async fn configure(
        &self,
        netns: &Netns,
        if_name: &str,
        lease: &AddressLease,
        options: &ConfigureOptions,
    ) -> Result<ContainerLink, Error> {
        let routes = route_destinations(lease, options)?;
        check_gateway(lease, &routes)?;

        let _guard = netns.enter()?;

        if options.ip_forward {
            enable_forwarding(&lease.address)?;
        }

        // the socket stays bound to the netns it is opened in
        let netlink = Netlink::new().map_err(|err| {
            error!(%err, netns = ?netns.path(), "open rtnetlink connection in netns failed");

            Error::Netlink { source: err }
        })?;

        let link_message = netlink
            .get_link(if_name)
            .await
            .map_err(|err| Error::InterfaceNotFound {
                name: if_name.to_string(),
                source: err,
            })?
            .ok_or_else(|| {
                error!(if_name, netns = ?netns.path(), "nic not exists in netns");

                Error::InterfaceNotFound {
                    name: if_name.to_string(),
                    source: IoError::new(ErrorKind::NotFound, "nic not exists in netns"),
                }
            })?;
        let index = link_message.header.index;

        netlink
            .handle
            .link()
            .set(index)
            .up()
            .execute()
            .await
            .map_err(|err| {
                error!(%err, if_name, "set nic up failed");

                Error::LinkUpFailed {
                    name: if_name.to_string(),
                    source: IoError::new(ErrorKind::Other, err),
                }
            })?;

        info!(if_name, index, "set nic up done");

        netlink
            .handle
            .address()
            .add(index, lease.address.ip(), lease.address.prefix())
            .execute()
            .await
            .map_err(|err| {
                error!(%err, if_name, address = %lease.address, "add address failed");

                Error::AddressAssignFailed {
                    name: if_name.to_string(),
                    address: lease.address,
                    source: IoError::new(ErrorKind::Other, err),
                }
            })?;

        info!(if_name, address = %lease.address, "add address done");

        for destination in routes.iter() {
            add_route(&netlink, index, *destination, lease.gateway).await?;

            info!(if_name, %destination, gateway = %lease.gateway, "add route done");
        }

        Ok(ContainerLink {
            index,
            mac: netlink::link_mac(&link_message),
            routes,
        })
    }
}

async fn add_route(
    netlink: &Netlink,
    index: u32,
    destination: IpNetwork,
    gateway: IpAddr,
) -> Result<(), Error> {
    let route_failed = |source: IoError| Error::RouteInstallFailed {
        destination,
        gateway,
        source,
    };

    let result = match (destination, gateway) {
        (IpNetwork::V4(dst), IpAddr::V4(gw)) => {
            netlink
                .handle
                .route()
                .add()
                .v4()
                .destination_prefix(dst.network(), dst.prefix())
                .gateway(gw)
                .output_interface(index)
                .execute()
                .await
        }

        (IpNetwork::V6(dst), IpAddr::V6(gw)) => {
            netlink
                .handle
                .route()
                .add()
                .v6()
                .destination_prefix(dst.network(), dst.prefix())
                .gateway(gw)
                .output_interface(index)
                .execute()
                .await
        }

        _ => {
            return Err(route_failed(IoError::new(
                ErrorKind::InvalidInput,
                "route and gateway family mismatch",
            )))
        }
    };

    result.map_err(|err| {
        error!(%err, %destination, %gateway, "add route failed");

        route_failed(IoError::new(ErrorKind::Other, err))
    })
}

fn route_destinations(
    lease: &AddressLease,
    options: &ConfigureOptions,
) -> Result<Vec<IpNetwork>, Error> {
    if !options.routes.is_empty() {
        return Ok(options.routes.clone());
    }

    let default_route = match lease.address {
        IpNetwork::V4(_) => IpNetwork::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0),
        IpNetwork::V6(_) => IpNetwork::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), 0),
    }
    .map_err(|err| Error::ConfigInvalid(err.to_string()))?;

    Ok(vec![default_route])
}

/// The gateway has to be on link: inside the leased subnet and not the address itself.
fn check_gateway(lease: &AddressLease, routes: &[IpNetwork]) -> Result<(), Error> {
    let reason = if !lease.address.contains(lease.gateway) {
        Some(format!(
            "gateway {} is unreachable from {}",
            lease.gateway, lease.address
        ))
    } else if lease.address.ip() == lease.gateway {
        Some(format!(
            "gateway {} is the leased address itself",
            lease.gateway
        ))
    } else if is_subnet_boundary(&lease.address, lease.gateway) {
        Some(format!(
            "gateway {} is not a host address of {}",
            lease.gateway, lease.address
        ))
    } else {
        None
    };

    if let Some(reason) = reason {
        error!(address = %lease.address, gateway = %lease.gateway, %reason, "invalid gateway");

        return Err(Error::RouteInstallFailed {
            destination: routes.first().copied().unwrap_or(lease.address),
            gateway: lease.gateway,
            source: IoError::new(ErrorKind::InvalidInput, reason),
        });
    }

    if let Some(destination) = routes
        .iter()
        .find(|destination| destination.is_ipv4() != lease.gateway.is_ipv4())
    {
        error!(%destination, gateway = %lease.gateway, "route and gateway family mismatch");

        return Err(Error::RouteInstallFailed {
            destination: *destination,
            gateway: lease.gateway,
            source: IoError::new(
                ErrorKind::InvalidInput,
                "route and gateway family mismatch",
            ),
        });
    }

    Ok(())
}

/// Network address, and for IPv4 the broadcast address. Point to point
/// subnets (/31, /127) have no such reserved addresses.
fn is_subnet_boundary(address: &IpNetwork, gateway: IpAddr) -> bool {
    match (address, gateway) {
        (IpNetwork::V4(net), IpAddr::V4(gateway)) => {
            net.prefix() < 31 && (gateway == net.network() || gateway == net.broadcast())
        }

        (IpNetwork::V6(net), IpAddr::V6(gateway)) => {
            net.prefix() < 127 && gateway == net.network()
        }

        _ => false,
    }
}

// tokio::fs would run on the blocking pool, outside of the entered netns
fn enable_forwarding(address: &IpNetwork) -> Result<(), Error> {
    let path = match address {
        IpNetwork::V4(_) => IPV4_FORWARD,
        IpNetwork::V6(_) => IPV6_FORWARD,
    };

    fs::write(path, b"1").map_err(|err| {
        error!(%err, path, "enable ip forwarding failed");

        Error::ForwardingFailed { source: err }
    })?;

    info!(path, "enable ip forwarding done");

    Ok(())
}
