use std::io;
use std::net::IpAddr;
use std::path::PathBuf;

use ipnetwork::IpNetwork;
use thiserror::Error;

pub const CODE_INCOMPATIBLE_VERSION: u32 = 1;
pub const CODE_UNKNOWN_CONTAINER: u32 = 3;
pub const CODE_INVALID_ENVIRONMENT: u32 = 4;
pub const CODE_INVALID_CONFIG: u32 = 7;

// codes above 99 are plugin specific
const CODE_NAMESPACE_UNAVAILABLE: u32 = 101;
const CODE_LINK_EXISTS: u32 = 102;
const CODE_LINK_CREATE_FAILED: u32 = 103;
const CODE_INTERFACE_NOT_FOUND: u32 = 104;
const CODE_NAMESPACE_MOVE_FAILED: u32 = 105;
const CODE_LINK_UP_FAILED: u32 = 106;
const CODE_ADDRESS_ASSIGN_FAILED: u32 = 107;
const CODE_ROUTE_INSTALL_FAILED: u32 = 108;
const CODE_ALLOCATOR_ERROR: u32 = 109;
const CODE_FORWARDING_FAILED: u32 = 110;
const CODE_NETLINK: u32 = 111;

#[derive(Debug, Error)]
pub enum Error {
    #[error("open netns {path:?} failed: {source}")]
    NamespaceUnavailable { path: PathBuf, source: io::Error },

    #[error("rtnetlink request failed: {source}")]
    Netlink { source: io::Error },

    #[error("link {name} already exists")]
    LinkExists { name: String },

    #[error("create veth {host} with peer {peer} failed: {source}")]
    LinkCreateFailed {
        host: String,
        peer: String,
        source: io::Error,
    },

    #[error("interface {name} not found: {source}")]
    InterfaceNotFound { name: String, source: io::Error },

    #[error("move {name} to netns {path:?} failed: {source}")]
    NamespaceMoveFailed {
        name: String,
        path: PathBuf,
        source: io::Error,
    },

    #[error("set link {name} up failed: {source}")]
    LinkUpFailed { name: String, source: io::Error },

    #[error("assign address {address} to {name} failed: {source}")]
    AddressAssignFailed {
        name: String,
        address: IpNetwork,
        source: io::Error,
    },

    #[error("install route {destination} via {gateway} failed: {source}")]
    RouteInstallFailed {
        destination: IpNetwork,
        gateway: IpAddr,
        source: io::Error,
    },

    #[error("enable ip forwarding failed: {source}")]
    ForwardingFailed { source: io::Error },

    #[error("ipam plugin {plugin} {command} failed: {msg}")]
    AllocatorError {
        plugin: String,
        command: &'static str,
        code: Option<u32>,
        msg: String,
        details: String,
    },

    #[error("invalid network config: {0}")]
    ConfigInvalid(String),

    #[error("incompatible CNI version {0}")]
    IncompatibleVersion(String),

    #[error("invalid invocation: {0}")]
    InvalidEnvironment(String),
}

impl Error {
    pub fn code(&self) -> u32 {
        match self {
            Error::NamespaceUnavailable { .. } => CODE_NAMESPACE_UNAVAILABLE,
            Error::Netlink { .. } => CODE_NETLINK,
            Error::LinkExists { .. } => CODE_LINK_EXISTS,
            Error::LinkCreateFailed { .. } => CODE_LINK_CREATE_FAILED,
            Error::InterfaceNotFound { .. } => CODE_INTERFACE_NOT_FOUND,
            Error::NamespaceMoveFailed { .. } => CODE_NAMESPACE_MOVE_FAILED,
            Error::LinkUpFailed { .. } => CODE_LINK_UP_FAILED,
            Error::AddressAssignFailed { .. } => CODE_ADDRESS_ASSIGN_FAILED,
            Error::RouteInstallFailed { .. } => CODE_ROUTE_INSTALL_FAILED,
            Error::ForwardingFailed { .. } => CODE_FORWARDING_FAILED,
            // the allocator's own code is passed through untouched
            Error::AllocatorError { code, .. } => code.unwrap_or(CODE_ALLOCATOR_ERROR),
            Error::ConfigInvalid(_) => CODE_INVALID_CONFIG,
            Error::IncompatibleVersion(_) => CODE_INCOMPATIBLE_VERSION,
            Error::InvalidEnvironment(_) => CODE_INVALID_ENVIRONMENT,
        }
    }

    /// The allocator reported it holds no lease for the container.
    pub fn is_lease_not_found(&self) -> bool {
        matches!(
            self,
            Error::AllocatorError {
                code: Some(CODE_UNKNOWN_CONTAINER),
                ..
            }
        )
    }

    /// Extra context for the CNI error payload.
    pub fn details(&self) -> String {
        match self {
            Error::AllocatorError { details, .. } => details.clone(),
            _ => std::error::Error::source(self)
                .map(|source| source.to_string())
                .unwrap_or_default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::ErrorKind;

    use super::*;

    #[test]
    fn allocator_code_pass_through() {
        let err = Error::AllocatorError {
            plugin: "host-local".to_string(),
            command: "DEL",
            code: Some(CODE_UNKNOWN_CONTAINER),
            msg: "no lease".to_string(),
            details: "container abcdef1234".to_string(),
        };

        assert!(err.is_lease_not_found());
        assert_eq!(err.code(), CODE_UNKNOWN_CONTAINER);
        assert_eq!(err.details(), "container abcdef1234");

        let err = Error::AllocatorError {
            plugin: "host-local".to_string(),
            command: "ADD",
            code: None,
            msg: "exit status: 1".to_string(),
            details: String::new(),
        };

        assert!(!err.is_lease_not_found());
        assert_eq!(err.code(), CODE_ALLOCATOR_ERROR);
    }

    #[test]
    fn details_carry_source() {
        let err = Error::LinkUpFailed {
            name: "eth0".to_string(),
            source: io::Error::new(ErrorKind::Other, "No such device"),
        };

        assert_eq!(err.code(), CODE_LINK_UP_FAILED);
        assert_eq!(err.details(), "No such device");
        assert!(!err.is_lease_not_found());
    }
}
