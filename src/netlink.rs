use std::io::{Error, ErrorKind};

use futures_util::future::AbortHandle;
use futures_util::{future, TryStreamExt};
use nix::errno::Errno;
use rtnetlink::packet::link::nlas::Nla as LinkNla;
use rtnetlink::packet::LinkMessage;
use rtnetlink::Handle;
use tracing::error;

/// A rtnetlink connection bound to the netns that was current when it was opened.
pub(crate) struct Netlink {
    pub(crate) handle: Handle,
    conn_stop: AbortHandle,
}

impl Netlink {
    pub(crate) fn new() -> Result<Self, Error> {
        let (conn, handle, _) = rtnetlink::new_connection()?;
        let (conn, abort_handle) = future::abortable(conn);

        tokio::spawn(async move {
            let _ = conn.await;
        });

        Ok(Self {
            handle,
            conn_stop: abort_handle,
        })
    }

    pub(crate) async fn get_link(&self, nic_name: &str) -> Result<Option<LinkMessage>, Error> {
        match self
            .handle
            .link()
            .get()
            .match_name(nic_name.to_string())
            .execute()
            .try_next()
            .await
        {
            Err(err) if errno_is(&err, Errno::ENODEV) => Ok(None),

            Err(err) => {
                error!(%err, nic_name, "get nic info failed");

                Err(Error::new(ErrorKind::Other, err))
            }

            Ok(link) => Ok(link),
        }
    }
}

impl Drop for Netlink {
    fn drop(&mut self) {
        self.conn_stop.abort();
    }
}

pub(crate) fn errno_is(err: &rtnetlink::Error, errno: Errno) -> bool {
    matches!(err, rtnetlink::Error::NetlinkError(msg) if msg.to_io().raw_os_error() == Some(errno as i32))
}

pub(crate) fn link_mac(link_message: &LinkMessage) -> Option<String> {
    link_message.nlas.iter().find_map(|nla| {
        if let LinkNla::Address(addr) = nla {
            Some(format_mac(addr))
        } else {
            None
        }
    })
}

fn format_mac(addr: &[u8]) -> String {
    addr.iter()
        .map(|byte| format!("{:02x}", byte))
        .collect::<Vec<_>>()
        .join(":")
}
