//! Network namespace handles and the scoped context switch into them.
//!
//! `setns(2)` only affects the calling thread, so the plugin drives everything
//! from a current-thread runtime and the guard restores the thread's original
//! namespace when it drops.

use std::cell::Cell;
use std::fs::File;
use std::io::{Error as IoError, ErrorKind};
use std::os::unix::io::{AsRawFd, RawFd};
use std::path::{Path, PathBuf};

use nix::sched::{setns, CloneFlags};
use nix::sys::statfs::fstatfs;
use tracing::{error, info};

use crate::error::Error;

const NSFS_MAGIC: i64 = 0x6e73_6673;
const THREAD_NETNS: &str = "/proc/thread-self/ns/net";

thread_local! {
    static ENTERED: Cell<bool> = Cell::new(false);
}

/// An open network namespace file, kept open until dropped.
#[derive(Debug)]
pub struct Netns {
    path: PathBuf,
    file: File,
}

impl Netns {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, Error> {
        let path = path.as_ref().to_path_buf();

        let file = File::open(&path).map_err(|err| {
            error!(%err, ?path, "open netns failed");

            Error::NamespaceUnavailable {
                path: path.clone(),
                source: err,
            }
        })?;

        let statfs = fstatfs(&file).map_err(|err| {
            error!(%err, ?path, "statfs netns failed");

            Error::NamespaceUnavailable {
                path: path.clone(),
                source: err.into(),
            }
        })?;

        if statfs.filesystem_type().0 as i64 != NSFS_MAGIC {
            error!(?path, "path is not a namespace file");

            return Err(Error::NamespaceUnavailable {
                source: IoError::new(
                    ErrorKind::InvalidInput,
                    format!("{:?} is not a namespace file", path),
                ),
                path,
            });
        }

        info!(?path, "open netns done");

        Ok(Self { path, file })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Switch the current thread into this namespace until the guard drops.
    ///
    /// Only one guard may be alive per thread.
    pub fn enter(&self) -> Result<NetnsGuard<'_>, Error> {
        if ENTERED.with(Cell::get) {
            error!(path = ?self.path, "netns context already entered");

            return Err(Error::NamespaceUnavailable {
                path: self.path.clone(),
                source: IoError::new(ErrorKind::WouldBlock, "netns context already entered"),
            });
        }

        let origin = File::open(THREAD_NETNS).map_err(|err| {
            error!(%err, "open current netns failed");

            Error::NamespaceUnavailable {
                path: PathBuf::from(THREAD_NETNS),
                source: err,
            }
        })?;

        setns(self.file.as_raw_fd(), CloneFlags::CLONE_NEWNET).map_err(|err| {
            error!(%err, path = ?self.path, "setns failed");

            Error::NamespaceUnavailable {
                path: self.path.clone(),
                source: err.into(),
            }
        })?;

        ENTERED.with(|entered| entered.set(true));

        info!(path = ?self.path, "enter netns done");

        Ok(NetnsGuard { netns: self, origin })
    }
}

impl AsRawFd for Netns {
    fn as_raw_fd(&self) -> RawFd {
        self.file.as_raw_fd()
    }
}

#[must_use = "the namespace is left as soon as the guard drops"]
#[derive(Debug)]
pub struct NetnsGuard<'a> {
    netns: &'a Netns,
    origin: File,
}

impl Drop for NetnsGuard<'_> {
    fn drop(&mut self) {
        // on failure the thread stays marked as entered, so no further enter can
        // run in the wrong namespace
        match setns(self.origin.as_raw_fd(), CloneFlags::CLONE_NEWNET) {
            Err(err) => {
                error!(%err, path = ?self.netns.path, "restore origin netns failed");
            }

            Ok(_) => {
                ENTERED.with(|entered| entered.set(false));

                info!(path = ?self.netns.path, "leave netns done");
            }
        }
    }
}

/// Creates a fresh, empty network namespace, alive as long as the handle.
///
/// The namespace is unshared on a short-lived thread so the caller's thread
/// never leaves its own namespace. Needs CAP_SYS_ADMIN.
#[cfg(test)]
pub(crate) fn scratch_netns() -> Netns {
    use std::sync::mpsc;
    use std::thread;

    use nix::sched::unshare;
    use nix::unistd::gettid;

    let (path_tx, path_rx) = mpsc::channel();
    let (opened_tx, opened_rx) = mpsc::channel::<()>();

    let thread = thread::spawn(move || {
        unshare(CloneFlags::CLONE_NEWNET).unwrap();
        path_tx
            .send(format!("/proc/self/task/{}/ns/net", gettid()))
            .unwrap();

        // keep the namespace referenced until the handle is open
        let _ = opened_rx.recv();
    });

    let path = path_rx.recv().unwrap();
    let netns = Netns::open(path).unwrap();

    drop(opened_tx);
    thread.join().unwrap();

    netns
}
