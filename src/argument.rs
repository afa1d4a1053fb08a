use std::path::PathBuf;
use std::str::FromStr;

use clap::Parser;

use crate::error::Error;

/// netter CNI plugin, driven by the CNI_* environment
#[derive(Debug, Parser)]
#[clap(version, about)]
pub struct Argument {
    #[clap(long, env = "CNI_COMMAND")]
    /// ADD, DEL or VERSION
    pub command: String,

    #[clap(long, env = "CNI_CONTAINERID")]
    /// container id
    pub container_id: Option<String>,

    #[clap(long, env = "CNI_NETNS")]
    /// container netns path
    pub netns: Option<PathBuf>,

    #[clap(long, env = "CNI_IFNAME")]
    /// interface name inside the container
    pub if_name: Option<String>,

    #[clap(long, env = "CNI_PATH")]
    /// plugin search path
    pub cni_path: Option<String>,

    #[clap(long, env = "CNI_ARGS")]
    /// extra plugin arguments
    pub cni_args: Option<String>,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Command {
    Add,
    Del,
    Version,
}

impl FromStr for Command {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ADD" => Ok(Command::Add),
            "DEL" => Ok(Command::Del),
            "VERSION" => Ok(Command::Version),
            other => Err(Error::InvalidEnvironment(format!(
                "unsupported CNI_COMMAND {}",
                other
            ))),
        }
    }
}
