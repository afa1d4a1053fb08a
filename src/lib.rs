use std::io;
use std::process::ExitCode;
use std::str::FromStr;

use bytes::Bytes;
use clap::Parser;
use tokio::io::AsyncReadExt;
use tracing::level_filters::LevelFilter;
use tracing::{error, info};
use tracing_subscriber::fmt;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use crate::argument::{Argument, Command};
use crate::configure::NetlinkConfigurator;
use crate::ipam::ExecIpam;
use crate::link::VethLinkManager;
use crate::plugin::{Invocation, Plugin};
use crate::types::{ErrorResult, VersionResult};

pub use error::Error;

mod argument;
pub mod config;
pub mod configure;
pub mod error;
pub mod ipam;
pub mod link;
mod netlink;
pub mod netns;
pub mod plugin;
pub mod types;

const LOG_ENV: &str = "NETTER_LOG";

/// Logs go to stderr, stdout carries the CNI result.
pub fn init_log() {
    let level = std::env::var(LOG_ENV)
        .ok()
        .and_then(|level| LevelFilter::from_str(&level).ok())
        .unwrap_or(LevelFilter::INFO);

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(io::stderr))
        .with(level)
        .init();
}

pub async fn run() -> ExitCode {
    let argument = match Argument::try_parse() {
        Err(err) => {
            error!(%err, "parse CNI environment failed");

            return report(
                config::LATEST_VERSION,
                None,
                &Error::InvalidEnvironment(err.to_string()),
            );
        }

        Ok(argument) => argument,
    };

    let command = match argument.command.parse::<Command>() {
        Err(err) => return report(config::LATEST_VERSION, None, &err),
        Ok(command) => command,
    };

    let mut raw_config = vec![];
    if let Err(err) = tokio::io::stdin().read_to_end(&mut raw_config).await {
        error!(%err, "read network config from stdin failed");

        return report(
            config::LATEST_VERSION,
            argument.container_id.as_deref(),
            &Error::ConfigInvalid(format!("read stdin failed: {}", err)),
        );
    }

    let cni_version = config::cni_version_of(&raw_config);

    if command == Command::Version {
        return version(&cni_version);
    }

    let invocation = Invocation {
        container_id: argument.container_id.unwrap_or_default(),
        netns: argument.netns.filter(|netns| !netns.as_os_str().is_empty()),
        if_name: argument.if_name.unwrap_or_default(),
        cni_path: argument.cni_path.unwrap_or_default(),
        cni_args: argument.cni_args,
        config: Bytes::from(raw_config),
    };

    info!(
        ?command,
        container_id = %invocation.container_id,
        netns = ?invocation.netns,
        if_name = %invocation.if_name,
        "invoked"
    );

    match execute(command, &invocation).await {
        Err(err) => {
            error!(%err, ?command, container_id = %invocation.container_id, "command failed");

            report(&cni_version, Some(invocation.container_id.as_str()), &err)
        }

        Ok(_) => {
            info!(?command, container_id = %invocation.container_id, "command done");

            ExitCode::SUCCESS
        }
    }
}

async fn execute(command: Command, invocation: &Invocation) -> Result<(), Error> {
    let plugin = Plugin::new(VethLinkManager::new()?, NetlinkConfigurator, ExecIpam);

    match command {
        Command::Add => {
            let result = plugin.attach(invocation).await?;

            types::write_result(io::stdout().lock(), &result).map_err(|err| {
                error!(%err, "write attach result failed");

                Error::InvalidEnvironment(format!("write result failed: {}", err))
            })
        }

        Command::Del => plugin.detach(invocation).await,

        Command::Version => Ok(()),
    }
}

/// Echo the requested version when it is one we speak.
fn version(cni_version: &str) -> ExitCode {
    let cni_version = if config::SUPPORTED_VERSIONS.contains(&cni_version) {
        cni_version
    } else {
        config::LATEST_VERSION
    };
    let result = VersionResult::new(cni_version);

    match types::write_result(io::stdout().lock(), &result) {
        Err(err) => {
            error!(%err, "write version result failed");

            ExitCode::FAILURE
        }

        Ok(_) => ExitCode::SUCCESS,
    }
}

fn report(cni_version: &str, container_id: Option<&str>, err: &Error) -> ExitCode {
    let result = ErrorResult::new(cni_version, container_id, err);

    if let Err(write_err) = types::write_result(io::stdout().lock(), &result) {
        error!(%write_err, "write error result failed");
    }

    ExitCode::FAILURE
}
