use std::collections::HashMap;
use std::env;
use std::io::{self, Read, Write};
use tokio::runtime::{Builder, Runtime};
use tracing::debug;

use crate::config::{NetConf, CNI_VERSION, SUPPORTED_VERSIONS};
use crate::error::{CniError, Result};
use crate::nat::{LazyTransport, NatRuleInstaller, NetfilterSocket};
use crate::plugin::OverlayPlugin;
use crate::rtnl::RtnlChannel;
use crate::types::{CmdArgs, VersionResult};

fn required_env(name: &str) -> Result<String> {
    env::var(name).map_err(|_| CniError::MissingEnvironment(name.to_string()))
}

/// Parse command arguments from environment
pub fn parse_args() -> Result<CmdArgs> {
    let container_id = required_env("CNI_CONTAINERID")?;
    let netns = required_env("CNI_NETNS")?;
    let ifname = required_env("CNI_IFNAME")?;

    let args_str = env::var("CNI_ARGS").unwrap_or_default();
    let args = parse_cni_args(&args_str);

    let mut stdin_data = Vec::new();
    io::stdin()
        .read_to_end(&mut stdin_data)
        .map_err(|e| CniError::io("Failed to read from stdin", "stdin", e))?;

    Ok(CmdArgs {
        container_id,
        netns,
        ifname,
        args,
        stdin_data,
    })
}

/// Parse CNI_ARGS string into key-value pairs
pub fn parse_cni_args(args_str: &str) -> HashMap<String, String> {
    args_str
        .split(';')
        .filter_map(|pair| pair.split_once('='))
        .map(|(key, value)| (key.to_string(), value.to_string()))
        .collect()
}

// The whole invocation is one short-lived task
fn runtime() -> Result<Runtime> {
    Builder::new_current_thread()
        .enable_all()
        .build()
        .map_err(|e| CniError::io("Failed to create Tokio runtime", "tokio", e))
}

/// Execute the add command
pub fn cmd_add(out: &mut impl Write) -> Result<()> {
    let args = parse_args()?;
    let conf = NetConf::parse(&args.stdin_data)?;
    let plugin = OverlayPlugin::new(conf, args);

    let result = runtime()?.block_on(async {
        let links = RtnlChannel::connect()?;
        // opened only once the topology is wired
        let mut nat = NatRuleInstaller::new(LazyTransport::new(NetfilterSocket::open));
        plugin.add_network(&links, &mut nat).await
    })?;

    result.write_to(out)
}

/// Execute the delete command
pub fn cmd_del() -> Result<()> {
    let args = parse_args()?;
    let conf = NetConf::parse(&args.stdin_data)?;
    let plugin = OverlayPlugin::new(conf, args);

    runtime()?.block_on(async {
        let links = RtnlChannel::connect()?;
        plugin.del_network(&links).await
    })
}

/// Execute the version command
pub fn cmd_version(out: &mut impl Write) -> Result<()> {
    VersionResult::new(CNI_VERSION, SUPPORTED_VERSIONS).write_to(out)
}

/// Run one CNI command, writing its response to `out`
pub fn dispatch(command: &str, out: &mut impl Write) -> Result<()> {
    debug!("Dispatching CNI command {}", command);
    match command {
        "ADD" => cmd_add(out),
        "DEL" => cmd_del(),
        "VERSION" => cmd_version(out),
        // accepted without doing anything
        "CHECK" | "STATUS" | "GC" => Ok(()),
        other => Err(CniError::UnknownCommand(other.to_string())),
    }
}

/// Main entry point for the CNI plugin
pub fn run_cni() -> Result<()> {
    let command = required_env("CNI_COMMAND")?;
    let stdout = io::stdout();
    let mut out = stdout.lock();
    dispatch(&command, &mut out)
}
