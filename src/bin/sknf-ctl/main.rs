use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::fs;
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;

use sknf::config::{Installer, NetConf, SknfConfig, SUBNET_PLACEHOLDER};
use sknf::ipam::{FileLedger, IpAllocator, DEFAULT_LEDGER_PATH};
use sknf::naming::DeviceNames;
use sknf::rtnl::RtnlChannel;
use sknf::topology::{LinkChannel, DEFAULT_BRIDGE_NAME, DEFAULT_VXLAN_NAME};

/// Operator tool for the sknf CNI plugin
#[derive(Parser)]
#[command(name = "sknf-ctl", author, version, about)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Subcommand to execute
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate a network configuration
    Generate {
        /// Network name
        #[arg(long, default_value = "sknf-network")]
        name: String,

        /// Pod subnet of this node (CIDR)
        #[arg(long)]
        subnet: String,

        /// Pod network of the whole cluster (CIDR)
        #[arg(long)]
        cluster_cidr: String,

        /// Physical uplink interface
        #[arg(long)]
        uplink: String,

        /// VXLAN network identifier
        #[arg(long)]
        vni: Option<u32>,

        /// Lock the IP ledger around allocations
        #[arg(long)]
        lock_ledger: bool,

        /// Enable br_netfilter sysctls on ADD
        #[arg(long)]
        br_netfilter: bool,

        /// Output file path
        #[arg(long)]
        output: Option<PathBuf>,
    },

    /// Install the plugin binary and its network configuration
    Install {
        /// Plugin binary to copy
        #[arg(long)]
        binary: PathBuf,

        /// Pod subnet of this node, substituted for {{SUBNET}}
        #[arg(long)]
        subnet: String,

        /// Configuration template; generated when omitted
        #[arg(long)]
        template: Option<PathBuf>,

        /// Cluster pod network, needed when no template is given
        #[arg(long)]
        cluster_cidr: Option<String>,

        /// Physical uplink, needed when no template is given
        #[arg(long)]
        uplink: Option<String>,

        /// Installation directory
        #[arg(long, default_value = "/opt/cni/bin")]
        bin_dir: PathBuf,

        /// CNI configuration directory
        #[arg(long, default_value = "/etc/cni/net.d")]
        conf_dir: PathBuf,
    },

    /// Print the host-side device names of a container attachment
    Names {
        /// Container network namespace path
        #[arg(long)]
        netns: String,

        /// Interface name inside the container
        #[arg(long, default_value = "eth0")]
        ifname: String,

        /// Container ID
        #[arg(long)]
        container_id: String,
    },

    /// Show the last-issued container address
    Ledger {
        #[arg(long, default_value = DEFAULT_LEDGER_PATH)]
        path: PathBuf,
    },

    /// Status of the bridge and VXLAN devices on this host
    Status {
        #[arg(long, default_value = DEFAULT_BRIDGE_NAME)]
        bridge: String,

        #[arg(long, default_value = DEFAULT_VXLAN_NAME)]
        vxlan: String,
    },
}

fn default_template(cluster_cidr: Option<&str>, uplink: Option<&str>) -> Result<String> {
    let (Some(cluster_cidr), Some(uplink)) = (cluster_cidr, uplink) else {
        anyhow::bail!("--cluster-cidr and --uplink are required without --template");
    };

    let conf = NetConf::new_default("sknf-network", SUBNET_PLACEHOLDER, cluster_cidr, uplink);
    Ok(serde_json::to_string_pretty(&conf)?)
}

fn run_install(
    binary: &Path,
    subnet: &str,
    template: Option<&Path>,
    cluster_cidr: Option<&str>,
    uplink: Option<&str>,
    config: SknfConfig,
) -> Result<()> {
    let template = match template {
        Some(path) => fs::read_to_string(path)
            .with_context(|| format!("Failure opening CNI plugin conf template from {}", path.display()))?,
        None => default_template(cluster_cidr, uplink)?,
    };

    let installer = Installer::new(config);
    installer.install(binary, &template, subnet)?;

    println!(
        "sknf installed to {} with subnet {}",
        installer.config().cni_bin_dir.display(),
        subnet
    );
    Ok(())
}

async fn print_device(links: &RtnlChannel, name: &str) -> Result<()> {
    match links.link_index(name).await? {
        Some(index) => {
            let master = links.link_master(index).await?;
            match master {
                Some(master) => println!("  {} (ifindex {}, master ifindex {})", name, index, master),
                None => println!("  {} (ifindex {})", name, index),
            }
        }
        None => println!("  {} not present", name),
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(log_level))
        .with_writer(std::io::stderr)
        .try_init()
        .map_err(|e| anyhow::anyhow!("Failed to set default subscriber: {}", e))?;

    match cli.command {
        Commands::Generate {
            name,
            subnet,
            cluster_cidr,
            uplink,
            vni,
            lock_ledger,
            br_netfilter,
            output,
        } => {
            let mut conf = NetConf::new_default(&name, &subnet, &cluster_cidr, &uplink);
            if let Some(vni) = vni {
                conf.vxlan.vni = vni;
            }
            conf.ledger.lock = lock_ledger;
            conf.br_netfilter = br_netfilter;

            // Round-trip through the plugin's own validation
            let json = serde_json::to_string_pretty(&conf)?;
            NetConf::parse(json.as_bytes()).context("Generated configuration is invalid")?;

            if let Some(path) = output {
                conf.save(&path)?;
                println!("Network configuration written to {}", path.display());
            } else {
                println!("{}", json);
            }
        }

        Commands::Install {
            binary,
            subnet,
            template,
            cluster_cidr,
            uplink,
            bin_dir,
            conf_dir,
        } => {
            let config = SknfConfig {
                cni_bin_dir: bin_dir,
                cni_conf_dir: conf_dir,
                ..SknfConfig::default()
            };
            run_install(
                &binary,
                &subnet,
                template.as_deref(),
                cluster_cidr.as_deref(),
                uplink.as_deref(),
                config,
            )?;
        }

        Commands::Names {
            netns,
            ifname,
            container_id,
        } => {
            let names = DeviceNames::derive(&netns, &ifname, &container_id);
            println!("host:      {}", names.host);
            println!("transient: {}", names.transient);
        }

        Commands::Ledger { path } => {
            let allocator = IpAllocator::new(FileLedger::new(&path));
            match allocator.last_issued()? {
                Some(cidr) => println!("{}", cidr),
                None => println!("No address issued yet ({} is absent)", path.display()),
            }
        }

        Commands::Status { bridge, vxlan } => {
            let links = RtnlChannel::connect()?;
            println!("Overlay devices:");
            print_device(&links, &bridge).await?;
            print_device(&links, &vxlan).await?;
        }
    }

    Ok(())
}
