//! vmstack CLI - provision Proxmox VMs and configure clusters on them.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;
use url::Url;

use vmstack::handlers::harvester::{DEFAULT_BOOT_SERVER_URL, DEFAULT_VERSION};
use vmstack::providers::proxmox::{Proxmox, ProxmoxConfig};
use vmstack::providers::{BootSpec, Hypervisor, VmHandle};
use vmstack::run::{self, Prepared};
use vmstack::scripts::{self, HarvesterInstall};
use vmstack::{ClusterConfig, HandlerRegistry, Secrets, SshExecutor};

/// vmstack CLI - declarative VMs and clusters on Proxmox VE.
#[derive(Parser)]
#[command(name = "vmstack")]
#[command(about = "Provision Proxmox VMs and configure clusters on them")]
struct Cli {
    /// Cluster description.
    #[arg(short, long, default_value = "cluster.yaml")]
    config: PathBuf,

    /// Proxmox VE API endpoint (or set `PROXMOX_VE_ENDPOINT` env var).
    #[arg(long, env = "PROXMOX_VE_ENDPOINT")]
    endpoint: Option<Url>,

    /// Proxmox VE API token (or set `PROXMOX_VE_API_TOKEN` env var).
    #[arg(long, env = "PROXMOX_VE_API_TOKEN", hide_env_values = true)]
    api_token: Option<String>,

    /// Public key installed on cloud-init VMs (or set `SSH_PUBLIC_KEY` env var).
    #[arg(long, env = "SSH_PUBLIC_KEY")]
    ssh_public_key: Option<String>,

    /// Private key used to reach the VMs (or set `PROXMOX_VE_SSH_PRIVATE_KEY` env var).
    #[arg(long, env = "PROXMOX_VE_SSH_PRIVATE_KEY")]
    ssh_private_key: Option<PathBuf>,

    /// Accept self-signed Proxmox certificates.
    #[arg(long, default_value = "false")]
    insecure: bool,

    /// Enable verbose logging.
    #[arg(short, long, default_value = "false")]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Load and validate the cluster description.
    Validate,

    /// Print the VMs to create and the unit execution order.
    Plan,

    /// Create every VM and execute every action and service.
    Apply {
        /// Write the kubeconfig fetched during the run to this file.
        #[arg(long)]
        kubeconfig_out: Option<PathBuf>,
    },

    /// Stop and destroy one VM.
    Destroy {
        /// VM ID.
        #[arg(long)]
        vmid: u32,

        /// Physical host the VM runs on.
        #[arg(long, default_value = "proxmox-1")]
        node: String,

        /// VM name, for logging.
        #[arg(long, default_value = "")]
        name: String,
    },

    /// Write the Harvester iPXE script and install config for the boot server.
    IpxeGen {
        /// Harvester version (e.g., v1.4.1).
        #[arg(default_value = DEFAULT_VERSION)]
        version: String,

        /// Boot server root; files land in `boot/` and `config/`.
        #[arg(long, default_value = ".")]
        output_dir: PathBuf,

        /// Base URL the boot server is reachable at.
        #[arg(long, default_value = DEFAULT_BOOT_SERVER_URL)]
        boot_server_url: String,

        /// Cluster virtual IP.
        #[arg(long)]
        vip: String,

        /// Console password (or set `HARVESTER_PASSWORD` env var).
        #[arg(long, env = "HARVESTER_PASSWORD", hide_env_values = true, default_value = "")]
        password: String,

        /// Extra kernel parameters (comma-separated).
        #[arg(long, value_delimiter = ',')]
        kernel_params: Vec<String>,
    },
}

fn proxmox(cli: &Cli) -> Result<Proxmox> {
    let endpoint = cli
        .endpoint
        .clone()
        .context("PROXMOX_VE_ENDPOINT is required")?;
    let token = cli
        .api_token
        .clone()
        .context("PROXMOX_VE_API_TOKEN is required")?;
    let config = ProxmoxConfig::new(endpoint, token).with_insecure(cli.insecure);
    Proxmox::new(config).context("Failed to create Proxmox client")
}

fn prepare(cli: &Cli, registry: &HandlerRegistry) -> Result<Prepared> {
    let config = ClusterConfig::load(&cli.config)
        .with_context(|| format!("Failed to load {}", cli.config.display()))?;
    run::prepare(config, registry, cli.ssh_public_key.as_deref())
}

fn print_plan(prepared: &Prepared) -> Result<()> {
    println!(
        "\n{:<24} {:<12} {:<8} {:<8} {:<10} {:<24}",
        "VM", "NODE", "CORES", "MEMORY", "BOOT", "AFTER"
    );
    println!("{}", "-".repeat(90));
    for req in &prepared.requests {
        let boot = match &req.boot {
            BootSpec::CloudInit { .. } => "cloud-init".to_string(),
            BootSpec::Ipxe { role, .. } => format!("ipxe/{role}"),
        };
        println!(
            "{:<24} {:<12} {:<8} {:<8} {:<10} {:<24}",
            req.name,
            req.node,
            req.cores,
            req.memory_mb,
            boot,
            req.after.as_deref().unwrap_or("-")
        );
    }

    println!("\nExecution order:");
    for (i, unit) in prepared.plan.order()?.iter().enumerate() {
        let deps = if unit.depends_on.is_empty() {
            String::new()
        } else {
            format!(" (after {})", unit.depends_on.join(", "))
        };
        println!("  {}. {} [{}]{deps}", i + 1, unit.id, unit.unit_type);
    }
    Ok(())
}

fn write_file(path: &Path, contents: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    std::fs::write(path, contents).with_context(|| format!("Failed to write {}", path.display()))?;
    info!(path = %path.display(), "Wrote file");
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if cli.verbose {
            EnvFilter::new("debug")
        } else {
            EnvFilter::new("info")
        }
    });
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let registry = HandlerRegistry::with_defaults();

    match &cli.command {
        Commands::Validate => {
            let prepared = prepare(&cli, &registry)?;
            println!(
                "✓ {} VMs in {} groups, {} units",
                prepared.requests.len(),
                prepared.config.vms.len(),
                prepared.plan.units().len()
            );
        }

        Commands::Plan => {
            let prepared = prepare(&cli, &registry)?;
            print_plan(&prepared)?;
        }

        Commands::Apply { kubeconfig_out } => {
            let prepared = prepare(&cli, &registry)?;
            let proxmox = proxmox(&cli)?;
            let remote = SshExecutor::new(cli.ssh_private_key.clone())
                .with_password(prepared.config.password.clone());
            let secrets = Secrets {
                password: prepared.config.password.clone(),
                ssh_public_key: cli.ssh_public_key.clone(),
            };

            let summary = run::apply(&prepared, &proxmox, &registry, &remote, &secrets).await?;

            if let Some(path) = kubeconfig_out {
                let kubeconfig = summary
                    .kubeconfig()
                    .context("No kubeconfig was produced by this run")?;
                write_file(path, kubeconfig)?;
            }
            let yaml =
                serde_yaml::to_string(&summary.outputs).context("Failed to render outputs")?;
            println!("{yaml}");
        }

        Commands::Destroy { vmid, node, name } => {
            let proxmox = proxmox(&cli)?;
            let vm = VmHandle {
                vmid: *vmid,
                name: name.clone(),
                node: node.clone(),
            };
            proxmox
                .delete_vm(&vm)
                .await
                .with_context(|| format!("Failed to destroy VM {vmid}"))?;
            println!("✓ Destroyed VM {vmid} on {node}");
        }

        Commands::IpxeGen {
            version,
            output_dir,
            boot_server_url,
            vip,
            password,
            kernel_params,
        } => {
            let install = HarvesterInstall {
                version: version.clone(),
                boot_server_url: boot_server_url.clone(),
                vip: vip.clone(),
                password: password.clone(),
                ssh_keys: cli.ssh_public_key.iter().cloned().collect(),
                kernel_params: kernel_params.clone(),
            };
            write_file(
                &output_dir.join("boot").join(install.script_name()),
                &scripts::harvester_ipxe(&install),
            )?;
            write_file(
                &output_dir.join("config").join(install.config_name()),
                &scripts::harvester_config(&install),
            )?;
            println!("✓ Boot script served at {}", install.script_url());
        }
    }

    Ok(())
}
