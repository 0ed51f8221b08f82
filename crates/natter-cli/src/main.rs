//! natter CLI
//!
//! Finds the local gateway, asks it for port forwardings, and learns the
//! host's public address over UPnP or STUN.

mod config;

use clap::{Args, Parser, Subcommand};
use natter_traversal::nat::StunClient;
use natter_traversal::upnp::{
    IgdDevice, PortMappingRequest, Protocol, SoapClient, UpnpErrorCode, discover_igd,
};
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use tokio::net::UdpSocket;

use config::Config;

/// natter - NAT traversal helper
#[derive(Parser)]
#[command(name = "natter")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Configuration file path
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

/// Where to send UPnP commands; discovered when not given
#[derive(Args)]
struct GatewayArgs {
    /// Control URL of the gateway
    #[arg(long, requires = "service_type")]
    control_url: Option<String>,

    /// Service type of the gateway
    #[arg(long, requires = "control_url")]
    service_type: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Search the local network for a UPnP gateway
    Discover,

    /// Ask the gateway for its external IP address
    ExternalIp {
        #[command(flatten)]
        gateway: GatewayArgs,
    },

    /// Forward an external port to this host
    Map {
        /// External port on the gateway
        #[arg(required = true)]
        external_port: u16,

        /// Internal port; defaults to the external port
        #[arg(short, long)]
        internal_port: Option<u16>,

        /// Internal client address; defaults to the address facing the gateway
        #[arg(long)]
        internal_client: Option<IpAddr>,

        /// Transport protocol
        #[arg(short, long, default_value = "udp")]
        protocol: Protocol,

        /// Mapping description
        #[arg(short, long)]
        description: Option<String>,

        /// Only accept traffic from this remote host
        #[arg(long)]
        remote_host: Option<String>,

        #[command(flatten)]
        gateway: GatewayArgs,
    },

    /// Remove a port forwarding
    Unmap {
        /// External port on the gateway
        #[arg(required = true)]
        external_port: u16,

        /// Transport protocol
        #[arg(short, long, default_value = "udp")]
        protocol: Protocol,

        /// Remote host the mapping was restricted to
        #[arg(long)]
        remote_host: Option<String>,

        #[command(flatten)]
        gateway: GatewayArgs,
    },

    /// Show where an external port is forwarded to
    QueryMapping {
        /// External port on the gateway
        #[arg(required = true)]
        external_port: u16,

        /// Transport protocol
        #[arg(short, long, default_value = "udp")]
        protocol: Protocol,

        #[command(flatten)]
        gateway: GatewayArgs,
    },

    /// Learn the public address through a STUN server
    Stun {
        /// STUN server; overrides the configuration
        #[arg(short, long)]
        server: Option<String>,

        /// STUN server port; overrides the configuration
        #[arg(short, long)]
        port: Option<u16>,

        /// Local address to send from
        #[arg(short, long, default_value = "0.0.0.0:0")]
        bind: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Load configuration
    let config = match &cli.config {
        Some(path) => Config::load(path)?,
        None => Config::load_or_default()?,
    };

    // Validate configuration
    config.validate()?;

    // Initialize logging
    let level = if cli.verbose {
        "debug".to_string()
    } else {
        config.logging.level.to_lowercase()
    };
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new(level))
        .init();

    match cli.command {
        Commands::Discover => {
            discover(&config).await?;
        }
        Commands::ExternalIp { gateway } => {
            external_ip(&gateway, &config).await?;
        }
        Commands::Map {
            external_port,
            internal_port,
            internal_client,
            protocol,
            description,
            remote_host,
            gateway,
        } => {
            let request = MapArgs {
                external_port,
                internal_port: internal_port.unwrap_or(external_port),
                internal_client,
                protocol,
                description,
                remote_host,
            };
            map_port(request, &gateway, &config).await?;
        }
        Commands::Unmap {
            external_port,
            protocol,
            remote_host,
            gateway,
        } => {
            unmap_port(external_port, protocol, remote_host, &gateway, &config).await?;
        }
        Commands::QueryMapping {
            external_port,
            protocol,
            gateway,
        } => {
            query_mapping(external_port, protocol, &gateway, &config).await?;
        }
        Commands::Stun { server, port, bind } => {
            stun(server, port, bind, &config).await?;
        }
    }

    Ok(())
}

/// Gateway from the command line, or from discovery
async fn gateway(args: &GatewayArgs, config: &Config) -> anyhow::Result<Option<IgdDevice>> {
    if let (Some(control_url), Some(service_type)) = (&args.control_url, &args.service_type) {
        return Ok(Some(IgdDevice {
            control_url: control_url.clone(),
            service_type: service_type.clone(),
        }));
    }

    let device = discover_igd(config.discovery_config()?).await?;
    if device.is_none() {
        println!("No UPnP gateway found");
    }
    Ok(device)
}

/// Local address the host uses to reach `control_url`
async fn address_facing(control_url: &str) -> anyhow::Result<IpAddr> {
    let url = natter_traversal::upnp::http::HttpUrl::parse(control_url)?;
    let remote: SocketAddr = tokio::net::lookup_host((url.host.as_str(), url.port))
        .await?
        .next()
        .ok_or_else(|| anyhow::anyhow!("Cannot resolve gateway host {}", url.host))?;

    let bind = if remote.is_ipv4() { "0.0.0.0:0" } else { "[::]:0" };
    let socket = UdpSocket::bind(bind).await?;
    socket.connect(remote).await?;
    Ok(socket.local_addr()?.ip())
}

/// Search for a gateway
async fn discover(config: &Config) -> anyhow::Result<()> {
    tracing::info!("Searching for a UPnP gateway");

    let discovery = config.discovery_config()?;
    match discover_igd(discovery).await? {
        Some(device) => {
            println!("Control URL: {}", device.control_url);
            println!("Service type: {}", device.service_type);

            let client = SoapClient::new(config.command_config());
            match client
                .get_status_info(&device.control_url, &device.service_type)
                .await
            {
                Ok(status) => println!("Status: {}", status.status),
                Err(e) => tracing::info!("Status unavailable: {}", e),
            }
        }
        None => println!("No UPnP gateway found"),
    }

    Ok(())
}

/// Print the gateway's external IP address
async fn external_ip(args: &GatewayArgs, config: &Config) -> anyhow::Result<()> {
    let Some(device) = gateway(args, config).await? else {
        return Ok(());
    };

    let client = SoapClient::new(config.command_config());
    let ip = client
        .get_external_ip(&device.control_url, &device.service_type)
        .await?;
    println!("External IP: {}", ip);
    Ok(())
}

/// Arguments of the `map` subcommand
struct MapArgs {
    external_port: u16,
    internal_port: u16,
    internal_client: Option<IpAddr>,
    protocol: Protocol,
    description: Option<String>,
    remote_host: Option<String>,
}

/// Install a port forwarding
async fn map_port(args: MapArgs, gateway_args: &GatewayArgs, config: &Config) -> anyhow::Result<()> {
    let Some(device) = gateway(gateway_args, config).await? else {
        return Ok(());
    };

    let internal_client = match args.internal_client {
        Some(ip) => ip,
        None => address_facing(&device.control_url).await?,
    };

    let mut request = PortMappingRequest::new(
        args.external_port,
        args.internal_port,
        internal_client.to_string(),
        args.protocol,
    )
    .with_description(
        args.description
            .unwrap_or_else(|| config.upnp.mapping_description.clone()),
    );
    if let Some(remote_host) = args.remote_host {
        request = request.with_remote_host(remote_host);
    }

    let client = SoapClient::new(config.command_config());
    client
        .add_port_mapping(&device.control_url, &device.service_type, &request)
        .await
        .map_err(|e| {
            anyhow::anyhow!("{} ({})", e, UpnpErrorCode::describe(e.code()))
        })?;

    println!(
        "Mapped {} port {} to {}:{}",
        request.protocol, request.external_port, request.internal_client, request.internal_port
    );
    Ok(())
}

/// Remove a port forwarding
async fn unmap_port(
    external_port: u16,
    protocol: Protocol,
    remote_host: Option<String>,
    gateway_args: &GatewayArgs,
    config: &Config,
) -> anyhow::Result<()> {
    let Some(device) = gateway(gateway_args, config).await? else {
        return Ok(());
    };

    let client = SoapClient::new(config.command_config());
    client
        .delete_port_mapping(
            &device.control_url,
            &device.service_type,
            external_port,
            protocol,
            remote_host.as_deref(),
        )
        .await
        .map_err(|e| {
            anyhow::anyhow!("{} ({})", e, UpnpErrorCode::describe(e.code()))
        })?;

    println!("Removed {} port {}", protocol, external_port);
    Ok(())
}

/// Show where a port is forwarded to
async fn query_mapping(
    external_port: u16,
    protocol: Protocol,
    gateway_args: &GatewayArgs,
    config: &Config,
) -> anyhow::Result<()> {
    let Some(device) = gateway(gateway_args, config).await? else {
        return Ok(());
    };

    let client = SoapClient::new(config.command_config());
    match client
        .get_specific_port_mapping_entry(
            &device.control_url,
            &device.service_type,
            external_port,
            protocol,
        )
        .await
    {
        Ok(entry) => println!(
            "{} port {} -> {}:{}",
            protocol, external_port, entry.internal_client, entry.internal_port
        ),
        Err(e) if e.code() == UpnpErrorCode::NO_SUCH_ENTRY => {
            println!("{} port {} is not mapped", protocol, external_port);
        }
        Err(e) => anyhow::bail!("{} ({})", e, UpnpErrorCode::describe(e.code())),
    }
    Ok(())
}

/// Learn the public address through STUN
async fn stun(
    server: Option<String>,
    port: Option<u16>,
    bind: String,
    config: &Config,
) -> anyhow::Result<()> {
    let server = server.unwrap_or_else(|| config.stun.server.clone());
    let port = port.unwrap_or(config.stun.port);
    tracing::info!("Querying STUN server {}:{}", server, port);

    let client = StunClient::bind(&bind).await?;
    match client
        .get_mapped_address(&server, port, config.stun_timeout())
        .await
    {
        Ok(mapped) => {
            println!("Local address: {}", client.local_addr()?);
            println!("Mapped address: {}", mapped);
        }
        Err(natter_traversal::nat::StunError::Timeout) => {
            println!("No reply from STUN server {}:{}", server, port);
        }
        Err(e) => return Err(e.into()),
    }
    Ok(())
}
