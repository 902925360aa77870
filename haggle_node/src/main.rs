// Copyright 2024 MaidSafe.net limited.
//
// This SAFE Network Software is licensed to you under The General Public License (GPL), version 3.
// Unless required by applicable law or agreed to in writing, the SAFE Network Software distributed
// under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied. Please review the Licences for the specific language governing
// permissions and limitations relating to use of the SAFE Network Software.

//! `haggled`: runs one Haggle engine instance until interrupted.

#[macro_use]
extern crate tracing;

use clap::Parser;
use color_eyre::eyre::Result;
use haggle_kernel::{KernelBuilder, KernelConfig, TCP_DEFAULT_PORT};
use haggle_logging::{init_logging, LogOutputDest};
use haggle_protocol::{Address, Interface, InterfaceType};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "haggled", version, about = "Delay-tolerant content-centric node")]
struct Opt {
    /// Directory for payload files and the data store.
    #[arg(long, default_value = "haggle-store")]
    storage_dir: PathBuf,

    /// Human-readable name of this node.
    #[arg(long, default_value = "haggle-node")]
    name: String,

    /// Address to accept peer contacts on.
    #[arg(long, default_value_t = IpAddr::V4(Ipv4Addr::UNSPECIFIED))]
    listen_addr: IpAddr,

    /// TCP port for peer contacts.
    #[arg(long, default_value_t = TCP_DEFAULT_PORT)]
    port: u16,

    /// Log to hourly-rotated files in this directory instead of stdout.
    #[arg(long)]
    log_dir: Option<PathBuf>,
}

fn main() -> Result<()> {
    color_eyre::install()?;
    let opt = Opt::parse();

    let dest = match &opt.log_dir {
        Some(dir) => LogOutputDest::Dir(dir.clone()),
        None => LogOutputDest::Stdout,
    };
    let _log_guard = init_logging(dest)?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    runtime.block_on(run(opt))
}

async fn run(opt: Opt) -> Result<()> {
    let mut config = KernelConfig::new(&opt.storage_dir);
    config.node_name = opt.name.clone();
    config.tcp_port = opt.port;

    // The local interface this node is reachable over; its identity feeds
    // into the node id.
    let listen = SocketAddr::new(opt.listen_addr, config.tcp_port);
    let mut identifier = opt.name.into_bytes();
    identifier.extend_from_slice(&config.tcp_port.to_be_bytes());
    let local_iface = Interface::new(InterfaceType::Ethernet, identifier)
        .with_name("local")
        .with_address(Address::Socket(listen))
        .local();

    let kernel = KernelBuilder::new(config)
        .local_interface(local_iface)
        .build()?;
    let handle = kernel.handle();

    info!("starting haggled on {listen}");
    let kernel_task = tokio::spawn(kernel.run());

    tokio::signal::ctrl_c().await?;
    info!("interrupt received, shutting down");
    handle.shutdown();
    kernel_task.await?;

    Ok(())
}
