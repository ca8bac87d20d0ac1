//! `cndm` — command-line interface for cndm NICs.
//!
//! ```text
//! USAGE:
//!   cndm selftest                   Loopback traffic through the simulated NIC
//!   cndm info <pcie-addr> [--phc N] Port table (and PTP clock) of a device
//!   cndm loopback <pcie-addr>       Loopback traffic on real hardware (VFIO)
//!   cndm bind-vfio <pcie-addr>      Bind device to vfio-pci (root)
//!   cndm unbind-vfio <pcie-addr>    Unbind from vfio-pci (root)
//!   cndm iommu-group <pcie-addr>    IOMMU group of a device
//! ```

use std::time::{Duration, Instant};

use anyhow::{ensure, Context, Result};
use clap::{Args, Parser, Subcommand};
use cndm_chip::regs;
use cndm_driver::device::RegisterWindow;
use cndm_driver::{
    Driver, DriverConfig, MappedBar, PciFunction, PhcClock, PortTable, SimConfig, SimDevice,
};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "cndm", about = "cndm NIC driver CLI", version)]
struct Cli {
    #[command(subcommand)]
    command: Cmd,
}

#[derive(Args, Clone, Copy)]
struct Traffic {
    /// Number of 60-byte frames per port.
    #[arg(long, default_value_t = 64)]
    small: usize,
    /// Number of 1514-byte frames per port.
    #[arg(long, default_value_t = 32)]
    large: usize,
    /// log2 of the RX and TX ring sizes.
    #[arg(long, default_value_t = 8)]
    ring_log_size: u32,
}

#[derive(Subcommand)]
enum Cmd {
    /// Run loopback traffic through the simulated device.
    Selftest {
        /// Number of simulated ports.
        #[arg(long, default_value_t = 1)]
        ports: u32,
        #[command(flatten)]
        traffic: Traffic,
    },
    /// Print the port table (and PTP clock) of a device.
    Info {
        /// PCIe address (e.g. 0000:01:00.0).
        pcie_addr: String,
        /// BAR0 offset of the PTP clock block (e.g. 0x1000).
        #[arg(long, value_parser = parse_offset)]
        phc: Option<u32>,
    },
    /// Run loopback traffic on every port of a VFIO-bound device.
    Loopback {
        /// PCIe address (e.g. 0000:01:00.0).
        pcie_addr: String,
        #[command(flatten)]
        traffic: Traffic,
    },
    /// Bind a device to vfio-pci (requires root / CAP_SYS_ADMIN).
    BindVfio {
        /// PCIe address (e.g. 0000:01:00.0).
        pcie_addr: String,
    },
    /// Unbind a device from vfio-pci.
    UnbindVfio {
        /// PCIe address (e.g. 0000:01:00.0).
        pcie_addr: String,
    },
    /// Query the IOMMU group for a device.
    IommuGroup {
        /// PCIe address (e.g. 0000:01:00.0).
        pcie_addr: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| "warn".into()),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Cmd::Selftest { ports, traffic } => cmd_selftest(ports, traffic).await?,
        Cmd::Info { pcie_addr, phc } => cmd_info(&pcie_addr, phc).await?,
        Cmd::Loopback { pcie_addr, traffic } => cmd_loopback(&pcie_addr, traffic).await?,
        Cmd::BindVfio { pcie_addr } => cmd_bind_vfio(&pcie_addr)?,
        Cmd::UnbindVfio { pcie_addr } => cmd_unbind_vfio(&pcie_addr)?,
        Cmd::IommuGroup { pcie_addr } => cmd_iommu_group(&pcie_addr)?,
    }

    Ok(())
}

fn parse_offset(s: &str) -> Result<u32, String> {
    let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u32::from_str_radix(hex, 16),
        None => s.parse(),
    };
    parsed.map_err(|e| format!("invalid offset {s:?}: {e}"))
}

fn pattern(len: usize, seed: usize) -> Vec<u8> {
    (0..len).map(|i| ((i + seed * 7) % 251) as u8).collect()
}

/// Send the configured frames on every port and check they come back
/// byte-identical and in order.
async fn run_traffic<D: PciFunction>(driver: &Driver<D>, traffic: Traffic) -> Result<()> {
    let frames: Vec<Vec<u8>> = (0..traffic.small)
        .map(|k| pattern(60, k))
        .chain((0..traffic.large).map(|k| pattern(1514, traffic.small + k)))
        .collect();
    let bytes: usize = frames.iter().map(Vec::len).sum();

    // Half a ring per burst keeps clear of the RX refill threshold.
    let burst = ((1usize << traffic.ring_log_size.min(16)) / 2).max(1);
    for port in driver.ports() {
        let start = Instant::now();
        for chunk in frames.chunks(burst) {
            for frame in chunk {
                port.start_xmit(frame).await?;
            }
            for (k, frame) in chunk.iter().enumerate() {
                let got = port
                    .recv_timeout(Duration::from_secs(1))
                    .await
                    .with_context(|| format!("port {}: frame {k} lost", port.index()))?;
                ensure!(
                    got[..] == frame[..],
                    "port {}: frame {k} corrupted ({} bytes, expected {})",
                    port.index(),
                    got.len(),
                    frame.len()
                );
            }
        }
        let elapsed = start.elapsed();
        port.process_tx_cq().await?;
        let stats = port.stats();
        println!(
            "port {}: {} frames, {} bytes in {:.2?} ({:.1} MB/s)",
            port.index(),
            stats.rx_packets,
            stats.rx_bytes,
            elapsed,
            bytes as f64 / elapsed.as_secs_f64() / 1e6
        );
        ensure!(stats.rx_truncated == 0, "port {}: truncated frames", port.index());
    }
    Ok(())
}

async fn cmd_selftest(ports: u32, traffic: Traffic) -> Result<()> {
    let sim = SimDevice::new(SimConfig::with_ports(ports));
    let config = DriverConfig::default().with_ring_log_size(traffic.ring_log_size);
    let driver = Driver::init(sim.clone(), config).await?;
    println!("Simulated cndm: {} ports", driver.port_count());

    let result = run_traffic(&driver, traffic).await;
    driver.shutdown().await?;
    result?;

    let stats = sim.stats();
    println!(
        "device: {} commands, {} frames, {} dropped, {} interrupts",
        stats.commands, stats.tx_frames, stats.rx_dropped, stats.irqs
    );
    ensure!(
        driver.packets().outstanding() == 0,
        "{} packet buffers leaked",
        driver.packets().outstanding()
    );
    println!("✅ selftest passed");
    Ok(())
}

async fn cmd_info(pcie_addr: &str, phc: Option<u32>) -> Result<()> {
    let bar = std::sync::Arc::new(MappedBar::sysfs(pcie_addr, 0)?);
    let table = PortTable::read(bar.as_ref()).await?;
    let ctrl = bar.read_dword(regs::MBOX_CTRL).await?;

    println!("PCIe address : {pcie_addr}");
    println!("BAR0 size    : {:#x}", bar.size());
    println!("Ports        : {}", table.count);
    println!("Port offset  : {:#x}", table.offset);
    println!("Port stride  : {:#x}", table.stride);
    println!(
        "Mailbox      : {}",
        if ctrl & regs::mbox::BUSY == 0 { "idle" } else { "busy" }
    );
    if let Some(offset) = phc {
        let clock = PhcClock::new(bar.clone(), offset);
        let now = clock.time().await?;
        println!("PHC time     : {}.{:09}", now.secs, now.nanos);
        println!("PHC period   : {:#x}", clock.nominal_period().await?);
    }
    Ok(())
}

async fn cmd_loopback(pcie_addr: &str, traffic: Traffic) -> Result<()> {
    let device = cndm_driver::VfioDevice::open(pcie_addr)?;
    let config = DriverConfig::default().with_ring_log_size(traffic.ring_log_size);
    let driver = Driver::init(device, config).await?;
    println!("{pcie_addr}: {} ports", driver.port_count());

    let result = run_traffic(&driver, traffic).await;
    driver.shutdown().await?;
    result
}

fn cmd_bind_vfio(pcie_addr: &str) -> Result<()> {
    cndm_driver::vfio::bind_to_vfio(pcie_addr)?;
    println!("{pcie_addr} bound to vfio-pci");
    println!("IOMMU group: {}", cndm_driver::vfio::iommu_group(pcie_addr)?);
    Ok(())
}

fn cmd_unbind_vfio(pcie_addr: &str) -> Result<()> {
    cndm_driver::vfio::unbind_from_vfio(pcie_addr)?;
    println!("{pcie_addr} released from vfio-pci");
    Ok(())
}

fn cmd_iommu_group(pcie_addr: &str) -> Result<()> {
    let group = cndm_driver::vfio::iommu_group(pcie_addr)?;
    println!("{pcie_addr} → IOMMU group {group}");
    println!("  /dev/vfio/{group}");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn offsets_parse_as_hex_or_decimal() {
        assert_eq!(parse_offset("0x1000"), Ok(0x1000));
        assert_eq!(parse_offset("0X20"), Ok(0x20));
        assert_eq!(parse_offset("4096"), Ok(4096));
        assert!(parse_offset("0xzz").is_err());
        assert!(parse_offset("").is_err());
    }

    #[test]
    fn info_takes_a_clock_offset() {
        let cli = Cli::try_parse_from(["cndm", "info", "0000:01:00.0", "--phc", "0x1000"])
            .expect("parse");
        match cli.command {
            Cmd::Info { pcie_addr, phc } => {
                assert_eq!(pcie_addr, "0000:01:00.0");
                assert_eq!(phc, Some(0x1000));
            }
            _ => panic!("wrong subcommand"),
        }
    }
}
