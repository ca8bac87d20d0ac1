//! Tests against a real cndm function bound to vfio-pci.
//!
//! Set `CNDM_PCIE_ADDRESS` (e.g. `0000:01:00.0`) and run with `--ignored`.

use std::time::Duration;

use cndm_driver::prelude::*;

fn pcie_address() -> String {
    std::env::var("CNDM_PCIE_ADDRESS").unwrap_or_else(|_| "0000:01:00.0".to_string())
}

#[tokio::test(flavor = "multi_thread")]
#[ignore] // Requires cndm hardware bound to vfio-pci
async fn test_vfio_bring_up() {
    let device = VfioDevice::open(&pcie_address()).expect("open VFIO device");
    let driver = Driver::init(device, DriverConfig::default())
        .await
        .expect("driver init");

    println!("Ports: {:?}", driver.port_table());
    assert!(driver.port_count() > 0);
    for port in driver.ports() {
        assert!(port.rx_posted().await > 0);
    }
    driver.shutdown().await.expect("shutdown");
}

#[tokio::test(flavor = "multi_thread")]
#[ignore] // Requires cndm hardware with port 0 looped back
async fn test_vfio_loopback() {
    let device = VfioDevice::open(&pcie_address()).expect("open VFIO device");
    let driver = Driver::init(device, DriverConfig::default())
        .await
        .expect("driver init");
    let port = driver.port(0).expect("port 0");

    let frame: Vec<u8> = (0..1514u32).map(|i| (i % 251) as u8).collect();
    port.start_xmit(&frame).await.expect("transmit");
    let got = port
        .recv_timeout(Duration::from_secs(1))
        .await
        .expect("loopback frame");
    assert_eq!(&got[..], &frame[..]);

    driver.shutdown().await.expect("shutdown");
}
