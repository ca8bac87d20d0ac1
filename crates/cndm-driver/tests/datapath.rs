//! Data path tests against the simulated NIC.

use std::time::Duration;

use cndm_driver::prelude::*;
use cndm_driver::sim::SimConfig as Sim;
use cndm_driver::DevicePort;

fn frame(len: usize, seed: u8) -> Vec<u8> {
    (0..len)
        .map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed))
        .collect()
}

async fn driver_with(sim: Sim, config: DriverConfig) -> (SimDevice, Driver<SimDevice>) {
    let device = SimDevice::new(sim);
    let driver = Driver::init(device.clone(), config)
        .await
        .expect("driver init");
    (device, driver)
}

/// Buffers held by the driver must be exactly those posted to the rings.
async fn assert_balanced(driver: &Driver<SimDevice>, port: &DevicePort<SimDevice>) {
    port.process_tx_cq().await.expect("reclaim");
    let posted = port.rx_posted().await + port.tx_outstanding().await;
    assert_eq!(driver.packets().outstanding(), posted as usize);
}

#[tokio::test]
async fn loopback_preserves_order_and_content() {
    let (sim, driver) = driver_with(Sim::default(), DriverConfig::default()).await;
    let port = driver.port(0).unwrap();
    assert!(sim.is_enabled());
    assert!(sim.is_master());
    assert_eq!(port.rx_posted().await, 256);

    let mut sent = Vec::new();
    for k in 0..64u8 {
        sent.push(frame(60, k));
    }
    for k in 0..32u8 {
        sent.push(frame(1514, 100 + k));
    }
    for payload in &sent {
        port.start_xmit(payload).await.unwrap();
    }

    for expected in &sent {
        let got = port.recv().await.unwrap();
        assert_eq!(&got[..], &expected[..]);
    }
    assert!(matches!(port.try_recv(), Err(CndmError::WouldBlock)));

    let stats = port.stats();
    assert_eq!(stats.tx_packets, 96);
    assert_eq!(stats.rx_packets, 96);
    assert_eq!(stats.tx_bytes, 64 * 60 + 32 * 1514);
    assert_eq!(stats.rx_bytes, stats.tx_bytes);
    assert_eq!(sim.stats().rx_dropped, 0);

    assert_balanced(&driver, port).await;
    driver.shutdown().await.unwrap();
    assert_eq!(driver.packets().outstanding(), 0);
}

#[tokio::test]
async fn completion_rings_wrap_many_times() {
    let config = DriverConfig::default().with_ring_log_size(4);
    let (sim, driver) = driver_with(Sim::default(), config).await;
    let port = driver.port(0).unwrap();
    assert_eq!(port.rx_posted().await, 16);

    let lengths = [60usize, 1514, 64, 9, 1000];
    let sent: Vec<Vec<u8>> = (0..200usize)
        .map(|k| frame(lengths[k % lengths.len()], k as u8))
        .collect();

    // Half a ring per burst, so every refill lands before the next burst.
    for burst in sent.chunks(8) {
        for payload in burst {
            port.start_xmit(payload).await.unwrap();
        }
        for expected in burst {
            let got = port.recv().await.unwrap();
            assert_eq!(&got[..], &expected[..]);
        }
    }
    assert!(matches!(port.try_recv(), Err(CndmError::WouldBlock)));

    let stats = port.stats();
    assert_eq!(stats.tx_packets, 200);
    assert_eq!(stats.rx_packets, 200);
    assert_eq!(stats.rx_bytes, stats.tx_bytes);
    assert_eq!(stats.rx_truncated, 0);
    assert_eq!(sim.stats().rx_dropped, 0);

    // 200 completions on each 16-entry CQ: twelve full passes and a half.
    for cqn in [0, 1] {
        match port.query(QueueKind::Cq, cqn).await.unwrap() {
            cndm_driver::chip::Reply::Queried { producer, .. } => assert_eq!(producer, 200),
            other => panic!("unexpected reply {other:?}"),
        }
    }

    assert_balanced(&driver, port).await;
    assert_eq!(port.rx_posted().await, 16);
    assert_eq!(port.tx_outstanding().await, 0);
    assert_eq!(driver.packets().outstanding(), 16);
    driver.shutdown().await.unwrap();
    assert_eq!(driver.packets().outstanding(), 0);
}

#[tokio::test]
async fn round_trip_lengths() {
    let config = DriverConfig::default()
        .with_ring_log_size(4)
        .with_packet_size(16 * 1024);
    let (_sim, driver) = driver_with(Sim::default(), config).await;
    let port = driver.port(0).unwrap();

    for (k, len) in [1usize, 59, 60, 1514, 9000].into_iter().enumerate() {
        let payload = frame(len, k as u8);
        port.start_xmit(&payload).await.unwrap();
        let got = port.recv().await.unwrap();
        assert_eq!(got.len(), len);
        assert_eq!(&got[..], &payload[..]);
        assert_balanced(&driver, port).await;
    }
    assert_eq!(port.tx_outstanding().await, 0);
}

#[tokio::test]
async fn transmit_rejects_bad_payloads() {
    let (sim, driver) = driver_with(
        Sim {
            link: LinkMode::Wire,
            ..Sim::default()
        },
        DriverConfig::default(),
    )
    .await;
    let port = driver.port(0).unwrap();

    assert!(matches!(
        port.start_xmit(&[]).await,
        Err(CndmError::EmptyPayload)
    ));
    let max = driver.config().max_payload();
    assert_eq!(max, 4096 - 10);
    assert!(matches!(
        port.start_xmit(&vec![0u8; max + 1]).await,
        Err(CndmError::PayloadTooLarge { len, max: m }) if len == max + 1 && m == max
    ));
    port.start_xmit(&vec![7u8; max]).await.unwrap();

    let frames = sim.take_tx_frames();
    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0].0, 0);
    assert_eq!(frames[0].1, vec![7u8; max]);
}

#[tokio::test]
async fn full_send_queue_reports_queue_full() {
    let (_sim, driver) = driver_with(
        Sim {
            stall_tx: true,
            ..Sim::default()
        },
        DriverConfig::default().with_ring_log_size(4),
    )
    .await;
    let port = driver.port(0).unwrap();

    for k in 0..16u8 {
        port.start_xmit(&frame(64, k)).await.unwrap();
    }
    assert_eq!(port.tx_outstanding().await, 16);
    assert!(matches!(
        port.start_xmit(&frame(64, 0)).await,
        Err(CndmError::QueueFull { port: 0, capacity: 16 })
    ));
    assert_eq!(port.stats().tx_queue_full, 1);
    assert_eq!(port.stats().tx_packets, 16);

    driver.shutdown().await.unwrap();
    assert_eq!(driver.packets().outstanding(), 0);
}

#[tokio::test]
async fn refill_waits_for_low_water() {
    let (sim, driver) = driver_with(
        Sim {
            link: LinkMode::Wire,
            ..Sim::default()
        },
        DriverConfig::default().with_ring_log_size(4),
    )
    .await;
    let port = driver.port(0).unwrap();
    let (rx_doorbell, _) = port.doorbells().await;
    let rx_doorbells = || {
        sim.register_writes()
            .into_iter()
            .filter(|(offset, _)| *offset == rx_doorbell)
            .map(|(_, value)| value)
            .collect::<Vec<_>>()
    };
    assert_eq!(rx_doorbells(), vec![16]);

    for k in 0..5u8 {
        assert!(sim.inject_rx(0, &frame(60, k)));
    }
    for k in 0..5u8 {
        assert_eq!(port.recv().await.unwrap(), frame(60, k));
    }
    assert_eq!(port.rx_posted().await, 11);
    assert_eq!(rx_doorbells(), vec![16]);

    for k in 5..8u8 {
        assert!(sim.inject_rx(0, &frame(60, k)));
    }
    for k in 5..8u8 {
        assert_eq!(port.recv().await.unwrap(), frame(60, k));
    }
    assert_eq!(port.rx_posted().await, 16);
    assert_eq!(rx_doorbells(), vec![16, 24]);
}

#[tokio::test]
async fn frames_without_buffers_are_dropped() {
    let (sim, driver) = driver_with(
        Sim {
            link: LinkMode::Wire,
            ..Sim::default()
        },
        DriverConfig::default().with_ring_log_size(3),
    )
    .await;
    let port = driver.port(0).unwrap();

    // Eight buffers posted, nobody services the RX queue in between.
    let delivered = (0..10u8)
        .filter(|k| sim.inject_rx(0, &frame(60, *k)))
        .count();
    assert_eq!(delivered, 8);
    assert_eq!(sim.stats().rx_dropped, 2);

    for k in 0..8u8 {
        assert_eq!(port.recv().await.unwrap(), frame(60, k));
    }
    assert_eq!(port.rx_posted().await, 8);
}

#[tokio::test]
async fn oversized_receive_is_clamped() {
    let (sim, driver) = driver_with(
        Sim {
            link: LinkMode::Wire,
            ..Sim::default()
        },
        DriverConfig::default(),
    )
    .await;
    let port = driver.port(0).unwrap();

    let big = frame(5000, 3);
    assert!(sim.inject_rx(0, &big));
    let got = port.recv().await.unwrap();
    assert_eq!(got.len(), 4096);
    assert_eq!(&got[..], &big[..4096]);
    assert_eq!(port.stats().rx_truncated, 1);
}

#[tokio::test]
async fn crossover_shares_vectors() {
    let (sim, driver) = driver_with(
        Sim {
            ports: 3,
            link: LinkMode::Crossover,
            irq_vectors: 2,
            ..Sim::default()
        },
        DriverConfig::default()
            .with_ring_log_size(5)
            .with_irq_vectors(1..=2),
    )
    .await;
    assert_eq!(driver.port_count(), 3);

    let a = frame(128, 1);
    let b = frame(256, 2);
    let c = frame(512, 3);
    driver.port(0).unwrap().start_xmit(&a).await.unwrap();
    driver.port(1).unwrap().start_xmit(&b).await.unwrap();
    driver.port(2).unwrap().start_xmit(&c).await.unwrap();

    assert_eq!(driver.port(1).unwrap().recv().await.unwrap(), a);
    assert_eq!(driver.port(0).unwrap().recv().await.unwrap(), b);
    // Port 2 has no partner and loops back.
    assert_eq!(driver.port(2).unwrap().recv().await.unwrap(), c);
    assert!(sim.stats().irqs >= 3);
}

#[tokio::test]
async fn explicit_dispatch_services_port() {
    let (sim, driver) = driver_with(
        Sim {
            link: LinkMode::Wire,
            irq_vectors: 4,
            ..Sim::with_ports(2)
        },
        DriverConfig::default().with_irq_vectors(1..=4),
    )
    .await;
    assert!(sim.inject_rx(1, &frame(90, 9)));
    driver.dispatch_interrupt(1).await;
    assert_eq!(driver.port(1).unwrap().try_recv().unwrap(), frame(90, 9));
    // Unknown vectors are ignored.
    driver.dispatch_interrupt(7).await;
}

#[tokio::test(start_paused = true)]
async fn receive_timeout() {
    let (_sim, driver) = driver_with(
        Sim {
            link: LinkMode::Wire,
            ..Sim::default()
        },
        DriverConfig::default(),
    )
    .await;
    let port = driver.port(0).unwrap();
    assert!(matches!(
        port.recv_timeout(Duration::from_millis(250)).await,
        Err(CndmError::Timeout { duration_ms: 250 })
    ));
}

#[tokio::test]
async fn shutdown_disconnects_port() {
    let (sim, driver) = driver_with(Sim::default(), DriverConfig::default()).await;
    let port = driver.port(0).unwrap().clone();

    port.start_xmit(&frame(60, 1)).await.unwrap();
    // Let the interrupt task deliver the frame before tearing down.
    let pending = port.recv().await.unwrap();
    assert_eq!(pending, frame(60, 1));
    port.start_xmit(&frame(61, 2)).await.unwrap();
    port.process_rx_cq().await.unwrap();

    driver.shutdown().await.unwrap();
    let tail: Vec<_> = sim
        .executed_commands()
        .iter()
        .rev()
        .take(4)
        .rev()
        .map(|c| (c.opcode, c.qn))
        .collect();
    assert_eq!(
        tail,
        vec![
            (Opcode::DestroyCq, 0),
            (Opcode::DestroyRq, 0),
            (Opcode::DestroyCq, 1),
            (Opcode::DestroySq, 0),
        ]
    );

    // Already received payloads stay readable, then the port reports
    // disconnection.
    assert_eq!(port.recv().await.unwrap(), frame(61, 2));
    assert!(matches!(
        port.recv().await,
        Err(CndmError::Disconnected { port: 0 })
    ));
    assert!(matches!(
        port.start_xmit(&frame(60, 0)).await,
        Err(CndmError::Disconnected { port: 0 })
    ));
    assert!(matches!(
        port.refill_rx_buffers().await,
        Err(CndmError::Disconnected { port: 0 })
    ));
    assert_eq!(driver.packets().outstanding(), 0);

    // A second shutdown issues no commands.
    let before = sim.executed_commands().len();
    port.shutdown().await.unwrap();
    assert_eq!(sim.executed_commands().len(), before);
}

#[tokio::test]
async fn query_reports_ring_state() {
    let (sim, driver) = driver_with(Sim::default(), DriverConfig::default()).await;
    let port = driver.port(0).unwrap();

    match port.query(QueueKind::Rq, 0).await.unwrap() {
        cndm_driver::chip::Reply::Queried {
            kind,
            qn,
            log_size,
            producer,
            consumer,
            ..
        } => {
            assert_eq!(kind, QueueKind::Rq);
            assert_eq!(qn, 0);
            assert_eq!(log_size, 8);
            assert_eq!(producer, 256);
            assert_eq!(consumer, 0);
        }
        other => panic!("unexpected reply {other:?}"),
    }

    assert!(matches!(
        port.query(QueueKind::Sq, 3).await,
        Err(CndmError::CommandFailed {
            opcode: Opcode::QuerySq,
            status: cndm_driver::sim::status::INVALID_QUEUE
        })
    ));

    let writes_before = sim.register_writes().len();
    let raw = Command::query(QueueKind::Cq, 0, 1).encode();
    let rsp = driver.commands().execute_raw(&raw).await.unwrap();
    assert_eq!(rsp.status(), 0);
    assert_eq!(sim.register_writes().len(), writes_before + 17);
    assert_eq!(
        rsp.decode(Opcode::QueryCq),
        port.query(QueueKind::Cq, 1).await.unwrap()
    );
}

#[tokio::test]
async fn ports_out_of_range() {
    let (_sim, driver) = driver_with(Sim::with_ports(2), DriverConfig::default()).await;
    assert!(driver.port(1).is_ok());
    assert!(matches!(
        driver.port(2),
        Err(CndmError::InvalidPort { index: 2, count: 2 })
    ));
    assert_eq!(driver.port_table().count, 2);
    assert_eq!(driver.port_table().offset, 0x2_0000);
    assert_eq!(driver.port_table().stride, 0x100);
}

#[tokio::test]
async fn foreign_buffers_are_rejected() {
    let (_sa, a) = driver_with(Sim::default(), DriverConfig::default()).await;
    let (_sb, b) = driver_with(Sim::default(), DriverConfig::default()).await;

    let buffer = a.alloc_pkt().unwrap();
    let addr = buffer.device_address(0);
    let before = b.packets().free_count();
    assert!(matches!(
        b.free_pkt(buffer),
        Err(CndmError::InvalidHandle { addr: x }) if x == addr
    ));
    assert_eq!(b.packets().free_count(), before);

    let buffer = a.alloc_pkt().unwrap();
    a.free_pkt(buffer).unwrap();
}
