//! Mailbox and bring-up tests against the simulated NIC.

use std::sync::Arc;
use std::time::Duration;

use cndm_chip::cmd::{to_words, Action};
use cndm_chip::regs::{mbox, mbox_cmd_word, MBOX_CTRL};
use cndm_driver::prelude::*;
use cndm_driver::sim::SimRegisters;
use cndm_driver::{HostMemoryPool, IrqVectors};

/// Wraps the model and reports `grant` vectors whatever was asked for.
struct ShortIrqs {
    inner: SimDevice,
    grant: u32,
}

impl PciFunction for ShortIrqs {
    type Regs = SimRegisters;
    type Pool = HostMemoryPool;

    async fn enable_device(&self) -> Result<()> {
        self.inner.enable_device().await
    }

    async fn set_master(&self) -> Result<()> {
        self.inner.set_master().await
    }

    async fn alloc_irq_vectors(&self, min: u32, max: u32) -> Result<IrqVectors> {
        let mut irqs = self.inner.alloc_irq_vectors(min, max).await?;
        irqs.count = self.grant;
        Ok(irqs)
    }

    fn bar_window(&self, bar: u32) -> Result<Arc<SimRegisters>> {
        self.inner.bar_window(bar)
    }

    fn memory_pool(&self) -> Arc<HostMemoryPool> {
        self.inner.memory_pool()
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_commands_do_not_interleave() {
    let sim = SimDevice::new(SimConfig {
        yield_on_access: true,
        busy_polls: 2,
        ..SimConfig::default()
    });
    let driver = Arc::new(
        Driver::init(sim.clone(), DriverConfig::default())
            .await
            .unwrap(),
    );
    sim.clear_register_writes();

    let tasks: Vec<_> = (1..=8u32)
        .map(|task| {
            let driver = driver.clone();
            tokio::spawn(async move {
                for _ in 0..20 {
                    let nop = Command {
                        flags: task,
                        ..Command::nop()
                    };
                    let rsp = driver.commands().execute(&nop).await.unwrap();
                    assert_eq!(rsp.word(1), task);
                }
            })
        })
        .collect();
    for task in tasks {
        task.await.unwrap();
    }

    let writes = sim.register_writes();
    assert_eq!(writes.len(), 8 * 20 * 17);
    for chunk in writes.chunks(17) {
        // All sixteen words belong to the caller whose flags are in word 1.
        let caller = Command {
            flags: chunk[1].1,
            ..Command::nop()
        };
        let words = to_words(&caller.encode());
        for (k, (offset, value)) in chunk[..16].iter().enumerate() {
            assert_eq!((*offset, *value), (mbox_cmd_word(k), words[k]));
        }
        assert!((1..=8).contains(&caller.flags));
        assert_eq!(chunk[16], (MBOX_CTRL, mbox::EXECUTE));
    }
}

#[tokio::test(start_paused = true)]
async fn hung_mailbox_times_out() {
    let sim = SimDevice::new(SimConfig {
        hang: true,
        ..SimConfig::default()
    });
    let config = DriverConfig::default().with_mailbox(MailboxConfig {
        max_polls: 50,
        ..MailboxConfig::default()
    });
    let err = Driver::init(sim.clone(), config).await.unwrap_err();
    assert!(matches!(
        err,
        CndmError::DeviceTimeout {
            opcode: Opcode::CreateCq,
            polls: 50
        }
    ));
}

#[tokio::test]
async fn busy_mailbox_is_polled() {
    let sim = SimDevice::new(SimConfig {
        busy_polls: 3,
        ..SimConfig::default()
    });
    let driver = Driver::init(sim.clone(), DriverConfig::default())
        .await
        .unwrap();
    let before = sim.stats();
    driver.commands().execute(&Command::nop()).await.unwrap();
    let after = sim.stats();
    assert_eq!(after.commands, before.commands + 1);
    assert_eq!(after.busy_reads, before.busy_reads + 3);
}

#[tokio::test]
async fn failed_create_aborts_init() {
    let sim = SimDevice::new(SimConfig {
        fail_opcode: Some(Opcode::CreateRq),
        ..SimConfig::default()
    });
    let err = Driver::init(sim.clone(), DriverConfig::default())
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        CndmError::CommandFailed {
            opcode: Opcode::CreateRq,
            status: cndm_driver::sim::status::INJECTED
        }
    ));

    let opcodes: Vec<_> = sim.executed_commands().iter().map(|c| c.opcode).collect();
    assert_eq!(
        opcodes,
        vec![Opcode::CreateCq, Opcode::CreateRq, Opcode::DestroyCq]
    );
}

#[tokio::test]
async fn failed_second_port_tears_down_first() {
    let sim = SimDevice::new(SimConfig {
        ports: 2,
        fail_opcode: Some(Opcode::CreateSq),
        fail_port: Some(1),
        ..SimConfig::default()
    });
    let err = Driver::init(sim.clone(), DriverConfig::default())
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        CndmError::CommandFailed {
            opcode: Opcode::CreateSq,
            ..
        }
    ));

    let teardown: Vec<_> = sim
        .executed_commands()
        .iter()
        .filter(|c| c.opcode.action() == Some(Action::Destroy))
        .map(|c| (c.opcode, c.port, c.qn))
        .collect();
    assert_eq!(
        teardown,
        vec![
            (Opcode::DestroyCq, 1, 0),
            (Opcode::DestroyRq, 1, 0),
            (Opcode::DestroyCq, 1, 1),
            (Opcode::DestroyCq, 0, 0),
            (Opcode::DestroyRq, 0, 0),
            (Opcode::DestroyCq, 0, 1),
            (Opcode::DestroySq, 0, 0),
        ]
    );
}

#[tokio::test]
async fn init_initializes_ports_in_order() {
    let sim = SimDevice::new(SimConfig::with_ports(2));
    let driver = Driver::init(sim.clone(), DriverConfig::default())
        .await
        .unwrap();

    let seq: Vec<_> = sim
        .executed_commands()
        .iter()
        .map(|c| (c.opcode, c.port, c.qn, c.qn2))
        .collect();
    let per_port = |p| {
        vec![
            (Opcode::CreateCq, p, 0, 0),
            (Opcode::CreateRq, p, 0, 0),
            (Opcode::CreateCq, p, 1, 0),
            (Opcode::CreateSq, p, 0, 1),
        ]
    };
    let mut expected = per_port(0);
    expected.extend(per_port(1));
    assert_eq!(seq, expected);

    let (rx0, tx0) = driver.port(0).unwrap().doorbells().await;
    let (rx1, tx1) = driver.port(1).unwrap().doorbells().await;
    assert_eq!((rx0, tx0), (0x2_0000, 0x2_0004));
    assert_eq!((rx1, tx1), (0x2_0100, 0x2_0104));
}

#[tokio::test]
async fn invalid_config_touches_nothing() {
    let sim = SimDevice::new(SimConfig::default());
    let err = Driver::init(
        sim.clone(),
        DriverConfig::default().with_headroom(4096),
    )
    .await
    .unwrap_err();
    assert!(matches!(err, CndmError::InvalidConfig { .. }));
    assert!(!sim.is_enabled());
    assert!(sim.register_writes().is_empty());
}

#[tokio::test]
async fn too_few_interrupt_vectors() {
    let sim = SimDevice::new(SimConfig {
        irq_vectors: 2,
        ..SimConfig::default()
    });
    let err = Driver::init(sim.clone(), DriverConfig::default().with_irq_vectors(4..=8))
        .await
        .unwrap_err();
    assert!(matches!(err, CndmError::HardwareError { .. }));
    assert!(sim.executed_commands().is_empty());
}

#[tokio::test]
async fn short_vector_grant_fails_init() {
    for (grant, range) in [(0, 1..=4), (2, 4..=8)] {
        let sim = SimDevice::new(SimConfig::default());
        let device = ShortIrqs {
            inner: sim.clone(),
            grant,
        };
        let err = Driver::init(device, DriverConfig::default().with_irq_vectors(range))
            .await
            .unwrap_err();
        assert!(matches!(err, CndmError::HardwareError { .. }), "{err}");
        assert!(sim.executed_commands().is_empty());
    }
}

#[tokio::test]
async fn raw_commands() {
    let sim = SimDevice::new(SimConfig::default());
    let driver = Driver::init(sim.clone(), DriverConfig::default())
        .await
        .unwrap();

    // A failing raw command is not an error; the status comes back as is.
    let raw = Command::destroy(QueueKind::Eq, 0, 9).encode();
    let rsp = driver.commands().execute_raw(&raw).await.unwrap();
    assert_eq!(rsp.status(), cndm_driver::sim::status::INVALID_QUEUE);

    assert!(matches!(
        driver.commands().execute_raw(&[0u8; 65]).await,
        Err(CndmError::InvalidCommandLength { len: 65 })
    ));
    assert!(matches!(
        driver.commands().execute_raw(&[0, 0, 0x40, 0x02]).await,
        Err(CndmError::UnknownOpcode { opcode: 0x0240 })
    ));

    let rsp = driver.commands().execute_raw(&[]).await.unwrap();
    assert_eq!(rsp.status(), 0);
}

#[tokio::test]
async fn event_queue_lifecycle() {
    let sim = SimDevice::new(SimConfig::default());
    let driver = Driver::init(sim, DriverConfig::default()).await.unwrap();
    let commands = driver.commands();

    commands
        .execute(&Command::create_eq(0, 0, 6, 0x1_2340_0000))
        .await
        .unwrap();
    commands
        .execute(&Command::modify(QueueKind::Eq, 0, 0))
        .await
        .unwrap();
    let reply = commands
        .execute_reply(&Command::query(QueueKind::Eq, 0, 0))
        .await
        .unwrap();
    assert!(matches!(
        reply,
        cndm_driver::chip::Reply::Queried {
            log_size: 6,
            base_address: 0x1_2340_0000,
            ..
        }
    ));
    commands
        .execute(&Command::destroy(QueueKind::Eq, 0, 0))
        .await
        .unwrap();
    assert!(commands
        .execute(&Command::destroy(QueueKind::Eq, 0, 0))
        .await
        .is_err());
}

#[tokio::test(start_paused = true)]
async fn backoff_sleeps_after_spinning() {
    let sim = SimDevice::new(SimConfig {
        busy_polls: 200,
        ..SimConfig::default()
    });
    let config = DriverConfig::default().with_mailbox(MailboxConfig {
        spin_polls: 4,
        initial_backoff: Duration::from_millis(1),
        max_backoff: Duration::from_millis(8),
        ..MailboxConfig::default()
    });
    let start = tokio::time::Instant::now();
    Driver::init(sim, config).await.unwrap();
    // Four commands, each slept through most of its busy reads.
    assert!(start.elapsed() >= Duration::from_millis(8));
}
