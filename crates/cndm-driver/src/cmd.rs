//! Mailbox command channel.
//!
//! A transaction is: write the 16 command words, write EXECUTE to the
//! control register, poll until BUSY clears, read the 16 response words.
//! Transactions are serialized by an async mutex; two callers never
//! interleave mailbox writes.

use std::sync::Arc;

use cndm_chip::cmd::{self, Command, Opcode, Reply, Response, CMD_LEN, STATUS_OK};
use cndm_chip::regs::{self, mbox, MBOX_WORDS};
use tokio::sync::Mutex;
use tracing::{debug, trace};

use crate::config::MailboxConfig;
use crate::device::RegisterWindow;
use crate::error::{CndmError, Result};

/// Serialized access to the device mailbox.
#[derive(Debug)]
pub struct CommandChannel<R> {
    regs: Arc<R>,
    config: MailboxConfig,
    lock: Mutex<()>,
}

impl<R: RegisterWindow> CommandChannel<R> {
    /// Channel over the BAR holding the mailbox.
    pub fn new(regs: Arc<R>, config: MailboxConfig) -> Self {
        Self {
            regs,
            config,
            lock: Mutex::new(()),
        }
    }

    /// Polling policy.
    pub const fn config(&self) -> &MailboxConfig {
        &self.config
    }

    /// Execute a command and check its status.
    ///
    /// # Errors
    ///
    /// [`CndmError::DeviceTimeout`] if the mailbox stays busy,
    /// [`CndmError::CommandFailed`] on a non-zero status, or a register
    /// access error.
    pub async fn execute(&self, command: &Command) -> Result<Response> {
        let rsp = self.submit(command.opcode, &command.encode()).await?;
        if rsp.status() != STATUS_OK {
            return Err(CndmError::CommandFailed {
                opcode: command.opcode,
                status: rsp.status(),
            });
        }
        Ok(rsp)
    }

    /// Execute a command and decode its response.
    ///
    /// # Errors
    ///
    /// As [`Self::execute`].
    pub async fn execute_reply(&self, command: &Command) -> Result<Reply> {
        let rsp = self.execute(command).await?;
        Ok(rsp.decode(command.opcode))
    }

    /// Execute a raw command, zero-padded to 64 bytes. The response status
    /// is returned as is.
    ///
    /// # Errors
    ///
    /// [`CndmError::InvalidCommandLength`] for input longer than 64 bytes
    /// and [`CndmError::UnknownOpcode`] for an opcode outside the closed
    /// set, both before any register access; otherwise as
    /// [`Self::execute`] minus the status check.
    pub async fn execute_raw(&self, raw: &[u8]) -> Result<Response> {
        let bytes = cmd::pad_raw(raw).ok_or(CndmError::InvalidCommandLength { len: raw.len() })?;
        let command = Command::decode(&bytes)?;
        self.submit(command.opcode, &bytes).await
    }

    async fn submit(&self, opcode: Opcode, bytes: &[u8; CMD_LEN]) -> Result<Response> {
        let _guard = self.lock.lock().await;
        trace!("Mailbox submit {}", opcode);

        for (k, word) in cmd::to_words(bytes).into_iter().enumerate() {
            self.regs.write_dword(regs::mbox_cmd_word(k), word).await?;
        }
        self.regs.write_dword(regs::MBOX_CTRL, mbox::EXECUTE).await?;

        let polls = self.wait_idle(opcode).await?;

        let mut words = [0u32; MBOX_WORDS];
        for (k, word) in words.iter_mut().enumerate() {
            *word = self.regs.read_dword(regs::mbox_rsp_word(k)).await?;
        }
        let rsp = Response::from_words(&words);
        debug!(
            "Mailbox {} done after {} busy polls, status {:#x}",
            opcode,
            polls,
            rsp.status()
        );
        Ok(rsp)
    }

    /// Poll the control register until BUSY clears. Returns the number of
    /// busy reads observed.
    async fn wait_idle(&self, opcode: Opcode) -> Result<u32> {
        let mut polls = 0u32;
        loop {
            if self.regs.read_dword(regs::MBOX_CTRL).await? & mbox::BUSY == 0 {
                return Ok(polls);
            }
            polls += 1;
            if polls >= self.config.max_polls {
                return Err(CndmError::DeviceTimeout { opcode, polls });
            }
            match self.config.backoff(polls - 1) {
                None => tokio::task::yield_now().await,
                Some(delay) => tokio::time::sleep(delay).await,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::PciFunction;
    use crate::sim::{SimConfig, SimDevice};

    fn channel(sim: &SimDevice, config: MailboxConfig) -> CommandChannel<crate::sim::SimRegisters> {
        CommandChannel::new(sim.bar_window(0).unwrap(), config)
    }

    #[tokio::test]
    async fn nop_round_trip_echoes_fields() {
        let sim = SimDevice::new(SimConfig::default());
        let ch = channel(&sim, MailboxConfig::default());
        let rsp = ch
            .execute(&Command {
                flags: 0x1234_5678,
                ..Command::nop()
            })
            .await
            .unwrap();
        assert_eq!(rsp.status(), STATUS_OK);
        assert_eq!(rsp.word(1), 0x1234_5678);
        assert_eq!(rsp.decode(Opcode::Nop), Reply::Nop);
    }

    #[tokio::test]
    async fn oversize_raw_command_never_touches_mailbox() {
        let sim = SimDevice::new(SimConfig::default());
        let ch = channel(&sim, MailboxConfig::default());
        let err = ch.execute_raw(&[0u8; 65]).await.unwrap_err();
        assert!(matches!(err, CndmError::InvalidCommandLength { len: 65 }));
        assert!(sim.register_writes().is_empty());
    }

    #[tokio::test]
    async fn unknown_raw_opcode_never_touches_mailbox() {
        let sim = SimDevice::new(SimConfig::default());
        let ch = channel(&sim, MailboxConfig::default());
        let err = ch.execute_raw(&[0, 0, 0x40, 0x02]).await.unwrap_err();
        assert!(matches!(err, CndmError::UnknownOpcode { opcode: 0x0240 }));
        assert!(sim.register_writes().is_empty());
    }

    #[tokio::test]
    async fn short_raw_command_is_padded() {
        let sim = SimDevice::new(SimConfig::default());
        let ch = channel(&sim, MailboxConfig::default());
        let rsp = ch.execute_raw(&[0, 0, 0, 0, 0xaa]).await.unwrap();
        assert_eq!(rsp.word(1), 0xaa);
        let writes = sim.register_writes();
        assert_eq!(writes.len(), MBOX_WORDS + 1);
        assert!(writes[2..MBOX_WORDS].iter().all(|&(_, v)| v == 0));
        assert_eq!(writes[MBOX_WORDS], (regs::MBOX_CTRL, mbox::EXECUTE));
    }

    #[tokio::test]
    async fn busy_device_is_polled_until_idle() {
        let sim = SimDevice::new(SimConfig {
            busy_polls: 5,
            ..SimConfig::default()
        });
        let ch = channel(&sim, MailboxConfig::default());
        ch.execute(&Command::nop()).await.unwrap();
        assert_eq!(sim.stats().busy_reads, 5);
    }

    #[tokio::test(start_paused = true)]
    async fn hung_device_times_out() {
        let sim = SimDevice::new(SimConfig {
            hang: true,
            ..SimConfig::default()
        });
        let ch = channel(
            &sim,
            MailboxConfig {
                max_polls: 50,
                ..MailboxConfig::default()
            },
        );
        let err = ch.execute(&Command::nop()).await.unwrap_err();
        assert!(matches!(
            err,
            CndmError::DeviceTimeout {
                opcode: Opcode::Nop,
                polls: 50
            }
        ));
    }

    #[tokio::test]
    async fn non_zero_status_is_command_failed() {
        let sim = SimDevice::new(SimConfig::default());
        let ch = channel(&sim, MailboxConfig::default());
        // No CQ exists yet.
        let err = ch
            .execute(&Command::destroy(cndm_chip::cmd::QueueKind::Cq, 0, 0))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            CndmError::CommandFailed {
                opcode: Opcode::DestroyCq,
                ..
            }
        ));
    }
}
