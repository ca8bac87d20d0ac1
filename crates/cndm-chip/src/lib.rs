//! Silicon contract of the `cndm` NIC.
//!
//! This crate has **no dependencies** and **no hardware access**. It is a
//! pure model of what the device expects on the wire: register offsets, the
//! 64-byte mailbox command format, descriptor and completion record layouts,
//! and the ring counter arithmetic shared by driver and device.
//!
//! | Module | Contents |
//! |--------|----------|
//! | [`regs`] | BAR0 register map (config registers, mailbox) |
//! | [`cmd`] | Opcodes, 64-byte command encoder, typed response decoder |
//! | [`desc`] | 16-byte descriptor and completion records |
//! | [`ring`] | Power-of-two ring geometry and the phase-bit protocol |

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod cmd;
pub mod desc;
pub mod regs;
pub mod ring;
