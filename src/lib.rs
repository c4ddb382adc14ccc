//! Per-device control plane of a Hands-Free Profile (HFP) audio gateway.
//!
//! This crate implements the state machine that manages one remote
//! handsfree/headset peer: its signalling connection lifecycle, its
//! synchronous audio (SCO) lifecycle, and the AT-command dialog that runs
//! during and after service-level-connection establishment, including the
//! virtual-call and voice-recognition sub-protocols and peer-initiated
//! dial-out.
//!
//! The multi-device service, the native HFP stack, telephony/audio and the
//! phonebook helper are external collaborators reached through the traits in
//! [`interfaces`]. The machine itself ([`machine::PeerMachine`]) is
//! synchronous and sans-IO; [`driver::spawn`] binds one machine to a tokio
//! task with FIFO message delivery and deadline-driven timers.

pub mod config;
pub mod device;
pub mod driver;
pub mod event;
pub mod interfaces;
pub mod machine;

pub use config::MachineConfig;
pub use device::BdAddr;
pub use driver::{MachineHandle, MachineSnapshot, SendError};
pub use event::{
    AudioState, CallState, CallStatus, ConnectionState, Message, StackEvent, StackEventKind,
};
pub use interfaces::Collaborators;
pub use machine::{PeerMachine, State};
