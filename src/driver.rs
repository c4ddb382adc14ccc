//! Binding of a [`PeerMachine`] to a tokio executor.
//!
//! Each machine runs on its own task with an unbounded mpsc inbox. The task
//! alternates between receiving messages and sleeping until the machine's
//! next timer deadline, so handlers stay synchronous and FIFO delivery and
//! run-to-completion come from the task itself. The service keeps one
//! [`MachineHandle`] per peer; when the last handle is dropped the task
//! exits.

use std::time::Instant;

use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tracing::debug;

use crate::config::MachineConfig;
use crate::device::BdAddr;
use crate::event::{AudioState, ConnectionState, Message};
use crate::interfaces::Collaborators;
use crate::machine::PeerMachine;

/// Error returned when sending to a machine whose task has already stopped.
#[derive(Debug, Clone, Error)]
#[error("state machine for {peer} has shut down")]
pub struct SendError {
    pub peer: BdAddr,
}

/// Service-visible state of a machine, published after every batch of work.
#[derive(Debug, Copy, Clone)]
pub struct MachineSnapshot {
    pub connection_state: ConnectionState,
    pub audio_state: AudioState,
    pub connecting_timestamp: Option<Instant>,
}

fn snapshot_of(machine: &PeerMachine) -> MachineSnapshot {
    MachineSnapshot {
        connection_state: machine.connection_state(),
        audio_state: machine.audio_state(),
        connecting_timestamp: machine.connecting_timestamp(),
    }
}

/// Use the runtime's clock so tests running under a paused clock stay
/// consistent between sleeps and deadlines.
fn now() -> Instant {
    tokio::time::Instant::now().into_std()
}

/// Clonable handle to a spawned machine.
#[derive(Clone)]
pub struct MachineHandle {
    peer: BdAddr,
    tx: mpsc::UnboundedSender<Message>,
    snapshot: watch::Receiver<MachineSnapshot>,
}

impl MachineHandle {
    pub fn peer(&self) -> BdAddr {
        self.peer
    }

    /// Enqueue a message for the machine. Delivery is FIFO per machine.
    pub fn send(&self, msg: Message) -> Result<(), SendError> {
        self.tx.send(msg).map_err(|_| SendError { peer: self.peer })
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.snapshot.borrow().connection_state
    }

    pub fn audio_state(&self) -> AudioState {
        self.snapshot.borrow().audio_state
    }

    pub fn connecting_timestamp(&self) -> Option<Instant> {
        self.snapshot.borrow().connecting_timestamp
    }

    /// Wait until the machine has processed more work and published a fresh
    /// snapshot. Returns an error once the task has exited.
    pub async fn changed(&mut self) -> Result<(), watch::error::RecvError> {
        self.snapshot.changed().await
    }
}

/// Spawn a machine for `peer` on the current runtime and return a handle to
/// it. The task runs until every handle is dropped.
pub fn spawn(peer: BdAddr, config: MachineConfig, collaborators: Collaborators) -> MachineHandle {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut machine = PeerMachine::new(peer, config, collaborators, now());
    let (snapshot_tx, snapshot_rx) = watch::channel(snapshot_of(&machine));
    tokio::spawn(async move {
        loop {
            let msg = match machine.poll_timeout() {
                Some(deadline) => {
                    tokio::select! {
                        msg = rx.recv() => msg,
                        _ = tokio::time::sleep_until(deadline.into()) => {
                            machine.handle_timeout(now());
                            let _ = snapshot_tx.send(snapshot_of(&machine));
                            continue;
                        }
                    }
                }
                None => rx.recv().await,
            };
            match msg {
                Some(msg) => {
                    machine.handle_message(msg, now());
                    let _ = snapshot_tx.send(snapshot_of(&machine));
                }
                None => break,
            }
        }
        debug!("machine task for {peer} exiting");
    });
    MachineHandle {
        peer,
        tx,
        snapshot: snapshot_rx,
    }
}
