use std::time::Duration;

/// Parameters governing a peer state machine's timers.
///
/// The defaults carry the profile values; tests construct a config with much
/// shorter timeouts so recovery edges can be exercised without waiting.
#[derive(Debug, Copy, Clone)]
pub struct MachineConfig {
    /// How long a signalling or audio transition may stay pending before the
    /// machine gives up and falls back to a stable state.
    ///
    /// Owned by `Connecting`, `Disconnecting`, `AudioConnecting` and
    /// `AudioDisconnecting`; armed on entry and cancelled on exit.
    pub connect_timeout: Duration,
    /// How long to wait for telephony to report a `Dialing` call after the
    /// peer requested an outgoing call, before answering ERROR.
    pub dialing_out_timeout: Duration,
    /// How long to wait for the local voice-recognition confirmation after a
    /// remote-initiated start, before answering ERROR. Also bounds the
    /// voice-recognition wake-lock.
    pub start_vr_timeout: Duration,
    /// How long to wait for telephony to stream current-call entries before
    /// emitting the list terminator ourselves.
    pub clcc_response_timeout: Duration,
}

impl Default for MachineConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(30),
            dialing_out_timeout: Duration::from_secs(10),
            start_vr_timeout: Duration::from_secs(5),
            clcc_response_timeout: Duration::from_secs(5),
        }
    }
}
