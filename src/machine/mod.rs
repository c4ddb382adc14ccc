//! The per-peer state machine of the audio gateway.
//!
//! One [`PeerMachine`] manages a single remote handsfree device through its
//! connection lifecycle, its SCO audio lifecycle and the AT dialog that runs
//! over the service level connection:
//!
//! ```text
//!                  (Disconnected)
//!                     |      ^
//!             Connect |      | stack Disconnected
//!                     V      |
//!            (Connecting)   (Disconnecting)
//!                     |      ^
//!   stack SlcConnected|      | Disconnect
//!                     V      |
//!                    (Connected)
//!                     |      ^
//!        ConnectAudio |      | stack audio Disconnected
//!                     V      |
//!        (AudioConnecting)  (AudioDisconnecting)
//!                     |      ^
//!     stack audio     |      | DisconnectAudio
//!        Connected    V      |
//!                     (AudioOn)
//! ```
//!
//! The machine is synchronous and executor-free: callers feed it messages via
//! [`PeerMachine::handle_message`], fire due timers via
//! [`PeerMachine::handle_timeout`], and learn when the next deadline is due
//! from [`PeerMachine::poll_timeout`]. The [`crate::driver`] module binds one
//! machine to a tokio task; tests drive it directly with hand-picked
//! `Instant`s.

pub mod at;
pub(crate) mod timer;

#[cfg(test)]
pub(crate) mod test_support;

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::time::Instant;

use tracing::{debug, error, info, warn};

use crate::config::MachineConfig;
use crate::device::BdAddr;
use crate::event::{
    AccessReply, AtResponse, AudioState, CallState, CallStatus, ClccEntry, ConnectionState,
    Message, StackAudioState, StackConnectionState, StackEvent, StackEventKind, VendorResultCode,
    VolumeKind, VrState, WbsConfig,
};
use crate::interfaces::{
    AccessPermission, ActivityRequest, BondState, Broadcast, Collaborators,
};
use self::at::{AtArg, AtCommandType};
use self::timer::{Timer, TimerTable};

const HEADSET_NAME: &str = "bt_headset_name";
const HEADSET_NREC: &str = "bt_headset_nrec";
const HEADSET_WBS: &str = "bt_wbs";
const AUDIO_FEATURE_ON: &str = "on";
const AUDIO_FEATURE_OFF: &str = "off";

const HF_INDICATOR_ENHANCED_DRIVER_SAFETY: i32 = 1;
const HF_INDICATOR_BATTERY_LEVEL_STATUS: i32 = 2;

/// The seven states of a peer machine. The last four form the `Connected*`
/// group sharing the connected-base message handler.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum State {
    Disconnected,
    Connecting,
    Disconnecting,
    Connected,
    AudioConnecting,
    AudioOn,
    AudioDisconnecting,
}

impl State {
    /// The connection state this machine state maps to for observers.
    pub fn connection_state(self) -> ConnectionState {
        match self {
            Self::Disconnected => ConnectionState::Disconnected,
            Self::Connecting => ConnectionState::Connecting,
            Self::Disconnecting => ConnectionState::Disconnecting,
            Self::Connected | Self::AudioConnecting | Self::AudioOn | Self::AudioDisconnecting => {
                ConnectionState::Connected
            }
        }
    }

    /// The audio state this machine state maps to for observers.
    ///
    /// `AudioDisconnecting` reports `Connected`: the observable surface has no
    /// disconnecting value, and the broadcast logic compensates so that
    /// `AudioDisconnecting -> AudioOn` is still seen as a change.
    pub fn audio_state(self) -> AudioState {
        match self {
            Self::AudioConnecting => AudioState::Connecting,
            Self::AudioOn | Self::AudioDisconnecting => AudioState::Connected,
            _ => AudioState::Disconnected,
        }
    }

}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            Self::Disconnected => "Disconnected",
            Self::Connecting => "Connecting",
            Self::Disconnecting => "Disconnecting",
            Self::Connected => "Connected",
            Self::AudioConnecting => "AudioConnecting",
            Self::AudioOn => "AudioOn",
            Self::AudioDisconnecting => "AudioDisconnecting",
        };
        f.write_str(name)
    }
}

/// Whether a state handler recognised a message.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
enum Disposition {
    Handled,
    NotHandled,
}

/// State machine for one remote handsfree peer.
pub struct PeerMachine {
    peer: BdAddr,
    config: MachineConfig,
    collaborators: Collaborators,

    state: State,
    prev_state: Option<State>,
    /// Transition requested by the current handler, performed after it
    /// returns.
    pending_transition: Option<State>,

    queue: VecDeque<Message>,
    /// Messages stashed for re-delivery at the next transition, in arrival
    /// order.
    deferred: VecDeque<Message>,
    timers: TimerTable,

    connecting_timestamp: Option<Instant>,
    /// Audio parameters negotiated with the peer (NREC, WBS), pushed to the
    /// audio subsystem on entry to `AudioOn`.
    audio_params: HashMap<&'static str, String>,
    speaker_volume: i32,
    mic_volume: i32,

    virtual_call_started: bool,
    voice_recognition_started: bool,
    waiting_for_voice_recognition: bool,
    dialing_out: bool,
}

impl PeerMachine {
    /// Create a machine for `peer` and run the initial entry into
    /// `Disconnected`.
    pub fn new(
        peer: BdAddr,
        config: MachineConfig,
        collaborators: Collaborators,
        now: Instant,
    ) -> Self {
        let mut machine = Self {
            peer,
            config,
            collaborators,
            state: State::Disconnected,
            prev_state: None,
            pending_transition: None,
            queue: VecDeque::new(),
            deferred: VecDeque::new(),
            timers: TimerTable::default(),
            connecting_timestamp: None,
            audio_params: HashMap::new(),
            speaker_volume: 0,
            mic_volume: 0,
            virtual_call_started: false,
            voice_recognition_started: false,
            waiting_for_voice_recognition: false,
            dialing_out: false,
        };
        info!("created state machine for {peer}");
        machine.enter_state(now);
        machine
    }

    /// The device this machine is bound to.
    pub fn peer(&self) -> BdAddr {
        self.peer
    }

    /// Current connection state as observed by the service.
    pub fn connection_state(&self) -> ConnectionState {
        self.state.connection_state()
    }

    /// Current audio state as observed by the service.
    pub fn audio_state(&self) -> AudioState {
        self.state.audio_state()
    }

    /// When the machine last entered `Connecting`/`Connected`, for metrics.
    pub fn connecting_timestamp(&self) -> Option<Instant> {
        self.connecting_timestamp
    }

    /// Current machine state. Exposed for dump output and tests.
    pub fn state(&self) -> State {
        self.state
    }

    /// Deliver one message and run the machine until the queue is idle.
    pub fn handle_message(&mut self, msg: Message, now: Instant) {
        self.queue.push_back(msg);
        self.drain(now);
    }

    /// Fire every timer whose deadline has passed and process the resulting
    /// timeout messages.
    pub fn handle_timeout(&mut self, now: Instant) {
        for (timer, peer) in self.timers.take_expired(now) {
            let msg = match timer {
                Timer::Connect => Message::ConnectTimeout(peer),
                Timer::DialingOut => Message::DialingOutTimeout(peer),
                Timer::StartVr => Message::StartVrTimeout(peer),
                Timer::ClccResponse => Message::ClccResponseTimeout(peer),
            };
            self.queue.push_back(msg);
        }
        self.drain(now);
    }

    /// The next instant at which [`handle_timeout`](Self::handle_timeout)
    /// should be called, if any timer is armed.
    pub fn poll_timeout(&self) -> Option<Instant> {
        self.timers.next_timeout()
    }

    /// Write a human-readable snapshot of the machine.
    pub fn dump(&self, w: &mut impl fmt::Write) -> fmt::Result {
        writeln!(w, "  peer: {}", self.peer)?;
        writeln!(w, "  state: {}", self.state)?;
        match self.prev_state {
            Some(prev) => writeln!(w, "  prev_state: {prev}")?,
            None => writeln!(w, "  prev_state: <none>")?,
        }
        writeln!(w, "  connection_state: {:?}", self.connection_state())?;
        writeln!(w, "  audio_state: {:?}", self.audio_state())?;
        writeln!(w, "  virtual_call_started: {}", self.virtual_call_started)?;
        writeln!(
            w,
            "  voice_recognition_started: {}",
            self.voice_recognition_started
        )?;
        writeln!(
            w,
            "  waiting_for_voice_recognition: {}",
            self.waiting_for_voice_recognition
        )?;
        writeln!(w, "  dialing_out: {}", self.dialing_out)?;
        writeln!(w, "  speaker_volume: {}", self.speaker_volume)?;
        writeln!(w, "  mic_volume: {}", self.mic_volume)?;
        writeln!(w, "  connecting_timestamp: {:?}", self.connecting_timestamp)?;
        Ok(())
    }

    fn drain(&mut self, now: Instant) {
        while let Some(msg) = self.queue.pop_front() {
            let name = msg.name();
            let disposition = match self.state {
                State::Disconnected => self.process_in_disconnected(msg, now),
                State::Connecting => self.process_in_connecting(msg, now),
                State::Disconnecting => self.process_in_disconnecting(msg),
                State::Connected => self.process_in_connected(msg, now),
                State::AudioConnecting => self.process_in_audio_connecting(msg, now),
                State::AudioOn => self.process_in_audio_on(msg, now),
                State::AudioDisconnecting => self.process_in_audio_disconnecting(msg, now),
            };
            if disposition == Disposition::NotHandled {
                error!(
                    "{}: unexpected msg {name}, currentDevice={}",
                    self.state, self.peer
                );
            }
            if let Some(next) = self.pending_transition.take() {
                self.perform_transition(next, now);
            }
        }
    }

    fn transition_to(&mut self, next: State) {
        self.pending_transition = Some(next);
    }

    fn defer(&mut self, msg: Message) {
        debug!("{}: deferring {}, device={}", self.state, msg.name(), self.peer);
        self.deferred.push_back(msg);
    }

    fn perform_transition(&mut self, next: State, now: Instant) {
        self.exit_state();
        self.prev_state = Some(self.state);
        self.state = next;
        self.enter_state(now);
        // Deferred messages are re-delivered ahead of anything already queued,
        // preserving their arrival order.
        let deferred = std::mem::take(&mut self.deferred);
        for msg in deferred.into_iter().rev() {
            self.queue.push_front(msg);
        }
    }

    // -------------------------------------------------------------------
    // Entry and exit actions
    // -------------------------------------------------------------------

    fn enter_state(&mut self, now: Instant) {
        self.enforce_valid_transition();
        match self.state {
            State::Disconnected => self.enter_disconnected(),
            State::Connecting => {
                self.connecting_timestamp = Some(now);
                self.arm_connect_timeout(now);
                self.broadcast_state_transitions();
            }
            State::Disconnecting => {
                self.arm_connect_timeout(now);
                self.broadcast_state_transitions();
            }
            State::Connected => self.enter_connected(now),
            State::AudioConnecting => {
                self.arm_connect_timeout(now);
                self.broadcast_state_transitions();
            }
            State::AudioOn => self.enter_audio_on(),
            State::AudioDisconnecting => {
                self.arm_connect_timeout(now);
                self.broadcast_state_transitions();
            }
        }
    }

    fn exit_state(&mut self) {
        match self.state {
            State::Connecting
            | State::Disconnecting
            | State::AudioConnecting
            | State::AudioDisconnecting => self.timers.stop(Timer::Connect),
            State::AudioOn => self.collaborators.system.set_bluetooth_sco_on(false),
            State::Disconnected | State::Connected => {}
        }
    }

    fn arm_connect_timeout(&mut self, now: Instant) {
        self.timers
            .set(Timer::Connect, now + self.config.connect_timeout, self.peer);
    }

    fn enter_disconnected(&mut self) {
        self.connecting_timestamp = None;
        self.collaborators.phonebook.reset_at_state();
        self.collaborators.system.listen_for_phone_state(false);
        self.voice_recognition_started = false;
        self.waiting_for_voice_recognition = false;
        self.audio_params.clear();
        self.broadcast_state_transitions();
        // Machines for unbonded devices are torn down once they settle here.
        if self.prev_state.is_some()
            && self.collaborators.adapter.bond_state(self.peer) == BondState::None
        {
            self.collaborators.service.remove_state_machine(self.peer);
        }
    }

    fn enter_connected(&mut self, now: Instant) {
        if self.connecting_timestamp.is_none() {
            self.connecting_timestamp = Some(now);
        }
        // Start listening here so the CIND answer sent during SLC setup is
        // computed from live telephony state.
        self.collaborators.system.listen_for_phone_state(true);
        if self.prev_state == Some(State::Connecting) {
            // Reset NREC on connect; the headset will override it later.
            self.process_noise_reduction(false);
            self.collaborators.system.query_phone_state();
            // Drop connection attempts deferred while pending, so a stale
            // auto-connect cannot tear down the link we just established.
            self.deferred.retain(|m| !matches!(m, Message::Connect(_)));
        }
        self.broadcast_state_transitions();
    }

    fn enter_audio_on(&mut self) {
        self.deferred
            .retain(|m| !matches!(m, Message::ConnectAudio(_)));
        // The device carrying SCO is by definition the active device; repair
        // any mismatch between native and service bookkeeping.
        if self.collaborators.service.active_device() != Some(self.peer) {
            self.collaborators.service.set_active_device(Some(self.peer));
        }
        self.set_audio_parameters();
        self.collaborators.system.set_bluetooth_sco_on(true);
        self.broadcast_state_transitions();
    }

    /// Abort on a transition outside the legal-edge table. Reaching this is a
    /// programming error, never peer misbehaviour.
    fn enforce_valid_transition(&self) {
        if self.state != State::Disconnected && self.prev_state.is_none() {
            panic!("prev_state is None on entry to {} for {}", self.state, self.peer);
        }
        let ok = match self.state {
            State::Disconnected => true,
            State::Connecting => self.prev_state == Some(State::Disconnected),
            State::Disconnecting => matches!(
                self.prev_state,
                Some(
                    State::Connected
                        | State::AudioConnecting
                        | State::AudioOn
                        | State::AudioDisconnecting
                )
            ),
            State::Connected => matches!(
                self.prev_state,
                Some(
                    State::Connecting
                        | State::AudioDisconnecting
                        | State::Disconnecting
                        | State::AudioConnecting
                        | State::AudioOn
                        | State::Disconnected
                )
            ),
            State::AudioConnecting => self.prev_state == Some(State::Connected),
            State::AudioDisconnecting => self.prev_state == Some(State::AudioOn),
            State::AudioOn => matches!(
                self.prev_state,
                Some(State::AudioConnecting | State::AudioDisconnecting | State::Connected)
            ),
        };
        if !ok {
            panic!(
                "invalid state transition from {:?} to {} for device {}",
                self.prev_state, self.state, self.peer
            );
        }
    }

    // -------------------------------------------------------------------
    // Broadcasts
    // -------------------------------------------------------------------

    /// Emit delta notifications for the transition just performed. Audio is
    /// reported before connection so listeners observe audio teardown before
    /// the link itself goes away.
    fn broadcast_state_transitions(&mut self) {
        let Some(prev) = self.prev_state else {
            return;
        };
        // `AudioDisconnecting -> AudioOn` maps to equal audio-state values but
        // is still an audible change; report it.
        if self.state.audio_state() != prev.audio_state()
            || (prev == State::AudioDisconnecting && self.state == State::AudioOn)
        {
            debug!(
                "audio state changed: {}: {} -> {}",
                self.peer, prev, self.state
            );
            self.broadcast_audio_state(prev.audio_state(), self.state.audio_state());
        }
        if self.state.connection_state() != prev.connection_state() {
            debug!(
                "connection state changed: {}: {} -> {}",
                self.peer, prev, self.state
            );
            self.broadcast_connection_state(prev.connection_state(), self.state.connection_state());
        }
    }

    fn broadcast_connection_state(&mut self, from: ConnectionState, to: ConnectionState) {
        debug!("broadcast connection state {}: {from:?} -> {to:?}", self.peer);
        if from == ConnectionState::Connected && self.virtual_call_started {
            // The link is going down; an in-progress virtual call cannot
            // outlive it.
            self.terminate_sco_using_virtual_voice_call();
        }
        self.collaborators
            .service
            .on_connection_state_changed_from_machine(self.peer, from, to);
        self.collaborators
            .service
            .send_broadcast(Broadcast::ConnectionStateChanged {
                peer: self.peer,
                from,
                to,
            });
    }

    fn broadcast_audio_state(&mut self, from: AudioState, to: AudioState) {
        debug!("broadcast audio state {}: {from:?} -> {to:?}", self.peer);
        if from == AudioState::Connected && self.virtual_call_started {
            // SCO died mid virtual call, e.g. a call transfer; clean it up.
            self.terminate_sco_using_virtual_voice_call();
        }
        self.collaborators
            .service
            .on_audio_state_changed_from_machine(self.peer, from, to);
        self.collaborators
            .service
            .send_broadcast(Broadcast::AudioStateChanged {
                peer: self.peer,
                from,
                to,
            });
    }

    // -------------------------------------------------------------------
    // Disconnected
    // -------------------------------------------------------------------

    fn process_in_disconnected(&mut self, msg: Message, _now: Instant) -> Disposition {
        match msg {
            Message::Connect(device) => {
                debug!("Disconnected: connecting to {device}");
                if device != self.peer {
                    error!(
                        "Disconnected: CONNECT failed, device={device}, currentDevice={}",
                        self.peer
                    );
                } else if !self.collaborators.native.connect_hfp(device) {
                    error!("Disconnected: connect_hfp({device}) failed");
                    // No state transition is involved, fire the broadcast
                    // immediately so observers can retry.
                    self.broadcast_connection_state(
                        ConnectionState::Disconnected,
                        ConnectionState::Disconnected,
                    );
                } else {
                    self.transition_to(State::Connecting);
                }
            }
            Message::Disconnect(_) => {}
            Message::CallStateChanged { .. } => {
                debug!("Disconnected: ignoring CallStateChanged");
            }
            Message::DeviceStateChanged(_) => {
                debug!("Disconnected: ignoring DeviceStateChanged");
            }
            Message::Stack(event) => {
                debug!("Disconnected: stack event {}", event.kind);
                if event.peer != self.peer {
                    error!(
                        "Disconnected: event device {} does not match currentDevice {}",
                        event.peer, self.peer
                    );
                    return Disposition::Handled;
                }
                match event.kind {
                    StackEventKind::ConnectionStateChanged(state) => {
                        self.process_connection_event_disconnected(state);
                    }
                    kind => error!("Disconnected: unexpected stack event {kind}"),
                }
            }
            _ => return Disposition::NotHandled,
        }
        Disposition::Handled
    }

    fn process_connection_event_disconnected(&mut self, state: StackConnectionState) {
        debug!("Disconnected: connection event {state:?}");
        match state {
            StackConnectionState::Disconnected => warn!("Disconnected: ignore Disconnected event"),
            // Both values land in Connecting: SLC establishment is still due.
            StackConnectionState::Connected | StackConnectionState::Connecting => {
                if self.collaborators.service.ok_to_accept_connection(self.peer) {
                    info!("Disconnected: accept incoming connection from {}", self.peer);
                    self.transition_to(State::Connecting);
                } else {
                    info!(
                        "Disconnected: rejected incoming HF, priority={} device={}",
                        self.collaborators.service.priority(self.peer),
                        self.peer
                    );
                    if !self.collaborators.native.disconnect_hfp(self.peer) {
                        error!("Disconnected: failed to disconnect {}", self.peer);
                    }
                    // Indicate rejection to other components.
                    self.broadcast_connection_state(
                        ConnectionState::Disconnected,
                        ConnectionState::Disconnected,
                    );
                }
            }
            StackConnectionState::Disconnecting => {
                warn!("Disconnected: ignore Disconnecting event");
            }
            StackConnectionState::SlcConnected => {
                error!("Disconnected: incorrect state SlcConnected");
            }
        }
    }

    // -------------------------------------------------------------------
    // Connecting
    // -------------------------------------------------------------------

    // During SLC establishment HFP 1.7.1 requires `AT+BRSF`, `AT+CIND`,
    // `AT+CMER`, `AT+BIND` and `+CHLD` to be answered here; other AT commands
    // are unexpected but still answered for interoperability.
    fn process_in_connecting(&mut self, msg: Message, now: Instant) -> Disposition {
        match msg {
            Message::Connect(_) | Message::ConnectAudio(_) | Message::Disconnect(_) => {
                self.defer(msg);
            }
            Message::ConnectTimeout(device) => {
                if device != self.peer {
                    error!("Connecting: unknown device timeout {device}");
                } else {
                    warn!("Connecting: connect timeout for {device}");
                    self.transition_to(State::Disconnected);
                }
            }
            Message::CallStateChanged { .. } => {
                debug!("Connecting: ignoring CallStateChanged");
            }
            Message::DeviceStateChanged(_) => {
                debug!("Connecting: ignoring DeviceStateChanged");
            }
            Message::Stack(event) => {
                debug!("Connecting: stack event {}", event.kind);
                if event.peer != self.peer {
                    error!(
                        "Connecting: event device {} does not match currentDevice {}",
                        event.peer, self.peer
                    );
                    return Disposition::Handled;
                }
                match event.kind {
                    StackEventKind::ConnectionStateChanged(state) => {
                        self.process_connection_event_connecting(state);
                    }
                    StackEventKind::AtChld(chld) => self.process_at_chld(chld),
                    StackEventKind::AtCind => self.process_at_cind(),
                    StackEventKind::Wbs(config) => self.process_wbs_event(config),
                    StackEventKind::AtBind(ids) => self.process_at_bind(&ids),
                    StackEventKind::VrStateChanged(state) => {
                        warn!("Connecting: unexpected VR event, state={state:?}");
                        self.process_vr_event(state, now);
                    }
                    StackEventKind::DialCall(number) => {
                        warn!("Connecting: unexpected dial event");
                        self.process_dial_call(number, now);
                    }
                    StackEventKind::SubscriberNumberRequest => {
                        warn!("Connecting: unexpected subscriber number request");
                        self.process_subscriber_number_request();
                    }
                    StackEventKind::AtCops => {
                        warn!("Connecting: unexpected COPS query");
                        self.process_at_cops();
                    }
                    StackEventKind::AtClcc => {
                        warn!("Connecting: unexpected CLCC query");
                        self.process_at_clcc(now);
                    }
                    StackEventKind::UnknownAt(at_string) => {
                        warn!("Connecting: unexpected unknown AT, cmd={at_string}");
                        self.process_unknown_at(&at_string);
                    }
                    StackEventKind::KeyPressed => {
                        warn!("Connecting: unexpected key-press event");
                        self.process_key_pressed();
                    }
                    StackEventKind::AtBiev { ind_id, ind_value } => {
                        warn!(
                            "Connecting: unexpected BIEV event, indId={ind_id}, indValue={ind_value}"
                        );
                        self.process_at_biev(ind_id, ind_value);
                    }
                    StackEventKind::VolumeChanged { kind, volume } => {
                        warn!("Connecting: unexpected volume event");
                        self.process_volume_event(kind, volume);
                    }
                    StackEventKind::AnswerCall => {
                        warn!("Connecting: unexpected answer event");
                        self.collaborators.system.answer_call(self.peer);
                    }
                    StackEventKind::HangupCall => {
                        warn!("Connecting: unexpected hangup event");
                        self.collaborators
                            .system
                            .hangup_call(self.peer, self.virtual_call_started);
                    }
                    kind => error!("Connecting: unexpected stack event {kind}"),
                }
            }
            _ => return Disposition::NotHandled,
        }
        Disposition::Handled
    }

    fn process_connection_event_connecting(&mut self, state: StackConnectionState) {
        debug!("Connecting: connection event {state:?}");
        match state {
            StackConnectionState::Disconnected => {
                warn!("Connecting: disconnected");
                self.transition_to(State::Disconnected);
            }
            StackConnectionState::Connected => debug!("Connecting: RFCOMM connected"),
            StackConnectionState::SlcConnected => {
                debug!("Connecting: SLC connected");
                self.transition_to(State::Connected);
            }
            StackConnectionState::Connecting => {}
            StackConnectionState::Disconnecting => warn!("Connecting: disconnecting"),
        }
    }

    // -------------------------------------------------------------------
    // Disconnecting
    // -------------------------------------------------------------------

    fn process_in_disconnecting(&mut self, msg: Message) -> Disposition {
        match msg {
            Message::Connect(_) | Message::ConnectAudio(_) | Message::Disconnect(_) => {
                self.defer(msg);
            }
            Message::ConnectTimeout(device) => {
                if device != self.peer {
                    error!("Disconnecting: unknown device timeout {device}");
                } else {
                    error!("Disconnecting: timeout for {device}");
                    self.transition_to(State::Disconnected);
                }
            }
            Message::Stack(event) => {
                debug!("Disconnecting: stack event {}", event.kind);
                if event.peer != self.peer {
                    error!(
                        "Disconnecting: event device {} does not match currentDevice {}",
                        event.peer, self.peer
                    );
                    return Disposition::Handled;
                }
                match event.kind {
                    StackEventKind::ConnectionStateChanged(state) => match state {
                        StackConnectionState::Disconnected => {
                            debug!("Disconnecting: disconnected");
                            self.transition_to(State::Disconnected);
                        }
                        StackConnectionState::SlcConnected => {
                            debug!("Disconnecting: SLC connected");
                            self.transition_to(State::Connected);
                        }
                        state => error!("Disconnecting: bad connection state {state:?}"),
                    },
                    kind => error!("Disconnecting: unexpected stack event {kind}"),
                }
            }
            _ => return Disposition::NotHandled,
        }
        Disposition::Handled
    }

    // -------------------------------------------------------------------
    // Connected group
    // -------------------------------------------------------------------

    /// Handle messages common to the whole `Connected*` group.
    ///
    /// Precondition: `Connect`, `Disconnect`, `ConnectAudio`,
    /// `DisconnectAudio` and `ConnectTimeout` must have been consumed by the
    /// concrete state; reaching them here is an invariant violation.
    fn process_connected_base(&mut self, msg: Message, now: Instant) -> Disposition {
        match msg {
            Message::Connect(_)
            | Message::Disconnect(_)
            | Message::ConnectAudio(_)
            | Message::DisconnectAudio(_)
            | Message::ConnectTimeout(_) => {
                panic!(
                    "illegal message {} in generic handler of {} for {}",
                    msg.name(),
                    self.state,
                    self.peer
                );
            }
            Message::VoiceRecognitionStart(device) => {
                if device != self.peer {
                    warn!(
                        "{}: VoiceRecognitionStart failed, {device} is not currentDevice",
                        self.state
                    );
                } else {
                    self.process_local_vr_event(VrState::Started);
                }
            }
            Message::VoiceRecognitionStop(device) => {
                if device != self.peer {
                    warn!(
                        "{}: VoiceRecognitionStop failed, {device} is not currentDevice",
                        self.state
                    );
                } else {
                    self.process_local_vr_event(VrState::Stopped);
                }
            }
            Message::CallStateChanged {
                state,
                virtual_call,
            } => self.process_call_state(state, virtual_call),
            Message::DeviceStateChanged(device_state) => {
                self.collaborators
                    .native
                    .notify_device_status(self.peer, device_state);
            }
            Message::SendClccResponse(entry) => self.process_send_clcc_response(&entry),
            Message::ClccResponseTimeout(device) => {
                if device != self.peer {
                    warn!(
                        "{}: ClccResponseTimeout failed, {device} is not currentDevice",
                        self.state
                    );
                } else {
                    self.collaborators
                        .native
                        .clcc_response(device, 0, 0, 0, 0, false, "", 0);
                }
            }
            Message::SendVendorResultCode(code) => {
                self.process_send_vendor_specific_result_code(&code);
            }
            Message::SendBsir(on) => {
                self.collaborators.native.send_bsir(self.peer, on);
            }
            Message::DialingOutTimeout(device) => {
                if device != self.peer {
                    warn!(
                        "{}: DialingOutTimeout failed, {device} is not currentDevice",
                        self.state
                    );
                } else if self.dialing_out {
                    self.dialing_out = false;
                    self.collaborators
                        .native
                        .at_response_code(device, AtResponse::Error, 0);
                }
            }
            Message::VirtualCallStart(device) => {
                if device != self.peer {
                    warn!(
                        "{}: VirtualCallStart failed, {device} is not currentDevice",
                        self.state
                    );
                } else {
                    self.initiate_sco_using_virtual_voice_call();
                }
            }
            Message::VirtualCallStop(device) => {
                if device != self.peer {
                    warn!(
                        "{}: VirtualCallStop failed, {device} is not currentDevice",
                        self.state
                    );
                } else {
                    self.terminate_sco_using_virtual_voice_call();
                }
            }
            Message::StartVrTimeout(device) => {
                if device != self.peer {
                    warn!(
                        "{}: StartVrTimeout failed, {device} is not currentDevice",
                        self.state
                    );
                } else if self.waiting_for_voice_recognition {
                    self.waiting_for_voice_recognition = false;
                    error!(
                        "{}: timeout waiting for voice recognition to start",
                        self.state
                    );
                    self.collaborators
                        .native
                        .at_response_code(device, AtResponse::Error, 0);
                }
            }
            Message::ConnectionAccessReply(reply) => self.handle_access_permission_result(reply),
            Message::Stack(event) => return self.process_stack_event_connected(event, now),
            _ => return Disposition::NotHandled,
        }
        Disposition::Handled
    }

    fn process_stack_event_connected(&mut self, event: StackEvent, now: Instant) -> Disposition {
        debug!("{}: stack event {}", self.state, event.kind);
        if event.peer != self.peer {
            error!(
                "{}: event device {} does not match currentDevice {}",
                self.state, event.peer, self.peer
            );
            return Disposition::Handled;
        }
        match event.kind {
            StackEventKind::ConnectionStateChanged(state) => {
                self.process_connection_event_connected(state);
            }
            StackEventKind::AudioStateChanged(state) => self.process_audio_event(state),
            StackEventKind::VrStateChanged(state) => self.process_vr_event(state, now),
            StackEventKind::AnswerCall => self.collaborators.system.answer_call(self.peer),
            StackEventKind::HangupCall => {
                self.collaborators
                    .system
                    .hangup_call(self.peer, self.virtual_call_started);
            }
            StackEventKind::VolumeChanged { kind, volume } => {
                self.process_volume_event(kind, volume);
            }
            StackEventKind::DialCall(number) => self.process_dial_call(number, now),
            StackEventKind::SendDtmf(code) => {
                self.collaborators.system.send_dtmf(code, self.peer);
            }
            StackEventKind::NoiseReduction(enable) => self.process_noise_reduction(enable),
            StackEventKind::Wbs(config) => self.process_wbs_event(config),
            StackEventKind::AtChld(chld) => self.process_at_chld(chld),
            StackEventKind::SubscriberNumberRequest => self.process_subscriber_number_request(),
            StackEventKind::AtCind => self.process_at_cind(),
            StackEventKind::AtCops => self.process_at_cops(),
            StackEventKind::AtClcc => self.process_at_clcc(now),
            StackEventKind::UnknownAt(at_string) => self.process_unknown_at(&at_string),
            StackEventKind::KeyPressed => self.process_key_pressed(),
            StackEventKind::AtBind(ids) => self.process_at_bind(&ids),
            StackEventKind::AtBiev { ind_id, ind_value } => {
                self.process_at_biev(ind_id, ind_value);
            }
        }
        Disposition::Handled
    }

    fn process_connection_event_connected(&mut self, state: StackConnectionState) {
        debug!("{}: connection event {state:?}", self.state);
        match state {
            StackConnectionState::Connected => {
                error!("{}: RFCOMM connected again, shouldn't happen", self.state);
            }
            StackConnectionState::SlcConnected => {
                error!("{}: SLC connected again, shouldn't happen", self.state);
            }
            StackConnectionState::Disconnecting => {
                info!("{}: disconnecting", self.state);
                self.transition_to(State::Disconnecting);
            }
            StackConnectionState::Disconnected => {
                info!("{}: disconnected", self.state);
                self.transition_to(State::Disconnected);
            }
            StackConnectionState::Connecting => {
                error!("{}: bad connection state Connecting", self.state);
            }
        }
    }

    /// Audio events are the one place the `Connected*` states genuinely
    /// diverge.
    fn process_audio_event(&mut self, state: StackAudioState) {
        debug!("{}: audio event {state:?}", self.state);
        match self.state {
            State::Connected => self.process_audio_event_connected(state),
            State::AudioConnecting => self.process_audio_event_audio_connecting(state),
            State::AudioOn => self.process_audio_event_audio_on(state),
            State::AudioDisconnecting => self.process_audio_event_audio_disconnecting(state),
            _ => unreachable!("audio event outside connected group"),
        }
    }

    fn process_audio_event_connected(&mut self, state: StackAudioState) {
        match state {
            StackAudioState::Connected => {
                if !self.is_sco_acceptable() {
                    warn!("Connected: reject incoming audio connection");
                    if !self.collaborators.native.disconnect_audio(self.peer) {
                        error!("Connected: failed to disconnect audio");
                    }
                    return;
                }
                info!("Connected: audio connected");
                self.transition_to(State::AudioOn);
            }
            StackAudioState::Connecting => {
                if !self.is_sco_acceptable() {
                    warn!("Connected: reject incoming pending audio connection");
                    if !self.collaborators.native.disconnect_audio(self.peer) {
                        error!("Connected: failed to disconnect pending audio");
                    }
                    return;
                }
                info!("Connected: audio connecting");
                self.transition_to(State::AudioConnecting);
            }
            StackAudioState::Disconnected | StackAudioState::Disconnecting => {}
        }
    }

    fn process_audio_event_audio_connecting(&mut self, state: StackAudioState) {
        match state {
            StackAudioState::Disconnected => {
                warn!("AudioConnecting: audio connection failed");
                self.transition_to(State::Connected);
            }
            // Wait and see whether the link still comes up; the timeout
            // covers us otherwise.
            StackAudioState::Connecting | StackAudioState::Disconnecting => {}
            StackAudioState::Connected => {
                info!("AudioConnecting: audio connected");
                self.transition_to(State::AudioOn);
            }
        }
    }

    fn process_audio_event_audio_on(&mut self, state: StackAudioState) {
        match state {
            StackAudioState::Disconnected => {
                info!("AudioOn: audio disconnected by remote");
                self.transition_to(State::Connected);
            }
            StackAudioState::Disconnecting => {
                info!("AudioOn: audio being disconnected by remote");
                self.transition_to(State::AudioDisconnecting);
            }
            state => error!("AudioOn: bad audio state {state:?}"),
        }
    }

    fn process_audio_event_audio_disconnecting(&mut self, state: StackAudioState) {
        match state {
            StackAudioState::Disconnected => {
                info!("AudioDisconnecting: audio disconnected");
                self.transition_to(State::Connected);
            }
            StackAudioState::Disconnecting => {}
            StackAudioState::Connected => {
                warn!("AudioDisconnecting: audio disconnection failed");
                self.transition_to(State::AudioOn);
            }
            // See if it settles into Connected; the timeout recovers us
            // otherwise.
            StackAudioState::Connecting => {}
        }
    }

    fn process_in_connected(&mut self, msg: Message, now: Instant) -> Disposition {
        match msg {
            Message::Connect(device) => {
                warn!("Connected: CONNECT ignored, device={device}");
            }
            Message::Disconnect(device) => {
                debug!("Connected: DISCONNECT from device={device}");
                if device != self.peer {
                    warn!("Connected: DISCONNECT, device {device} not connected");
                } else if !self.collaborators.native.disconnect_hfp(device) {
                    error!("Connected: DISCONNECT from {device} failed");
                    // No state transition involved, fire the broadcast
                    // immediately.
                    self.broadcast_connection_state(
                        ConnectionState::Connected,
                        ConnectionState::Connected,
                    );
                } else {
                    self.transition_to(State::Disconnecting);
                }
            }
            Message::ConnectAudio(_) => {
                debug!("Connected: CONNECT_AUDIO, device={}", self.peer);
                if !self.is_sco_acceptable() {
                    warn!(
                        "Connected: no active/held call, no call setup and no in-band ringing, \
                         not allowing SCO, device={}",
                        self.peer
                    );
                } else if !self.collaborators.native.connect_audio(self.peer) {
                    error!("Connected: failed to connect SCO audio for {}", self.peer);
                    self.broadcast_audio_state(AudioState::Disconnected, AudioState::Disconnected);
                } else {
                    self.transition_to(State::AudioConnecting);
                }
            }
            Message::DisconnectAudio(_) => {
                debug!("Connected: ignore DISCONNECT_AUDIO, device={}", self.peer);
            }
            other => return self.process_connected_base(other, now),
        }
        Disposition::Handled
    }

    fn process_in_audio_connecting(&mut self, msg: Message, now: Instant) -> Disposition {
        match msg {
            Message::Connect(_)
            | Message::Disconnect(_)
            | Message::ConnectAudio(_)
            | Message::DisconnectAudio(_) => self.defer(msg),
            Message::ConnectTimeout(device) => {
                if device != self.peer {
                    warn!("AudioConnecting: connect timeout for unknown device {device}");
                } else {
                    warn!("AudioConnecting: connect timeout");
                    self.transition_to(State::Connected);
                }
            }
            other => return self.process_connected_base(other, now),
        }
        Disposition::Handled
    }

    fn process_in_audio_on(&mut self, msg: Message, now: Instant) -> Disposition {
        match msg {
            Message::Connect(device) => {
                warn!("AudioOn: CONNECT ignored, device={device}");
            }
            Message::Disconnect(device) => {
                debug!("AudioOn: DISCONNECT, device={device}");
                if device != self.peer {
                    warn!("AudioOn: DISCONNECT, device {device} not connected");
                } else {
                    // Disconnect BT SCO first; if that fails we still move to
                    // AudioDisconnecting to force the link down.
                    if !self.collaborators.native.disconnect_audio(self.peer) {
                        warn!("AudioOn: disconnect_audio failed, device={}", self.peer);
                    }
                    self.defer(Message::Disconnect(self.peer));
                    self.transition_to(State::AudioDisconnecting);
                }
            }
            Message::ConnectAudio(device) => {
                if device != self.peer {
                    warn!("AudioOn: CONNECT_AUDIO device is not connected, device={device}");
                } else {
                    warn!("AudioOn: CONNECT_AUDIO device audio is already connected, device={device}");
                }
            }
            Message::DisconnectAudio(device) => {
                if device != self.peer {
                    warn!(
                        "AudioOn: DISCONNECT_AUDIO failed, device={device}, currentDevice={}",
                        self.peer
                    );
                } else if self.collaborators.native.disconnect_audio(self.peer) {
                    debug!("AudioOn: DISCONNECT_AUDIO, device={}", self.peer);
                    self.transition_to(State::AudioDisconnecting);
                } else {
                    warn!("AudioOn: DISCONNECT_AUDIO failed, device={}", self.peer);
                }
            }
            Message::ScoVolumeChanged(volume) => self.process_intent_sco_volume(volume),
            Message::Stack(ref event)
                if event.peer == self.peer && matches!(event.kind, StackEventKind::Wbs(_)) =>
            {
                error!("AudioOn: cannot change WBS codec while audio is connected");
            }
            other => return self.process_connected_base(other, now),
        }
        Disposition::Handled
    }

    fn process_in_audio_disconnecting(&mut self, msg: Message, now: Instant) -> Disposition {
        match msg {
            Message::Connect(_)
            | Message::Disconnect(_)
            | Message::ConnectAudio(_)
            | Message::DisconnectAudio(_) => self.defer(msg),
            Message::ConnectTimeout(device) => {
                if device != self.peer {
                    warn!("AudioDisconnecting: connect timeout for unknown device {device}");
                } else {
                    warn!("AudioDisconnecting: connect timeout");
                    self.transition_to(State::Connected);
                }
            }
            other => return self.process_connected_base(other, now),
        }
        Disposition::Handled
    }

    fn process_intent_sco_volume(&mut self, volume: i32) {
        if self.speaker_volume != volume {
            self.speaker_volume = volume;
            self.collaborators
                .native
                .set_volume(self.peer, VolumeKind::Speaker, volume);
        }
    }

    // -------------------------------------------------------------------
    // Voice recognition
    // -------------------------------------------------------------------

    fn process_vr_event(&mut self, state: VrState, now: Instant) {
        debug!(
            "processVrEvent: state={state:?} voiceRecognitionStarted={} \
             waitingForVoiceRecognition={} isInCall={}",
            self.voice_recognition_started,
            self.waiting_for_voice_recognition,
            self.collaborators.system.is_in_call()
        );
        match state {
            VrState::Started => {
                if !self.virtual_call_started && !self.collaborators.system.is_in_call() {
                    if !self
                        .collaborators
                        .service
                        .start_activity(ActivityRequest::VoiceCommand)
                    {
                        error!("processVrEvent: voice-command activity not found");
                        self.collaborators.native.at_response_code(
                            self.peer,
                            AtResponse::Error,
                            0,
                        );
                        return;
                    }
                    self.expect_voice_recognition(now);
                } else {
                    // A call is ongoing; refuse.
                    self.collaborators
                        .native
                        .at_response_code(self.peer, AtResponse::Error, 0);
                }
            }
            VrState::Stopped => {
                if self.voice_recognition_started || self.waiting_for_voice_recognition {
                    self.collaborators
                        .native
                        .at_response_code(self.peer, AtResponse::Ok, 0);
                    self.voice_recognition_started = false;
                    self.waiting_for_voice_recognition = false;
                    if self.collaborators.native.stop_voice_recognition(self.peer)
                        && !self.collaborators.system.is_in_call()
                        && self.audio_state() != AudioState::Disconnected
                    {
                        self.collaborators.native.disconnect_audio(self.peer);
                        self.collaborators
                            .system
                            .set_audio_parameters("A2dpSuspended=false");
                    }
                } else {
                    self.collaborators
                        .native
                        .at_response_code(self.peer, AtResponse::Error, 0);
                }
            }
        }
    }

    fn process_local_vr_event(&mut self, state: VrState) {
        match state {
            VrState::Started => {
                if self.voice_recognition_started || self.collaborators.system.is_in_call() {
                    error!(
                        "processLocalVrEvent: voice recognition started when call is active, \
                         isInCall={}, voiceRecognitionStarted={}",
                        self.collaborators.system.is_in_call(),
                        self.voice_recognition_started
                    );
                    return;
                }
                self.voice_recognition_started = true;

                let need_audio = if self.waiting_for_voice_recognition {
                    if self.timers.get(Timer::StartVr).is_none() {
                        return;
                    }
                    debug!("processLocalVrEvent: voice recognition started successfully");
                    self.waiting_for_voice_recognition = false;
                    self.collaborators
                        .native
                        .at_response_code(self.peer, AtResponse::Ok, 0);
                    self.timers.stop(Timer::StartVr);
                    true
                } else {
                    debug!("processLocalVrEvent: voice recognition started locally");
                    self.collaborators.native.start_voice_recognition(self.peer)
                };

                if need_audio && self.audio_state() == AudioState::Disconnected {
                    debug!("processLocalVrEvent: initiating audio connection for voice recognition");
                    // A2DP must not be streaming while SCO is up; ordinary
                    // calls suspend it through the audio mode change, but the
                    // voice-dial path never leaves normal mode, so suspend it
                    // explicitly.
                    self.collaborators
                        .system
                        .set_audio_parameters("A2dpSuspended=true");
                    self.collaborators.native.connect_audio(self.peer);
                }

                let wake_lock = self.collaborators.system.vr_wake_lock();
                if wake_lock.is_held() {
                    wake_lock.release();
                }
            }
            VrState::Stopped => {
                debug!(
                    "processLocalVrEvent: voice recognition stopped, \
                     voiceRecognitionStarted={}, waitingForVoiceRecognition={}",
                    self.voice_recognition_started, self.waiting_for_voice_recognition
                );
                if self.voice_recognition_started || self.waiting_for_voice_recognition {
                    self.voice_recognition_started = false;
                    self.waiting_for_voice_recognition = false;
                    if self.collaborators.native.stop_voice_recognition(self.peer)
                        && !self.collaborators.system.is_in_call()
                        && self.audio_state() != AudioState::Disconnected
                    {
                        self.collaborators.native.disconnect_audio(self.peer);
                        self.collaborators
                            .system
                            .set_audio_parameters("A2dpSuspended=false");
                    }
                }
            }
        }
    }

    fn expect_voice_recognition(&mut self, now: Instant) {
        self.waiting_for_voice_recognition = true;
        self.collaborators.service.set_active_device(Some(self.peer));
        self.timers
            .set(Timer::StartVr, now + self.config.start_vr_timeout, self.peer);
        let wake_lock = self.collaborators.system.vr_wake_lock();
        if !wake_lock.is_held() {
            wake_lock.acquire(self.config.start_vr_timeout);
        }
    }

    // -------------------------------------------------------------------
    // Virtual call
    // -------------------------------------------------------------------

    /// Drive SCO establishment with a synthetic dialing -> alerting -> active
    /// call sequence. Returns false when telephony or voice recognition is
    /// busy and nothing was injected.
    pub(crate) fn initiate_sco_using_virtual_voice_call(&mut self) -> bool {
        debug!("initiateScoUsingVirtualVoiceCall: received");
        if self.collaborators.system.is_in_call() || self.voice_recognition_started {
            error!("initiateScoUsingVirtualVoiceCall: call in progress");
            return false;
        }
        self.process_call_state_update(CallState::new(0, 0, CallStatus::Dialing), true);
        self.process_call_state_update(CallState::new(0, 0, CallStatus::Alerting), true);
        self.process_call_state_update(CallState::new(1, 0, CallStatus::Idle), true);
        self.virtual_call_started = true;
        debug!("initiateScoUsingVirtualVoiceCall: done");
        true
    }

    /// End a virtual call, if one is in progress. Returns false otherwise.
    pub(crate) fn terminate_sco_using_virtual_voice_call(&mut self) -> bool {
        debug!("terminateScoUsingVirtualVoiceCall: received");
        if !self.virtual_call_started {
            warn!("terminateScoUsingVirtualVoiceCall: no present call to terminate");
            return false;
        }
        self.process_call_state_update(CallState::new(0, 0, CallStatus::Idle), true);
        self.virtual_call_started = false;
        debug!("terminateScoUsingVirtualVoiceCall: done");
        true
    }

    fn process_call_state(&mut self, state: CallState, virtual_call: bool) {
        self.process_call_state_update(state, virtual_call);
    }

    fn process_call_state_update(&mut self, call_state: CallState, is_virtual: bool) {
        let system = self.collaborators.system.clone();
        system.set_num_active_calls(call_state.num_active);
        system.set_num_held_calls(call_state.num_held);
        system.set_call_status(call_state.status);
        if self.dialing_out {
            match call_state.status {
                CallStatus::Dialing => {
                    if self.timers.get(Timer::DialingOut).is_none() {
                        return;
                    }
                    self.collaborators.service.set_active_device(Some(self.peer));
                    self.collaborators
                        .native
                        .at_response_code(self.peer, AtResponse::Ok, 0);
                    self.timers.stop(Timer::DialingOut);
                }
                CallStatus::Active | CallStatus::Idle => self.dialing_out = false,
                _ => {}
            }
        }

        debug!(
            "processCallState: numActive={} numHeld={} callStatus={:?} number={} type={}",
            call_state.num_active,
            call_state.num_held,
            call_state.status,
            call_state.number,
            call_state.number_type
        );

        if is_virtual {
            // Virtual call state update.
            if self.state != State::Disconnected {
                self.collaborators
                    .native
                    .phone_state_change(self.peer, &call_state);
            }
        } else {
            // Circuit-switched voice call update: a real call preempts any
            // virtual call in progress.
            if call_state.num_active > 0
                || call_state.num_held > 0
                || call_state.status != CallStatus::Idle
            {
                self.terminate_sco_using_virtual_voice_call();
            }

            // Terminating the virtual call above reset the snapshot status to
            // Idle; restore the real value so CIND reads callsetup correctly.
            if system.call_status() != call_state.status {
                system.set_call_status(call_state.status);
            }

            // A surviving virtual call means there is no real call; let it
            // continue and skip the stack update.
            if !self.virtual_call_started && self.state != State::Disconnected {
                self.collaborators
                    .native
                    .phone_state_change(self.peer, &call_state);
            }
        }
    }

    // -------------------------------------------------------------------
    // Dial-out and key press
    // -------------------------------------------------------------------

    fn process_dial_call(&mut self, number: Option<String>, now: Instant) {
        let device = self.peer;
        if self.dialing_out {
            debug!("processDialCall: already dialling");
            self.collaborators
                .native
                .at_response_code(device, AtResponse::Error, 0);
            return;
        }
        let number = number.unwrap_or_default();
        let dial_number = if number.is_empty() {
            match self.collaborators.phonebook.last_dialed_number() {
                Some(n) => n,
                None => {
                    debug!("processDialCall: last dial number null");
                    self.collaborators
                        .native
                        .at_response_code(device, AtResponse::Error, 0);
                    return;
                }
            }
        } else if number.starts_with('>') {
            // Memory dialling: just dial the last number for now. The `>9999`
            // marker is a conformance-test probe that must be refused.
            if number.starts_with(">9999") {
                self.collaborators
                    .native
                    .at_response_code(device, AtResponse::Error, 0);
                return;
            }
            debug!("processDialCall: memory dial, using last dialled number");
            match self.collaborators.phonebook.last_dialed_number() {
                Some(n) => n,
                None => {
                    debug!("processDialCall: last dial number null");
                    self.collaborators
                        .native
                        .at_response_code(device, AtResponse::Error, 0);
                    return;
                }
            }
        } else {
            let trimmed = number.strip_suffix(';').unwrap_or(&number);
            at::convert_pre_dial(trimmed)
        };
        // A real outgoing call ends any virtual call before the intent fires.
        self.terminate_sco_using_virtual_voice_call();
        self.collaborators.service.set_active_device(Some(self.peer));
        self.collaborators
            .service
            .start_activity(ActivityRequest::DialCall {
                number: dial_number,
            });
        self.dialing_out = true;
        self.timers.set(
            Timer::DialingOut,
            now + self.config.dialing_out_timeout,
            device,
        );
    }

    fn process_key_pressed(&mut self) {
        let system = &self.collaborators.system;
        if system.call_status() == CallStatus::Incoming {
            system.answer_call(self.peer);
        } else if system.num_active_calls() > 0 {
            if self.audio_state() != AudioState::Disconnected {
                self.collaborators.service.set_active_device(Some(self.peer));
                self.collaborators.native.connect_audio(self.peer);
            } else {
                system.hangup_call(self.peer, false);
            }
        } else {
            let Some(dial_number) = self.collaborators.phonebook.last_dialed_number() else {
                debug!("processKeyPressed: last dial number null");
                return;
            };
            self.collaborators.service.set_active_device(Some(self.peer));
            self.collaborators
                .service
                .start_activity(ActivityRequest::DialCall {
                    number: dial_number,
                });
        }
    }

    // -------------------------------------------------------------------
    // Volume, NREC, WBS
    // -------------------------------------------------------------------

    fn process_volume_event(&mut self, kind: VolumeKind, volume: i32) {
        // When a call is active only the device with audio focus may change
        // the SCO volume.
        if self.collaborators.system.is_in_call() && self.audio_state() != AudioState::Connected {
            warn!(
                "processVolumeEvent: ignored because {} does not have audio focus",
                self.peer
            );
        }
        match kind {
            VolumeKind::Speaker => {
                self.speaker_volume = volume;
                let show_ui = self.state == State::AudioOn;
                self.collaborators.system.set_stream_volume(volume, show_ui);
            }
            VolumeKind::Microphone => {
                self.mic_volume = volume;
            }
        }
    }

    fn process_noise_reduction(&mut self, enable: bool) {
        let prev = self
            .audio_params
            .get(HEADSET_NREC)
            .map(String::as_str)
            .unwrap_or(AUDIO_FEATURE_OFF)
            .to_owned();
        let new = if enable {
            AUDIO_FEATURE_ON
        } else {
            AUDIO_FEATURE_OFF
        };
        self.audio_params.insert(HEADSET_NREC, new.to_owned());
        debug!("processNoiseReductionEvent: {HEADSET_NREC} change {prev} -> {new}");
        if self.audio_state() == AudioState::Connected {
            self.set_audio_parameters();
        }
    }

    fn process_wbs_event(&mut self, config: WbsConfig) {
        let prev = self
            .audio_params
            .get(HEADSET_WBS)
            .map(String::as_str)
            .unwrap_or(AUDIO_FEATURE_OFF)
            .to_owned();
        let new = match config {
            WbsConfig::Yes => AUDIO_FEATURE_ON,
            WbsConfig::No | WbsConfig::None => AUDIO_FEATURE_OFF,
        };
        self.audio_params.insert(HEADSET_WBS, new.to_owned());
        debug!("processWBSEvent: {HEADSET_WBS} change {prev} -> {new}");
    }

    /// Push the negotiated audio parameters to the audio subsystem. Only done
    /// on entry to `AudioOn` and on NREC changes while audio is up.
    fn set_audio_parameters(&self) {
        let name = self
            .collaborators
            .adapter
            .remote_name(self.peer)
            .unwrap_or_else(|| "<unknown>".to_owned());
        let nrec = self
            .audio_params
            .get(HEADSET_NREC)
            .map(String::as_str)
            .unwrap_or(AUDIO_FEATURE_OFF);
        let wbs = self
            .audio_params
            .get(HEADSET_WBS)
            .map(String::as_str)
            .unwrap_or(AUDIO_FEATURE_OFF);
        let key_value_pairs =
            format!("{HEADSET_NAME}={name};{HEADSET_NREC}={nrec};{HEADSET_WBS}={wbs}");
        info!("setAudioParameters for {}: {key_value_pairs}", self.peer);
        self.collaborators
            .system
            .set_audio_parameters(&key_value_pairs);
    }

    // -------------------------------------------------------------------
    // AT command processors
    // -------------------------------------------------------------------

    fn process_at_chld(&mut self, chld: i32) {
        let response = if self.collaborators.system.process_chld(chld) {
            AtResponse::Ok
        } else {
            AtResponse::Error
        };
        self.collaborators
            .native
            .at_response_code(self.peer, response, 0);
    }

    fn process_subscriber_number_request(&mut self) {
        match self.collaborators.system.subscriber_number() {
            Some(number) => {
                let toa = at::toa_from_number(&number);
                self.collaborators
                    .native
                    .at_response_string(self.peer, &format!("+CNUM: ,\"{number}\",{toa},,4"));
                self.collaborators
                    .native
                    .at_response_code(self.peer, AtResponse::Ok, 0);
            }
            None => {
                error!("processSubscriberNumberRequest: no subscriber number");
                self.collaborators
                    .native
                    .at_response_code(self.peer, AtResponse::Error, 0);
            }
        }
    }

    fn process_at_cind(&mut self) {
        let system = &self.collaborators.system;
        // Carkits expect a well-formed CIND answer even mid virtual call, so
        // synthesise one active call and no call setup for it.
        let (num_active, num_held) = if self.virtual_call_started {
            (1, 0)
        } else {
            (system.num_active_calls(), system.num_held_calls())
        };
        self.collaborators.native.cind_response(
            self.peer,
            system.cind_service(),
            num_active,
            num_held,
            system.call_status(),
            system.cind_signal(),
            system.cind_roam(),
            system.cind_battery_charge(),
        );
    }

    fn process_at_cops(&mut self) {
        let operator = self
            .collaborators
            .system
            .network_operator()
            .unwrap_or_default();
        self.collaborators
            .native
            .cops_response(self.peer, &operator);
    }

    fn process_at_clcc(&mut self, now: Instant) {
        if self.virtual_call_started {
            // In a virtual call we list our own number rather than a remote
            // party.
            let number = self
                .collaborators
                .system
                .subscriber_number()
                .unwrap_or_default();
            let toa = at::toa_from_number(&number);
            self.collaborators
                .native
                .clcc_response(self.peer, 1, 0, 0, 0, false, &number, toa);
            self.collaborators
                .native
                .clcc_response(self.peer, 0, 0, 0, 0, false, "", 0);
        } else if !self.collaborators.system.list_current_calls() {
            error!("processAtClcc: failed to list current calls for {}", self.peer);
            self.collaborators
                .native
                .clcc_response(self.peer, 0, 0, 0, 0, false, "", 0);
        } else {
            self.timers.set(
                Timer::ClccResponse,
                now + self.config.clcc_response_timeout,
                self.peer,
            );
        }
    }

    fn process_send_clcc_response(&mut self, entry: &ClccEntry) {
        if self.timers.get(Timer::ClccResponse).is_none() {
            return;
        }
        if entry.index == 0 {
            self.timers.stop(Timer::ClccResponse);
        }
        self.collaborators.native.clcc_response(
            self.peer,
            entry.index,
            entry.direction,
            entry.status,
            entry.mode,
            entry.mpty,
            &entry.number,
            entry.number_type,
        );
    }

    fn process_at_cscs(&mut self, args: &str, command_type: AtCommandType) {
        debug!("processAtCscs: args={args}");
        self.collaborators
            .phonebook
            .handle_cscs_command(args, command_type, self.peer);
    }

    fn process_at_cpbs(&mut self, args: &str, command_type: AtCommandType) {
        debug!("processAtCpbs: args={args}");
        self.collaborators
            .phonebook
            .handle_cpbs_command(args, command_type, self.peer);
    }

    fn process_at_cpbr(&mut self, args: &str, command_type: AtCommandType) {
        debug!("processAtCpbr: args={args}");
        self.collaborators
            .phonebook
            .handle_cpbr_command(args, command_type, self.peer);
    }

    fn process_unknown_at(&mut self, at_string: &str) {
        debug!("processUnknownAt: {at_string}");
        let at_command = at::parse_unknown_at(at_string);
        let command_type = at::at_command_type(&at_command);
        if let Some(rest) = at_command.strip_prefix("+CSCS") {
            self.process_at_cscs(rest, command_type);
        } else if let Some(rest) = at_command.strip_prefix("+CPBS") {
            self.process_at_cpbs(rest, command_type);
        } else if let Some(rest) = at_command.strip_prefix("+CPBR") {
            self.process_at_cpbr(rest, command_type);
        } else {
            self.process_vendor_specific_at(&at_command);
        }
    }

    fn process_vendor_specific_at(&mut self, at_string: &str) {
        debug!("processVendorSpecificAt: {at_string}");

        // Only SET commands are accepted.
        let Some(index_of_equal) = at_string.find('=') else {
            error!("processVendorSpecificAt: command type error in {at_string}");
            self.collaborators
                .native
                .at_response_code(self.peer, AtResponse::Error, 0);
            return;
        };

        let command = &at_string[..index_of_equal];
        let Some(company_id) = at::vendor_company_id(command) else {
            error!("processVendorSpecificAt: unsupported command {at_string}");
            self.collaborators
                .native
                .at_response_code(self.peer, AtResponse::Error, 0);
            return;
        };

        let arg = &at_string[index_of_equal + 1..];
        if arg.starts_with('?') {
            error!("processVendorSpecificAt: command type error in {at_string}");
            self.collaborators
                .native
                .at_response_code(self.peer, AtResponse::Error, 0);
            return;
        }

        let args = at::generate_args(arg);
        if command == "+XAPL" {
            self.process_at_xapl(&args);
        }
        self.collaborators
            .service
            .send_broadcast(Broadcast::VendorSpecificEvent {
                peer: self.peer,
                command: command.to_owned(),
                company_id,
                command_type: AtCommandType::Set,
                args,
            });
        self.collaborators
            .native
            .at_response_code(self.peer, AtResponse::Ok, 0);
    }

    /// `AT+XAPL=<vendor>-<product>-<version>,<features>`, the Apple accessory
    /// capability exchange.
    fn process_at_xapl(&mut self, args: &[AtArg]) {
        if args.len() != 2 {
            warn!("processAtXapl: args length must be 2, got {}", args.len());
            return;
        }
        if !matches!(args[0], AtArg::Str(_)) || !matches!(args[1], AtArg::Int(_)) {
            warn!("processAtXapl: argument types do not match");
            return;
        }
        // Feature bit 2: we support battery level reporting only.
        self.collaborators
            .native
            .at_response_string(self.peer, "+XAPL=iPhone,2");
    }

    fn process_at_bind(&mut self, at_string: &str) {
        debug!("processAtBind: {at_string}");
        let mut iter = 0;
        while iter < at_string.len() {
            let end = at::find_char(',', at_string, iter);
            let id = &at_string[iter..end];
            match id.trim().parse::<i32>() {
                Ok(HF_INDICATOR_ENHANCED_DRIVER_SAFETY) => {
                    debug!("processAtBind: enhanced driver safety indicator supported");
                    self.send_indicator_event(HF_INDICATOR_ENHANCED_DRIVER_SAFETY, -1);
                }
                Ok(HF_INDICATOR_BATTERY_LEVEL_STATUS) => {
                    debug!("processAtBind: battery level indicator supported");
                    self.send_indicator_event(HF_INDICATOR_BATTERY_LEVEL_STATUS, -1);
                }
                Ok(ind_id) => debug!("processAtBind: invalid HF indicator {ind_id}"),
                Err(_) => error!("processAtBind: bad indicator id {id:?}"),
            }
            iter = end + 1;
        }
    }

    fn process_at_biev(&mut self, ind_id: i32, ind_value: i32) {
        debug!("processAtBiev: indId={ind_id}, indValue={ind_value}");
        self.send_indicator_event(ind_id, ind_value);
    }

    fn send_indicator_event(&mut self, ind_id: i32, ind_value: i32) {
        self.collaborators
            .service
            .send_broadcast(Broadcast::HfIndicatorValueChanged {
                peer: self.peer,
                ind_id,
                ind_value,
            });
    }

    fn process_send_vendor_specific_result_code(&mut self, code: &VendorResultCode) {
        let mut to_send = format!("{}: ", code.command);
        if let Some(arg) = &code.arg {
            to_send.push_str(arg);
        }
        self.collaborators
            .native
            .at_response_string(code.peer, &to_send);
    }

    fn handle_access_permission_result(&mut self, reply: AccessReply) {
        debug!("handleAccessPermissionResult");
        let phonebook = &self.collaborators.phonebook;
        if !phonebook.checking_access_permission() {
            return;
        }
        let response = if reply.allowed {
            if reply.always {
                self.collaborators
                    .adapter
                    .set_phonebook_access_permission(self.peer, AccessPermission::Allowed);
            }
            phonebook.process_cpbr_command(reply.peer)
        } else {
            if reply.always {
                self.collaborators
                    .adapter
                    .set_phonebook_access_permission(self.peer, AccessPermission::Rejected);
            }
            Some(AtResponse::Error)
        };
        phonebook.set_cpbr_index(-1);
        phonebook.set_checking_access_permission(false);
        match response {
            Some(code) => {
                self.collaborators
                    .native
                    .at_response_code(reply.peer, code, 0);
            }
            None => debug!("handleAccessPermissionResult: no response to send"),
        }
    }

    // -------------------------------------------------------------------
    // SCO gating
    // -------------------------------------------------------------------

    /// Accept SCO only for the active device on an allowed audio route, and
    /// only when there is an active call, voice recognition, an active
    /// virtual call, or in-band ringing for an incoming call.
    fn is_sco_acceptable(&self) -> bool {
        let service = &self.collaborators.service;
        if service.force_sco_audio() {
            return true;
        }
        let active_device = service.active_device();
        if active_device != Some(self.peer) {
            warn!(
                "isScoAcceptable: rejected SCO since {} is not the current active device {:?}",
                self.peer, active_device
            );
            return false;
        }
        if !service.audio_route_allowed() {
            warn!("isScoAcceptable: rejected SCO since audio route is not allowed");
            return false;
        }
        let system = &self.collaborators.system;
        if system.is_in_call() || self.voice_recognition_started {
            return true;
        }
        if system.is_ringing() && service.inband_ringing_enabled() {
            return true;
        }
        warn!(
            "isScoAcceptable: rejected SCO, inCall={}, voiceRecognition={}, ringing={}, \
             inbandRinging={}",
            system.is_in_call(),
            self.voice_recognition_started,
            system.is_ringing(),
            service.inband_ringing_enabled()
        );
        false
    }
}

#[cfg(test)]
impl PeerMachine {
    pub(crate) fn virtual_call_started(&self) -> bool {
        self.virtual_call_started
    }

    pub(crate) fn voice_recognition_started(&self) -> bool {
        self.voice_recognition_started
    }

    pub(crate) fn waiting_for_voice_recognition(&self) -> bool {
        self.waiting_for_voice_recognition
    }

    pub(crate) fn dialing_out(&self) -> bool {
        self.dialing_out
    }
}
