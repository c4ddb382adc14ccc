//! Messages, stack events and the value types they carry.
//!
//! Every external stimulus a machine can observe is normalised into a
//! [`Message`] before it reaches a state handler: user requests from the
//! service, telephony and system events, events reported by the native HFP
//! stack, and the machine's own timer expirations.

use std::fmt;

use crate::device::BdAddr;

/// Connection state of a machine as observed by the service and broadcast to
/// listeners.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
}

/// Audio (SCO) state of a machine as observed by the service.
///
/// There is deliberately no `Disconnecting` value: the profile surface never
/// had one, and `AudioDisconnecting` reports `Connected` until the link is
/// actually down.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum AudioState {
    Disconnected,
    Connecting,
    Connected,
}

/// Connection states reported by the native stack.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum StackConnectionState {
    Disconnected,
    Connecting,
    /// RFCOMM is up but the service level connection is still being
    /// negotiated.
    Connected,
    /// The service level connection is fully established.
    SlcConnected,
    Disconnecting,
}

/// Audio states reported by the native stack.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum StackAudioState {
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
}

/// Voice recognition states, both as reported by the peer and as requested
/// locally.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum VrState {
    Stopped,
    Started,
}

/// Which volume a `+VGS`/`+VGM` style update refers to.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum VolumeKind {
    Speaker,
    Microphone,
}

/// Wide-band-speech configuration carried by an `AT+BAC`/codec event.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum WbsConfig {
    /// No codec preference reported.
    None,
    /// Narrow-band (CVSD) requested.
    No,
    /// Wide-band (mSBC) requested.
    Yes,
}

/// Result code to send to the peer in response to an AT command.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum AtResponse {
    Error,
    Ok,
}

/// Call progress values tracked by telephony.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum CallStatus {
    Active,
    Held,
    Dialing,
    Alerting,
    Incoming,
    Waiting,
    Idle,
}

/// Snapshot of the telephony call state, as delivered by the telephony
/// subsystem or synthesised for a virtual call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallState {
    pub num_active: u32,
    pub num_held: u32,
    pub status: CallStatus,
    pub number: String,
    pub number_type: i32,
}

impl CallState {
    pub fn new(num_active: u32, num_held: u32, status: CallStatus) -> Self {
        Self {
            num_active,
            num_held,
            status,
            number: String::new(),
            number_type: 0,
        }
    }
}

/// Network status indicators pushed to the peer via `+CIEV`.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct DeviceState {
    pub service: i32,
    pub roam: i32,
    pub signal: i32,
    pub battery: i32,
}

/// One `+CLCC` list entry streamed by telephony. `index == 0` is the list
/// terminator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClccEntry {
    pub index: i32,
    pub direction: i32,
    pub status: i32,
    pub mode: i32,
    pub mpty: bool,
    pub number: String,
    pub number_type: i32,
}

/// An unsolicited vendor result code the service wants delivered to the peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VendorResultCode {
    pub peer: BdAddr,
    pub command: String,
    pub arg: Option<String>,
}

/// Reply to a phonebook access permission request.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct AccessReply {
    pub peer: BdAddr,
    /// Whether the user granted access for this request.
    pub allowed: bool,
    /// Whether the decision should be persisted for future requests.
    pub always: bool,
}

/// Event reported by the native HFP stack for one peer.
#[derive(Debug, Clone, PartialEq)]
pub struct StackEvent {
    pub peer: BdAddr,
    pub kind: StackEventKind,
}

/// The payload of a [`StackEvent`].
#[derive(Debug, Clone, PartialEq)]
pub enum StackEventKind {
    ConnectionStateChanged(StackConnectionState),
    AudioStateChanged(StackAudioState),
    VrStateChanged(VrState),
    AnswerCall,
    HangupCall,
    VolumeChanged { kind: VolumeKind, volume: i32 },
    /// `ATD...` with the dial string, if any; `None` means redial.
    DialCall(Option<String>),
    SendDtmf(i32),
    NoiseReduction(bool),
    Wbs(WbsConfig),
    AtChld(i32),
    SubscriberNumberRequest,
    AtCind,
    AtCops,
    AtClcc,
    /// An AT command the stack did not recognise, verbatim after `AT`.
    UnknownAt(String),
    KeyPressed,
    /// `AT+BIND=` carrying the unparsed comma-separated indicator id list.
    AtBind(String),
    AtBiev { ind_id: i32, ind_value: i32 },
}

impl fmt::Display for StackEventKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            Self::ConnectionStateChanged(_) => "ConnectionStateChanged",
            Self::AudioStateChanged(_) => "AudioStateChanged",
            Self::VrStateChanged(_) => "VrStateChanged",
            Self::AnswerCall => "AnswerCall",
            Self::HangupCall => "HangupCall",
            Self::VolumeChanged { .. } => "VolumeChanged",
            Self::DialCall(_) => "DialCall",
            Self::SendDtmf(_) => "SendDtmf",
            Self::NoiseReduction(_) => "NoiseReduction",
            Self::Wbs(_) => "Wbs",
            Self::AtChld(_) => "AtChld",
            Self::SubscriberNumberRequest => "SubscriberNumberRequest",
            Self::AtCind => "AtCind",
            Self::AtCops => "AtCops",
            Self::AtClcc => "AtClcc",
            Self::UnknownAt(_) => "UnknownAt",
            Self::KeyPressed => "KeyPressed",
            Self::AtBind(_) => "AtBind",
            Self::AtBiev { .. } => "AtBiev",
        };
        f.write_str(name)
    }
}

/// A unit of work delivered to a machine's event queue.
///
/// Handlers run to completion for one message before the next is dequeued.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    // User requests from the service API.
    Connect(BdAddr),
    Disconnect(BdAddr),
    ConnectAudio(BdAddr),
    DisconnectAudio(BdAddr),
    VoiceRecognitionStart(BdAddr),
    VoiceRecognitionStop(BdAddr),
    VirtualCallStart(BdAddr),
    VirtualCallStop(BdAddr),

    // System events.
    CallStateChanged {
        state: CallState,
        /// True when the update is synthesised by the virtual-call protocol
        /// rather than reported by real telephony.
        virtual_call: bool,
    },
    DeviceStateChanged(DeviceState),
    ScoVolumeChanged(i32),
    ConnectionAccessReply(AccessReply),
    SendClccResponse(ClccEntry),
    SendVendorResultCode(VendorResultCode),
    SendBsir(bool),

    // Native stack events.
    Stack(StackEvent),

    // Timer expirations. Each carries the peer recorded when the timer was
    // armed; a mismatch means the timer belongs to an earlier session and is
    // dropped.
    ConnectTimeout(BdAddr),
    DialingOutTimeout(BdAddr),
    StartVrTimeout(BdAddr),
    ClccResponseTimeout(BdAddr),
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl Message {
    /// Short name used in log lines.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Connect(_) => "Connect",
            Self::Disconnect(_) => "Disconnect",
            Self::ConnectAudio(_) => "ConnectAudio",
            Self::DisconnectAudio(_) => "DisconnectAudio",
            Self::VoiceRecognitionStart(_) => "VoiceRecognitionStart",
            Self::VoiceRecognitionStop(_) => "VoiceRecognitionStop",
            Self::VirtualCallStart(_) => "VirtualCallStart",
            Self::VirtualCallStop(_) => "VirtualCallStop",
            Self::CallStateChanged { .. } => "CallStateChanged",
            Self::DeviceStateChanged(_) => "DeviceStateChanged",
            Self::ScoVolumeChanged(_) => "ScoVolumeChanged",
            Self::ConnectionAccessReply(_) => "ConnectionAccessReply",
            Self::SendClccResponse(_) => "SendClccResponse",
            Self::SendVendorResultCode(_) => "SendVendorResultCode",
            Self::SendBsir(_) => "SendBsir",
            Self::Stack(_) => "Stack",
            Self::ConnectTimeout(_) => "ConnectTimeout",
            Self::DialingOutTimeout(_) => "DialingOutTimeout",
            Self::StartVrTimeout(_) => "StartVrTimeout",
            Self::ClccResponseTimeout(_) => "ClccResponseTimeout",
        }
    }
}
