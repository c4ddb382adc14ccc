//! Collaborator interfaces consumed by the peer state machine.
//!
//! The machine never talks to the wider system directly; everything it needs
//! is reached through the trait objects collected in [`Collaborators`]:
//! the native HFP stack, the telephony/audio subsystem, the multi-device
//! service, the adapter (bonding and device names) and the phonebook helper.
//! All of them must tolerate invocation from the machine's executor while
//! other machines call them concurrently.

use std::sync::Arc;
use std::time::Duration;

use crate::device::BdAddr;
use crate::event::{
    AtResponse, AudioState, CallState, CallStatus, ConnectionState, DeviceState, VolumeKind,
};
use crate::machine::at::{AtArg, AtCommandType, CompanyId};

/// Outbound surface of the native HFP stack.
///
/// Calls report success as `bool`; a `false` return means the stack rejected
/// the request and the machine stays in its current state.
pub trait NativeInterface: Send + Sync {
    fn connect_hfp(&self, peer: BdAddr) -> bool;
    fn disconnect_hfp(&self, peer: BdAddr) -> bool;
    fn connect_audio(&self, peer: BdAddr) -> bool;
    fn disconnect_audio(&self, peer: BdAddr) -> bool;
    fn set_volume(&self, peer: BdAddr, kind: VolumeKind, volume: i32) -> bool;
    fn at_response_code(&self, peer: BdAddr, response: AtResponse, error_code: i32) -> bool;
    fn at_response_string(&self, peer: BdAddr, response: &str) -> bool;
    #[allow(clippy::too_many_arguments)]
    fn cind_response(
        &self,
        peer: BdAddr,
        service: i32,
        num_active: u32,
        num_held: u32,
        call_status: CallStatus,
        signal: i32,
        roam: i32,
        battery: i32,
    ) -> bool;
    #[allow(clippy::too_many_arguments)]
    fn clcc_response(
        &self,
        peer: BdAddr,
        index: i32,
        direction: i32,
        status: i32,
        mode: i32,
        mpty: bool,
        number: &str,
        number_type: i32,
    ) -> bool;
    fn cops_response(&self, peer: BdAddr, operator: &str) -> bool;
    fn phone_state_change(&self, peer: BdAddr, state: &CallState) -> bool;
    fn start_voice_recognition(&self, peer: BdAddr) -> bool;
    fn stop_voice_recognition(&self, peer: BdAddr) -> bool;
    fn send_bsir(&self, peer: BdAddr, in_band_ring: bool) -> bool;
    fn notify_device_status(&self, peer: BdAddr, state: DeviceState) -> bool;
}

/// A wake lock scoped to the voice-recognition start window.
pub trait WakeLock: Send + Sync {
    /// Acquire the lock, auto-releasing after `timeout`.
    fn acquire(&self, timeout: Duration);
    fn release(&self);
    fn is_held(&self) -> bool;
}

/// Telephony and audio-routing surface.
///
/// The call-state getters form the snapshot CIND answers are computed from;
/// the setters exist because call-state updates flow through the machine and
/// are written back here before being forwarded to the stack.
pub trait SystemInterface: Send + Sync {
    // Telephony snapshot.
    fn is_in_call(&self) -> bool;
    fn is_ringing(&self) -> bool;
    fn num_active_calls(&self) -> u32;
    fn num_held_calls(&self) -> u32;
    fn call_status(&self) -> CallStatus;
    fn set_num_active_calls(&self, n: u32);
    fn set_num_held_calls(&self, n: u32);
    fn set_call_status(&self, status: CallStatus);
    fn cind_service(&self) -> i32;
    fn cind_signal(&self) -> i32;
    fn cind_roam(&self) -> i32;
    fn cind_battery_charge(&self) -> i32;
    fn network_operator(&self) -> Option<String>;
    fn subscriber_number(&self) -> Option<String>;

    // Telephony actions.
    fn answer_call(&self, peer: BdAddr);
    fn hangup_call(&self, peer: BdAddr, virtual_call: bool);
    fn send_dtmf(&self, code: i32, peer: BdAddr);
    fn process_chld(&self, chld: i32) -> bool;
    /// Ask telephony to stream the current-call list; each entry arrives as a
    /// `SendClccResponse` message. Returns false if the query could not start.
    fn list_current_calls(&self) -> bool;
    fn query_phone_state(&self);
    fn listen_for_phone_state(&self, listen: bool);

    // Audio routing.
    fn set_bluetooth_sco_on(&self, on: bool);
    fn set_stream_volume(&self, volume: i32, show_ui: bool);
    /// Push `key=value;...` parameters to the audio subsystem.
    fn set_audio_parameters(&self, params: &str);

    fn vr_wake_lock(&self) -> Arc<dyn WakeLock>;
}

/// Typed replacement for the system-level broadcasts the machine emits.
#[derive(Debug, Clone, PartialEq)]
pub enum Broadcast {
    ConnectionStateChanged {
        peer: BdAddr,
        from: ConnectionState,
        to: ConnectionState,
    },
    AudioStateChanged {
        peer: BdAddr,
        from: AudioState,
        to: AudioState,
    },
    VendorSpecificEvent {
        peer: BdAddr,
        command: String,
        company_id: CompanyId,
        command_type: AtCommandType,
        args: Vec<AtArg>,
    },
    HfIndicatorValueChanged {
        peer: BdAddr,
        ind_id: i32,
        /// `-1` means the indicator is supported but no value was reported.
        ind_value: i32,
    },
}

/// An activity the machine asks the system to launch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActivityRequest {
    /// Bring up the platform voice-command UI.
    VoiceCommand,
    /// Place an outgoing call to `number`.
    DialCall { number: String },
}

/// Surface of the multi-device service that owns this machine.
pub trait Service: Send + Sync {
    fn on_connection_state_changed_from_machine(
        &self,
        peer: BdAddr,
        from: ConnectionState,
        to: ConnectionState,
    );
    fn on_audio_state_changed_from_machine(&self, peer: BdAddr, from: AudioState, to: AudioState);
    fn active_device(&self) -> Option<BdAddr>;
    fn set_active_device(&self, peer: Option<BdAddr>) -> bool;
    fn ok_to_accept_connection(&self, peer: BdAddr) -> bool;
    fn priority(&self, peer: BdAddr) -> i32;
    fn audio_route_allowed(&self) -> bool;
    fn inband_ringing_enabled(&self) -> bool;
    fn force_sco_audio(&self) -> bool;
    /// Tear this machine down; invoked when the machine lands in
    /// `Disconnected` and the peer is no longer bonded.
    fn remove_state_machine(&self, peer: BdAddr);
    fn send_broadcast(&self, broadcast: Broadcast);
    /// Returns false when the activity could not be dispatched.
    fn start_activity(&self, request: ActivityRequest) -> bool;
}

/// Bond state of a remote device as tracked by the adapter.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum BondState {
    None,
    Bonding,
    Bonded,
}

/// Phonebook access permission persisted per device.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum AccessPermission {
    Allowed,
    Rejected,
}

/// Adapter-level device registry: bonding and remote names.
pub trait AdapterInterface: Send + Sync {
    fn bond_state(&self, peer: BdAddr) -> BondState;
    fn remote_name(&self, peer: BdAddr) -> Option<String>;
    fn set_phonebook_access_permission(&self, peer: BdAddr, permission: AccessPermission);
}

/// The phonebook helper owning the `AT+CSCS`/`AT+CPBS`/`AT+CPBR` dialog state.
pub trait PhonebookInterface: Send + Sync {
    fn handle_cscs_command(&self, args: &str, command_type: AtCommandType, peer: BdAddr);
    fn handle_cpbs_command(&self, args: &str, command_type: AtCommandType, peer: BdAddr);
    fn handle_cpbr_command(&self, args: &str, command_type: AtCommandType, peer: BdAddr);
    /// Drop any in-flight phonebook dialog state.
    fn reset_at_state(&self);
    fn last_dialed_number(&self) -> Option<String>;
    /// True while a CPBR read is parked on a user permission decision.
    fn checking_access_permission(&self) -> bool;
    fn set_checking_access_permission(&self, checking: bool);
    fn set_cpbr_index(&self, index: i32);
    /// Resume the parked CPBR read; `None` means no response code should be
    /// sent to the peer.
    fn process_cpbr_command(&self, peer: BdAddr) -> Option<AtResponse>;
}

/// The set of collaborators a machine is constructed with.
#[derive(Clone)]
pub struct Collaborators {
    pub native: Arc<dyn NativeInterface>,
    pub system: Arc<dyn SystemInterface>,
    pub service: Arc<dyn Service>,
    pub adapter: Arc<dyn AdapterInterface>,
    pub phonebook: Arc<dyn PhonebookInterface>,
}
