//! Mock collaborators shared by the machine scenario tests and the driver
//! tests. Every mock journals its calls so tests can assert exact call
//! sequences and broadcast ordering.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::device::BdAddr;
use crate::event::{
    AtResponse, AudioState, CallState, CallStatus, ConnectionState, DeviceState, VolumeKind,
};
use crate::interfaces::{
    AccessPermission, ActivityRequest, AdapterInterface, BondState, Broadcast, Collaborators,
    NativeInterface, PhonebookInterface, Service, SystemInterface, WakeLock,
};
use crate::machine::at::AtCommandType;

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum NativeCall {
    ConnectHfp(BdAddr),
    DisconnectHfp(BdAddr),
    ConnectAudio(BdAddr),
    DisconnectAudio(BdAddr),
    SetVolume(BdAddr, VolumeKind, i32),
    AtResponseCode(BdAddr, AtResponse, i32),
    AtResponseString(BdAddr, String),
    CindResponse {
        peer: BdAddr,
        service: i32,
        num_active: u32,
        num_held: u32,
        call_status: CallStatus,
        signal: i32,
        roam: i32,
        battery: i32,
    },
    ClccResponse {
        peer: BdAddr,
        index: i32,
        direction: i32,
        status: i32,
        mode: i32,
        mpty: bool,
        number: String,
        number_type: i32,
    },
    CopsResponse(BdAddr, String),
    PhoneStateChange(BdAddr, CallState),
    StartVoiceRecognition(BdAddr),
    StopVoiceRecognition(BdAddr),
    SendBsir(BdAddr, bool),
    NotifyDeviceStatus(BdAddr, DeviceState),
}

#[derive(Default)]
pub(crate) struct MockNative {
    pub calls: Mutex<Vec<NativeCall>>,
    pub fail_connect_hfp: AtomicBool,
    pub fail_disconnect_hfp: AtomicBool,
    pub fail_connect_audio: AtomicBool,
    pub fail_disconnect_audio: AtomicBool,
    /// Return value of `start_voice_recognition`: whether audio is needed.
    pub vr_needs_audio: AtomicBool,
}

impl MockNative {
    pub fn new() -> Self {
        let native = Self::default();
        native.vr_needs_audio.store(true, Ordering::SeqCst);
        native
    }

    fn record(&self, call: NativeCall) {
        self.calls.lock().unwrap().push(call);
    }

    pub fn calls(&self) -> Vec<NativeCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn take_calls(&self) -> Vec<NativeCall> {
        std::mem::take(&mut self.calls.lock().unwrap())
    }

    pub fn phone_state_changes(&self) -> Vec<CallState> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                NativeCall::PhoneStateChange(_, state) => Some(state),
                _ => None,
            })
            .collect()
    }

    pub fn response_codes(&self) -> Vec<AtResponse> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                NativeCall::AtResponseCode(_, code, _) => Some(code),
                _ => None,
            })
            .collect()
    }
}

impl NativeInterface for MockNative {
    fn connect_hfp(&self, peer: BdAddr) -> bool {
        self.record(NativeCall::ConnectHfp(peer));
        !self.fail_connect_hfp.load(Ordering::SeqCst)
    }

    fn disconnect_hfp(&self, peer: BdAddr) -> bool {
        self.record(NativeCall::DisconnectHfp(peer));
        !self.fail_disconnect_hfp.load(Ordering::SeqCst)
    }

    fn connect_audio(&self, peer: BdAddr) -> bool {
        self.record(NativeCall::ConnectAudio(peer));
        !self.fail_connect_audio.load(Ordering::SeqCst)
    }

    fn disconnect_audio(&self, peer: BdAddr) -> bool {
        self.record(NativeCall::DisconnectAudio(peer));
        !self.fail_disconnect_audio.load(Ordering::SeqCst)
    }

    fn set_volume(&self, peer: BdAddr, kind: VolumeKind, volume: i32) -> bool {
        self.record(NativeCall::SetVolume(peer, kind, volume));
        true
    }

    fn at_response_code(&self, peer: BdAddr, response: AtResponse, error_code: i32) -> bool {
        self.record(NativeCall::AtResponseCode(peer, response, error_code));
        true
    }

    fn at_response_string(&self, peer: BdAddr, response: &str) -> bool {
        self.record(NativeCall::AtResponseString(peer, response.to_owned()));
        true
    }

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
    ) -> bool {
        self.record(NativeCall::CindResponse {
            peer,
            service,
            num_active,
            num_held,
            call_status,
            signal,
            roam,
            battery,
        });
        true
    }

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
    ) -> bool {
        self.record(NativeCall::ClccResponse {
            peer,
            index,
            direction,
            status,
            mode,
            mpty,
            number: number.to_owned(),
            number_type,
        });
        true
    }

    fn cops_response(&self, peer: BdAddr, operator: &str) -> bool {
        self.record(NativeCall::CopsResponse(peer, operator.to_owned()));
        true
    }

    fn phone_state_change(&self, peer: BdAddr, state: &CallState) -> bool {
        self.record(NativeCall::PhoneStateChange(peer, state.clone()));
        true
    }

    fn start_voice_recognition(&self, peer: BdAddr) -> bool {
        self.record(NativeCall::StartVoiceRecognition(peer));
        self.vr_needs_audio.load(Ordering::SeqCst)
    }

    fn stop_voice_recognition(&self, peer: BdAddr) -> bool {
        self.record(NativeCall::StopVoiceRecognition(peer));
        true
    }

    fn send_bsir(&self, peer: BdAddr, in_band_ring: bool) -> bool {
        self.record(NativeCall::SendBsir(peer, in_band_ring));
        true
    }

    fn notify_device_status(&self, peer: BdAddr, state: DeviceState) -> bool {
        self.record(NativeCall::NotifyDeviceStatus(peer, state));
        true
    }
}

#[derive(Default)]
pub(crate) struct MockWakeLock {
    held: AtomicBool,
    pub acquisitions: Mutex<Vec<Duration>>,
}

impl WakeLock for MockWakeLock {
    fn acquire(&self, timeout: Duration) {
        self.acquisitions.lock().unwrap().push(timeout);
        self.held.store(true, Ordering::SeqCst);
    }

    fn release(&self) {
        self.held.store(false, Ordering::SeqCst);
    }

    fn is_held(&self) -> bool {
        self.held.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum SystemCall {
    AnswerCall(BdAddr),
    HangupCall(BdAddr, bool),
    SendDtmf(i32, BdAddr),
    ProcessChld(i32),
    ListCurrentCalls,
    QueryPhoneState,
    ListenForPhoneState(bool),
    SetBluetoothScoOn(bool),
    SetStreamVolume(i32, bool),
    SetAudioParameters(String),
}

/// Mutable telephony snapshot behind the mock system interface. `is_in_call`
/// and `is_ringing` derive from it the way the real telephony adapter
/// derives them.
#[derive(Debug, Clone)]
pub(crate) struct PhoneSnapshot {
    pub num_active: u32,
    pub num_held: u32,
    pub status: CallStatus,
    pub cind_service: i32,
    pub cind_signal: i32,
    pub cind_roam: i32,
    pub cind_battery: i32,
    pub operator: Option<String>,
    pub subscriber: Option<String>,
}

impl Default for PhoneSnapshot {
    fn default() -> Self {
        Self {
            num_active: 0,
            num_held: 0,
            status: CallStatus::Idle,
            cind_service: 1,
            cind_signal: 4,
            cind_roam: 0,
            cind_battery: 5,
            operator: Some("Operator".to_owned()),
            subscriber: Some("+14155550100".to_owned()),
        }
    }
}

pub(crate) struct MockSystem {
    pub snapshot: Mutex<PhoneSnapshot>,
    pub calls: Mutex<Vec<SystemCall>>,
    pub fail_process_chld: AtomicBool,
    pub fail_list_current_calls: AtomicBool,
    pub wake_lock: Arc<MockWakeLock>,
}

impl MockSystem {
    pub fn new() -> Self {
        Self {
            snapshot: Mutex::new(PhoneSnapshot::default()),
            calls: Mutex::new(Vec::new()),
            fail_process_chld: AtomicBool::new(false),
            fail_list_current_calls: AtomicBool::new(false),
            wake_lock: Arc::new(MockWakeLock::default()),
        }
    }

    fn record(&self, call: SystemCall) {
        self.calls.lock().unwrap().push(call);
    }

    pub fn calls(&self) -> Vec<SystemCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn audio_parameters(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                SystemCall::SetAudioParameters(s) => Some(s),
                _ => None,
            })
            .collect()
    }

    pub fn set_incoming_call(&self) {
        let mut snapshot = self.snapshot.lock().unwrap();
        snapshot.status = CallStatus::Incoming;
    }

    pub fn set_active_call(&self) {
        let mut snapshot = self.snapshot.lock().unwrap();
        snapshot.num_active = 1;
        snapshot.status = CallStatus::Idle;
    }
}

impl SystemInterface for MockSystem {
    fn is_in_call(&self) -> bool {
        self.snapshot.lock().unwrap().num_active >= 1
    }

    fn is_ringing(&self) -> bool {
        self.snapshot.lock().unwrap().status == CallStatus::Incoming
    }

    fn num_active_calls(&self) -> u32 {
        self.snapshot.lock().unwrap().num_active
    }

    fn num_held_calls(&self) -> u32 {
        self.snapshot.lock().unwrap().num_held
    }

    fn call_status(&self) -> CallStatus {
        self.snapshot.lock().unwrap().status
    }

    fn set_num_active_calls(&self, n: u32) {
        self.snapshot.lock().unwrap().num_active = n;
    }

    fn set_num_held_calls(&self, n: u32) {
        self.snapshot.lock().unwrap().num_held = n;
    }

    fn set_call_status(&self, status: CallStatus) {
        self.snapshot.lock().unwrap().status = status;
    }

    fn cind_service(&self) -> i32 {
        self.snapshot.lock().unwrap().cind_service
    }

    fn cind_signal(&self) -> i32 {
        self.snapshot.lock().unwrap().cind_signal
    }

    fn cind_roam(&self) -> i32 {
        self.snapshot.lock().unwrap().cind_roam
    }

    fn cind_battery_charge(&self) -> i32 {
        self.snapshot.lock().unwrap().cind_battery
    }

    fn network_operator(&self) -> Option<String> {
        self.snapshot.lock().unwrap().operator.clone()
    }

    fn subscriber_number(&self) -> Option<String> {
        self.snapshot.lock().unwrap().subscriber.clone()
    }

    fn answer_call(&self, peer: BdAddr) {
        self.record(SystemCall::AnswerCall(peer));
    }

    fn hangup_call(&self, peer: BdAddr, virtual_call: bool) {
        self.record(SystemCall::HangupCall(peer, virtual_call));
    }

    fn send_dtmf(&self, code: i32, peer: BdAddr) {
        self.record(SystemCall::SendDtmf(code, peer));
    }

    fn process_chld(&self, chld: i32) -> bool {
        self.record(SystemCall::ProcessChld(chld));
        !self.fail_process_chld.load(Ordering::SeqCst)
    }

    fn list_current_calls(&self) -> bool {
        self.record(SystemCall::ListCurrentCalls);
        !self.fail_list_current_calls.load(Ordering::SeqCst)
    }

    fn query_phone_state(&self) {
        self.record(SystemCall::QueryPhoneState);
    }

    fn listen_for_phone_state(&self, listen: bool) {
        self.record(SystemCall::ListenForPhoneState(listen));
    }

    fn set_bluetooth_sco_on(&self, on: bool) {
        self.record(SystemCall::SetBluetoothScoOn(on));
    }

    fn set_stream_volume(&self, volume: i32, show_ui: bool) {
        self.record(SystemCall::SetStreamVolume(volume, show_ui));
    }

    fn set_audio_parameters(&self, params: &str) {
        self.record(SystemCall::SetAudioParameters(params.to_owned()));
    }

    fn vr_wake_lock(&self) -> Arc<dyn WakeLock> {
        self.wake_lock.clone()
    }
}

/// One connection- or audio-state delta, journalled in emission order so
/// tests can assert audio-before-connection ordering.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Delta {
    Connection(ConnectionState, ConnectionState),
    Audio(AudioState, AudioState),
}

pub(crate) struct MockService {
    pub active_device: Mutex<Option<BdAddr>>,
    pub accept_connections: AtomicBool,
    pub audio_route_allowed: AtomicBool,
    pub inband_ringing: AtomicBool,
    pub force_sco: AtomicBool,
    pub fail_start_activity: AtomicBool,
    pub deltas: Mutex<Vec<Delta>>,
    pub broadcasts: Mutex<Vec<Broadcast>>,
    pub activities: Mutex<Vec<ActivityRequest>>,
    pub removed: Mutex<Vec<BdAddr>>,
}

impl MockService {
    pub fn new() -> Self {
        Self {
            active_device: Mutex::new(None),
            accept_connections: AtomicBool::new(true),
            audio_route_allowed: AtomicBool::new(true),
            inband_ringing: AtomicBool::new(false),
            force_sco: AtomicBool::new(false),
            fail_start_activity: AtomicBool::new(false),
            deltas: Mutex::new(Vec::new()),
            broadcasts: Mutex::new(Vec::new()),
            activities: Mutex::new(Vec::new()),
            removed: Mutex::new(Vec::new()),
        }
    }

    pub fn deltas(&self) -> Vec<Delta> {
        self.deltas.lock().unwrap().clone()
    }

    pub fn take_deltas(&self) -> Vec<Delta> {
        std::mem::take(&mut self.deltas.lock().unwrap())
    }

    pub fn broadcasts(&self) -> Vec<Broadcast> {
        self.broadcasts.lock().unwrap().clone()
    }

    pub fn take_broadcasts(&self) -> Vec<Broadcast> {
        std::mem::take(&mut self.broadcasts.lock().unwrap())
    }

    pub fn activities(&self) -> Vec<ActivityRequest> {
        self.activities.lock().unwrap().clone()
    }
}

impl Service for MockService {
    fn on_connection_state_changed_from_machine(
        &self,
        _peer: BdAddr,
        from: ConnectionState,
        to: ConnectionState,
    ) {
        self.deltas.lock().unwrap().push(Delta::Connection(from, to));
    }

    fn on_audio_state_changed_from_machine(&self, _peer: BdAddr, from: AudioState, to: AudioState) {
        self.deltas.lock().unwrap().push(Delta::Audio(from, to));
    }

    fn active_device(&self) -> Option<BdAddr> {
        *self.active_device.lock().unwrap()
    }

    fn set_active_device(&self, peer: Option<BdAddr>) -> bool {
        *self.active_device.lock().unwrap() = peer;
        true
    }

    fn ok_to_accept_connection(&self, _peer: BdAddr) -> bool {
        self.accept_connections.load(Ordering::SeqCst)
    }

    fn priority(&self, _peer: BdAddr) -> i32 {
        100
    }

    fn audio_route_allowed(&self) -> bool {
        self.audio_route_allowed.load(Ordering::SeqCst)
    }

    fn inband_ringing_enabled(&self) -> bool {
        self.inband_ringing.load(Ordering::SeqCst)
    }

    fn force_sco_audio(&self) -> bool {
        self.force_sco.load(Ordering::SeqCst)
    }

    fn remove_state_machine(&self, peer: BdAddr) {
        self.removed.lock().unwrap().push(peer);
    }

    fn send_broadcast(&self, broadcast: Broadcast) {
        self.broadcasts.lock().unwrap().push(broadcast);
    }

    fn start_activity(&self, request: ActivityRequest) -> bool {
        self.activities.lock().unwrap().push(request);
        !self.fail_start_activity.load(Ordering::SeqCst)
    }
}

pub(crate) struct MockAdapter {
    pub bond_state: Mutex<BondState>,
    pub remote_name: Mutex<Option<String>>,
    pub permissions: Mutex<Vec<(BdAddr, AccessPermission)>>,
}

impl MockAdapter {
    pub fn new() -> Self {
        Self {
            bond_state: Mutex::new(BondState::Bonded),
            remote_name: Mutex::new(Some("Test Headset".to_owned())),
            permissions: Mutex::new(Vec::new()),
        }
    }
}

impl AdapterInterface for MockAdapter {
    fn bond_state(&self, _peer: BdAddr) -> BondState {
        *self.bond_state.lock().unwrap()
    }

    fn remote_name(&self, _peer: BdAddr) -> Option<String> {
        self.remote_name.lock().unwrap().clone()
    }

    fn set_phonebook_access_permission(&self, peer: BdAddr, permission: AccessPermission) {
        self.permissions.lock().unwrap().push((peer, permission));
    }
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum PhonebookCall {
    Cscs(String, AtCommandType),
    Cpbs(String, AtCommandType),
    Cpbr(String, AtCommandType),
    ResetAtState,
    ProcessCpbr(BdAddr),
    SetCpbrIndex(i32),
    SetCheckingAccessPermission(bool),
}

pub(crate) struct MockPhonebook {
    pub calls: Mutex<Vec<PhonebookCall>>,
    pub last_dialed: Mutex<Option<String>>,
    pub checking_access: AtomicBool,
    pub cpbr_result: Mutex<Option<AtResponse>>,
}

impl MockPhonebook {
    pub fn new() -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            last_dialed: Mutex::new(Some("5550100".to_owned())),
            checking_access: AtomicBool::new(false),
            cpbr_result: Mutex::new(Some(AtResponse::Ok)),
        }
    }

    fn record(&self, call: PhonebookCall) {
        self.calls.lock().unwrap().push(call);
    }

    pub fn calls(&self) -> Vec<PhonebookCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn take_calls(&self) -> Vec<PhonebookCall> {
        std::mem::take(&mut self.calls.lock().unwrap())
    }
}

impl PhonebookInterface for MockPhonebook {
    fn handle_cscs_command(&self, args: &str, command_type: AtCommandType, _peer: BdAddr) {
        self.record(PhonebookCall::Cscs(args.to_owned(), command_type));
    }

    fn handle_cpbs_command(&self, args: &str, command_type: AtCommandType, _peer: BdAddr) {
        self.record(PhonebookCall::Cpbs(args.to_owned(), command_type));
    }

    fn handle_cpbr_command(&self, args: &str, command_type: AtCommandType, _peer: BdAddr) {
        self.record(PhonebookCall::Cpbr(args.to_owned(), command_type));
    }

    fn reset_at_state(&self) {
        self.record(PhonebookCall::ResetAtState);
    }

    fn last_dialed_number(&self) -> Option<String> {
        self.last_dialed.lock().unwrap().clone()
    }

    fn checking_access_permission(&self) -> bool {
        self.checking_access.load(Ordering::SeqCst)
    }

    fn set_checking_access_permission(&self, checking: bool) {
        self.record(PhonebookCall::SetCheckingAccessPermission(checking));
        self.checking_access.store(checking, Ordering::SeqCst);
    }

    fn set_cpbr_index(&self, index: i32) {
        self.record(PhonebookCall::SetCpbrIndex(index));
    }

    fn process_cpbr_command(&self, peer: BdAddr) -> Option<AtResponse> {
        self.record(PhonebookCall::ProcessCpbr(peer));
        *self.cpbr_result.lock().unwrap()
    }
}

/// The full set of mocks a machine is wired to in tests.
pub(crate) struct Fixture {
    pub native: Arc<MockNative>,
    pub system: Arc<MockSystem>,
    pub service: Arc<MockService>,
    pub adapter: Arc<MockAdapter>,
    pub phonebook: Arc<MockPhonebook>,
}

impl Fixture {
    pub fn new() -> Self {
        Self {
            native: Arc::new(MockNative::new()),
            system: Arc::new(MockSystem::new()),
            service: Arc::new(MockService::new()),
            adapter: Arc::new(MockAdapter::new()),
            phonebook: Arc::new(MockPhonebook::new()),
        }
    }

    pub fn collaborators(&self) -> Collaborators {
        Collaborators {
            native: self.native.clone(),
            system: self.system.clone(),
            service: self.service.clone(),
            adapter: self.adapter.clone(),
            phonebook: self.phonebook.clone(),
        }
    }
}
