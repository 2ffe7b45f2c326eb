// =============================================================================
// Matrixon Appservice - Test Utils Module
// =============================================================================
//
// Project: Matrixon - Ultra High Performance Matrix NextServer (Synapse Alternative)
// Author: arkSong (arksong2018@gmail.com) - Founder of Matrixon Innovation Project
// Date: 2024-12-11
// Version: 0.11.0-alpha
// License: Apache 2.0 / MIT
//
// Description:
//   In-memory homeserver, client factory and handler doubles shared by the
//   unit tests. Every clone of a FakeHomeserver sees the same state, so a
//   test keeps one handle for assertions while the code under test talks
//   to others.
//
// =============================================================================

#![cfg(any(test, feature = "testing"))]

use std::{
    collections::{BTreeMap, HashMap, VecDeque},
    sync::{Arc, Mutex},
    time::Duration,
};

use async_trait::async_trait;
use ruma::{DeviceId, EventId, OwnedDeviceId, OwnedEventId, OwnedRoomId, RoomId, UserId};
use serde_json::{json, Value};

use crate::{
    api::{ClientFactory, ClientIdentity, HomeserverApi, LoginResponse, SyncRequest, WhoAmI},
    errcode,
    events::{LifecycleEvent, LifecycleKind, RawEvent, SyncSnapshot},
    service::{dispatcher::EventHandler, sync::StopHandle},
    Error, MatrixError, Result,
};

/// Device ID handed out by fresh logins.
pub const LOGIN_DEVICE_ID: &str = "LOGINDEVICE";

struct FakeState {
    snapshots: VecDeque<Result<SyncSnapshot>>,
    sync_requests: Vec<SyncRequest>,
    stop_when_drained: Option<StopHandle>,
    joined_rooms: Vec<OwnedRoomId>,
    joined_rooms_calls: usize,
    join_calls: Vec<String>,
    join_error: Option<MatrixError>,
    registration_error: Option<MatrixError>,
    registered_localparts: Vec<String>,
    login_calls: usize,
    login_failures: usize,
    login_error: Option<MatrixError>,
    login_delay: Option<Duration>,
    sent_events: Vec<(OwnedRoomId, String, Value)>,
    room_states: HashMap<OwnedRoomId, Vec<RawEvent>>,
    devices: Vec<OwnedDeviceId>,
    device_keys: BTreeMap<OwnedDeviceId, Value>,
    device_impersonation: bool,
}

impl Default for FakeState {
    fn default() -> Self {
        Self {
            snapshots: VecDeque::new(),
            sync_requests: Vec::new(),
            stop_when_drained: None,
            joined_rooms: Vec::new(),
            joined_rooms_calls: 0,
            join_calls: Vec::new(),
            join_error: None,
            registration_error: None,
            registered_localparts: Vec::new(),
            login_calls: 0,
            login_failures: 0,
            login_error: None,
            login_delay: None,
            sent_events: Vec::new(),
            room_states: HashMap::new(),
            devices: Vec::new(),
            device_keys: BTreeMap::new(),
            device_impersonation: true,
        }
    }
}

/// Scripted homeserver. Clones share state.
#[derive(Clone, Default)]
pub struct FakeHomeserver {
    state: Arc<Mutex<FakeState>>,
    identity: Option<ClientIdentity>,
}

impl FakeHomeserver {
    pub fn new() -> Self {
        Self::default()
    }

    /// A handle on the same state that answers as `identity`.
    pub fn with_identity(&self, identity: ClientIdentity) -> Self {
        Self {
            state: Arc::clone(&self.state),
            identity: Some(identity),
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, FakeState> {
        self.state.lock().unwrap()
    }

    pub fn push_snapshot(&self, snapshot: Result<SyncSnapshot>) {
        self.state().snapshots.push_back(snapshot);
    }

    /// Stops `handle` once the queued snapshots run out.
    pub fn stop_when_drained(&self, handle: StopHandle) {
        self.state().stop_when_drained = Some(handle);
    }

    pub fn sync_requests(&self) -> Vec<SyncRequest> {
        self.state().sync_requests.clone()
    }

    pub fn set_joined_rooms(&self, rooms: impl IntoIterator<Item = OwnedRoomId>) {
        self.state().joined_rooms = rooms.into_iter().collect();
    }

    pub fn joined_rooms_calls(&self) -> usize {
        self.state().joined_rooms_calls
    }

    pub fn join_calls(&self) -> Vec<String> {
        self.state().join_calls.clone()
    }

    pub fn fail_joins(&self, error: MatrixError) {
        self.state().join_error = Some(error);
    }

    pub fn fail_registration(&self, error: MatrixError) {
        self.state().registration_error = Some(error);
    }

    /// Localparts of every registration attempt, failed ones included.
    pub fn registered_localparts(&self) -> Vec<String> {
        self.state().registered_localparts.clone()
    }

    pub fn login_calls(&self) -> usize {
        self.state().login_calls
    }

    /// Fails the next `count` logins with `error`.
    pub fn fail_logins(&self, count: usize, error: MatrixError) {
        let mut state = self.state();
        state.login_failures = count;
        state.login_error = Some(error);
    }

    pub fn set_login_delay(&self, delay: Duration) {
        self.state().login_delay = Some(delay);
    }

    pub fn sent_events(&self) -> Vec<(OwnedRoomId, String, Value)> {
        self.state().sent_events.clone()
    }

    pub fn set_room_state(&self, room_id: &RoomId, events: Vec<Value>) {
        self.state().room_states.insert(
            room_id.to_owned(),
            events.into_iter().map(RawEvent::new).collect(),
        );
    }

    pub fn set_devices(&self, devices: impl IntoIterator<Item = OwnedDeviceId>) {
        self.state().devices = devices.into_iter().collect();
    }

    pub fn set_device_keys(&self, device_id: &DeviceId, keys: Value) {
        self.state().device_keys.insert(device_id.to_owned(), keys);
    }

    /// Whether `whoami` honours an impersonated device ID.
    pub fn set_device_impersonation(&self, supported: bool) {
        self.state().device_impersonation = supported;
    }

    fn user_id(&self) -> Result<&UserId> {
        self.identity
            .as_ref()
            .map(|identity| &*identity.user_id)
            .ok_or_else(|| Error::InvalidState("fake client has no identity".to_owned()))
    }
}

#[async_trait]
impl HomeserverApi for FakeHomeserver {
    async fn whoami(&self) -> Result<WhoAmI> {
        let user_id = self.user_id()?.to_owned();
        let impersonation = self.state().device_impersonation;
        let identity = self.identity.as_ref();

        let device_id = match identity {
            Some(ClientIdentity {
                access_token: Some(_),
                ..
            }) => Some(OwnedDeviceId::from(LOGIN_DEVICE_ID)),
            Some(ClientIdentity {
                device_id: Some(device_id),
                ..
            }) if impersonation => Some(device_id.clone()),
            _ => None,
        };
        Ok(WhoAmI { user_id, device_id })
    }

    async fn sync(&self, request: &SyncRequest) -> Result<SyncSnapshot> {
        let mut state = self.state();
        state.sync_requests.push(request.clone());

        match state.snapshots.pop_front() {
            Some(snapshot) => snapshot,
            None => match &state.stop_when_drained {
                Some(handle) => {
                    handle.stop();
                    Ok(SyncSnapshot::default())
                }
                None => Err(Error::Transport("no queued sync response".to_owned())),
            },
        }
    }

    async fn register_appservice_user(&self, localpart: &str) -> Result<()> {
        let mut state = self.state();
        state.registered_localparts.push(localpart.to_owned());
        match &state.registration_error {
            Some(error) => Err(error.clone().into()),
            None => Ok(()),
        }
    }

    async fn login_appservice(&self, user_id: &UserId) -> Result<LoginResponse> {
        let delay = {
            let mut state = self.state();
            state.login_calls += 1;
            state.login_delay
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.state();
        if state.login_failures > 0 {
            state.login_failures -= 1;
            if let Some(error) = &state.login_error {
                return Err(error.clone().into());
            }
        }
        Ok(LoginResponse {
            access_token: format!("syt_{}_{}", user_id.localpart(), state.login_calls),
            device_id: Some(OwnedDeviceId::from(LOGIN_DEVICE_ID)),
        })
    }

    async fn joined_rooms(&self) -> Result<Vec<OwnedRoomId>> {
        let mut state = self.state();
        state.joined_rooms_calls += 1;
        Ok(state.joined_rooms.clone())
    }

    async fn join_room(&self, room_id_or_alias: &str) -> Result<OwnedRoomId> {
        let mut state = self.state();
        state.join_calls.push(room_id_or_alias.to_owned());
        if let Some(error) = &state.join_error {
            return Err(error.clone().into());
        }

        let room_id = RoomId::parse(room_id_or_alias)?;
        if !state.joined_rooms.contains(&room_id) {
            state.joined_rooms.push(room_id.clone());
        }
        Ok(room_id)
    }

    async fn leave_room(&self, room_id: &RoomId) -> Result<()> {
        self.state()
            .joined_rooms
            .retain(|joined| joined.as_str() != room_id.as_str());
        Ok(())
    }

    async fn send_event(
        &self,
        room_id: &RoomId,
        event_type: &str,
        content: Value,
    ) -> Result<OwnedEventId> {
        let mut state = self.state();
        state
            .sent_events
            .push((room_id.to_owned(), event_type.to_owned(), content));
        Ok(EventId::parse(format!("$sent{}", state.sent_events.len()))?)
    }

    async fn room_state(&self, room_id: &RoomId) -> Result<Vec<RawEvent>> {
        self.state().room_states.get(room_id).cloned().ok_or_else(|| {
            MatrixError::new(404, errcode::NOT_FOUND, "Room not found").into()
        })
    }

    async fn own_devices(&self) -> Result<Vec<OwnedDeviceId>> {
        Ok(self.state().devices.clone())
    }

    async fn query_device_keys(&self, _user_id: &UserId) -> Result<BTreeMap<OwnedDeviceId, Value>> {
        Ok(self.state().device_keys.clone())
    }
}

/// Hands out [`FakeHomeserver`] handles bound to the requested identity.
pub struct FakeFactory {
    server: FakeHomeserver,
    identities: Mutex<Vec<ClientIdentity>>,
}

impl FakeFactory {
    pub fn new(server: FakeHomeserver) -> Self {
        Self {
            server,
            identities: Mutex::new(Vec::new()),
        }
    }

    /// Every identity a client was created for, in order.
    pub fn identities(&self) -> Vec<ClientIdentity> {
        self.identities.lock().unwrap().clone()
    }
}

impl ClientFactory for FakeFactory {
    fn create_client(&self, identity: ClientIdentity) -> Arc<dyn HomeserverApi> {
        self.identities.lock().unwrap().push(identity.clone());
        Arc::new(self.server.with_identity(identity))
    }
}

/// Records every dispatched event.
#[derive(Default)]
pub struct RecordingHandler {
    events: Mutex<Vec<LifecycleEvent>>,
}

impl RecordingHandler {
    pub fn events(&self) -> Vec<LifecycleEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn kinds(&self) -> Vec<LifecycleKind> {
        self.events().iter().map(LifecycleEvent::kind).collect()
    }

    pub fn of_kind(&self, kind: LifecycleKind) -> Vec<LifecycleEvent> {
        self.events()
            .into_iter()
            .filter(|event| event.kind() == kind)
            .collect()
    }

    pub fn count(&self, kind: LifecycleKind) -> usize {
        self.of_kind(kind).len()
    }
}

#[async_trait]
impl EventHandler for RecordingHandler {
    async fn handle(&self, event: &LifecycleEvent) -> Result<()> {
        self.events.lock().unwrap().push(event.clone());
        Ok(())
    }
}

/// An `m.room.member` event for `user_id`.
pub fn member_event(user_id: &str, membership: &str, age: Option<u64>, event_id: &str) -> Value {
    let mut event = json!({
        "type": "m.room.member",
        "state_key": user_id,
        "sender": user_id,
        "event_id": event_id,
        "content": {"membership": membership},
    });
    if let Some(age) = age {
        event["unsigned"] = json!({"age": age});
    }
    event
}
