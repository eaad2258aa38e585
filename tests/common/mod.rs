#![allow(dead_code)]

use async_trait::async_trait;
use chrono::Utc;
use serde_json::json;
use shiftsync::{
    Command, CommandType, ConnectivityFlag, EndShiftPayload, EngineDeps, LocationPayload,
    MemoryLocalStore, PushTokenPayload, QueuePolicy, RemoteEnvelope, RemoteTransport,
    SensorBatchPayload, StartShiftPayload, SyncEngine, TransportError, UploadPhotoPayload,
};
use std::collections::{HashMap, HashSet, VecDeque};
use std::path::Path;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

pub type Reply = std::result::Result<RemoteEnvelope, TransportError>;

/// Transport answering from per-command scripts.
///
/// Unscripted calls succeed: `START_SHIFT` returns `srv_<local id>`,
/// everything else a 204.
#[derive(Default)]
pub struct ScriptedTransport {
    scripts: StdMutex<HashMap<CommandType, VecDeque<Reply>>>,
    fallback: StdMutex<HashMap<CommandType, Reply>>,
    calls: StdMutex<Vec<(CommandType, String)>>,
    panicking: StdMutex<HashSet<CommandType>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    delay: Duration,
}

impl ScriptedTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_delay(delay: Duration) -> Self {
        Self {
            delay,
            ..Self::default()
        }
    }

    /// Queues one reply for the next call of `command_type`.
    pub fn script(&self, command_type: CommandType, reply: Reply) {
        self.scripts
            .lock()
            .unwrap()
            .entry(command_type)
            .or_default()
            .push_back(reply);
    }

    /// Reply used for every call once the script for `command_type` is empty.
    pub fn always(&self, command_type: CommandType, reply: Reply) {
        self.fallback.lock().unwrap().insert(command_type, reply);
    }

    /// Every call of `command_type` panics after being recorded.
    pub fn panic_on(&self, command_type: CommandType) {
        self.panicking.lock().unwrap().insert(command_type);
    }

    pub fn calls(&self) -> Vec<(CommandType, String)> {
        self.calls.lock().unwrap().clone()
    }

    pub fn calls_for(&self, command_type: CommandType) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter(|(called, _)| *called == command_type)
            .map(|(_, detail)| detail)
            .collect()
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    async fn respond(&self, command_type: CommandType, detail: String, default: Reply) -> Reply {
        if self.panicking.lock().unwrap().contains(&command_type) {
            self.calls.lock().unwrap().push((command_type, detail));
            panic!("transport blew up on {}", command_type);
        }

        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        self.calls.lock().unwrap().push((command_type, detail));
        let scripted = self
            .scripts
            .lock()
            .unwrap()
            .get_mut(&command_type)
            .and_then(|queue| queue.pop_front());
        let reply = scripted
            .or_else(|| self.fallback.lock().unwrap().get(&command_type).cloned())
            .unwrap_or(default);

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        reply
    }
}

#[async_trait]
impl RemoteTransport for ScriptedTransport {
    async fn start_shift(&self, request: &StartShiftPayload) -> Reply {
        let default = Ok(RemoteEnvelope::ok(
            json!({"id": format!("srv_{}", request.local_shift_id)}),
        ));
        self.respond(CommandType::StartShift, request.local_shift_id.clone(), default)
            .await
    }

    async fn end_shift(&self, server_shift_id: &str, _request: &EndShiftPayload) -> Reply {
        self.respond(
            CommandType::EndShift,
            server_shift_id.to_string(),
            Ok(RemoteEnvelope::no_content()),
        )
        .await
    }

    async fn upload_photo(
        &self,
        _server_shift_id: Option<&str>,
        request: &UploadPhotoPayload,
    ) -> Reply {
        self.respond(
            CommandType::UploadPhoto,
            request.local_photo_id.clone(),
            Ok(RemoteEnvelope::no_content()),
        )
        .await
    }

    async fn upload_sensor_batch(
        &self,
        _server_shift_id: Option<&str>,
        request: &SensorBatchPayload,
    ) -> Reply {
        self.respond(
            CommandType::UploadSensorBatch,
            request.batch_id.clone(),
            Ok(RemoteEnvelope::no_content()),
        )
        .await
    }

    async fn record_location(
        &self,
        _server_shift_id: Option<&str>,
        request: &LocationPayload,
    ) -> Reply {
        self.respond(
            CommandType::RecordLocation,
            request.sample_id.clone(),
            Ok(RemoteEnvelope::no_content()),
        )
        .await
    }

    async fn update_push_token(&self, request: &PushTokenPayload) -> Reply {
        self.respond(
            CommandType::UpdatePushToken,
            request.token.clone(),
            Ok(RemoteEnvelope::no_content()),
        )
        .await
    }
}

pub struct Harness {
    pub engine: SyncEngine,
    pub transport: Arc<ScriptedTransport>,
    pub local: Arc<MemoryLocalStore>,
    pub connectivity: Arc<ConnectivityFlag>,
}

pub fn quiet_policy() -> QueuePolicy {
    QueuePolicy::default().throttle_ms(0)
}

pub async fn open_harness(root: &Path, policy: QueuePolicy, online: bool) -> Harness {
    open_with(
        root,
        policy,
        online,
        Arc::new(ScriptedTransport::new()),
        Arc::new(MemoryLocalStore::new()),
    )
    .await
}

pub async fn open_with(
    root: &Path,
    policy: QueuePolicy,
    online: bool,
    transport: Arc<ScriptedTransport>,
    local: Arc<MemoryLocalStore>,
) -> Harness {
    let connectivity = Arc::new(ConnectivityFlag::new(online));
    let deps = EngineDeps {
        transport: transport.clone(),
        local: local.clone(),
        connectivity: connectivity.clone(),
    };
    let engine = SyncEngine::open(root, policy, deps).await.unwrap();
    Harness {
        engine,
        transport,
        local,
        connectivity,
    }
}

pub fn start_shift(local_shift_id: &str) -> Command {
    Command::StartShift(StartShiftPayload {
        local_shift_id: local_shift_id.to_string(),
        site_id: "site_1".to_string(),
        started_at: Utc::now(),
        latitude: None,
        longitude: None,
    })
}

pub fn end_shift(local_shift_id: &str) -> Command {
    Command::EndShift(EndShiftPayload {
        local_shift_id: local_shift_id.to_string(),
        ended_at: Utc::now(),
        latitude: None,
        longitude: None,
    })
}

pub fn upload_photo(local_photo_id: &str) -> Command {
    Command::UploadPhoto(UploadPhotoPayload {
        local_photo_id: local_photo_id.to_string(),
        local_shift_id: None,
        file_path: format!("/photos/{}.jpg", local_photo_id),
        captured_at: Utc::now(),
        caption: None,
    })
}

pub fn record_location(sample_id: &str) -> Command {
    Command::RecordLocation(LocationPayload {
        sample_id: sample_id.to_string(),
        local_shift_id: None,
        latitude: 52.52,
        longitude: 13.40,
        accuracy_m: Some(5.0),
        recorded_at: Utc::now(),
    })
}

pub fn push_token(token: &str) -> Command {
    Command::UpdatePushToken(PushTokenPayload {
        token: token.to_string(),
        platform: "android".to_string(),
    })
}

pub fn status(code: u16) -> Reply {
    Ok(RemoteEnvelope::new(code, None))
}
