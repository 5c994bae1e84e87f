pub mod mac;

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use tokio::sync::broadcast;

use crate::protocol::RenderType;
pub use mac::{InvalidMac, MacAddress};

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum NodeError {
    #[error("render time must be greater than zero")]
    ZeroRenderTime,
}

/// Change notification for one logical property. Transient values travel in
/// the notification itself so observers never race the next setter; map-like
/// fields signal dirtiness and are read back through the getters.
#[derive(Debug, Clone, PartialEq)]
pub enum NodeChange {
    Connected(bool),
    ComputerInfo,
    Activity(String),
    ActivityProgress(f64),
    Exception(String),
    LastStatus(String),
    CurrentTask(Option<String>),
    Synced,
    LastFileId(i64),
    AvailableVersions,
    PerformanceScore(f64),
    Prepared(bool),
    SelectedSession(String),
    Log(String),
}

#[derive(Debug, Default)]
struct NodeState {
    connected: bool,
    computer_name: String,
    os: String,
    cores: i32,
    selected_session_id: Option<String>,
    synced: HashMap<String, bool>,
    last_file_id: i64,
    available_versions: HashSet<String>,
    activity: String,
    activity_progress: f64,
    exception: String,
    last_status: String,
    current_task_id: Option<String>,
    is_prepared: bool,
    performance_score_pp: f64,
    log: String,
}

/// Observable record of one render node: identity, capabilities, per-session
/// sync state, and current activity. Setters emit a [`NodeChange`] and are
/// safe to call from the connection's dispatched handlers (plain mutex, no
/// await while held).
pub struct Node {
    name: String,
    address: String,
    render_type: RenderType,
    pass: Option<String>,
    mac: Option<MacAddress>,
    performance: f64,
    state: Mutex<NodeState>,
    changes: broadcast::Sender<NodeChange>,
}

impl Node {
    pub fn new(name: impl Into<String>, address: impl Into<String>) -> Self {
        let (changes, _) = broadcast::channel(256);
        Self {
            name: name.into(),
            address: address.into(),
            render_type: RenderType::Cpu,
            pass: None,
            mac: None,
            performance: 0.0,
            state: Mutex::new(NodeState {
                cores: -1,
                activity_progress: -1.0,
                ..NodeState::default()
            }),
            changes,
        }
    }

    pub fn with_render_type(mut self, render_type: RenderType) -> Self {
        self.render_type = render_type;
        self
    }

    pub fn with_pass(mut self, pass: impl Into<String>) -> Self {
        self.pass = Some(pass.into());
        self
    }

    pub fn with_mac(mut self, mac: MacAddress) -> Self {
        self.mac = Some(mac);
        self
    }

    /// User-provided relative performance; values at or below zero mean
    /// "weigh by core count".
    pub fn with_performance(mut self, performance: f64) -> Self {
        self.performance = performance;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn render_type(&self) -> RenderType {
        self.render_type
    }

    pub fn pass(&self) -> Option<&str> {
        self.pass.as_deref()
    }

    pub fn mac(&self) -> Option<MacAddress> {
        self.mac
    }

    pub fn performance(&self) -> f64 {
        self.performance
    }

    pub fn subscribe(&self) -> broadcast::Receiver<NodeChange> {
        self.changes.subscribe()
    }

    fn emit(&self, change: NodeChange) {
        let _ = self.changes.send(change);
    }

    pub fn connected(&self) -> bool {
        self.state.lock().unwrap().connected
    }

    pub fn set_connected(&self, connected: bool) {
        self.state.lock().unwrap().connected = connected;
        self.emit(NodeChange::Connected(connected));
    }

    /// Applied when the read loop observes the transport drop: connection
    /// caches are invalid until a fresh sync or check verifies them again.
    pub fn on_disconnected(&self) {
        {
            let mut state = self.state.lock().unwrap();
            state.connected = false;
            for flag in state.synced.values_mut() {
                *flag = false;
            }
            state.available_versions.clear();
        }
        self.emit(NodeChange::Connected(false));
        self.emit(NodeChange::Synced);
        self.emit(NodeChange::AvailableVersions);
    }

    pub fn computer_name(&self) -> String {
        self.state.lock().unwrap().computer_name.clone()
    }

    pub fn os(&self) -> String {
        self.state.lock().unwrap().os.clone()
    }

    pub fn cores(&self) -> i32 {
        self.state.lock().unwrap().cores
    }

    pub fn set_computer_info(&self, name: impl Into<String>, os: impl Into<String>, cores: i32) {
        {
            let mut state = self.state.lock().unwrap();
            state.computer_name = name.into();
            state.os = os.into();
            state.cores = cores;
        }
        self.emit(NodeChange::ComputerInfo);
    }

    pub fn activity(&self) -> String {
        self.state.lock().unwrap().activity.clone()
    }

    pub fn is_idle(&self) -> bool {
        self.state.lock().unwrap().activity.is_empty()
    }

    pub fn set_activity(&self, activity: impl Into<String>) {
        let activity = activity.into();
        self.state.lock().unwrap().activity = activity.clone();
        self.emit(NodeChange::Activity(activity));
    }

    pub fn activity_progress(&self) -> f64 {
        self.state.lock().unwrap().activity_progress
    }

    pub fn has_activity_progress(&self) -> bool {
        self.state.lock().unwrap().activity_progress > 0.0
    }

    /// Progress in percent; -1 marks indeterminate.
    pub fn set_activity_progress(&self, progress: f64) {
        self.state.lock().unwrap().activity_progress = progress;
        self.emit(NodeChange::ActivityProgress(progress));
    }

    pub fn exception(&self) -> String {
        self.state.lock().unwrap().exception.clone()
    }

    pub fn set_exception(&self, exception: impl Into<String>) {
        let exception = exception.into();
        self.state.lock().unwrap().exception = exception.clone();
        self.emit(NodeChange::Exception(exception));
    }

    pub fn clear_exception(&self) {
        self.set_exception("");
    }

    pub fn last_status(&self) -> String {
        self.state.lock().unwrap().last_status.clone()
    }

    pub fn set_last_status(&self, status: impl Into<String>) {
        let status = status.into();
        self.state.lock().unwrap().last_status = status.clone();
        self.emit(NodeChange::LastStatus(status));
    }

    pub fn selected_session_id(&self) -> Option<String> {
        self.state.lock().unwrap().selected_session_id.clone()
    }

    pub fn select_session(&self, session_id: impl Into<String>) {
        let session_id = session_id.into();
        self.state.lock().unwrap().selected_session_id = Some(session_id.clone());
        self.emit(NodeChange::SelectedSession(session_id));
    }

    pub fn is_session_synced(&self, session_id: &str) -> bool {
        self.state
            .lock()
            .unwrap()
            .synced
            .get(session_id)
            .copied()
            .unwrap_or(false)
    }

    /// Synced state of the currently selected session.
    pub fn is_synced(&self) -> bool {
        let state = self.state.lock().unwrap();
        match &state.selected_session_id {
            Some(session) => state.synced.get(session).copied().unwrap_or(false),
            None => false,
        }
    }

    pub fn set_session_synced(&self, session_id: &str, synced: bool) {
        self.state
            .lock()
            .unwrap()
            .synced
            .insert(session_id.to_string(), synced);
        self.emit(NodeChange::Synced);
    }

    pub fn last_file_id(&self) -> i64 {
        self.state.lock().unwrap().last_file_id
    }

    /// Only called after the node verified the sync; never optimistic.
    pub fn set_last_file_id(&self, file_id: i64) {
        self.state.lock().unwrap().last_file_id = file_id;
        self.emit(NodeChange::LastFileId(file_id));
    }

    pub fn available_versions(&self) -> HashSet<String> {
        self.state.lock().unwrap().available_versions.clone()
    }

    pub fn add_available_version(&self, version: impl Into<String>) {
        self.state
            .lock()
            .unwrap()
            .available_versions
            .insert(version.into());
        self.emit(NodeChange::AvailableVersions);
    }

    pub fn is_prepared(&self) -> bool {
        self.state.lock().unwrap().is_prepared
    }

    pub fn set_prepared(&self, prepared: bool) {
        self.state.lock().unwrap().is_prepared = prepared;
        self.emit(NodeChange::Prepared(prepared));
    }

    pub fn current_task_id(&self) -> Option<String> {
        self.state.lock().unwrap().current_task_id.clone()
    }

    /// Claims the single in-flight task slot. Returns false when another
    /// render or peek already holds it.
    pub fn try_claim_task(&self, task_id: &str) -> bool {
        let claimed = {
            let mut state = self.state.lock().unwrap();
            if state.current_task_id.is_some() {
                false
            } else {
                state.current_task_id = Some(task_id.to_string());
                true
            }
        };
        if claimed {
            self.emit(NodeChange::CurrentTask(Some(task_id.to_string())));
        }
        claimed
    }

    pub fn release_task(&self) {
        self.state.lock().unwrap().current_task_id = None;
        self.emit(NodeChange::CurrentTask(None));
    }

    pub fn performance_score_pp(&self) -> f64 {
        self.state.lock().unwrap().performance_score_pp
    }

    /// Records pixels-per-millisecond throughput after a completed render.
    pub fn update_performance(&self, pixels: u64, ms: u64) -> Result<f64, NodeError> {
        if ms == 0 {
            return Err(NodeError::ZeroRenderTime);
        }
        let score = pixels as f64 / ms as f64;
        self.state.lock().unwrap().performance_score_pp = score;
        self.emit(NodeChange::PerformanceScore(score));
        Ok(score)
    }

    pub fn append_log(&self, line: &str) {
        {
            let mut state = self.state.lock().unwrap();
            state.log.push_str(line);
            if !line.ends_with('\n') {
                state.log.push('\n');
            }
        }
        self.emit(NodeChange::Log(line.to_string()));
    }

    pub fn log_snapshot(&self) -> String {
        self.state.lock().unwrap().log.clone()
    }
}
