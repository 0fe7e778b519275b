#[cfg(test)]
mod agent_test;
#[cfg(test)]
mod agent_transport_test;

pub mod agent_config;
pub mod agent_gather;
pub(crate) mod agent_internal;
pub mod agent_selector;
pub mod agent_turn;

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};

use agent_config::*;
use agent_internal::*;

use crate::candidate::*;
use crate::description::*;
use crate::error::*;
use crate::state::*;

pub type OnConnectionStateChangeHdlrFn = Box<
    dyn (FnMut(ConnectionState) -> Pin<Box<dyn Future<Output = ()> + Send + 'static>>)
        + Send
        + Sync,
>;
pub type OnCandidateHdlrFn = Box<
    dyn (FnMut(Option<Candidate>) -> Pin<Box<dyn Future<Output = ()> + Send + 'static>>)
        + Send
        + Sync,
>;
pub type OnDataHdlrFn =
    Box<dyn (FnMut(Vec<u8>) -> Pin<Box<dyn Future<Output = ()> + Send + 'static>>) + Send + Sync>;

/// Represents the ICE agent.
pub struct Agent {
    pub(crate) internal: Arc<AgentInternal>,
}

impl Agent {
    /// Creates a new Agent.
    pub async fn new(config: AgentConfig) -> Result<Self> {
        config.validate()?;

        let (internal, events_rx) = AgentInternal::new(config);
        let internal = Arc::new(internal);
        internal.start_event_loop(events_rx);

        Ok(Self { internal })
    }

    /// Sets a handler that is fired when the connection state changes.
    pub fn on_connection_state_change(&self, f: OnConnectionStateChangeHdlrFn) {
        self.internal
            .on_connection_state_change_hdlr
            .store(Some(Arc::new(Mutex::new(f))));
    }

    /// Sets a handler that is fired for every gathered candidate. Gathering
    /// is done once the handler fires with `None`. Peer-reflexive candidates
    /// are never reported.
    pub fn on_candidate(&self, f: OnCandidateHdlrFn) {
        self.internal
            .on_candidate_hdlr
            .store(Some(Arc::new(Mutex::new(f))));
    }

    /// Sets a handler that is fired for every application datagram received
    /// from the selected pair.
    pub fn on_data(&self, f: OnDataHdlrFn) {
        self.internal.on_data_hdlr.store(Some(Arc::new(Mutex::new(f))));
    }

    /// Opens the UDP socket, gathers host candidates and starts the worker
    /// driving the session. A no-op once gathering has started.
    pub async fn gather_candidates(&self) -> Result<()> {
        self.internal.gather_candidates().await
    }

    /// Snapshots the local description. Assumes the controlling role if no
    /// role was decided yet.
    pub async fn get_local_description(&self) -> LocalDescription {
        let mut state = self.internal.state.lock().await;
        if state.mode == crate::attributes::Role::Unspecified {
            log::debug!("assuming controlling mode");
            state.mode = crate::attributes::Role::Controlling;
        }
        let mut local = state.local.clone();
        local.finished = state.gathering_done;
        local
    }

    /// Applies the remote description: credentials, candidates and the
    /// end-of-candidates flag. Unfreezes every already known pair. Assumes
    /// the controlled role if no role was decided yet.
    pub async fn set_remote_description(&self, sdp: &str) -> Result<()> {
        self.internal.set_remote_description(sdp).await
    }

    /// Adds one remote `a=candidate:` line.
    pub async fn add_remote_candidate(&self, line: &str) -> Result<()> {
        self.internal.add_remote_candidate(line).await
    }

    /// Marks the remote candidate list as complete, shortening the fail
    /// deadline to zero.
    pub async fn set_remote_gathering_done(&self) {
        {
            let mut state = self.internal.state.lock().await;
            state.remote.finished = true;
            // Recomputed by the next bookkeeping pass.
            state.fail_at = None;
        }
        self.internal.interrupt();
    }

    /// Sends an application datagram over the selected pair.
    pub async fn send(&self, data: &[u8]) -> Result<()> {
        self.internal.send(data, None).await
    }

    /// Sends an application datagram, setting the Differentiated Services
    /// field first.
    pub async fn send_diffserv(&self, data: &[u8], ds: u32) -> Result<()> {
        self.internal.send(data, Some(ds)).await
    }

    /// Returns the current connection state.
    pub fn get_state(&self) -> ConnectionState {
        ConnectionState::from(self.internal.connection_state.load(Ordering::SeqCst))
    }

    /// Snapshots the selected pair as (local, remote) candidates.
    pub async fn get_selected_candidate_pair(&self) -> Option<(Candidate, Candidate)> {
        let state = self.internal.state.lock().await;
        let pair = &state.pairs[state.selected_pair?];

        let local = match pair.local {
            Some(id) => state.local.candidate(id).clone(),
            // Undifferentiated local side: fall back to the first local
            // candidate.
            None => state.local.candidates.first()?.clone(),
        };
        let remote = state.remote.candidate(pair.remote).clone();
        Some((local, remote))
    }

    /// Stops the worker and closes the agent.
    pub async fn close(&self) -> Result<()> {
        self.internal.close().await
    }
}

impl AgentInternal {
    pub(crate) fn start_event_loop(self: &Arc<Self>, mut events_rx: mpsc::Receiver<AgentEvent>) {
        let internal = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(event) = events_rx.recv().await {
                match event {
                    AgentEvent::StateChange(state) => {
                        if let Some(handler) = &*internal.on_connection_state_change_hdlr.load() {
                            let mut f = handler.lock().await;
                            f(state).await;
                        }
                    }
                    AgentEvent::Candidate(candidate) => {
                        if let Some(handler) = &*internal.on_candidate_hdlr.load() {
                            let mut f = handler.lock().await;
                            f(Some(candidate)).await;
                        }
                    }
                    AgentEvent::GatheringDone => {
                        if let Some(handler) = &*internal.on_candidate_hdlr.load() {
                            let mut f = handler.lock().await;
                            f(None).await;
                        }
                    }
                    AgentEvent::Data(data) => {
                        if let Some(handler) = &*internal.on_data_hdlr.load() {
                            let mut f = handler.lock().await;
                            f(data).await;
                        }
                    }
                }
            }
        });
    }
}
