//! Agent wiring.
//!
//! [`Agent`] builds the resolver, executor, dispatcher and session from a
//! validated [`Config`] and runs the session loop on its own task.

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::{broadcast, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::Config;
use crate::files::{PathResolver, TransferExecutor};
use crate::network::{
    ConnectionState, SessionConfig, SessionEvent, SessionManager, Sleeper, TokioSleeper,
};
use crate::router::CommandDispatcher;

/// Agent lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentState {
    /// Not started, or fully stopped.
    Stopped,
    /// The session loop is running.
    Running,
    /// Exit requested, waiting for the session loop to finish.
    ShuttingDown,
}

/// Events emitted by the agent.
#[derive(Debug, Clone, PartialEq)]
pub enum AgentEvent {
    /// Agent state changed.
    StateChanged(AgentState),
}

/// Cloneable handle that asks a running agent to exit.
#[derive(Debug, Clone)]
pub struct ShutdownHandle {
    token: CancellationToken,
}

impl ShutdownHandle {
    /// Request exit. The session loop stops at its next suspension point.
    pub fn request_exit(&self) {
        self.token.cancel();
    }

    /// Whether exit has been requested.
    pub fn is_exit_requested(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Wait until exit is requested.
    pub async fn exit_requested(&self) {
        self.token.cancelled().await;
    }
}

/// The model agent.
pub struct Agent {
    /// Command channel session.
    session: Arc<SessionManager>,
    /// Current state.
    state: Arc<RwLock<AgentState>>,
    /// Cancellation token for the session loop.
    shutdown_token: CancellationToken,
    /// Session loop task, while running.
    task: Option<JoinHandle<()>>,
    /// Event sender.
    event_tx: broadcast::Sender<AgentEvent>,
}

impl Agent {
    /// Create an agent that waits between reconnects with the tokio timer.
    pub fn new(config: Config) -> Result<Self> {
        Self::with_sleeper(config, Arc::new(TokioSleeper))
    }

    /// Create an agent with a custom reconnect [`Sleeper`].
    pub fn with_sleeper(config: Config, sleeper: Arc<dyn Sleeper>) -> Result<Self> {
        config.validate()?;

        let root = config.ensure_root_dir()?;
        let resolver = PathResolver::new(root)
            .with_context(|| format!("Failed to open root directory: {}", root.display()))?;
        let session_config =
            SessionConfig::from_config(&config).context("Invalid server_url")?;
        let executor = TransferExecutor::new(&session_config.server_url, config.chunk_size)
            .context("Failed to initialize transfer executor")?;
        info!(
            root = %resolver.root().display(),
            http_base = %executor.http_base(),
            "Transfers configured"
        );

        let dispatcher = Arc::new(CommandDispatcher::new(resolver, executor));
        let session = Arc::new(SessionManager::new(session_config, dispatcher, sleeper));

        let (event_tx, _) = broadcast::channel(16);

        Ok(Self {
            session,
            state: Arc::new(RwLock::new(AgentState::Stopped)),
            shutdown_token: CancellationToken::new(),
            task: None,
            event_tx,
        })
    }

    /// Returns the current state.
    pub async fn state(&self) -> AgentState {
        *self.state.read().await
    }

    /// Current command channel state.
    pub fn connection_state(&self) -> ConnectionState {
        self.session.state()
    }

    /// Returns a receiver for agent events.
    pub fn subscribe(&self) -> broadcast::Receiver<AgentEvent> {
        self.event_tx.subscribe()
    }

    /// Returns a receiver for command channel events.
    pub fn session_events(&self) -> broadcast::Receiver<SessionEvent> {
        self.session.subscribe()
    }

    /// Returns a handle that can request exit from another task.
    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            token: self.shutdown_token.clone(),
        }
    }

    /// Spawn the session loop.
    pub async fn start(&mut self) -> Result<()> {
        {
            let mut state = self.state.write().await;
            if *state != AgentState::Stopped {
                anyhow::bail!("Agent is already running");
            }
            if self.shutdown_token.is_cancelled() {
                anyhow::bail!("Agent cannot be restarted after exit was requested");
            }
            *state = AgentState::Running;
        }

        let session = Arc::clone(&self.session);
        let token = self.shutdown_token.clone();
        self.task = Some(tokio::spawn(async move {
            session.run(token).await;
        }));

        self.emit_event(AgentEvent::StateChanged(AgentState::Running));
        let session_config = self.session.config();
        info!(
            client_id = %session_config.client_id,
            server_url = %session_config.server_url,
            "Agent started"
        );
        Ok(())
    }

    /// Request exit and wait for the session loop to finish.
    pub async fn stop(&mut self) -> Result<()> {
        {
            let mut state = self.state.write().await;
            if *state == AgentState::Stopped {
                return Ok(());
            }
            *state = AgentState::ShuttingDown;
        }
        self.emit_event(AgentEvent::StateChanged(AgentState::ShuttingDown));

        info!("Stopping agent...");
        self.shutdown_token.cancel();

        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                warn!("Session task ended abnormally: {}", e);
            }
        }

        {
            let mut state = self.state.write().await;
            *state = AgentState::Stopped;
        }
        self.emit_event(AgentEvent::StateChanged(AgentState::Stopped));

        info!("Agent stopped");
        Ok(())
    }

    fn emit_event(&self, event: AgentEvent) {
        let _ = self.event_tx.send(event);
    }
}
