//! Agent lifecycle: build the shared services, run every listener and shut
//! everything down on a signal or on the first listener failure

use crate::command::{Catalog, CommandExecutor, CommandService};
use crate::config::AgentConfig;
use crate::error::AgentError;
use crate::security::{PolicyConfig, SecurityPolicy};
use crate::transport::{GrpcListener, HttpListener, Listener, MqttListener, MqttSettings};
use deskctl_shared::state_machine::{AgentEvent, AgentPhase, AgentStateMachine, TransitionResult};
use futures::future::join_all;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

/// Events emitted by listener tasks
#[derive(Debug)]
pub enum LifecycleEvent {
    /// A listener's serve loop returned
    ListenerExited {
        listener: &'static str,
        result: Result<(), AgentError>,
    },
}

/// Owns the shared command service and every enabled listener
pub struct Agent {
    service: Arc<CommandService>,
    listeners: Vec<Arc<dyn Listener>>,
    cleanup_interval: Duration,
    shutdown_timeout: Duration,
    machine: AgentStateMachine,
}

impl Agent {
    /// Load the catalog and construct the enabled listeners.
    ///
    /// Fails when no listener is enabled or the catalog source is malformed.
    pub async fn build(config: AgentConfig) -> Result<Self, AgentError> {
        let mut machine = AgentStateMachine::new();
        match Self::assemble(&config).await {
            Ok((service, listeners)) => Ok(Self {
                service,
                listeners,
                cleanup_interval: config.rate_limit_cleanup_interval(),
                shutdown_timeout: config.shutdown_timeout(),
                machine,
            }),
            Err(e) => {
                machine.process_event(AgentEvent::InitFailed);
                error!("agent initialization failed: {}", e);
                Err(e)
            }
        }
    }

    async fn assemble(
        config: &AgentConfig,
    ) -> Result<(Arc<CommandService>, Vec<Arc<dyn Listener>>), AgentError> {
        if config.enabled_listener_count() == 0 {
            return Err(AgentError::NoListenersEnabled);
        }

        let catalog = Arc::new(Catalog::load(&config.commands_file).await?);
        let catalog_path = catalog.source().to_path_buf();
        let policy = Arc::new(SecurityPolicy::new(PolicyConfig::from(config)));
        let service = Arc::new(CommandService::new(
            catalog,
            policy,
            Arc::new(CommandExecutor::new()),
            config.default_timeout(),
        ));

        let mut listeners: Vec<Arc<dyn Listener>> = Vec::new();
        if config.http_enabled {
            listeners.push(Arc::new(HttpListener::new(&config.http_addr, service.clone())));
        }
        if config.grpc_enabled {
            listeners.push(Arc::new(GrpcListener::new(&config.grpc_addr, service.clone())));
        }
        if config.mqtt_enabled {
            listeners.push(Arc::new(MqttListener::new(
                MqttSettings::from(config),
                service.clone(),
            )));
        }

        info!(
            platform = service.platform(),
            catalog = %catalog_path.display(),
            listeners = listeners.len(),
            "agent initialized"
        );
        Ok((service, listeners))
    }

    /// Assemble an agent from prebuilt parts
    pub fn from_parts(
        service: Arc<CommandService>,
        listeners: Vec<Arc<dyn Listener>>,
        cleanup_interval: Duration,
        shutdown_timeout: Duration,
    ) -> Result<Self, AgentError> {
        if listeners.is_empty() {
            return Err(AgentError::NoListenersEnabled);
        }
        Ok(Self {
            service,
            listeners,
            cleanup_interval,
            shutdown_timeout,
            machine: AgentStateMachine::new(),
        })
    }

    pub fn phase(&self) -> AgentPhase {
        self.machine.state()
    }

    fn transition(&mut self, event: AgentEvent) {
        match self.machine.process_event(event) {
            TransitionResult::Success(phase) => debug!(%phase, "agent phase changed"),
            TransitionResult::Invalid { from, event } => {
                warn!(%from, ?event, "ignored agent event")
            }
        }
    }

    /// Run until `shutdown` resolves or a listener fails, then drain.
    ///
    /// A listener failure wins over a later drain timeout in the returned error.
    pub async fn run<F>(&mut self, shutdown: F) -> Result<(), AgentError>
    where
        F: Future<Output = ()>,
    {
        let (stop_tx, stop_rx) = watch::channel(false);
        let cleanup = self
            .service
            .policy()
            .rate_limiter()
            .start_cleanup(self.cleanup_interval, stop_rx);

        let (event_tx, mut event_rx) = mpsc::channel::<LifecycleEvent>(self.listeners.len());
        let mut handles = Vec::with_capacity(self.listeners.len() + 1);
        for listener in &self.listeners {
            let listener = listener.clone();
            let event_tx = event_tx.clone();
            handles.push(tokio::spawn(async move {
                let result = listener.start().await;
                let _ = event_tx
                    .send(LifecycleEvent::ListenerExited {
                        listener: listener.name(),
                        result,
                    })
                    .await;
            }));
        }
        drop(event_tx);
        handles.push(cleanup);

        self.transition(AgentEvent::ListenersStarted);
        info!(listeners = self.listeners.len(), "agent running");

        tokio::pin!(shutdown);
        let outcome = loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("shutdown signal received");
                    self.transition(AgentEvent::ShutdownRequested);
                    break Ok(());
                }
                event = event_rx.recv() => match event {
                    Some(LifecycleEvent::ListenerExited { listener, result: Err(e) }) => {
                        error!(listener, "listener failed, shutting down: {}", e);
                        self.transition(AgentEvent::ListenerFailed);
                        break Err(e);
                    }
                    Some(LifecycleEvent::ListenerExited { listener, result: Ok(()) }) => {
                        warn!(listener, "listener exited before shutdown");
                    }
                    None => {
                        warn!("all listeners exited, shutting down");
                        self.transition(AgentEvent::ShutdownRequested);
                        break Ok(());
                    }
                }
            }
        };

        let drained = self.drain(handles, stop_tx).await;
        outcome.and(drained)
    }

    async fn drain(
        &mut self,
        handles: Vec<tokio::task::JoinHandle<()>>,
        stop_tx: watch::Sender<bool>,
    ) -> Result<(), AgentError> {
        for listener in &self.listeners {
            listener.stop().await;
        }
        stop_tx.send_replace(true);

        let aborts: Vec<_> = handles.iter().map(|h| h.abort_handle()).collect();
        match timeout(self.shutdown_timeout, join_all(handles)).await {
            Ok(_) => {
                self.transition(AgentEvent::Drained);
                info!("agent stopped");
                Ok(())
            }
            Err(_) => {
                for abort in aborts {
                    abort.abort();
                }
                self.transition(AgentEvent::DrainTimedOut);
                error!(
                    timeout_secs = self.shutdown_timeout.as_secs(),
                    "shutdown timed out, abandoning listeners"
                );
                Err(AgentError::ShutdownTimeout(self.shutdown_timeout))
            }
        }
    }
}
