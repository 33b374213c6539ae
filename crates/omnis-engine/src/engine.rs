//! Built-in handlers for the fixed command set.
//!
//! Job orchestration lives outside this crate; it plugs in through the
//! [`JobBackend`] trait and reports progress through an [`EventSink`]. The
//! [`Engine`] itself only tracks coarse status (ready, installing), serves
//! the read-only queries from configuration, and guards the installation
//! state transitions.

use crate::config::EngineConfig;
use crate::dispatch::{Dispatcher, HandlerError};
use crate::security::SecurityValidator;
use omnis_core::command::{Command, ErrorCode, EventKind};
use serde_json::{Value, json};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Where job backends push broadcast events (job progress, errors).
pub type EventSink = Arc<dyn Fn(EventKind, Value) + Send + Sync>;

/// An [`EventSink`] that discards everything; for tests and dry wiring.
pub fn null_event_sink() -> EventSink {
    Arc::new(|_, _| {})
}

/// The seam where the job-orchestration layer plugs in.
///
/// Implementations run their pipeline on their own tasks and emit
/// `JOB_STARTED` / `JOB_PROGRESS` / `JOB_COMPLETED` / `ERROR_OCCURRED` /
/// `INSTALLATION_COMPLETE` through the sink they were handed.
pub trait JobBackend: Send + Sync {
    /// Begin an installation toward the already-validated target path.
    fn start_installation(
        &self,
        target: PathBuf,
        args: Value,
        events: EventSink,
    ) -> Result<Value, HandlerError>;

    /// Cancel the running installation.
    fn cancel_installation(&self) -> Result<Value, HandlerError>;

    /// Check a configuration payload for plausibility.
    fn validate_config(&self, config: &Value) -> Result<Value, HandlerError> {
        let _ = config;
        Ok(json!({ "valid": true }))
    }
}

#[derive(Debug)]
struct Status {
    ready: bool,
    installing: bool,
}

impl Status {
    fn state_name(&self) -> &'static str {
        if self.installing {
            "installing"
        } else if self.ready {
            "idle"
        } else {
            "starting"
        }
    }
}

/// Engine facade: status tracking plus the handlers for every command.
pub struct Engine {
    status: Arc<Mutex<Status>>,
    branding: HashMap<String, String>,
    job_names: Vec<String>,
    backend: Option<Arc<dyn JobBackend>>,
    validator: Arc<SecurityValidator>,
    events: EventSink,
    shutdown: CancellationToken,
}

impl Engine {
    pub fn new(config: &EngineConfig, validator: Arc<SecurityValidator>, events: EventSink) -> Self {
        Self {
            status: Arc::new(Mutex::new(Status {
                ready: true,
                installing: false,
            })),
            branding: config.branding.clone(),
            job_names: config.job_names.clone(),
            backend: None,
            validator,
            events,
            shutdown: CancellationToken::new(),
        }
    }

    /// Attach the job backend. Without one, START_INSTALLATION and
    /// CANCEL_INSTALLATION report `ENGINE_NOT_READY`.
    pub fn with_backend(mut self, backend: Arc<dyn JobBackend>) -> Self {
        self.backend = Some(backend);
        self
    }

    /// Replace the event sink. Useful when the sink's source (the server)
    /// can only be built after the engine.
    pub fn with_event_sink(mut self, events: EventSink) -> Self {
        self.events = events;
        self
    }

    /// Token cancelled when a SHUTDOWN command is accepted; the binary
    /// watches it to stop the server.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Mark the running installation as finished; used by backends when
    /// their pipeline completes or is cancelled out of band.
    pub fn finish_installation(&self) {
        lock(&self.status).installing = false;
    }

    /// Flip engine readiness; GET_STATUS and START_INSTALLATION honor it.
    pub fn set_ready(&self, ready: bool) {
        lock(&self.status).ready = ready;
    }

    /// Bind a handler for every command in the fixed set.
    pub fn register_handlers(&self, dispatcher: &Dispatcher) {
        dispatcher.register(Command::Ping, |args| {
            Ok(json!({
                "pong": true,
                "echo": args.get("echo").cloned().unwrap_or(Value::Null),
            }))
        });

        let status = self.status.clone();
        dispatcher.register(Command::GetStatus, move |_args| {
            let status = lock(&status);
            Ok(json!({
                "ready": status.ready,
                "busy": status.installing,
                "state": status.state_name(),
            }))
        });

        let branding = self.branding.clone();
        dispatcher.register(Command::GetBranding, move |_args| {
            Ok(json!({ "branding": branding }))
        });

        let job_names = self.job_names.clone();
        dispatcher.register(Command::GetJobNames, move |_args| {
            Ok(json!({ "jobs": job_names }))
        });

        let status = self.status.clone();
        let backend = self.backend.clone();
        let validator = self.validator.clone();
        let events = self.events.clone();
        dispatcher.register(Command::StartInstallation, move |args| {
            let target = args
                .get("target")
                .and_then(Value::as_str)
                .ok_or_else(|| {
                    HandlerError::new(ErrorCode::ValidationFailed, "missing argument 'target'")
                })?;
            let target = validator.validate_path(target)?;

            let backend = backend.clone().ok_or_else(|| {
                HandlerError::new(ErrorCode::EngineNotReady, "no job backend is attached")
            })?;

            {
                let mut status = lock(&status);
                if !status.ready {
                    return Err(HandlerError::new(
                        ErrorCode::EngineNotReady,
                        "engine is not ready",
                    ));
                }
                if status.installing {
                    return Err(HandlerError::new(
                        ErrorCode::EngineBusy,
                        "an installation is already running",
                    ));
                }
                status.installing = true;
            }

            info!("Starting installation to {}", target.display());
            match backend.start_installation(target, args.clone(), events.clone()) {
                Ok(result) => Ok(result),
                Err(e) => {
                    lock(&status).installing = false;
                    Err(e)
                }
            }
        });

        let status = self.status.clone();
        let backend = self.backend.clone();
        dispatcher.register(Command::CancelInstallation, move |_args| {
            {
                let status = lock(&status);
                if !status.installing {
                    return Err(HandlerError::new(
                        ErrorCode::InvalidState,
                        "no installation in progress",
                    ));
                }
            }
            let backend = backend.clone().ok_or_else(|| {
                HandlerError::new(ErrorCode::EngineNotReady, "no job backend is attached")
            })?;
            let result = backend.cancel_installation()?;
            lock(&status).installing = false;
            info!("Installation cancelled");
            Ok(result)
        });

        let backend = self.backend.clone();
        dispatcher.register(Command::ValidateConfig, move |args| {
            // The validator guarantees "config" is a map before dispatch.
            let config = args.get("config").cloned().unwrap_or(json!({}));
            match &backend {
                Some(backend) => backend.validate_config(&config),
                None => Ok(json!({ "valid": true })),
            }
        });

        let shutdown = self.shutdown.clone();
        dispatcher.register(Command::Shutdown, move |_args| {
            info!("Shutdown requested over IPC");
            shutdown.cancel();
            Ok(json!({ "shutting_down": true }))
        });
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

// ── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use omnis_core::message::Envelope;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct TestBackend {
        started: AtomicBool,
        cancelled: AtomicBool,
    }

    impl TestBackend {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                started: AtomicBool::new(false),
                cancelled: AtomicBool::new(false),
            })
        }
    }

    impl JobBackend for TestBackend {
        fn start_installation(
            &self,
            target: PathBuf,
            _args: Value,
            events: EventSink,
        ) -> Result<Value, HandlerError> {
            self.started.store(true, Ordering::SeqCst);
            events(EventKind::JobStarted, json!({ "job": "partition" }));
            Ok(json!({ "started": true, "target": target.to_string_lossy() }))
        }

        fn cancel_installation(&self) -> Result<Value, HandlerError> {
            self.cancelled.store(true, Ordering::SeqCst);
            Ok(json!({ "cancelled": true }))
        }
    }

    fn setup(backend: Option<Arc<TestBackend>>) -> (Engine, Dispatcher) {
        let config = EngineConfig::default();
        let validator = Arc::new(SecurityValidator::default());
        let mut engine = Engine::new(&config, validator, null_event_sink());
        if let Some(backend) = backend {
            engine = engine.with_backend(backend);
        }
        let dispatcher = Dispatcher::new();
        engine.register_handlers(&dispatcher);
        (engine, dispatcher)
    }

    async fn call(dispatcher: &Dispatcher, command: Command, args: Value) -> Envelope {
        dispatcher.dispatch(&Envelope::request(command, args)).await
    }

    #[tokio::test]
    async fn test_ping_echoes() {
        let (_engine, dispatcher) = setup(None);
        let resp = call(&dispatcher, Command::Ping, json!({ "echo": "hello" })).await;
        assert!(resp.is_success());
        assert_eq!(resp.result()["pong"], true);
        assert_eq!(resp.result()["echo"], "hello");
    }

    #[tokio::test]
    async fn test_get_status_idle() {
        let (_engine, dispatcher) = setup(None);
        let resp = call(&dispatcher, Command::GetStatus, json!({})).await;
        assert_eq!(resp.result()["ready"], true);
        assert_eq!(resp.result()["busy"], false);
        assert_eq!(resp.result()["state"], "idle");
    }

    #[tokio::test]
    async fn test_get_branding_and_job_names() {
        let (_engine, dispatcher) = setup(None);
        let resp = call(&dispatcher, Command::GetBranding, json!({})).await;
        assert_eq!(resp.result()["branding"]["product_name"], "Omnis");

        let resp = call(&dispatcher, Command::GetJobNames, json!({})).await;
        let jobs = resp.result()["jobs"].as_array().unwrap().clone();
        assert!(jobs.contains(&json!("partition")));
    }

    #[tokio::test]
    async fn test_start_without_backend_is_not_ready() {
        let (_engine, dispatcher) = setup(None);
        let resp = call(
            &dispatcher,
            Command::StartInstallation,
            json!({ "target": "/mnt/target" }),
        )
        .await;
        assert_eq!(resp.error_info().unwrap().code, ErrorCode::EngineNotReady);
    }

    #[tokio::test]
    async fn test_start_then_busy_then_cancel() {
        let backend = TestBackend::new();
        let (_engine, dispatcher) = setup(Some(backend.clone()));

        let resp = call(
            &dispatcher,
            Command::StartInstallation,
            json!({ "target": "/mnt/target" }),
        )
        .await;
        assert!(resp.is_success(), "start failed: {:?}", resp.error_info());
        assert!(backend.started.load(Ordering::SeqCst));

        // Second start while installing reports busy.
        let resp = call(
            &dispatcher,
            Command::StartInstallation,
            json!({ "target": "/mnt/target" }),
        )
        .await;
        assert_eq!(resp.error_info().unwrap().code, ErrorCode::EngineBusy);

        let resp = call(&dispatcher, Command::CancelInstallation, json!({})).await;
        assert!(resp.is_success());
        assert!(backend.cancelled.load(Ordering::SeqCst));

        // After cancellation the engine is idle again.
        let resp = call(&dispatcher, Command::GetStatus, json!({})).await;
        assert_eq!(resp.result()["state"], "idle");
    }

    #[tokio::test]
    async fn test_cancel_when_idle_is_invalid_state() {
        let backend = TestBackend::new();
        let (_engine, dispatcher) = setup(Some(backend));
        let resp = call(&dispatcher, Command::CancelInstallation, json!({})).await;
        assert_eq!(resp.error_info().unwrap().code, ErrorCode::InvalidState);
    }

    #[tokio::test]
    async fn test_start_rejects_bad_target() {
        let backend = TestBackend::new();
        let (_engine, dispatcher) = setup(Some(backend.clone()));
        let resp = call(
            &dispatcher,
            Command::StartInstallation,
            json!({ "target": "/etc/passwd" }),
        )
        .await;
        assert_eq!(resp.error_info().unwrap().code, ErrorCode::InvalidTarget);
        assert!(!backend.started.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_validate_config_defaults_to_valid() {
        let (_engine, dispatcher) = setup(None);
        let resp = call(
            &dispatcher,
            Command::ValidateConfig,
            json!({ "config": { "locale": "de_DE.UTF-8" } }),
        )
        .await;
        assert_eq!(resp.result()["valid"], true);
    }

    #[tokio::test]
    async fn test_shutdown_cancels_token() {
        let (engine, dispatcher) = setup(None);
        let token = engine.shutdown_token();
        assert!(!token.is_cancelled());

        let resp = call(&dispatcher, Command::Shutdown, json!({})).await;
        assert_eq!(resp.result()["shutting_down"], true);
        assert!(token.is_cancelled());
    }

    #[tokio::test]
    async fn test_not_ready_blocks_start() {
        let backend = TestBackend::new();
        let (engine, dispatcher) = setup(Some(backend));
        engine.set_ready(false);
        let resp = call(
            &dispatcher,
            Command::StartInstallation,
            json!({ "target": "/mnt/target" }),
        )
        .await;
        assert_eq!(resp.error_info().unwrap().code, ErrorCode::EngineNotReady);
    }
}
