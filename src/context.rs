//! The runtime context: owns the handle registry, the scheduler and the IO
//! runtime, and tears them down in a fixed order.
//!
//! Shutdown order is scheduler first (no more transport passes or renewals),
//! then the registry (leak report), then the IO runtime (open sockets are
//! dropped). Dropping the context runs the same sequence if `shutdown` was
//! never called.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use tokio::runtime::{Builder, Handle, Runtime};

use crate::audio::AudioStreamBuffer;
use crate::config::RuntimeConfig;
use crate::credentials::{CredentialRenewalTimer, CredentialSource};
use crate::diagnostics::{self, LogRing};
use crate::error::Result;
use crate::handles::HandleRegistry;
use crate::scheduler::Scheduler;
use crate::transport::{Transport, TransportCallbacks, TungsteniteSocket, WebSocketIo};

pub struct SpeechContext {
    config: RuntimeConfig,
    registry: Arc<HandleRegistry>,
    scheduler: Arc<Scheduler>,
    runtime: Mutex<Option<Runtime>>,
    io: Handle,
    log_ring: Option<Arc<LogRing>>,
    shut_down: AtomicBool,
}

impl SpeechContext {
    /// Starts the scheduler lanes and a small multi-threaded IO runtime.
    pub fn start(config: RuntimeConfig) -> Result<Self> {
        let runtime = Builder::new_multi_thread()
            .worker_threads(2)
            .thread_name("speech-io")
            .enable_all()
            .build()?;
        let io = runtime.handle().clone();

        let scheduler = Arc::new(Scheduler::new(config.scheduler.clone()));
        scheduler.init()?;
        log::info!("speech context started");

        Ok(Self {
            registry: Arc::new(HandleRegistry::new(config.registry)),
            scheduler,
            runtime: Mutex::new(Some(runtime)),
            io,
            log_ring: None,
            shut_down: AtomicBool::new(false),
            config,
        })
    }

    /// Like [`start`](Self::start), and installs the process logger first.
    pub fn start_with_logging(config: RuntimeConfig) -> Result<Self> {
        let ring = diagnostics::init_logging(&config.logging)?;
        let mut context = Self::start(config)?;
        context.log_ring = Some(ring);
        Ok(context)
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<HandleRegistry> {
        &self.registry
    }

    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.scheduler
    }

    pub fn io_handle(&self) -> Handle {
        self.io.clone()
    }

    pub fn log_ring(&self) -> Option<&Arc<LogRing>> {
        self.log_ring.as_ref()
    }

    pub fn object_report(&self) -> String {
        diagnostics::object_report(&self.registry)
    }

    pub fn create_audio_buffer(&self) -> Arc<AudioStreamBuffer> {
        Arc::new(AudioStreamBuffer::new(self.config.audio))
    }

    /// A transport over a real websocket on the context's IO runtime.
    pub fn create_transport(&self, callbacks: Arc<dyn TransportCallbacks>) -> Transport {
        self.create_transport_with_socket(Box::new(TungsteniteSocket::new(self.io_handle())), callbacks)
    }

    pub fn create_transport_with_socket(
        &self,
        socket: Box<dyn WebSocketIo>,
        callbacks: Arc<dyn TransportCallbacks>,
    ) -> Transport {
        Transport::new(
            self.scheduler.clone(),
            socket,
            callbacks,
            self.config.transport.clone(),
        )
    }

    pub fn create_renewal_timer(&self, source: Arc<dyn CredentialSource>) -> CredentialRenewalTimer {
        CredentialRenewalTimer::new(
            source,
            self.scheduler.clone(),
            self.io_handle(),
            self.config.credentials.clone(),
        )
    }

    /// Stops everything. Fails with `Abort` from the scheduler's background
    /// lane; later calls do nothing.
    pub fn shutdown(&self) -> Result<()> {
        if self.shut_down.load(Ordering::Acquire) {
            return Ok(());
        }
        self.scheduler.term()?;
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        self.registry.terminate_all();
        if let Some(runtime) = self.runtime.lock().take() {
            runtime.shutdown_background();
        }
        log::info!("speech context shut down");
        Ok(())
    }
}

impl Drop for SpeechContext {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            log::error!("speech context shutdown failed: {}", e);
        }
    }
}
