//! Channel actor - owns the worker subprocess and serializes all interaction.
//!
//! Flow:
//! 1. Spawn worker subprocess
//! 2. Send Init, read frames until the worker acknowledges
//! 3. Run event loop routing replies to callers, one request in flight
//! 4. On worker exit: fail the pending call, refuse further calls
//!
//! The event loop task is the sole owner of the process handle, the pending
//! call, and the in-flight bookkeeping; callers reach it only through a
//! bounded queue.

use std::collections::VecDeque;
use std::process::ExitStatus;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::bridge::protocol::{self, Request, Response};
use crate::process::{
    BridgeSpawner, ProcessError, ProcessEvent, SpawnError, WorkerProcess, WorkerSpawner,
};

/// Default deadline for the startup handshake. Model loading dominates this;
/// large checkpoints on a cold cache take minutes.
pub const DEFAULT_INIT_TIMEOUT: Duration = Duration::from_secs(300);

/// Default per-call deadline.
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(120);

#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("failed to spawn worker: {0}")]
    Spawn(#[from] SpawnError),

    /// The worker did not acknowledge initialization before the deadline.
    #[error("worker initialization timed out")]
    InitTimeout,

    /// The worker exited before acknowledging initialization.
    #[error("worker exited during initialization: {0}")]
    InitCrash(ExitStatus),

    /// The worker answered the handshake with an error.
    #[error("worker rejected initialization: {0}")]
    InitRejected(String),

    /// Write attempted after the worker's input closed.
    #[error("worker input channel is closed")]
    ChannelClosed,

    /// The worker exited while the channel was running. Terminal: the
    /// channel refuses further calls; restart policy belongs to the caller.
    #[error("worker crashed: {0}")]
    WorkerCrash(ExitStatus),

    /// Application error reported by the worker, delivered verbatim.
    #[error("worker error: {0}")]
    Failure(String),

    /// Caller-side deadline elapsed. The worker keeps computing; the channel
    /// discards its late reply and stays usable.
    #[error("request timed out")]
    Timeout,

    /// The channel was shut down while this call was pending.
    #[error("request cancelled by channel shutdown")]
    Cancelled,

    /// The channel's event loop has already exited.
    #[error("channel is no longer running")]
    ActorDead,

    /// Fatal channel-integrity failure (framing overflow, encode error).
    #[error("protocol error: {0}")]
    Protocol(String),
}

impl From<ProcessError> for ChannelError {
    fn from(e: ProcessError) -> Self {
        match e {
            ProcessError::ChannelClosed => ChannelError::ChannelClosed,
            other => ChannelError::Protocol(other.to_string()),
        }
    }
}

/// Speech synthesis request.
#[derive(Debug, Clone)]
pub struct GenerateRequest {
    text: String,
    audio_prompt: Option<String>,
    language: Option<String>,
    exaggeration: Option<f32>,
    cfg_weight: Option<f32>,
}

impl GenerateRequest {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            audio_prompt: None,
            language: None,
            exaggeration: None,
            cfg_weight: None,
        }
    }

    /// Reference audio clip for voice cloning.
    pub fn with_audio_prompt(mut self, path: impl Into<String>) -> Self {
        self.audio_prompt = Some(path.into());
        self
    }

    /// Language code, honored by multilingual model variants.
    pub fn with_language(mut self, language: impl Into<String>) -> Self {
        self.language = Some(language.into());
        self
    }

    pub fn with_exaggeration(mut self, exaggeration: f32) -> Self {
        self.exaggeration = Some(exaggeration);
        self
    }

    pub fn with_cfg_weight(mut self, cfg_weight: f32) -> Self {
        self.cfg_weight = Some(cfg_weight);
        self
    }

    fn into_request(self) -> Request {
        Request::Generate {
            text: self.text,
            audio_prompt: self.audio_prompt,
            language: self.language,
            exaggeration: self.exaggeration,
            cfg_weight: self.cfg_weight,
        }
    }
}

/// Channel configuration. Immutable once the channel is spawned.
pub struct ChannelConfig {
    model: String,
    device: String,
    init_timeout: Duration,
    call_timeout: Duration,
    spawner: Arc<dyn WorkerSpawner>,
}

impl ChannelConfig {
    pub fn new(model: impl Into<String>, device: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            device: device.into(),
            init_timeout: DEFAULT_INIT_TIMEOUT,
            call_timeout: DEFAULT_CALL_TIMEOUT,
            spawner: Arc::new(BridgeSpawner::new("chatterbex_bridge.py")),
        }
    }

    pub fn with_init_timeout(mut self, timeout: Duration) -> Self {
        self.init_timeout = timeout;
        self
    }

    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    /// Replace the default bridge spawner (packaging resolves the real
    /// bridge location; tests substitute scripted workers).
    pub fn with_spawner(mut self, spawner: Arc<dyn WorkerSpawner>) -> Self {
        self.spawner = spawner;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CallKind {
    Generate,
    Ping,
}

/// Reply sink for one queued call, typed by what completes it.
enum CallReply {
    Audio(oneshot::Sender<Result<Vec<u8>, ChannelError>>),
    Pong(oneshot::Sender<Result<(), ChannelError>>),
}

impl CallReply {
    fn kind(&self) -> CallKind {
        match self {
            Self::Audio(_) => CallKind::Generate,
            Self::Pong(_) => CallKind::Ping,
        }
    }

    fn is_closed(&self) -> bool {
        match self {
            Self::Audio(tx) => tx.is_closed(),
            Self::Pong(tx) => tx.is_closed(),
        }
    }

    fn reject(self, error: ChannelError) {
        match self {
            Self::Audio(tx) => {
                let _ = tx.send(Err(error));
            }
            Self::Pong(tx) => {
                let _ = tx.send(Err(error));
            }
        }
    }
}

struct Call {
    request: Request,
    reply: CallReply,
}

/// The one outstanding caller, stamped with the generation of the request
/// written on its behalf.
struct PendingCall {
    generation: u64,
    reply: CallReply,
}

/// A request written to the worker whose reply has not arrived yet. The
/// worker answers strictly in order, so these form a FIFO; normally it holds
/// one entry, two transiently after an abandoned call.
#[derive(Debug, Clone, Copy)]
struct Inflight {
    generation: u64,
    kind: CallKind,
}

/// Handle to a running worker channel.
///
/// Spawned with [`Channel::spawn`]; the startup handshake completes before
/// this handle is returned, so a `Channel` is always ready for calls.
/// Concurrent calls queue and run one at a time, in order.
#[derive(Debug)]
pub struct Channel {
    call_tx: mpsc::Sender<Call>,
    shutdown_tx: mpsc::Sender<oneshot::Sender<()>>,
    call_timeout: Duration,
    actor: JoinHandle<()>,
}

impl Channel {
    /// Spawn the worker and perform the startup handshake.
    ///
    /// Fails without returning a handle if the worker cannot be spawned,
    /// rejects initialization, exits, or misses the init deadline; the
    /// subprocess is torn down on every failure path.
    pub async fn spawn(config: ChannelConfig) -> Result<Self, ChannelError> {
        let mut process = WorkerProcess::spawn(config.spawner.as_ref())?;
        tracing::info!(
            model = %config.model,
            device = %config.device,
            pid = process.id(),
            "Starting worker channel"
        );

        if let Err(e) = handshake(&mut process, &config).await {
            process.terminate().await;
            return Err(e);
        }
        tracing::info!("Worker ready");

        let (call_tx, call_rx) = mpsc::channel(8);
        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
        let actor = tokio::spawn(run_event_loop(process, call_rx, shutdown_rx));

        Ok(Self {
            call_tx,
            shutdown_tx,
            call_timeout: config.call_timeout,
            actor,
        })
    }

    /// Synthesize speech, waiting up to the configured call timeout.
    ///
    /// Returns the raw audio bytes (a WAV artifact) on success. On
    /// [`ChannelError::Timeout`] the channel stays usable: the worker's late
    /// reply is discarded, and the next queued call proceeds.
    pub async fn generate(&self, request: GenerateRequest) -> Result<Vec<u8>, ChannelError> {
        self.generate_with_timeout(request, self.call_timeout).await
    }

    pub async fn generate_with_timeout(
        &self,
        request: GenerateRequest,
        timeout: Duration,
    ) -> Result<Vec<u8>, ChannelError> {
        let (tx, rx) = oneshot::channel();
        let call = Call {
            request: request.into_request(),
            reply: CallReply::Audio(tx),
        };
        self.call_tx
            .send(call)
            .await
            .map_err(|_| ChannelError::ActorDead)?;

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(ChannelError::ActorDead),
            Err(_) => Err(ChannelError::Timeout),
        }
    }

    /// Liveness probe through the worker's request loop.
    pub async fn ping(&self) -> Result<(), ChannelError> {
        self.ping_with_timeout(self.call_timeout).await
    }

    pub async fn ping_with_timeout(&self, timeout: Duration) -> Result<(), ChannelError> {
        let (tx, rx) = oneshot::channel();
        let call = Call {
            request: Request::Ping,
            reply: CallReply::Pong(tx),
        };
        self.call_tx
            .send(call)
            .await
            .map_err(|_| ChannelError::ActorDead)?;

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(ChannelError::ActorDead),
            Err(_) => Err(ChannelError::Timeout),
        }
    }

    /// Terminate the worker and stop the event loop. A pending call is
    /// completed with [`ChannelError::Cancelled`]. Idempotent.
    pub async fn shutdown(&self) -> Result<(), ChannelError> {
        let (tx, rx) = oneshot::channel();
        if self.shutdown_tx.send(tx).await.is_err() {
            // Event loop already gone (crash or prior shutdown).
            return Ok(());
        }
        let _ = rx.await;
        Ok(())
    }

    /// Whether the event loop is still running.
    pub fn is_alive(&self) -> bool {
        !self.actor.is_finished()
    }
}

/// Send Init and read frames until the worker acknowledges, rejects, exits,
/// or the deadline elapses.
async fn handshake(process: &mut WorkerProcess, config: &ChannelConfig) -> Result<(), ChannelError> {
    let init = Request::Init {
        model: config.model.clone(),
        device: config.device.clone(),
    };
    tracing::debug!("Sending init to worker");
    match process.send(&init).await {
        Ok(()) => {}
        // Stdin already broken means the worker is dying; fall through to
        // the read side, which resolves to InitRejected or InitCrash.
        Err(ProcessError::ChannelClosed) => {}
        Err(other) => return Err(other.into()),
    }

    tracing::debug!("Waiting for init acknowledgement");
    let result = tokio::time::timeout(config.init_timeout, async {
        loop {
            match process.next_event().await {
                Ok(ProcessEvent::Frame(line)) => match protocol::decode_response(&line) {
                    Ok(Response::Ack) => return Ok(()),
                    Ok(Response::Failure { message }) => {
                        return Err(ChannelError::InitRejected(message));
                    }
                    Ok(Response::Audio(_)) => {
                        tracing::warn!("Unexpected audio frame during handshake, ignoring");
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "Undecodable frame during handshake, ignoring");
                    }
                },
                Ok(ProcessEvent::Exited(status)) => {
                    return Err(ChannelError::InitCrash(status));
                }
                Err(e) => return Err(e.into()),
            }
        }
    })
    .await;

    match result {
        Ok(outcome) => outcome,
        Err(_) => Err(ChannelError::InitTimeout),
    }
}

async fn run_event_loop(
    mut process: WorkerProcess,
    mut call_rx: mpsc::Receiver<Call>,
    mut shutdown_rx: mpsc::Receiver<oneshot::Sender<()>>,
) {
    let mut pending: Option<PendingCall> = None;
    let mut inflight: VecDeque<Inflight> = VecDeque::new();
    let mut generation: u64 = 0;

    loop {
        // Single-flight: while a live caller waits, no new call is accepted.
        // A closed reply sink means the caller abandoned its wait; the next
        // call may then proceed and the stale reply is discarded later.
        let accept_calls = pending
            .as_ref()
            .map(|p| p.reply.is_closed())
            .unwrap_or(true);

        tokio::select! {
            biased;

            Some(ack) = shutdown_rx.recv() => {
                tracing::info!("Shutdown requested");
                process.terminate().await;
                if let Some(p) = pending.take() {
                    p.reply.reject(ChannelError::Cancelled);
                }
                let _ = ack.send(());
                break;
            }

            event = process.next_event() => {
                match event {
                    Ok(ProcessEvent::Frame(line)) => {
                        handle_frame(&line, &mut pending, &mut inflight);
                    }
                    Ok(ProcessEvent::Exited(status)) => {
                        tracing::error!(code = status.code(), "Worker exited");
                        if let Some(p) = pending.take() {
                            p.reply.reject(ChannelError::WorkerCrash(status));
                        }
                        break;
                    }
                    Err(e) => {
                        tracing::error!(error = %e, "Fatal channel error");
                        process.terminate().await;
                        if let Some(p) = pending.take() {
                            p.reply.reject(ChannelError::Protocol(e.to_string()));
                        }
                        break;
                    }
                }
            }

            msg = call_rx.recv(), if accept_calls => {
                let Some(call) = msg else {
                    tracing::debug!("Channel handle dropped, terminating worker");
                    process.terminate().await;
                    if let Some(p) = pending.take() {
                        p.reply.reject(ChannelError::Cancelled);
                    }
                    break;
                };

                if let Some(stale) = pending.take() {
                    // The caller gave up; the worker still owes a reply for
                    // this generation, discarded on arrival by the mismatch
                    // check in handle_frame.
                    tracing::warn!(
                        generation = stale.generation,
                        "Releasing abandoned call"
                    );
                }

                generation += 1;
                tracing::debug!(generation, kind = ?call.reply.kind(), "Dispatching request");
                match process.send(&call.request).await {
                    Ok(()) => {
                        inflight.push_back(Inflight {
                            generation,
                            kind: call.reply.kind(),
                        });
                        pending = Some(PendingCall {
                            generation,
                            reply: call.reply,
                        });
                    }
                    Err(e) => {
                        call.reply.reject(e.into());
                    }
                }
            }
        }
    }

    // Calls that were already queued behind the terminal event.
    while let Ok(call) = call_rx.try_recv() {
        call.reply.reject(ChannelError::ActorDead);
    }
    tracing::info!("Channel event loop exiting");
}

/// Route one decoded frame. The worker answers requests strictly in order,
/// so a completing frame always answers the oldest in-flight request; it is
/// delivered only if that request is still the one a caller waits on.
fn handle_frame(
    line: &str,
    pending: &mut Option<PendingCall>,
    inflight: &mut VecDeque<Inflight>,
) {
    let response = match protocol::decode_response(line) {
        Ok(response) => response,
        Err(e) => {
            // A malformed frame cannot be safely attributed to the pending
            // request; the caller keeps waiting.
            tracing::warn!(error = %e, "Undecodable frame, ignoring");
            return;
        }
    };

    let Some(front) = inflight.front().copied() else {
        tracing::warn!("Frame with no request in flight, ignoring");
        return;
    };

    // A bare ack is not a valid reply to a generate request; only the
    // audio or error frame that follows completes it.
    if front.kind == CallKind::Generate && matches!(response, Response::Ack) {
        tracing::warn!("Ignoring bare ack while a generate request is in flight");
        return;
    }

    inflight.pop_front();
    match pending.take_if(|p| p.generation == front.generation) {
        Some(p) => deliver(p.reply, response),
        None => {
            tracing::warn!(generation = front.generation, "Discarding stale reply");
        }
    }
}

fn deliver(reply: CallReply, response: Response) {
    match (reply, response) {
        (CallReply::Audio(tx), Response::Audio(bytes)) => {
            tracing::debug!(len = bytes.len(), "Delivering audio payload");
            let _ = tx.send(Ok(bytes));
        }
        (CallReply::Audio(tx), Response::Failure { message }) => {
            let _ = tx.send(Err(ChannelError::Failure(message)));
        }
        (CallReply::Audio(tx), Response::Ack) => {
            // Filtered out in handle_frame; kept total for safety.
            let _ = tx.send(Err(ChannelError::Protocol(
                "bare ack in reply to generate request".to_string(),
            )));
        }
        (CallReply::Pong(tx), Response::Failure { message }) => {
            let _ = tx.send(Err(ChannelError::Failure(message)));
        }
        // Any ok-status frame answers a ping.
        (CallReply::Pong(tx), _) => {
            let _ = tx.send(Ok(()));
        }
    }
}
