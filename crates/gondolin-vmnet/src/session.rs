#![forbid(unsafe_code)]

use crate::backend::FrameBackend;
use crate::capture::Capture;
use crate::config::VmNetConfig;
use crate::dns::HostDns;
use crate::metrics::Metrics;
use gondolin_intercept::{
    CertificateAuthority, FlowChannel, FlowContext, FlowOutput, GuestInput, Interceptor,
    UpstreamClient,
};
use gondolin_policy::Policy;
use gondolin_stack::{Action, FlowId, FlowIo, Millis, NetworkStack};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Semaphore};
use tokio::task::JoinHandle;
use tracing::Instrument;

/// The assembled network plane for one VM: sans-IO stack + interception,
/// driven over a frame backend by [`VmNetwork::run`].
pub struct VmNetwork {
    cfg: VmNetConfig,
    policy: Policy,
    interceptor: Arc<Interceptor>,
    metrics: Metrics,
    session_counter: AtomicU64,
}

struct FlowHandle {
    in_tx: mpsc::UnboundedSender<GuestInput>,
    credit: Arc<Semaphore>,
    task: JoinHandle<()>,
    relay: JoinHandle<()>,
}

enum Wake {
    Shutdown(bool),
    Frame(Option<Vec<u8>>),
    FlowEvent(Option<(FlowId, FlowOutput)>),
    Tick,
}

impl VmNetwork {
    pub fn new(cfg: VmNetConfig, policy: Policy) -> anyhow::Result<Self> {
        let ca = match (&cfg.ca_cert_path, &cfg.ca_key_path) {
            (Some(cert), Some(key)) => CertificateAuthority::load_or_generate(cert, key)?,
            _ => CertificateAuthority::generate()?,
        };

        let resolver = Arc::new(HostDns::new(cfg.dns_overrides.clone()));
        let mut upstream = UpstreamClient::new(resolver);
        if let Some(timeout) = cfg.upstream_request_timeout {
            upstream.request_timeout = timeout;
        }
        upstream.follow_redirects = cfg.follow_redirects;

        let interceptor = Arc::new(Interceptor::new(
            policy.clone(),
            ca,
            upstream,
            cfg.intercept.clone(),
        ));

        Ok(Self {
            cfg,
            policy,
            interceptor,
            metrics: Metrics::new(),
            session_counter: AtomicU64::new(1),
        })
    }

    /// The CA certificate PEM for the guest trust store.
    pub fn ca_cert_pem(&self) -> &str {
        self.interceptor.ca_cert_pem()
    }

    /// `NAME -> placeholder` map exported into the guest environment.
    pub fn guest_env(&self) -> std::collections::HashMap<String, String> {
        self.interceptor.guest_env()
    }

    pub fn metrics(&self) -> Metrics {
        self.metrics.clone()
    }

    pub fn interceptor(&self) -> &Arc<Interceptor> {
        &self.interceptor
    }

    /// Pump the backend until it closes or `shutdown` flips true. All
    /// flow tasks are cancelled on the way out.
    pub async fn run<B: FrameBackend>(
        &self,
        mut backend: B,
        mut shutdown: watch::Receiver<bool>,
    ) -> anyhow::Result<()> {
        let session_id = self.session_counter.fetch_add(1, Ordering::Relaxed);
        let span = tracing::info_span!("vm_net_session", session_id);

        async {
            tracing::info!("session started");

            let mut stack =
                NetworkStack::new(self.cfg.stack.clone(), self.policy.admission());
            let start = tokio::time::Instant::now();

            let mut capture = match &self.cfg.capture_dir {
                Some(dir) => match Capture::open(dir, session_id).await {
                    Ok(capture) => Some(capture),
                    Err(err) => {
                        tracing::warn!("capture disabled: {err}");
                        None
                    }
                },
                None => None,
            };

            let (event_tx, mut event_rx) = mpsc::unbounded_channel::<(FlowId, FlowOutput)>();
            let mut flows: HashMap<FlowId, FlowHandle> = HashMap::new();

            let actions = stack.link_up();
            self.process_actions(
                actions,
                &mut backend,
                &mut flows,
                &event_tx,
                &mut capture,
            )
            .await?;

            let mut tick = tokio::time::interval(Duration::from_millis(100));
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                // Decide what woke us inside the select, act afterwards:
                // the arm handlers must not touch the backend while its
                // recv future is still held by the select.
                let wake = tokio::select! {
                    biased;
                    changed = shutdown.changed() => Wake::Shutdown(changed.is_err() || *shutdown.borrow()),
                    frame = backend.recv() => Wake::Frame(frame),
                    event = event_rx.recv() => Wake::FlowEvent(event),
                    _ = tick.tick() => Wake::Tick,
                };

                match wake {
                    Wake::Shutdown(true) => {
                        tracing::info!("shutdown requested");
                        break;
                    }
                    Wake::Shutdown(false) => {}
                    Wake::Frame(None) => {
                        tracing::info!("backend closed");
                        break;
                    }
                    Wake::Frame(Some(frame)) => {
                        self.metrics.frame_rx(frame.len());
                        if let Some(capture) = capture.as_mut() {
                            let _ = capture.record(&frame).await;
                        }
                        let actions = stack.handle_frame(&frame, elapsed_ms(start));
                        self.process_actions(actions, &mut backend, &mut flows, &event_tx, &mut capture).await?;
                    }
                    // The session holds `event_tx`, so the channel cannot
                    // report closed here.
                    Wake::FlowEvent(None) => break,
                    Wake::FlowEvent(Some((flow, output))) => {
                        let io = match output {
                            FlowOutput::Data(data) => FlowIo::Send { flow, data },
                            FlowOutput::Consumed(bytes) => FlowIo::Consumed { flow, bytes },
                            FlowOutput::Shutdown => FlowIo::Shutdown { flow },
                            FlowOutput::Abort => {
                                if let Some(handle) = flows.remove(&flow) {
                                    handle.credit.close();
                                    handle.relay.abort();
                                }
                                FlowIo::Abort { flow }
                            }
                        };
                        let actions = stack.handle_flow_io(io, elapsed_ms(start));
                        self.process_actions(actions, &mut backend, &mut flows, &event_tx, &mut capture).await?;
                    }
                    Wake::Tick => {
                        let actions = stack.poll(elapsed_ms(start));
                        self.process_actions(actions, &mut backend, &mut flows, &event_tx, &mut capture).await?;
                        self.metrics.absorb_stack_stats(&stack.stats);
                        flows.retain(|_, handle| !handle.task.is_finished());
                    }
                }
            }

            for (_, handle) in flows.drain() {
                handle.credit.close();
                handle.task.abort();
                handle.relay.abort();
            }
            self.metrics.absorb_stack_stats(&stack.stats);

            if let Some(capture) = capture {
                let path = capture.path().to_path_buf();
                if let Err(err) = capture.close().await {
                    tracing::warn!("failed to flush capture: {err}");
                } else {
                    tracing::info!(path = %path.display(), "wrote capture file");
                }
            }

            tracing::info!("session closed");
            Ok(())
        }
        .instrument(span)
        .await
    }

    async fn process_actions<B: FrameBackend>(
        &self,
        actions: Vec<Action>,
        backend: &mut B,
        flows: &mut HashMap<FlowId, FlowHandle>,
        event_tx: &mpsc::UnboundedSender<(FlowId, FlowOutput)>,
        capture: &mut Option<Capture>,
    ) -> anyhow::Result<()> {
        for action in actions {
            match action {
                Action::EmitFrame(frame) => {
                    self.metrics.frame_tx(frame.len());
                    if let Some(capture) = capture.as_mut() {
                        let _ = capture.record(&frame).await;
                    }
                    backend.send(frame).await?;
                }
                Action::FlowOpen { flow, host, ip, port } => {
                    tracing::debug!(flow, %host, %ip, port, "flow opened");
                    let (in_tx, in_rx) = mpsc::unbounded_channel::<GuestInput>();
                    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<FlowOutput>();
                    let credit =
                        Arc::new(Semaphore::new(self.cfg.stack.tcp.send_buffer_bytes));
                    let chan = FlowChannel::new(in_rx, out_tx, credit.clone());
                    let ctx = FlowContext { flow, host, port };

                    let task = tokio::spawn(self.interceptor.clone().serve_flow(ctx, chan));
                    let relay_tx = event_tx.clone();
                    let relay = tokio::spawn(async move {
                        while let Some(output) = out_rx.recv().await {
                            if relay_tx.send((flow, output)).is_err() {
                                break;
                            }
                        }
                    });

                    flows.insert(
                        flow,
                        FlowHandle {
                            in_tx,
                            credit,
                            task,
                            relay,
                        },
                    );
                    self.metrics.flow_spawned();
                }
                Action::FlowData { flow, data } => {
                    if let Some(handle) = flows.get(&flow) {
                        let _ = handle.in_tx.send(GuestInput::Data(data));
                    }
                }
                Action::FlowAcked { flow, bytes } => {
                    if let Some(handle) = flows.get(&flow) {
                        handle.credit.add_permits(bytes);
                    }
                }
                Action::FlowFin { flow } => {
                    if let Some(handle) = flows.get(&flow) {
                        let _ = handle.in_tx.send(GuestInput::Fin);
                    }
                }
                Action::FlowReset { flow } => {
                    if let Some(handle) = flows.remove(&flow) {
                        let _ = handle.in_tx.send(GuestInput::Reset);
                        handle.credit.close();
                    }
                }
            }
        }
        Ok(())
    }
}

impl std::fmt::Debug for VmNetwork {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VmNetwork")
            .field("cfg", &self.cfg)
            .finish_non_exhaustive()
    }
}

fn elapsed_ms(start: tokio::time::Instant) -> Millis {
    start.elapsed().as_millis().min(u64::MAX as u128) as u64
}
