//! Agent wiring.
//!
//! Every agent is the same shape: a hub listener thread feeding the
//! coordinator, one or more component threads, and the coordinator actor on
//! the calling thread. Components receive `GateCommand`s over their own
//! channel and report `LocalEvent`s back through the shared input channel.
//! A component that fails fatally posts `Shutdown` so the whole agent winds
//! down and the error surfaces from `run_*`.

use anyhow::{anyhow, Context, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender, TryRecvError};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::capture::CaptureStore;
use crate::channel::{EventChannel, HubTransport, MemoryHub, MqttTransport};
use crate::config::{HubSettings, KioskConfig};
use crate::detect::build_classifier;
use crate::frame::FrameRingBuffer;
use crate::ingest::{run_ingest, FrameSource};
use crate::protocol::now_timestamp;
use crate::proximity::{ProximityGate, ProximityParams};
use crate::retry::RetryPolicy;
use crate::sensor::open_sensor;
use crate::session::{
    run_coordinator, AgentInput, AgentStatus, CoordinatorExit, CoordinatorOptions, GateCommand,
    LocalEvent, SessionCoordinator,
};
use crate::stabilizer::{DetectionStabilizer, StabilizerParams};
use crate::stillness::{Observation, StillnessDetector, StillnessParams};

/// Consecutive sensor read failures tolerated before the agent gives up.
const SENSOR_ERROR_LIMIT: u32 = 50;
const SENSOR_ERROR_BACKOFF: Duration = Duration::from_millis(200);

pub const PROXIMITY_CLIENT_ID: &str = "proximity-agent";
pub const STILLNESS_CLIENT_ID: &str = "stillness-agent";
pub const VISION_CLIENT_ID: &str = "vision-agent";

fn producer_restart_policy() -> RetryPolicy {
    RetryPolicy::exponential(Duration::from_millis(500), Duration::from_secs(5)).with_max_attempts(10)
}

/// Transport for the configured hub address. `memory://` gives a detached
/// in-process hub for dry runs.
pub fn hub_transport(settings: &HubSettings, client_id: &str) -> Result<Arc<dyn HubTransport>> {
    if settings.addr.starts_with("memory://") {
        log::warn!("hub: using detached in-memory hub, nothing will reach a real hub");
        return Ok(Arc::new(MemoryHub::new().transport()));
    }
    Ok(Arc::new(MqttTransport::from_settings(settings, client_id)?))
}

fn coordinator_options(config: &KioskConfig) -> CoordinatorOptions {
    CoordinatorOptions {
        heartbeat_period: config.heartbeat.period,
        publish_heartbeat: config.heartbeat.publish,
        ..CoordinatorOptions::default()
    }
}

struct Agent {
    shutdown: Arc<AtomicBool>,
    channel: EventChannel,
    inputs: Sender<AgentInput>,
    receiver: Receiver<AgentInput>,
    listener: JoinHandle<()>,
    workers: Vec<JoinHandle<Result<()>>>,
    commands: Vec<Sender<GateCommand>>,
}

impl Agent {
    fn start(
        transport: Arc<dyn HubTransport>,
        reconnect: RetryPolicy,
        shutdown: Arc<AtomicBool>,
    ) -> Result<Self> {
        let channel = EventChannel::new(transport, reconnect, Arc::clone(&shutdown));
        let (inputs, receiver) = mpsc::channel();
        let listener = channel.spawn_listener(inputs.clone())?;
        Ok(Self {
            shutdown,
            channel,
            inputs,
            receiver,
            listener,
            workers: Vec::new(),
            commands: Vec::new(),
        })
    }

    /// New command channel for one component.
    fn subscribe(&mut self) -> Receiver<GateCommand> {
        let (tx, rx) = mpsc::channel();
        self.commands.push(tx);
        rx
    }

    fn spawn(
        &mut self,
        name: &'static str,
        work: impl FnOnce() -> Result<()> + Send + 'static,
    ) -> Result<()> {
        let inputs = self.inputs.clone();
        let handle = std::thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                let result = work();
                if let Err(e) = &result {
                    log::error!("{} failed: {:#}", name, e);
                    let _ = inputs.send(AgentInput::Shutdown);
                }
                result
            })
            .with_context(|| format!("failed to spawn {}", name))?;
        self.workers.push(handle);
        Ok(())
    }

    fn run(
        self,
        options: CoordinatorOptions,
        status: impl Fn() -> AgentStatus,
    ) -> Result<CoordinatorExit> {
        let Agent {
            shutdown,
            channel,
            inputs,
            receiver,
            listener,
            workers,
            commands,
        } = self;
        drop(inputs);

        let coordinator = SessionCoordinator::new(options);
        let exit = run_coordinator(
            coordinator,
            receiver,
            channel.handle(),
            commands,
            status,
            &shutdown,
        );

        shutdown.store(true, Ordering::SeqCst);
        channel.close();
        let mut failure = None;
        for worker in workers {
            match worker.join() {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    failure.get_or_insert(e);
                }
                Err(_) => {
                    failure.get_or_insert(anyhow!("component thread panicked"));
                }
            }
        }
        if listener.join().is_err() {
            log::warn!("hub listener panicked");
        }
        if let Some(e) = failure {
            return Err(e);
        }
        let exit = exit?;
        log::info!("agent stopped ({:?})", exit);
        Ok(exit)
    }
}

/// Distance sensor -> ProximityGate -> `lidarDistance`.
pub fn run_proximity(
    config: &KioskConfig,
    transport: Arc<dyn HubTransport>,
    shutdown: Arc<AtomicBool>,
) -> Result<CoordinatorExit> {
    let settings = &config.proximity;
    let mut sensor = open_sensor(&settings.device, settings.baud)?;
    let mut gate = ProximityGate::new(ProximityParams::from(settings));
    log::info!(
        "proximity: threshold {}cm, hard lock {:?}, offline fallback {}",
        settings.threshold_cm,
        settings.hard_lock,
        settings.offline_fallback
    );

    let mut agent = Agent::start(transport, config.hub.reconnect.clone(), Arc::clone(&shutdown))?;
    let commands = agent.subscribe();
    let events = agent.inputs.clone();
    let ready = Arc::new(AtomicBool::new(false));
    let sensor_ready = Arc::clone(&ready);
    let stop = Arc::clone(&shutdown);

    agent.spawn("proximity-sensor", move || {
        let mut failures = 0u32;
        while !stop.load(Ordering::SeqCst) {
            loop {
                match commands.try_recv() {
                    Ok(GateCommand::HubContact) => gate.on_hub_contact(),
                    Ok(GateCommand::SessionStart) => gate.on_session_start(Instant::now()),
                    Ok(GateCommand::SessionEnd) => gate.on_session_end(),
                    Ok(_) => {}
                    Err(TryRecvError::Empty) => break,
                    Err(TryRecvError::Disconnected) => return Ok(()),
                }
            }
            match sensor.read_distance() {
                Ok(Some(distance_cm)) => {
                    failures = 0;
                    sensor_ready.store(true, Ordering::Relaxed);
                    log::trace!("proximity: {}cm", distance_cm);
                    if let Some(trigger) = gate.on_sample(distance_cm, Instant::now()) {
                        let event = LocalEvent::ProximityTrigger {
                            distance_cm: trigger.distance_cm,
                        };
                        if events.send(AgentInput::Local(event)).is_err() {
                            return Ok(());
                        }
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    failures += 1;
                    if failures >= SENSOR_ERROR_LIMIT {
                        return Err(e.context("distance sensor keeps failing"));
                    }
                    log::warn!("proximity: sensor read failed: {:#}", e);
                    std::thread::sleep(SENSOR_ERROR_BACKOFF);
                }
            }
        }
        Ok(())
    })?;

    let handle = agent.channel.handle();
    agent.run(coordinator_options(config), move || AgentStatus {
        queue_len: handle.pending_len(),
        ready: ready.load(Ordering::Relaxed),
    })
}

fn spawn_ingest(
    agent: &mut Agent,
    source: FrameSource,
    ring: &Arc<FrameRingBuffer>,
) -> Result<()> {
    let ring = Arc::clone(ring);
    let stop = Arc::clone(&agent.shutdown);
    agent.spawn("frame-ingest", move || {
        run_ingest(source, ring, stop).map(|_| ())
    })
}

/// Camera -> StillnessDetector -> `basketStable`.
pub fn run_stillness(
    config: &KioskConfig,
    transport: Arc<dyn HubTransport>,
    shutdown: Arc<AtomicBool>,
) -> Result<CoordinatorExit> {
    let settings = &config.stillness;
    let source = FrameSource::new(
        settings.camera.source_config(producer_restart_policy()),
        Arc::clone(&shutdown),
    )?;
    let ring = Arc::new(FrameRingBuffer::new(config.ring_depth));
    let mut detector = StillnessDetector::new(StillnessParams::from(settings));
    let sample_interval = settings.sample_interval;

    let mut agent = Agent::start(transport, config.hub.reconnect.clone(), Arc::clone(&shutdown))?;
    spawn_ingest(&mut agent, source, &ring)?;

    let commands = agent.subscribe();
    let events = agent.inputs.clone();
    let frames = Arc::clone(&ring);
    let stop = Arc::clone(&shutdown);
    agent.spawn("stillness-detector", move || {
        let mut last_seq = None;
        while !stop.load(Ordering::SeqCst) {
            loop {
                match commands.try_recv() {
                    Ok(GateCommand::Activate) => {
                        log::info!("stillness: detection run started");
                        detector.activate(Instant::now());
                    }
                    Ok(GateCommand::Deactivate) | Ok(GateCommand::SessionEnd) => {
                        if detector.is_active() || detector.has_emitted() {
                            log::info!("stillness: detection run stopped");
                        }
                        detector.deactivate();
                    }
                    Ok(_) => {}
                    Err(TryRecvError::Empty) => break,
                    Err(TryRecvError::Disconnected) => return Ok(()),
                }
            }
            if detector.is_active() {
                if let Some(frame) = frames.latest_after(last_seq) {
                    last_seq = Some(frame.seq);
                    match detector.observe(&frame, frame.captured_at) {
                        Observation::Stable(sample) => {
                            log::info!("stillness: stable (diff {:.1})", sample.diff);
                            let event = LocalEvent::StillnessStable {
                                at: chrono::Utc::now(),
                            };
                            if events.send(AgentInput::Local(event)).is_err() {
                                return Ok(());
                            }
                        }
                        Observation::Motion(sample) => {
                            log::debug!(
                                "stillness: diff {:.1}{}",
                                sample.diff,
                                if sample.in_grace { " (grace)" } else { "" }
                            );
                        }
                        _ => {}
                    }
                }
            }
            std::thread::sleep(sample_interval);
        }
        Ok(())
    })?;

    let options = CoordinatorOptions {
        acknowledge_start: true,
        auto_start: settings.auto_start,
        exit_on_stop: config.exit_on_stop,
        fallback_start: settings.fallback_start,
        ..coordinator_options(config)
    };
    agent.run(options, move || AgentStatus {
        queue_len: ring.len(),
        ready: !ring.is_empty(),
    })
}

/// Camera -> Classifier -> DetectionStabilizer -> `yoloDetection`.
pub fn run_vision(
    config: &KioskConfig,
    transport: Arc<dyn HubTransport>,
    shutdown: Arc<AtomicBool>,
) -> Result<CoordinatorExit> {
    let settings = &config.vision;
    let mut classifier = build_classifier(settings)?;
    classifier
        .warm_up()
        .with_context(|| format!("{} classifier warm-up failed", classifier.name()))?;
    log::info!("vision: classifier '{}' ready", classifier.name());
    let capture = if settings.capture.enabled {
        Some(CaptureStore::new(&settings.capture)?)
    } else {
        None
    };
    let source = FrameSource::new(
        settings.camera.source_config(producer_restart_policy()),
        Arc::clone(&shutdown),
    )?;
    let ring = Arc::new(FrameRingBuffer::new(config.ring_depth));
    let mut stabilizer = DetectionStabilizer::new(StabilizerParams::from(settings));
    let loop_sleep = settings.loop_sleep;

    let mut agent = Agent::start(transport, config.hub.reconnect.clone(), Arc::clone(&shutdown))?;
    spawn_ingest(&mut agent, source, &ring)?;

    let commands = agent.subscribe();
    let events = agent.inputs.clone();
    let frames = Arc::clone(&ring);
    let stop = Arc::clone(&shutdown);
    let ready = Arc::new(AtomicBool::new(false));
    let loop_ready = Arc::clone(&ready);
    agent.spawn("vision-loop", move || {
        let mut capture = capture;
        let mut enabled = false;
        let mut last_seq = None;
        while !stop.load(Ordering::SeqCst) {
            loop {
                match commands.try_recv() {
                    Ok(GateCommand::Activate) => {
                        log::info!("vision: detection enabled");
                        enabled = true;
                        stabilizer.reset();
                    }
                    Ok(GateCommand::Deactivate) => {
                        log::info!("vision: detection paused");
                        enabled = false;
                    }
                    Ok(GateCommand::SessionEnd) => stabilizer.reset(),
                    Ok(_) => {}
                    Err(TryRecvError::Empty) => break,
                    Err(TryRecvError::Disconnected) => return Ok(()),
                }
            }
            let frame = if enabled { frames.latest_after(last_seq) } else { None };
            let Some(frame) = frame else {
                std::thread::sleep(loop_sleep);
                continue;
            };
            last_seq = Some(frame.seq);
            loop_ready.store(true, Ordering::Relaxed);

            let detections = match classifier.classify(&frame) {
                Ok(detections) => detections,
                Err(e) => {
                    log::warn!("vision: classifier failed on frame {}: {:#}", frame.seq, e);
                    std::thread::sleep(loop_sleep);
                    continue;
                }
            };
            if let Some(stable) = stabilizer.tick(&detections, frame.captured_at) {
                log::info!("vision: stable {} -> {}", stable.signature, stable.label);
                let img_path = capture.as_ref().and_then(|store| {
                    store.request(
                        frame,
                        detections,
                        &chrono::Local::now(),
                        &stable.label,
                        stable.count,
                        stable.confidence,
                    )
                });
                let event = stable.to_event(
                    img_path.map(|path| path.display().to_string()),
                    now_timestamp(),
                );
                if events.send(AgentInput::Local(LocalEvent::Detection(event))).is_err() {
                    break;
                }
            }
            std::thread::sleep(loop_sleep);
        }
        if let Some(store) = capture.as_mut() {
            store.close();
        }
        Ok(())
    })?;

    let options = CoordinatorOptions {
        acknowledge_start: true,
        auto_start: settings.auto_start,
        exit_on_stop: config.exit_on_stop,
        ..coordinator_options(config)
    };
    agent.run(options, move || AgentStatus {
        queue_len: ring.len(),
        ready: ready.load(Ordering::Relaxed),
    })
}
