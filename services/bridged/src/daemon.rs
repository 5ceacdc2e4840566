use crate::config::BridgeConfig;
use crate::engine::{Action, Engine, EngineOutput, StateHandle};
use crate::metrics::{self, CacheHandle, ExportCache};
use crate::mqtt;
use crate::pubsub::Publication;
use crate::runner::{ProcessEvent, Runner};
use crate::serial::{self, SerialCmd};
use crate::spool::{Spool, SpoolRecord};
use crate::state::RuntimeState;
use crate::watchdog::Watchdog;
use ferrite::logging::{self, Logger};
use rumqttc::v5::mqttbytes::v5::{ConnectReturnCode, Packet};
use rumqttc::v5::{AsyncClient, Event};
use std::cell::RefCell;
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::rc::Rc;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch, Notify};
use tokio::task::spawn_local;
use tokio_util::sync::CancellationToken;

/// Delay between a SET_BAUDRATE response frame and the device reconfigure,
/// mirroring the MCU side.
const BAUD_SWITCH_DELAY: Duration = Duration::from_millis(50);

/// Engine tick granularity; a quarter of the smallest valid ack timeout.
const TICK_INTERVAL: Duration = Duration::from_millis(25);

const MQTT_RECONNECT_DELAY: Duration = Duration::from_secs(5);

#[derive(Debug)]
pub enum DaemonError {
    /// Startup wiring failed (device, broker options, listen address).
    Setup(String),
    /// A supervised task died; the whole group was cancelled.
    TaskFailed(String),
}

impl std::fmt::Display for DaemonError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            DaemonError::Setup(detail) => write!(f, "setup failed: {}", detail),
            DaemonError::TaskFailed(detail) => write!(f, "supervised task failed: {}", detail),
        }
    }
}

/// Shared wiring every task uses to hand engine output to its consumers.
#[derive(Clone)]
struct Ctx {
    engine: Rc<RefCell<Engine>>,
    state: StateHandle,
    spool: Rc<RefCell<Spool>>,
    queue: Rc<RefCell<VecDeque<Publication>>>,
    queue_limit: usize,
    notify: Rc<Notify>,
    serial_tx: mpsc::UnboundedSender<SerialCmd>,
    runner: Rc<Runner>,
    connected: watch::Receiver<bool>,
    log: Logger,
}

impl Ctx {
    /// Route one engine step's output: bytes to the serial writer,
    /// publications to the queue or spool, actions to the runner.
    fn dispatch(&self, output: EngineOutput) {
        if !output.serial.is_empty() {
            let _ = self.serial_tx.send(SerialCmd::Write(output.serial));
        }

        for publication in output.publications {
            self.enqueue(publication);
        }

        for action in output.actions {
            match action {
                Action::SetBaudrate { baud } => {
                    // The response frame is already queued ahead of the
                    // switch; wait out the old baudrate before reconfiguring.
                    let serial_tx = self.serial_tx.clone();
                    spawn_local(async move {
                        tokio::time::sleep(BAUD_SWITCH_DELAY).await;
                        let _ = serial_tx.send(SerialCmd::SetBaud(baud));
                    });
                }
                action => self.runner.execute(action),
            }
        }
    }

    /// Bounded publish queue with drop-oldest overflow; disconnected
    /// publications go to the spool instead.
    fn enqueue(&self, publication: Publication) {
        if !*self.connected.borrow() {
            let record = to_record(&publication);
            let mut spool = self.spool.borrow_mut();
            if !spool.store(&record) {
                self.state.borrow_mut().mqtt_dropped_messages += 1;
            }
            sync_spool_state(&self.state, &spool);
            return;
        }

        {
            let mut queue = self.queue.borrow_mut();
            if queue.len() >= self.queue_limit {
                queue.pop_front();
                self.state.borrow_mut().mqtt_dropped_messages += 1;
            }
            queue.push_back(publication);
            self.state.borrow_mut().mqtt_queue_size = queue.len() as u64;
        }

        self.notify.notify_one();
    }
}

fn to_record(publication: &Publication) -> SpoolRecord {
    SpoolRecord {
        topic: publication.topic.clone(),
        payload: publication.payload.clone(),
        qos: 0,
        retain: publication.retain,
        response_topic: publication.correlation.response_topic.clone(),
        correlation_data: publication.correlation.correlation_data.clone(),
        user_properties: publication.properties.clone(),
    }
}

fn from_record(record: SpoolRecord) -> Publication {
    let mut publication = Publication::new(record.topic, record.payload);
    publication.retain = record.retain;
    publication.correlation.response_topic = record.response_topic;
    publication.correlation.correlation_data = record.correlation_data;
    publication.properties = record.user_properties;
    publication
}

fn sync_spool_state(state: &StateHandle, spool: &Spool) {
    let mut state = state.borrow_mut();
    state.mqtt_spool_enabled = !spool.is_degraded();
    state.mqtt_spool_degraded = spool.is_degraded();
    state.mqtt_spool_failure_reason = spool.failure_reason().to_string();
    state.mqtt_spooled_records = spool.len();
}

/// Runs the daemon until a fatal task error or a termination signal. Must
/// be awaited inside a `LocalSet` on a current-thread runtime.
pub async fn run(config: BridgeConfig, log: Logger) -> Result<(), DaemonError> {
    let state: StateHandle = Rc::new(RefCell::new(RuntimeState::new()));
    let engine = Rc::new(RefCell::new(Engine::new(&config, state.clone(), Some(&log))));

    let spool = Rc::new(RefCell::new(Spool::new(
        config.mqtt.spool_dir.clone(),
        Some(&log),
    )));
    sync_spool_state(&state, &spool.borrow());

    // Serial device and pump threads.
    let port = serial::open(&config.serial.port, config.serial.baud)
        .map_err(|error| DaemonError::Setup(format!("serial open: {}", error)))?;
    let serial_link = serial::start(port, &log)
        .map_err(|error| DaemonError::Setup(format!("serial clone: {}", error)))?;
    let mut serial_rx = serial_link.rx;
    let serial_tx = serial_link.tx;

    // Broker client and event loop.
    let client_id = format!("bridged-{}", std::process::id());
    let options = mqtt::build_options(&config.mqtt, &client_id).map_err(DaemonError::Setup)?;
    let (client, mut eventloop) = AsyncClient::new(options, 64);

    let (connected_tx, connected_rx) = watch::channel(false);
    let (fatal_tx, mut fatal_rx) = mpsc::channel::<String>(4);
    let (process_tx, mut process_rx) = mpsc::unbounded_channel::<ProcessEvent>();

    let runner = Rc::new(Runner::new(process_tx, Some(&log)));
    let cancel = CancellationToken::new();

    let ctx = Ctx {
        engine: engine.clone(),
        state: state.clone(),
        spool: spool.clone(),
        queue: Rc::new(RefCell::new(VecDeque::new())),
        queue_limit: config.mqtt.queue_limit,
        notify: Rc::new(Notify::new()),
        serial_tx: serial_tx.clone(),
        runner,
        connected: connected_rx.clone(),
        log: log.new(logging::o!()),
    };

    // Kick off the handshake towards the MCU.
    let initial = engine.borrow_mut().start(Instant::now());
    ctx.dispatch(initial);

    // 1. Serial RX -> parser -> link -> services.
    {
        let ctx = ctx.clone();
        let cancel = cancel.clone();
        let fatal = fatal_tx.clone();
        spawn_local(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    bytes = serial_rx.recv() => match bytes {
                        Some(bytes) => {
                            let output = ctx.engine.borrow_mut().handle_serial(&bytes, Instant::now());
                            ctx.dispatch(output);
                            // Explicit yield between byte batches.
                            tokio::task::yield_now().await;
                        }
                        None => {
                            let _ = fatal.send("serial reader stopped".to_string()).await;
                            return;
                        }
                    },
                }
            }
        });
    }

    // 2. Engine timer: ARQ timeouts, console pump, pending expiry.
    {
        let ctx = ctx.clone();
        let cancel = cancel.clone();
        spawn_local(async move {
            let mut ticker = tokio::time::interval(TICK_INTERVAL);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = ticker.tick() => {
                        let output = ctx.engine.borrow_mut().tick(Instant::now());
                        ctx.dispatch(output);
                    }
                }
            }
        });
    }

    // 3. MQTT inbound -> authorisation -> services.
    {
        let ctx = ctx.clone();
        let cancel = cancel.clone();
        let client = client.clone();
        let prefix = config.mqtt.topic_prefix.clone();
        let task_log = log.new(logging::o!());
        spawn_local(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    event = eventloop.poll() => match event {
                        Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                            if ack.code == ConnectReturnCode::Success {
                                logging::info!(task_log, "broker connected");
                                ctx.state.borrow_mut().mqtt_connected = true;
                                let _ = connected_tx.send(true);
                                // Subscriptions die with the clean session;
                                // renew on every (re)connect.
                                if let Err(error) = client
                                    .subscribe(mqtt::subscription(&prefix), mqtt::SUBSCRIBE_QOS)
                                    .await
                                {
                                    logging::warn!(task_log, "subscribe failed"; "error" => %error);
                                }
                            } else {
                                logging::warn!(task_log, "broker rejected connection";
                                               "code" => ?ack.code);
                            }
                        }
                        Ok(Event::Incoming(Packet::Publish(publish))) => {
                            if let Some(request) = mqtt::parse_incoming(
                                &prefix,
                                &publish.topic,
                                &publish.payload,
                                publish.properties.as_ref(),
                            ) {
                                let output = ctx
                                    .engine
                                    .borrow_mut()
                                    .handle_request(request, Instant::now());
                                ctx.dispatch(output);
                            }
                        }
                        Ok(_) => (),
                        Err(error) => {
                            logging::warn!(task_log, "broker connection lost";
                                           "error" => %error);
                            ctx.state.borrow_mut().mqtt_connected = false;
                            let _ = connected_tx.send(false);
                            tokio::select! {
                                _ = cancel.cancelled() => return,
                                _ = tokio::time::sleep(MQTT_RECONNECT_DELAY) => {}
                            }
                        }
                    },
                }
            }
        });
    }

    // 4. MQTT outbound publisher.
    {
        let ctx = ctx.clone();
        let cancel = cancel.clone();
        let client = client.clone();
        let prefix = config.mqtt.topic_prefix.clone();
        let task_log = log.new(logging::o!());
        spawn_local(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = ctx.notify.notified() => {}
                }

                loop {
                    let publication = {
                        let mut queue = ctx.queue.borrow_mut();
                        let publication = queue.pop_front();
                        ctx.state.borrow_mut().mqtt_queue_size = queue.len() as u64;
                        publication
                    };

                    let publication = match publication {
                        Some(publication) => publication,
                        None => break,
                    };

                    let topic = format!("{}{}", prefix, publication.topic);
                    let properties = mqtt::publish_properties(&publication);
                    if let Err(error) = client
                        .publish_with_properties(
                            topic,
                            mqtt::PUBLISH_QOS,
                            publication.retain,
                            publication.payload.clone(),
                            properties,
                        )
                        .await
                    {
                        logging::warn!(task_log, "publish failed";
                                       "topic" => &publication.topic,
                                       "error" => %error);
                        ctx.state.borrow_mut().mqtt_dropped_messages += 1;
                    }
                }
            }
        });
    }

    // 5. Spool drainer, active only while the broker is connected.
    {
        let ctx = ctx.clone();
        let cancel = cancel.clone();
        let mut connected = connected_rx.clone();
        spawn_local(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    changed = connected.changed() => {
                        if changed.is_err() {
                            return;
                        }
                    }
                }

                while *connected.borrow() {
                    let record = ctx.spool.borrow_mut().take_oldest();
                    match record {
                        Some(record) => {
                            ctx.enqueue(from_record(record));
                            tokio::task::yield_now().await;
                        }
                        None => break,
                    }
                }

                sync_spool_state(&ctx.state, &ctx.spool.borrow());
            }
        });
    }

    // 6. Status writer and snapshot republisher.
    {
        let ctx = ctx.clone();
        let cancel = cancel.clone();
        let snapshot_path = config.status.snapshot_path.clone();
        let snapshot_every = config.status.snapshot_interval_secs;
        let summary_every = config.status.bridge_summary_interval;
        let handshake_every = config.status.bridge_handshake_interval;
        let cache: CacheHandle = Arc::new(RwLock::new(ExportCache::default()));
        let task_log = log.new(logging::o!());

        // 7. Optional metrics endpoint, fed by the same cache.
        if config.metrics.enabled {
            let listen: SocketAddr = config
                .metrics
                .listen
                .parse()
                .map_err(|error| DaemonError::Setup(format!("metrics.listen: {}", error)))?;
            spawn_local(metrics::serve(listen, cache.clone(), cancel.clone()));
        }

        spawn_local(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(1));
            let mut elapsed: u64 = 0;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = ticker.tick() => {}
                }
                elapsed += 1;

                if elapsed % snapshot_every == 0 {
                    let (json, prometheus) = {
                        let mut state = ctx.state.borrow_mut();
                        let json = serde_json::to_string_pretty(&state.snapshot_json())
                            .unwrap_or_default();
                        (json, state.prometheus_text())
                    };

                    if let Ok(mut cache) = cache.write() {
                        cache.json = json;
                        cache.prometheus = prometheus;
                    }

                    if let Err(error) = ctx.state.borrow_mut().write_snapshot(&snapshot_path) {
                        logging::warn!(task_log, "snapshot write failed"; "error" => %error);
                    }
                }

                if elapsed % summary_every == 0 {
                    let output = ctx.engine.borrow_mut().publish_summary(Instant::now());
                    ctx.dispatch(output);
                }
                if elapsed % handshake_every == 0 {
                    let output = ctx.engine.borrow_mut().publish_handshake(Instant::now());
                    ctx.dispatch(output);
                }
            }
        });
    }

    // 8. Process runner feedback into the engine.
    {
        let ctx = ctx.clone();
        let cancel = cancel.clone();
        spawn_local(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    event = process_rx.recv() => match event {
                        Some(ProcessEvent::Output { pid, bytes }) => {
                            let output = ctx.engine.borrow_mut().process_output(pid, &bytes, Instant::now());
                            ctx.dispatch(output);
                        }
                        Some(ProcessEvent::Exited { pid, exit_code }) => {
                            let output = ctx.engine.borrow_mut().process_exited(pid, exit_code, Instant::now());
                            ctx.dispatch(output);
                        }
                        None => return,
                    },
                }
            }
        });
    }

    // 9. Watchdog keepalive.
    let watchdog = Watchdog::from_env();
    watchdog.notify_ready(&log);
    {
        let mut state = state.borrow_mut();
        state.watchdog_enabled = watchdog.enabled();
        state.watchdog_interval_ms = watchdog
            .interval()
            .map(|interval| interval.as_millis() as u64)
            .unwrap_or(0);
    }
    if let Some(every) = watchdog.kick_interval() {
        let ctx = ctx.clone();
        let cancel = cancel.clone();
        let fatal = fatal_tx.clone();
        let task_log = log.new(logging::o!());
        spawn_local(async move {
            let mut ticker = tokio::time::interval(every);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = ticker.tick() => {
                        if watchdog.kick(&task_log).is_err() {
                            let _ = fatal.send("watchdog keepalive failed".to_string()).await;
                            return;
                        }
                        ctx.state.borrow_mut().watchdog_last_heartbeat_ms =
                            ferrite::time::timestamp_millis();
                    }
                }
            }
        });
    }

    // Supervisor: the first fatal error cancels the whole group; a signal
    // shuts down cleanly.
    let result = tokio::select! {
        reason = fatal_rx.recv() => Err(DaemonError::TaskFailed(
            reason.unwrap_or_else(|| "unknown task failure".to_string()),
        )),
        signal = tokio::signal::ctrl_c() => match signal {
            Ok(()) => {
                logging::info!(log, "termination signal, shutting down");
                Ok(())
            }
            Err(error) => Err(DaemonError::Setup(format!("signal handler: {}", error))),
        },
    };

    cancel.cancel();
    let _ = serial_tx.send(SerialCmd::Shutdown);

    result
}
