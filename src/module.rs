use crate::channel::{Channel, ChannelState};
use crate::error::{PslError, Result};
use crate::sinc::{Message, MessageType, Payload, MODULE_CHANNEL};
use crate::transport::{FrameReader, Transport};
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use log::{debug, error, info, warn};
use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

const WORKER_JOIN_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Timeouts {
    /// Reply to a single command.
    pub request: Duration,
    /// Channel reaching a commanded state.
    pub channel_state: Duration,
    /// Oscilloscope frame after `adc_trace` was started.
    pub adc_trace: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            request: Duration::from_secs(10),
            channel_state: Duration::from_secs(10),
            adc_trace: Duration::from_secs(10),
        }
    }
}

/// Where a transaction expects its reply from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ReplyFilter {
    /// `MODULE_CHANNEL` matches any channel.
    pub channel: i32,
    /// `None` matches any reply type.
    pub kind: Option<MessageType>,
}

impl ReplyFilter {
    pub fn new(channel: i32, kind: MessageType) -> Self {
        Self {
            channel,
            kind: Some(kind),
        }
    }

    pub fn matches(&self, message: &Message) -> bool {
        let channel = self.channel == MODULE_CHANNEL || self.channel == message.channel;
        let kind = match self.kind {
            None => true,
            Some(kind) if kind == message.message_type() => true,
            // A failed command is answered with a bare SUCCESS carrying the error.
            Some(_) => matches!(&message.payload, Payload::Success(s) if s.error_code != 0),
        };
        channel && kind
    }
}

struct Pending {
    filter: ReplyFilter,
    reply: Sender<Result<Message>>,
}

#[derive(Default)]
struct RouterState {
    pending: Option<Pending>,
    active: Vec<bool>,
    connected: bool,
}

struct Router {
    alias: String,
    state: Mutex<RouterState>,
    channels: Vec<Arc<Channel>>,
}

impl Router {
    fn lock(&self) -> Result<MutexGuard<'_, RouterState>> {
        Ok(self.state.lock()?)
    }

    fn dispatch(&self, message: Message) -> Result<()> {
        let kind = message.message_type();
        if kind.is_reply() {
            let mut state = self.lock()?;
            let matched = state
                .pending
                .as_ref()
                .is_some_and(|pending| pending.filter.matches(&message));
            if matched {
                if let Some(pending) = state.pending.take() {
                    // The caller may already have timed out and gone.
                    let _ = pending.reply.send(Ok(message));
                }
            } else {
                warn!(
                    "{}: unexpected {kind:?} for channel {} dropped",
                    self.alias, message.channel
                );
            }
            return Ok(());
        }
        if kind.is_request() {
            warn!("{}: device sent a {kind:?} request; ignored", self.alias);
            return Ok(());
        }

        let channel = {
            let state = self.lock()?;
            let index = message.channel;
            let active = usize::try_from(index)
                .ok()
                .and_then(|i| state.active.get(i).copied())
                .unwrap_or(false);
            if !active {
                debug!(
                    "{}: {kind:?} for inactive channel {index} dropped",
                    self.alias
                );
                return Ok(());
            }
            Arc::clone(&self.channels[index as usize])
        };

        match message.payload {
            Payload::ParamUpdated(params) => {
                for param in params {
                    if param.key != "channel.state" {
                        debug!(
                            "{}: channel {} {} = {}",
                            self.alias, channel.index, param.key, param.value
                        );
                        continue;
                    }
                    match param.value.as_str().and_then(ChannelState::from_device) {
                        Some(state) => channel.apply_state(state)?,
                        None => warn!(
                            "{}: channel {} reported unknown state '{}'",
                            self.alias, channel.index, param.value
                        ),
                    }
                }
            }
            Payload::HistogramData(data) => channel.on_histogram(&data)?,
            Payload::OscilloscopeData(data) => channel.on_oscilloscope(data)?,
            Payload::CalibrationProgress(progress) => channel.on_progress(progress)?,
            Payload::AsyncError(status) => error!(
                "{}: channel {} error {}: {}",
                self.alias, channel.index, status.error_code, status.message
            ),
            other => warn!(
                "{}: unhandled {:?} for channel {}",
                self.alias,
                other.message_type(),
                channel.index
            ),
        }
        Ok(())
    }

    fn fail(&self, err: PslError) {
        match self.state.lock() {
            Ok(mut state) => {
                state.connected = false;
                match state.pending.take() {
                    Some(pending) => {
                        let _ = pending.reply.send(Err(err));
                    }
                    None => debug!("{}: no caller waiting on failed link: {err}", self.alias),
                }
            }
            Err(_) => error!("{}: router lock poisoned while failing: {err}", self.alias),
        }
    }
}

fn receive_loop(mut reader: FrameReader, router: Arc<Router>, shutdown: Arc<AtomicBool>) {
    debug!("{}: receive worker started", router.alias);
    while !shutdown.load(Ordering::SeqCst) {
        let message = match reader.read_message() {
            Ok(Some(message)) => message,
            Ok(None) => continue,
            Err(PslError::Decode(e)) => {
                warn!("{}: dropped undecodable frame: {e}", router.alias);
                continue;
            }
            Err(e) => {
                if !shutdown.load(Ordering::SeqCst) {
                    error!("{}: receive failed: {e}", router.alias);
                }
                router.fail(e);
                break;
            }
        };
        if let Err(e) = router.dispatch(message) {
            error!("{}: dispatch failed: {e}", router.alias);
        }
    }
    debug!("{}: receive worker stopped", router.alias);
}

/// An outstanding command. Holds the send-lock until ended or dropped.
pub struct Transaction<'a> {
    module: &'a Module,
    reply: Receiver<Result<Message>>,
    what: &'static str,
    _send: MutexGuard<'a, ()>,
}

impl Transaction<'_> {
    /// Wait for the reply.
    pub fn wait(&self) -> Result<Message> {
        match self.reply.recv_timeout(self.module.timeouts.request) {
            Ok(reply) => reply,
            Err(RecvTimeoutError::Timeout) => Err(PslError::TransactionTimeout(self.what)),
            Err(RecvTimeoutError::Disconnected) => {
                Err(PslError::NotConnected(self.module.alias.clone()))
            }
        }
    }

    /// Release the send-lock so the next command may go out.
    pub fn end(self) {}
}

impl Drop for Transaction<'_> {
    fn drop(&mut self) {
        if let Ok(mut state) = self.module.router.state.lock() {
            state.pending = None;
        }
    }
}

fn command_name(kind: MessageType) -> &'static str {
    match kind {
        MessageType::Ping => "ping",
        MessageType::GetParam => "get-param",
        MessageType::SetParam => "set-param",
        MessageType::StartCalibration => "start-calibration",
        MessageType::GetCalibration => "get-calibration",
        MessageType::SetCalibration => "set-calibration",
        MessageType::CalculateDcOffset => "calculate-dc-offset",
        MessageType::StartOscilloscope => "start-oscilloscope",
        MessageType::StartHistogram => "start-histogram",
        MessageType::StartListMode => "start-list-mode",
        MessageType::StopDataAcquisition => "stop-data-acquisition",
        MessageType::ListParamDetails => "list-param-details",
        MessageType::CheckParamConsistency => "check-param-consistency",
        _ => "reply",
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChannelSpec {
    pub det_chan: i32,
    pub alias: String,
}

pub struct Module {
    pub alias: String,
    transport: Transport,
    send_lock: Mutex<()>,
    router: Arc<Router>,
    shutdown: Arc<AtomicBool>,
    worker: Mutex<Option<JoinHandle<()>>>,
    run_number: AtomicU16,
    pub timeouts: Timeouts,
}

impl Module {
    /// Connect and start the receive worker. Channels start out inactive.
    pub fn connect(
        alias: &str,
        host: &str,
        port: u16,
        timeouts: Timeouts,
        channels: &[ChannelSpec],
    ) -> Result<Self> {
        let transport = Transport::connect(host, port, timeouts.request)?;
        let reader = transport.reader()?;
        let channels: Vec<Arc<Channel>> = channels
            .iter()
            .enumerate()
            .map(|(index, spec)| Arc::new(Channel::new(index as i32, spec.det_chan, &spec.alias)))
            .collect();
        let router = Arc::new(Router {
            alias: alias.to_string(),
            state: Mutex::new(RouterState {
                pending: None,
                active: vec![false; channels.len()],
                connected: true,
            }),
            channels,
        });
        let shutdown = Arc::new(AtomicBool::new(false));
        let worker = {
            let router = Arc::clone(&router);
            let shutdown = Arc::clone(&shutdown);
            thread::Builder::new()
                .name(format!("{alias}-rx"))
                .spawn(move || receive_loop(reader, router, shutdown))
                .map_err(|e| PslError::Thread(format!("cannot start receive worker: {e}")))?
        };
        info!("module '{alias}' connected to {host}:{port}");
        Ok(Self {
            alias: alias.to_string(),
            transport,
            send_lock: Mutex::new(()),
            router,
            shutdown,
            worker: Mutex::new(Some(worker)),
            run_number: AtomicU16::new(0),
            timeouts,
        })
    }

    pub fn host(&self) -> &str {
        self.transport.host()
    }

    pub fn port(&self) -> u16 {
        self.transport.port()
    }

    pub fn channels(&self) -> &[Arc<Channel>] {
        &self.router.channels
    }

    pub fn channel(&self, index: i32) -> Result<&Arc<Channel>> {
        usize::try_from(index)
            .ok()
            .and_then(|i| self.router.channels.get(i))
            .ok_or(PslError::UnknownChannel(index))
    }

    pub fn is_connected(&self) -> bool {
        self.router.lock().map(|s| s.connected).unwrap_or(false)
    }

    /// Route async frames for `index` to its channel, or stop doing so.
    pub fn set_active(&self, index: i32, active: bool) -> Result<()> {
        let mut state = self.router.lock()?;
        let slot = usize::try_from(index)
            .ok()
            .and_then(|i| state.active.get_mut(i))
            .ok_or(PslError::UnknownChannel(index))?;
        *slot = active;
        Ok(())
    }

    pub fn is_active(&self, index: i32) -> bool {
        self.router
            .lock()
            .ok()
            .and_then(|s| usize::try_from(index).ok().and_then(|i| s.active.get(i).copied()))
            .unwrap_or(false)
    }

    pub fn active_channels(&self) -> Vec<Arc<Channel>> {
        self.channels()
            .iter()
            .filter(|c| self.is_active(c.index))
            .cloned()
            .collect()
    }

    pub fn run_number(&self) -> u16 {
        self.run_number.load(Ordering::SeqCst)
    }

    pub(crate) fn next_run(&self) {
        self.run_number.fetch_add(1, Ordering::SeqCst);
    }

    /// Send a command and register for its reply.
    pub fn begin(&self, channel: i32, payload: Payload, expect: MessageType) -> Result<Transaction> {
        let send = self.send_lock.lock()?;
        let what = command_name(payload.message_type());
        let (tx, rx) = bounded(1);
        {
            let mut state = self.router.lock()?;
            if !state.connected {
                return Err(PslError::NotConnected(self.alias.clone()));
            }
            state.pending = Some(Pending {
                filter: ReplyFilter::new(channel, expect),
                reply: tx,
            });
        }
        let transaction = Transaction {
            module: self,
            reply: rx,
            what,
            _send: send,
        };
        self.transport.send(&Message::new(channel, payload))?;
        Ok(transaction)
    }

    /// One complete round-trip. Fails on a non-zero device status.
    pub fn request(&self, channel: i32, payload: Payload, expect: MessageType) -> Result<Payload> {
        let transaction = self.begin(channel, payload, expect)?;
        let reply = transaction.wait()?;
        transaction.end();
        if let Some(status) = reply.payload.status() {
            if status.error_code != 0 {
                return Err(PslError::Device {
                    code: status.error_code,
                    message: status.message.clone(),
                });
            }
        }
        Ok(reply.payload)
    }

    /// A command answered by a plain SUCCESS.
    pub fn command(&self, channel: i32, payload: Payload) -> Result<()> {
        self.request(channel, payload, MessageType::Success)?;
        Ok(())
    }

    pub fn ping(&self) -> Result<()> {
        self.command(MODULE_CHANNEL, Payload::Ping)
    }

    /// Stop the receive worker and close the connection.
    pub fn shutdown(&self) -> Result<()> {
        self.shutdown.store(true, Ordering::SeqCst);
        let worker = self.worker.lock()?.take();
        if let Some(worker) = worker {
            let start = Instant::now();
            while !worker.is_finished() && start.elapsed() < WORKER_JOIN_TIMEOUT {
                thread::sleep(Duration::from_millis(10));
            }
            if worker.is_finished() {
                if worker.join().is_err() {
                    error!("{}: receive worker panicked", self.alias);
                }
            } else {
                warn!("{}: receive worker did not stop in time", self.alias);
            }
        }
        self.router.lock()?.connected = false;
        self.transport.disconnect()?;
        info!("module '{}' shut down", self.alias);
        Ok(())
    }
}

impl Drop for Module {
    fn drop(&mut self) {
        let running = self.worker.lock().map(|w| w.is_some()).unwrap_or(false);
        if running {
            if let Err(e) = self.shutdown() {
                warn!("{}: shutdown failed: {e}", self.alias);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sinc::{self, KeyValue, ParamValue, Status};
    use std::io::Write;
    use std::net::{TcpListener, TcpStream};

    fn module_with_peer(channels: usize) -> (Module, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let specs: Vec<ChannelSpec> = (0..channels)
            .map(|i| ChannelSpec {
                det_chan: i as i32,
                alias: format!("det{i}"),
            })
            .collect();
        let timeouts = Timeouts {
            request: Duration::from_millis(500),
            ..Default::default()
        };
        let module = Module::connect("test", "127.0.0.1", port, timeouts, &specs).unwrap();
        let (peer, _) = listener.accept().unwrap();
        (module, peer)
    }

    fn reply(peer: &mut TcpStream, message: Message) {
        peer.write_all(&sinc::encode(&message).unwrap()).unwrap();
    }

    #[test]
    fn filter_wildcards() {
        let ok = Message::new(3, Payload::Success(Status::default()));
        assert!(ReplyFilter::new(3, MessageType::Success).matches(&ok));
        assert!(ReplyFilter::new(MODULE_CHANNEL, MessageType::Success).matches(&ok));
        assert!(!ReplyFilter::new(2, MessageType::Success).matches(&ok));
        assert!(!ReplyFilter::new(3, MessageType::GetParamResponse).matches(&ok));
        let any = ReplyFilter {
            channel: 3,
            kind: None,
        };
        assert!(any.matches(&ok));

        let failed = Message::new(
            3,
            Payload::Success(Status {
                error_code: 4,
                message: "bad key".into(),
            }),
        );
        assert!(ReplyFilter::new(3, MessageType::GetParamResponse).matches(&failed));
    }

    #[test]
    fn reply_reaches_the_caller_and_mismatch_is_dropped() {
        let (module, mut peer) = module_with_peer(1);
        let handle = thread::spawn(move || {
            let mut reader =
                FrameReader::new(peer.try_clone().unwrap(), Duration::from_millis(100), Duration::from_secs(1))
                    .unwrap();
            let request = loop {
                if let Some(m) = reader.read_message().unwrap() {
                    break m;
                }
            };
            assert_eq!(request.message_type(), MessageType::GetParam);
            // Wrong channel first; the router must drop it.
            reply(
                &mut peer,
                Message::new(5, Payload::Success(Status::default())),
            );
            reply(
                &mut peer,
                Message::new(
                    0,
                    Payload::GetParamResponse {
                        status: Status::default(),
                        results: vec![KeyValue::new("afe.dacGain", ParamValue::Float(1.5))],
                    },
                ),
            );
            peer
        });
        let payload = module
            .request(
                0,
                Payload::GetParam(vec!["afe.dacGain".into()]),
                MessageType::GetParamResponse,
            )
            .unwrap();
        let _peer = handle.join().unwrap();
        match payload {
            Payload::GetParamResponse { results, .. } => {
                assert_eq!(results[0].value, ParamValue::Float(1.5))
            }
            other => panic!("unexpected {other:?}"),
        }
        module.shutdown().unwrap();
    }

    #[test]
    fn device_error_code_fails_the_request() {
        let (module, mut peer) = module_with_peer(1);
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            reply(
                &mut peer,
                Message::new(
                    0,
                    Payload::Success(Status {
                        error_code: 7,
                        message: "nope".into(),
                    }),
                ),
            );
            peer
        });
        let err = module
            .command(0, Payload::StartHistogram)
            .unwrap_err();
        let _peer = handle.join().unwrap();
        assert!(matches!(err, PslError::Device { code: 7, .. }));
    }

    #[test]
    fn silent_device_times_out() {
        let (module, _peer) = module_with_peer(1);
        let err = module.ping().unwrap_err();
        assert!(matches!(err, PslError::TransactionTimeout("ping")));
        // The send-lock was released.
        assert!(matches!(
            module.ping().unwrap_err(),
            PslError::TransactionTimeout(_)
        ));
    }

    #[test]
    fn lost_connection_fails_waiting_caller() {
        let (module, peer) = module_with_peer(1);
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            drop(peer);
        });
        let err = module.ping().unwrap_err();
        handle.join().unwrap();
        assert!(matches!(err, PslError::Io(_) | PslError::NotConnected(_)));
        assert!(!module.is_connected());
        assert!(matches!(module.ping(), Err(PslError::NotConnected(_))));
    }

    #[test]
    fn async_frames_reach_active_channels_only() {
        let (module, mut peer) = module_with_peer(2);
        module.set_active(1, true).unwrap();
        let state = |value: &str| {
            Payload::ParamUpdated(vec![KeyValue::new(
                "channel.state",
                ParamValue::Option(value.into()),
            )])
        };
        reply(&mut peer, Message::new(0, state("histogram")));
        reply(&mut peer, Message::new(1, state("histogram")));
        let channel = module.channel(1).unwrap();
        let mark = 0;
        channel
            .wait_for_state(ChannelState::Histogram, mark, Duration::from_secs(2))
            .unwrap();
        assert_eq!(
            module.channel(0).unwrap().state().unwrap(),
            ChannelState::Disconnected
        );
        assert!(matches!(module.channel(2), Err(PslError::UnknownChannel(2))));
    }
}
