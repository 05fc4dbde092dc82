//! The send worker: consumes one job queue and transmits PTP messages to the
//! subscribed clients.
//!
//! Each worker runs on its own thread and handles jobs strictly in order. A Sync
//! job is a two-step exchange: the Sync goes out on the event socket, the worker
//! fetches the transmit timestamp from the socket error queue and sends it in a
//! Follow-Up on the general socket. Announce and Delay-Response jobs are single
//! sends on the general socket.

use std::{
    net::SocketAddr,
    sync::{
        atomic::{AtomicI64, Ordering},
        Arc,
    },
    thread,
    time::Duration,
};

use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::sync::mpsc;

use crate::{
    client::{Job, SubscriptionClient},
    configuration::Configuration,
    protocol::{MessageType, Packet, PAYLOAD_SIZE_BYTES},
    stats::Stats,
    timestamp_mode::TimestampMode,
    transport::{Channel, TimestampBuffers, Transport, TransportError, UdpTransport},
};

/// Errors that stop a send worker.
#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("Worker {worker} setup failed: {source}")]
    Setup {
        worker: usize,
        source: TransportError,
    },
    #[error("Worker {worker} failed to send Delay-Response to {peer}: {source}")]
    DelayRespSend {
        worker: usize,
        peer: SocketAddr,
        source: TransportError,
    },
}

/// Errors from TX timestamp retrieval.
#[derive(Error, Debug)]
pub enum TimestampError {
    #[error("No TX timestamp after {attempts} attempts")]
    Exhausted { attempts: u32 },
    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Reads the TX timestamp of the datagram `sent` from the error queue.
///
/// Makes at most `max_attempts` non-blocking reads, sleeping `retry_delay` after
/// each read that found nothing. Reports that belong to another datagram are
/// dropped and count as attempts. Returns the outcome together with the number of
/// reads made, which equals `max_attempts` when the queue never produced a match.
pub fn read_tx_timestamp<T: Transport + ?Sized>(
    transport: &mut T,
    buffers: &mut TimestampBuffers,
    sent: &[u8],
    max_attempts: u32,
    retry_delay: Duration,
) -> (Result<DateTime<Utc>, TimestampError>, u32) {
    let mut attempts = 0;
    while attempts < max_attempts {
        attempts += 1;
        match transport.recv_tx_timestamp(buffers) {
            Ok(Some(report)) if report.matches(buffers, sent) => {
                return (Ok(report.timestamp), attempts);
            }
            Ok(Some(report)) => {
                log::trace!(
                    "Dropping TX timestamp {} of a previous packet",
                    report.timestamp
                );
            }
            Ok(None) => {
                if attempts < max_attempts && !retry_delay.is_zero() {
                    thread::sleep(retry_delay);
                }
            }
            Err(e) => return (Err(e.into()), attempts),
        }
    }
    (Err(TimestampError::Exhausted { attempts }), attempts)
}

/// A send worker bound to its queue and its pair of sockets.
pub struct SendWorker<T: Transport> {
    id: usize,
    queue: mpsc::Receiver<Job>,
    load: Arc<AtomicI64>,
    config: Arc<Configuration>,
    stats: Arc<dyn Stats>,
    transport: T,
    send_buf: Vec<u8>,
    ts_buffers: TimestampBuffers,
}

impl SendWorker<UdpTransport> {
    /// Opens the worker's sockets and enables TX timestamping.
    ///
    /// Fails without starting anything when a socket cannot be bound or
    /// timestamping cannot be enabled.
    pub fn start(
        id: usize,
        queue: mpsc::Receiver<Job>,
        load: Arc<AtomicI64>,
        config: Arc<Configuration>,
        stats: Arc<dyn Stats>,
    ) -> Result<Self, WorkerError> {
        let transport = UdpTransport::open(&config)
            .map_err(|source| WorkerError::Setup { worker: id, source })?;
        Ok(Self::with_transport(
            id, queue, load, config, stats, transport,
        ))
    }
}

impl<T: Transport> SendWorker<T> {
    /// Creates a worker over an already prepared transport.
    pub fn with_transport(
        id: usize,
        queue: mpsc::Receiver<Job>,
        load: Arc<AtomicI64>,
        config: Arc<Configuration>,
        stats: Arc<dyn Stats>,
        transport: T,
    ) -> Self {
        SendWorker {
            id,
            queue,
            load,
            config,
            stats,
            transport,
            send_buf: vec![0u8; PAYLOAD_SIZE_BYTES],
            ts_buffers: TimestampBuffers::new(),
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    /// Processes jobs until the queue is closed.
    ///
    /// Blocks the calling thread. Returns an error only when a Delay-Response could
    /// not be sent; jobs still queued at that point are left unprocessed. The
    /// sockets are closed when the worker is dropped on return.
    pub fn run(mut self) -> Result<(), WorkerError> {
        log::info!(
            "Send worker {} started ({} timestamps)",
            self.id,
            self.config.timestamp_type
        );
        while let Some(client) = self.queue.blocking_recv() {
            self.process(&client)?;
        }
        log::info!("Send worker {} stopped: queue closed", self.id);
        Ok(())
    }

    /// Handles one job and does the end-of-job bookkeeping.
    pub fn process(&mut self, client: &SubscriptionClient) -> Result<(), WorkerError> {
        match client.subscription() {
            MessageType::Sync => self.send_sync(client),
            MessageType::Announce => self.send_announce(client),
            MessageType::DelayResp => self.send_delay_resp(client)?,
            other => {
                log::error!(
                    "Worker {}: unknown subscription type {} for {}",
                    self.id,
                    other,
                    client.event_addr().ip()
                );
                return Ok(());
            }
        }

        client.advance_sequence();
        self.stats
            .set_max_worker_load(self.id, self.load.load(Ordering::Relaxed));
        self.stats
            .set_max_worker_queue(self.id, self.queue.len() as i64);
        Ok(())
    }

    fn send_sync(&mut self, client: &SubscriptionClient) {
        let sequence_id = client.sequence_id();
        let peer = client.event_addr();

        let sync = client.sync_packet(sequence_id);
        let n = match sync.write_to(&mut self.send_buf) {
            Ok(n) => n,
            Err(e) => {
                log::error!("Worker {}: failed to serialize Sync: {}", self.id, e);
                return;
            }
        };
        if let Err(e) = self
            .transport
            .send_to(Channel::Event, &self.send_buf[..n], peer)
        {
            log::error!("Worker {}: failed to send Sync: {}", self.id, e);
            return;
        }
        self.stats.inc_tx(MessageType::Sync);
        log::trace!("Worker {}: sent Sync {} to {}", self.id, sequence_id, peer);

        let (result, attempts) = read_tx_timestamp(
            &mut self.transport,
            &mut self.ts_buffers,
            &self.send_buf[..n],
            self.config.txts_attempts,
            self.config.txts_retry_delay(),
        );
        self.stats
            .set_max_tx_ts_attempts(self.id, i64::from(attempts));
        let mut tx_timestamp = match result {
            Ok(ts) => ts,
            Err(e) => {
                log::warn!(
                    "Worker {}: no TX timestamp for Sync {} to {}: {}",
                    self.id,
                    sequence_id,
                    peer,
                    e
                );
                return;
            }
        };
        if self.config.timestamp_type != TimestampMode::Hardware {
            tx_timestamp = tx_timestamp + self.config.utc_offset;
        }

        let followup = client.followup_packet(sequence_id, tx_timestamp);
        self.send_general(client, &followup, MessageType::FollowUp);
    }

    fn send_announce(&mut self, client: &SubscriptionClient) {
        let announce = client.announce_packet(client.sequence_id());
        self.send_general(client, &announce, MessageType::Announce);
    }

    fn send_general(
        &mut self,
        client: &SubscriptionClient,
        packet: &dyn Packet,
        message_type: MessageType,
    ) {
        let peer = client.general_addr();
        let n = match packet.write_to(&mut self.send_buf) {
            Ok(n) => n,
            Err(e) => {
                log::error!(
                    "Worker {}: failed to serialize {}: {}",
                    self.id,
                    message_type,
                    e
                );
                return;
            }
        };
        match self
            .transport
            .send_to(Channel::General, &self.send_buf[..n], peer)
        {
            Ok(()) => {
                self.stats.inc_tx(message_type);
                log::trace!("Worker {}: sent {} to {}", self.id, message_type, peer);
            }
            Err(e) => {
                log::error!("Worker {}: failed to send {}: {}", self.id, message_type, e);
            }
        }
    }

    fn send_delay_resp(&mut self, client: &SubscriptionClient) -> Result<(), WorkerError> {
        let peer = client.general_addr();
        let resp = client.delay_resp_packet();
        let n = match resp.write_to(&mut self.send_buf) {
            Ok(n) => n,
            Err(e) => {
                log::error!(
                    "Worker {}: failed to serialize Delay-Response: {}",
                    self.id,
                    e
                );
                return Ok(());
            }
        };
        self.transport
            .send_to(Channel::General, &self.send_buf[..n], peer)
            .map_err(|source| WorkerError::DelayRespSend {
                worker: self.id,
                peer,
                source,
            })?;
        self.stats.inc_tx(MessageType::DelayResp);
        log::trace!(
            "Worker {}: sent Delay-Response {} to {}",
            self.id,
            resp.header.sequence_id,
            peer
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        client::GrandmasterProfile,
        configuration::Parser,
        protocol::{ClockQuality, FollowUp, Header, PortIdentity},
        stats::WorkerStats,
        transport::TxTimestamp,
    };
    use std::{
        collections::VecDeque,
        io,
        net::{IpAddr, Ipv4Addr},
        sync::Mutex,
    };

    #[derive(Debug, Clone, PartialEq)]
    struct Datagram {
        channel: Channel,
        bytes: Vec<u8>,
        peer: SocketAddr,
    }

    enum Report {
        /// Timestamp whose echo is the last datagram sent on the event channel.
        Matching(DateTime<Utc>),
        /// Timestamp of some earlier packet.
        Stale(DateTime<Utc>),
    }

    #[derive(Default)]
    struct MockTransport {
        sent: Arc<Mutex<Vec<Datagram>>>,
        reports: VecDeque<Report>,
        reads: u32,
        fail_channel: Option<Channel>,
    }

    impl MockTransport {
        fn with_reports(reports: Vec<Report>) -> Self {
            MockTransport {
                reports: reports.into(),
                ..Default::default()
            }
        }

        fn failing(channel: Channel) -> Self {
            MockTransport {
                fail_channel: Some(channel),
                ..Default::default()
            }
        }

        fn sent(&self) -> Vec<Datagram> {
            self.sent.lock().unwrap().clone()
        }
    }

    impl Transport for MockTransport {
        fn send_to(
            &mut self,
            channel: Channel,
            buf: &[u8],
            peer: SocketAddr,
        ) -> Result<(), TransportError> {
            if self.fail_channel == Some(channel) {
                return Err(TransportError::Send {
                    peer,
                    source: io::Error::new(io::ErrorKind::Other, "network unreachable"),
                });
            }
            self.sent.lock().unwrap().push(Datagram {
                channel,
                bytes: buf.to_vec(),
                peer,
            });
            Ok(())
        }

        fn recv_tx_timestamp(
            &mut self,
            buffers: &mut TimestampBuffers,
        ) -> Result<Option<TxTimestamp>, TransportError> {
            self.reads += 1;
            let (timestamp, echo) = match self.reports.pop_front() {
                None => return Ok(None),
                Some(Report::Matching(ts)) => {
                    let last = self
                        .sent
                        .lock()
                        .unwrap()
                        .iter()
                        .rev()
                        .find(|d| d.channel == Channel::Event)
                        .map(|d| d.bytes.clone())
                        .unwrap_or_default();
                    let mut echo = vec![0x45; 42];
                    echo.extend_from_slice(&last);
                    (ts, echo)
                }
                Some(Report::Stale(ts)) => (ts, vec![0xde, 0xad, 0xbe, 0xef]),
            };
            buffers.echo[..echo.len()].copy_from_slice(&echo);
            Ok(Some(TxTimestamp {
                timestamp,
                echoed: echo.len(),
            }))
        }
    }

    fn config(args: &[&str]) -> Arc<Configuration> {
        let mut argv = vec!["ptp4u-tx", "--txts-attempts", "5", "--txts-retry-delay-us", "0"];
        argv.extend_from_slice(args);
        Arc::new(Configuration::parse_from(argv))
    }

    fn profile() -> Arc<GrandmasterProfile> {
        Arc::new(GrandmasterProfile {
            port_identity: PortIdentity {
                clock_identity: 0x0c42_a1ff_fe6d_7ca6,
                port_number: 1,
            },
            domain_number: 0,
            current_utc_offset: 37,
            priority1: 128,
            priority2: 128,
            clock_quality: ClockQuality {
                clock_class: 6,
                clock_accuracy: 0x21,
                offset_scaled_log_variance: 0x4e5d,
            },
            time_source: 0x20,
        })
    }

    fn client(subscription: MessageType, sequence_id: u16) -> Job {
        Arc::new(
            SubscriptionClient::for_ip(
                subscription,
                IpAddr::V4(Ipv4Addr::new(10, 0, 0, 5)),
                Duration::from_secs(1),
                profile(),
            )
            .with_sequence_id(sequence_id),
        )
    }

    fn stamp() -> DateTime<Utc> {
        DateTime::<Utc>::from_timestamp(1_700_000_000, 123_456_789).unwrap()
    }

    struct Harness {
        worker: SendWorker<MockTransport>,
        stats: Arc<WorkerStats>,
        queue: mpsc::Sender<Job>,
    }

    fn harness(conf: Arc<Configuration>, transport: MockTransport) -> Harness {
        let (queue, rx) = mpsc::channel(16);
        let stats = Arc::new(WorkerStats::new(1));
        let worker = SendWorker::with_transport(
            0,
            rx,
            Arc::new(AtomicI64::new(3)),
            conf,
            stats.clone(),
            transport,
        );
        Harness {
            worker,
            stats,
            queue,
        }
    }

    #[test]
    fn test_hardware_sync_sends_followup_with_tx_timestamp() {
        let mut h = harness(
            config(&[]),
            MockTransport::with_reports(vec![Report::Matching(stamp())]),
        );
        let c = client(MessageType::Sync, 41);

        h.worker.process(&c).unwrap();

        let sent = h.worker.transport.sent();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0].channel, Channel::Event);
        assert_eq!(sent[0].peer, "10.0.0.5:319".parse::<SocketAddr>().unwrap());
        let sync = Header::from_bytes(&sent[0].bytes).unwrap();
        assert_eq!(sync.message_type, MessageType::Sync);
        assert_eq!(sync.sequence_id, 41);

        assert_eq!(sent[1].channel, Channel::General);
        assert_eq!(sent[1].peer, "10.0.0.5:320".parse::<SocketAddr>().unwrap());
        let followup = FollowUp::from_bytes(&sent[1].bytes).unwrap();
        assert_eq!(followup.header.sequence_id, 41);
        assert_eq!(followup.precise_origin_timestamp.to_datetime().unwrap(), stamp());

        assert_eq!(c.sequence_id(), 42);
        let snap = h.stats.snapshot();
        assert_eq!(snap.tx_sync, 1);
        assert_eq!(snap.tx_follow_up, 1);
        assert_eq!(snap.workers[0].max_tx_ts_attempts, 1);
        assert_eq!(snap.workers[0].max_load, 3);
    }

    #[test]
    fn test_software_timestamp_gets_offset() {
        let mut h = harness(
            config(&["--timestamp-type", "software", "--utc-offset", "37ms"]),
            MockTransport::with_reports(vec![Report::Matching(stamp())]),
        );
        let c = client(MessageType::Sync, 7);

        h.worker.process(&c).unwrap();

        let sent = h.worker.transport.sent();
        let followup = FollowUp::from_bytes(&sent[1].bytes).unwrap();
        assert_eq!(
            followup.precise_origin_timestamp.to_datetime().unwrap(),
            stamp() + chrono::Duration::milliseconds(37)
        );
    }

    #[test]
    fn test_hardware_timestamp_is_not_offset() {
        let mut h = harness(
            config(&["--utc-offset", "37ms"]),
            MockTransport::with_reports(vec![Report::Matching(stamp())]),
        );
        let c = client(MessageType::Sync, 7);

        h.worker.process(&c).unwrap();

        let followup = FollowUp::from_bytes(&h.worker.transport.sent()[1].bytes).unwrap();
        assert_eq!(followup.precise_origin_timestamp.to_datetime().unwrap(), stamp());
    }

    #[test]
    fn test_exhausted_retrieval_skips_followup() {
        let mut h = harness(config(&[]), MockTransport::default());
        let c = client(MessageType::Sync, 41);

        h.worker.process(&c).unwrap();

        assert_eq!(h.worker.transport.sent().len(), 1);
        assert_eq!(h.worker.transport.reads, 5);
        assert_eq!(c.sequence_id(), 42);
        let snap = h.stats.snapshot();
        assert_eq!(snap.workers[0].max_tx_ts_attempts, 5);
        assert_eq!(snap.tx_sync, 1);
        assert_eq!(snap.tx_follow_up, 0);
    }

    #[test]
    fn test_stale_reports_are_skipped() {
        let mut h = harness(
            config(&[]),
            MockTransport::with_reports(vec![
                Report::Stale(stamp() - chrono::Duration::seconds(1)),
                Report::Stale(stamp() - chrono::Duration::seconds(1)),
                Report::Matching(stamp()),
            ]),
        );
        let c = client(MessageType::Sync, 1);

        h.worker.process(&c).unwrap();

        let followup = FollowUp::from_bytes(&h.worker.transport.sent()[1].bytes).unwrap();
        assert_eq!(followup.precise_origin_timestamp.to_datetime().unwrap(), stamp());
        assert_eq!(h.stats.snapshot().workers[0].max_tx_ts_attempts, 3);
    }

    #[test]
    fn test_sync_send_failure_skips_followup() {
        let mut h = harness(config(&[]), MockTransport::failing(Channel::Event));
        let c = client(MessageType::Sync, 10);

        h.worker.process(&c).unwrap();

        assert!(h.worker.transport.sent().is_empty());
        assert_eq!(h.worker.transport.reads, 0);
        assert_eq!(c.sequence_id(), 11);
        let snap = h.stats.snapshot();
        assert_eq!(snap.tx_sync, 0);
        assert_eq!(snap.workers[0].max_load, 3);
    }

    #[test]
    fn test_followup_send_failure_completes_job() {
        let transport = MockTransport {
            fail_channel: Some(Channel::General),
            ..MockTransport::with_reports(vec![Report::Matching(stamp())])
        };
        let mut h = harness(config(&[]), transport);
        h.queue.try_send(client(MessageType::Announce, 0)).unwrap();
        let c = client(MessageType::Sync, 41);

        h.worker.process(&c).unwrap();

        let sent = h.worker.transport.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].channel, Channel::Event);
        assert_eq!(c.sequence_id(), 42);
        let snap = h.stats.snapshot();
        assert_eq!(snap.tx_sync, 1);
        assert_eq!(snap.tx_follow_up, 0);
        assert_eq!(snap.workers[0].max_tx_ts_attempts, 1);
        assert_eq!(snap.workers[0].max_load, 3);
        assert_eq!(snap.workers[0].max_queue, 1);
    }

    #[test]
    fn test_announce_failure_still_advances_sequence() {
        let mut h = harness(config(&[]), MockTransport::failing(Channel::General));
        let c = client(MessageType::Announce, u16::MAX);

        h.worker.process(&c).unwrap();

        assert_eq!(c.sequence_id(), 0);
        let snap = h.stats.snapshot();
        assert_eq!(snap.tx_announce, 0);
        assert_eq!(snap.workers[0].max_load, 3);
    }

    #[test]
    fn test_announce_sent_on_general_channel() {
        let mut h = harness(config(&[]), MockTransport::default());
        let c = client(MessageType::Announce, 5);

        h.worker.process(&c).unwrap();

        let sent = h.worker.transport.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].channel, Channel::General);
        let header = Header::from_bytes(&sent[0].bytes).unwrap();
        assert_eq!(header.message_type, MessageType::Announce);
        assert_eq!(header.sequence_id, 5);
        assert_eq!(h.stats.snapshot().tx_announce, 1);
    }

    #[test]
    fn test_unknown_subscription_is_skipped() {
        let mut h = harness(config(&[]), MockTransport::default());
        let c = client(MessageType::Signaling, 3);

        h.worker.process(&c).unwrap();

        assert!(h.worker.transport.sent().is_empty());
        assert_eq!(c.sequence_id(), 3);
        assert_eq!(h.stats.snapshot().workers[0].max_load, 0);
    }

    #[test]
    fn test_queue_depth_is_reported() {
        let mut h = harness(config(&[]), MockTransport::default());
        let c = client(MessageType::Announce, 0);
        h.queue.try_send(client(MessageType::Announce, 0)).unwrap();
        h.queue.try_send(client(MessageType::Announce, 0)).unwrap();

        h.worker.process(&c).unwrap();

        assert_eq!(h.stats.snapshot().workers[0].max_queue, 2);
    }

    #[test]
    fn test_delay_resp_failure_stops_worker() {
        let transport = MockTransport::failing(Channel::General);
        let sent = transport.sent.clone();
        let h = harness(config(&[]), transport);
        let failing = client(MessageType::DelayResp, 0);
        let later = client(MessageType::Sync, 9);
        h.queue.try_send(failing.clone()).unwrap();
        h.queue.try_send(later.clone()).unwrap();
        drop(h.queue);

        let result = h.worker.run();

        assert!(matches!(result, Err(WorkerError::DelayRespSend { .. })));
        assert!(sent.lock().unwrap().is_empty());
        assert_eq!(failing.sequence_id(), 0);
        assert_eq!(later.sequence_id(), 9);
    }

    #[test]
    fn test_run_drains_queue_until_closed() {
        let transport = MockTransport::default();
        let sent = transport.sent.clone();
        let h = harness(config(&[]), transport);
        let announce = client(MessageType::Announce, 0);
        let resp = client(MessageType::DelayResp, 0);
        h.queue.try_send(announce.clone()).unwrap();
        h.queue.try_send(resp.clone()).unwrap();
        drop(h.queue);

        h.worker.run().unwrap();

        assert_eq!(sent.lock().unwrap().len(), 2);
        assert_eq!(announce.sequence_id(), 1);
        assert_eq!(resp.sequence_id(), 1);
        assert_eq!(h.stats.snapshot().tx_delay_resp, 1);
    }

    #[test]
    fn test_read_tx_timestamp_reports_transport_error() {
        struct Broken;
        impl Transport for Broken {
            fn send_to(&mut self, _: Channel, _: &[u8], _: SocketAddr) -> Result<(), TransportError> {
                Ok(())
            }
            fn recv_tx_timestamp(
                &mut self,
                _: &mut TimestampBuffers,
            ) -> Result<Option<TxTimestamp>, TransportError> {
                Err(TransportError::ErrorQueue(io::Error::from_raw_os_error(9)))
            }
        }

        let mut buffers = TimestampBuffers::new();
        let (result, attempts) =
            read_tx_timestamp(&mut Broken, &mut buffers, &[1, 2, 3], 10, Duration::ZERO);
        assert!(matches!(result, Err(TimestampError::Transport(_))));
        assert_eq!(attempts, 1);
    }
}
