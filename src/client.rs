//! Subscribed unicast clients and the messages built for them.

use std::{
    net::{IpAddr, SocketAddr},
    sync::{
        atomic::{AtomicU16, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use chrono::{DateTime, Utc};

use crate::{
    configuration::Configuration,
    protocol::{
        Announce, ClockQuality, DelayResp, FollowUp, Header, MessageType, PortIdentity,
        PtpTimestamp, SyncDelayReq, FLAG_PTP_TIMESCALE, FLAG_TWO_STEP, FLAG_UNICAST,
        FLAG_UTC_OFFSET_VALID, PTP_EVENT_PORT, PTP_GENERAL_PORT,
    },
};

/// A job queued for a send worker: the client that is due a message.
pub type Job = Arc<SubscriptionClient>;

/// Properties of this grandmaster shared by every message it sends.
#[derive(Debug, Clone, PartialEq)]
pub struct GrandmasterProfile {
    pub port_identity: PortIdentity,
    pub domain_number: u8,
    pub current_utc_offset: i16,
    pub priority1: u8,
    pub priority2: u8,
    pub clock_quality: ClockQuality,
    pub time_source: u8,
}

impl GrandmasterProfile {
    /// Builds the profile from the configuration and the port's clock identity.
    pub fn from_config(conf: &Configuration, clock_identity: u64) -> Self {
        GrandmasterProfile {
            port_identity: PortIdentity {
                clock_identity,
                port_number: 1,
            },
            domain_number: conf.domain,
            current_utc_offset: conf.announce_utc_offset(),
            priority1: conf.priority1,
            priority2: conf.priority2,
            clock_quality: ClockQuality {
                clock_class: conf.clock_class,
                clock_accuracy: conf.clock_accuracy,
                offset_scaled_log_variance: conf.clock_variance,
            },
            time_source: conf.time_source,
        }
    }
}

/// A client subscribed to one message type.
///
/// The scheduler decides when the client is due and enqueues it; the send worker
/// that owns the client is the only writer of its sequence id.
#[derive(Debug)]
pub struct SubscriptionClient {
    subscription: MessageType,
    event_addr: SocketAddr,
    general_addr: SocketAddr,
    interval: Duration,
    sequence_id: AtomicU16,
    profile: Arc<GrandmasterProfile>,
    delay_resp: Mutex<DelayResp>,
}

impl SubscriptionClient {
    pub fn new(
        subscription: MessageType,
        event_addr: SocketAddr,
        general_addr: SocketAddr,
        interval: Duration,
        profile: Arc<GrandmasterProfile>,
    ) -> Self {
        let delay_resp = DelayResp {
            header: Header::new(
                MessageType::DelayResp,
                DelayResp::SIZE as u16,
                profile.domain_number,
                profile.port_identity,
                0,
            ),
            receive_timestamp: PtpTimestamp::default(),
            requesting_port_identity: PortIdentity::default(),
        };
        SubscriptionClient {
            subscription,
            event_addr,
            general_addr,
            interval,
            sequence_id: AtomicU16::new(0),
            profile,
            delay_resp: Mutex::new(delay_resp),
        }
    }

    /// Creates a client reachable on the standard PTP ports of `ip`.
    pub fn for_ip(
        subscription: MessageType,
        ip: IpAddr,
        interval: Duration,
        profile: Arc<GrandmasterProfile>,
    ) -> Self {
        Self::new(
            subscription,
            SocketAddr::new(ip, PTP_EVENT_PORT),
            SocketAddr::new(ip, PTP_GENERAL_PORT),
            interval,
            profile,
        )
    }

    /// Starts the client's sequence at `sequence_id`.
    pub fn with_sequence_id(self, sequence_id: u16) -> Self {
        self.sequence_id.store(sequence_id, Ordering::Relaxed);
        self
    }

    pub fn subscription(&self) -> MessageType {
        self.subscription
    }

    pub fn event_addr(&self) -> SocketAddr {
        self.event_addr
    }

    pub fn general_addr(&self) -> SocketAddr {
        self.general_addr
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Sequence id the next message to this client will carry.
    pub fn sequence_id(&self) -> u16 {
        self.sequence_id.load(Ordering::Relaxed)
    }

    /// Moves to the next sequence id, wrapping at 65535.
    pub fn advance_sequence(&self) -> u16 {
        self.sequence_id.fetch_add(1, Ordering::Relaxed).wrapping_add(1)
    }

    /// logMessageInterval for the granted interval (log2 seconds).
    pub fn log_message_interval(&self) -> i8 {
        let secs = self.interval.as_secs_f64();
        if secs <= 0.0 {
            return 0x7f;
        }
        secs.log2().round().clamp(-128.0, 127.0) as i8
    }

    fn header(&self, message_type: MessageType, length: usize, sequence_id: u16) -> Header {
        let mut header = Header::new(
            message_type,
            length as u16,
            self.profile.domain_number,
            self.profile.port_identity,
            sequence_id,
        );
        header.log_message_interval = self.log_message_interval();
        header
    }

    /// Two-step Sync; the origin time follows in the Follow-Up.
    pub fn sync_packet(&self, sequence_id: u16) -> SyncDelayReq {
        let mut header = self.header(MessageType::Sync, SyncDelayReq::SIZE, sequence_id);
        header.flag_field = FLAG_TWO_STEP | FLAG_UNICAST;
        SyncDelayReq {
            header,
            origin_timestamp: PtpTimestamp::default(),
        }
    }

    /// Follow-Up carrying the transmit time of the Sync with the same sequence id.
    pub fn followup_packet(&self, sequence_id: u16, tx_timestamp: DateTime<Utc>) -> FollowUp {
        FollowUp {
            header: self.header(MessageType::FollowUp, FollowUp::SIZE, sequence_id),
            precise_origin_timestamp: PtpTimestamp::from(tx_timestamp),
        }
    }

    pub fn announce_packet(&self, sequence_id: u16) -> Announce {
        let mut header = self.header(MessageType::Announce, Announce::SIZE, sequence_id);
        header.flag_field = FLAG_UNICAST | FLAG_PTP_TIMESCALE | FLAG_UTC_OFFSET_VALID;
        Announce {
            header,
            origin_timestamp: PtpTimestamp::default(),
            current_utc_offset: self.profile.current_utc_offset,
            grandmaster_priority1: self.profile.priority1,
            grandmaster_clock_quality: self.profile.clock_quality,
            grandmaster_priority2: self.profile.priority2,
            grandmaster_identity: self.profile.port_identity.clock_identity,
            steps_removed: 0,
            time_source: self.profile.time_source,
        }
    }

    /// Prepares the Delay-Response answering `request`, received at `received`.
    ///
    /// The response echoes the request's sequence id, correction and source port.
    pub fn prepare_delay_resp(&self, request: &Header, received: DateTime<Utc>) {
        let mut header = self.header(
            MessageType::DelayResp,
            DelayResp::SIZE,
            request.sequence_id,
        );
        header.correction_field = request.correction_field;
        let resp = DelayResp {
            header,
            receive_timestamp: PtpTimestamp::from(received),
            requesting_port_identity: request.source_port_identity,
        };
        *self.delay_resp.lock().unwrap_or_else(|e| e.into_inner()) = resp;
    }

    /// The prepared Delay-Response.
    pub fn delay_resp_packet(&self) -> DelayResp {
        *self.delay_resp.lock().unwrap_or_else(|e| e.into_inner())
    }
}
