//! Fakes shared by the unit tests: a platform with manual timers, a transport and an
//! application that record what reaches them.

use std::collections::BTreeMap;
use std::string::{String, ToString};
use std::sync::Mutex;
use std::vec::Vec;

use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_time::{Duration, Instant};

use crate::error::{ConnectReasonCode, Error, ProtocolError};
use crate::event::{Event, EventKind};
use crate::packet::{
    ConnectRequest, DisconnectReason, PacketId, Properties, PublishRequest, QoS, ReceivedPublish,
    SubscribeRequest, UnsubscribeRequest,
};
use crate::pipeline::{Application, Pipeline, Policy};
use crate::platform::{Platform, TimerId};
use crate::rpc::RpcStatus;
use crate::transport::MqttTransport;

#[derive(Default)]
struct Clock {
    now_ms: u64,
    next_timer: u32,
    /// Live timers and their deadline when armed.
    timers: BTreeMap<u32, Option<u64>>,
    delays: BTreeMap<u32, u64>,
    random: u32,
}

/// A platform whose clock only moves when the test says so.
#[derive(Default)]
pub struct FakePlatform {
    clock: Mutex<Clock>,
}

impl FakePlatform {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn advance(&self, ms: u64) {
        self.clock.lock().unwrap().now_ms += ms;
    }

    pub fn set_random(&self, value: u32) {
        self.clock.lock().unwrap().random = value;
    }

    pub fn is_live(&self, timer: TimerId) -> bool {
        self.clock.lock().unwrap().timers.contains_key(&timer.0)
    }

    pub fn is_armed(&self, timer: TimerId) -> bool {
        matches!(
            self.clock.lock().unwrap().timers.get(&timer.0),
            Some(Some(_))
        )
    }

    /// Delay passed to the most recent start of `timer`, in milliseconds.
    pub fn last_delay(&self, timer: TimerId) -> Option<u64> {
        self.clock.lock().unwrap().delays.get(&timer.0).copied()
    }

    pub fn armed_timers(&self) -> Vec<TimerId> {
        self.clock
            .lock()
            .unwrap()
            .timers
            .iter()
            .filter(|(_, deadline)| deadline.is_some())
            .map(|(id, _)| TimerId(*id))
            .collect()
    }

    pub fn live_timers(&self) -> usize {
        self.clock.lock().unwrap().timers.len()
    }
}

impl Platform for FakePlatform {
    fn now(&self) -> Result<Instant, Error> {
        Ok(Instant::from_millis(self.clock.lock().unwrap().now_ms))
    }

    fn random(&self) -> Result<u32, Error> {
        Ok(self.clock.lock().unwrap().random)
    }

    fn timer_create(&self) -> Result<TimerId, Error> {
        let mut clock = self.clock.lock().unwrap();
        clock.next_timer += 1;
        let id = clock.next_timer;
        clock.timers.insert(id, None);
        Ok(TimerId(id))
    }

    fn timer_start(&self, timer: TimerId, delay: Duration) -> Result<(), Error> {
        let mut clock = self.clock.lock().unwrap();
        let deadline = clock.now_ms.saturating_add(delay.as_millis());
        let slot = clock.timers.get_mut(&timer.0).ok_or(Error::NotFound)?;
        *slot = Some(deadline);
        clock.delays.insert(timer.0, delay.as_millis());
        Ok(())
    }

    fn timer_destroy(&self, timer: TimerId) -> Result<(), Error> {
        let mut clock = self.clock.lock().unwrap();
        clock.timers.remove(&timer.0).map(|_| ()).ok_or(Error::NotFound)
    }
}

/// A publish as the transport saw it.
#[derive(Debug, Clone, PartialEq)]
pub struct SentPublish {
    pub id: PacketId,
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: QoS,
    pub correlation_data: Option<Vec<u8>>,
    pub response_topic: Option<String>,
    pub content_type: Option<String>,
    pub status: Option<String>,
    pub status_message: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Sent {
    Connect {
        client_id: String,
        certificate: Vec<u8>,
    },
    Disconnect,
    Publish(SentPublish),
    Subscribe {
        filter: String,
        id: PacketId,
    },
    Unsubscribe {
        filter: String,
    },
    Process,
}

/// A transport that records requests and hands out increasing packet ids.
pub struct RecordingTransport<'l> {
    log: &'l Mutex<Vec<Sent>>,
    next_id: PacketId,
    pub fail_publish: bool,
}

impl<'l> RecordingTransport<'l> {
    pub fn new(log: &'l Mutex<Vec<Sent>>) -> Self {
        Self {
            log,
            next_id: 0,
            fail_publish: false,
        }
    }

    fn next_id(&mut self) -> PacketId {
        self.next_id += 1;
        self.next_id
    }
}

impl MqttTransport for RecordingTransport<'_> {
    fn connect(&mut self, request: &ConnectRequest<'_>) -> Result<(), Error> {
        self.log.lock().unwrap().push(Sent::Connect {
            client_id: request.client_id.to_string(),
            certificate: request.credential.certificate.to_vec(),
        });
        Ok(())
    }

    fn disconnect(&mut self) -> Result<(), Error> {
        self.log.lock().unwrap().push(Sent::Disconnect);
        Ok(())
    }

    fn publish(&mut self, request: &PublishRequest<'_>) -> Result<PacketId, Error> {
        if self.fail_publish {
            return Err(Error::Transport);
        }
        let id = self.next_id();
        let properties = &request.properties;
        self.log.lock().unwrap().push(Sent::Publish(SentPublish {
            id,
            topic: request.topic.to_string(),
            payload: request.payload.to_vec(),
            qos: request.qos,
            correlation_data: properties.correlation_data.map(<[u8]>::to_vec),
            response_topic: properties.response_topic.map(str::to_string),
            content_type: properties.content_type.map(str::to_string),
            status: properties.user_property("status").map(str::to_string),
            status_message: properties.user_property("statusMessage").map(str::to_string),
        }));
        Ok(id)
    }

    fn subscribe(&mut self, request: &SubscribeRequest<'_>) -> Result<PacketId, Error> {
        let id = self.next_id();
        self.log.lock().unwrap().push(Sent::Subscribe {
            filter: request.topic_filter.to_string(),
            id,
        });
        Ok(id)
    }

    fn unsubscribe(&mut self, request: &UnsubscribeRequest<'_>) -> Result<PacketId, Error> {
        let id = self.next_id();
        self.log.lock().unwrap().push(Sent::Unsubscribe {
            filter: request.topic_filter.to_string(),
        });
        Ok(id)
    }

    fn process(&mut self) -> Result<(), Error> {
        self.log.lock().unwrap().push(Sent::Process);
        Ok(())
    }
}

/// An event as the application saw it.
#[derive(Debug, Clone, PartialEq)]
pub enum Seen {
    ConnAck(ConnectReasonCode),
    Disconnected(DisconnectReason),
    Error {
        error: Error,
        sender: &'static str,
        cause: EventKind,
    },
    Execute {
        correlation_id: Vec<u8>,
        command: String,
        content_type: String,
        payload: Vec<u8>,
    },
    Ready(String),
    Response {
        command: String,
        correlation_id: Vec<u8>,
        status: Option<RpcStatus>,
        payload: Vec<u8>,
        content_type: Option<String>,
        error_message: Option<String>,
        protocol_error: Option<ProtocolError>,
    },
    Other(EventKind),
}

/// An application that records every event reaching it.
pub struct RecordingApp<'l> {
    log: &'l Mutex<Vec<Seen>>,
}

impl<'l> RecordingApp<'l> {
    pub fn new(log: &'l Mutex<Vec<Seen>>) -> Self {
        Self { log }
    }
}

impl Application for RecordingApp<'_> {
    fn on_event(&mut self, event: &Event<'_>) -> Result<(), Error> {
        let seen = match event {
            Event::ConnAck(ack) => Seen::ConnAck(ack.reason_code),
            Event::Disconnected(reason) => Seen::Disconnected(*reason),
            Event::Error(report) => Seen::Error {
                error: report.error,
                sender: report.sender,
                cause: report.event.kind(),
            },
            Event::RpcServerExecuteReq(request) => Seen::Execute {
                correlation_id: request.correlation_id.to_vec(),
                command: request.command_name.to_string(),
                content_type: request.content_type.to_string(),
                payload: request.payload.to_vec(),
            },
            Event::RpcClientReady(command) => Seen::Ready(command.to_string()),
            Event::RpcClientResponse(response) => Seen::Response {
                command: response.command_name.to_string(),
                correlation_id: response.correlation_id.to_vec(),
                status: response.status,
                payload: response.payload.to_vec(),
                content_type: response.content_type.map(str::to_string),
                error_message: response.error_message.map(str::to_string),
                protocol_error: response.protocol_error,
            },
            other => Seen::Other(other.kind()),
        };
        self.log.lock().unwrap().push(seen);
        Ok(())
    }
}

/// Drains a shared log.
pub fn take<T>(log: &Mutex<Vec<T>>) -> Vec<T> {
    core::mem::take(&mut *log.lock().unwrap())
}

/// The publishes in a transport log.
pub fn publishes(sent: &[Sent]) -> Vec<SentPublish> {
    sent.iter()
        .filter_map(|sent| match sent {
            Sent::Publish(publish) => Some(publish.clone()),
            _ => None,
        })
        .collect()
}

/// An inbound publish carrying RPC properties.
pub fn received<'a>(
    topic: &'a str,
    payload: &'a [u8],
    properties: Properties<'a>,
) -> ReceivedPublish<'a> {
    ReceivedPublish {
        topic,
        payload,
        qos: QoS::AtLeastOnce,
        packet_id: Some(1),
        properties,
    }
}

/// A platform, a transport log and an application log for one pipeline run.
#[derive(Default)]
pub struct Harness {
    pub platform: FakePlatform,
    pub sent: Mutex<Vec<Sent>>,
    pub seen: Mutex<Vec<Seen>>,
}

impl Harness {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a pipeline from `policies` (transport side first) and runs `script` on it.
    pub fn run(
        &self,
        policies: &mut [&mut dyn Policy],
        script: impl FnOnce(&Pipeline<'_, CriticalSectionRawMutex>),
    ) {
        let mut transport = RecordingTransport::new(&self.sent);
        let mut app = RecordingApp::new(&self.seen);
        let mut pipeline = Pipeline::new(&self.platform, &mut transport, &mut app);
        for policy in policies.iter_mut() {
            pipeline = pipeline.with_policy(&mut **policy).unwrap();
        }
        script(&pipeline);
    }

    pub fn sent(&self) -> Vec<Sent> {
        take(&self.sent)
    }

    pub fn seen(&self) -> Vec<Seen> {
        take(&self.seen)
    }
}
