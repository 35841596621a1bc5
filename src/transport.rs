//! # MQTT Transport Abstraction
//!
//! This module defines the `MqttTransport` trait, the outbound end of every
//! pipeline. The transport owns the MQTT session (socket, TLS, packet encoding);
//! the pipeline only hands it requests. Its acknowledgments and received messages
//! come back as inbound events posted with
//! [`Pipeline::post_inbound_event`](crate::pipeline::Pipeline::post_inbound_event).

use crate::error::Error;
use crate::event::Event;
use crate::packet::{ConnectRequest, PacketId, PublishRequest, SubscribeRequest, UnsubscribeRequest};

/// MQTT client primitives consumed by the pipeline.
///
/// Calls must not block on the network: they queue the packet and return. A
/// transport used with a [`SyncPipeline`](crate::pipeline::SyncPipeline) does its
/// I/O in [`MqttTransport::process`].
pub trait MqttTransport: Send {
    fn connect(&mut self, request: &ConnectRequest<'_>) -> Result<(), Error>;

    fn disconnect(&mut self) -> Result<(), Error>;

    /// Queues a publish and returns the packet id used for it.
    fn publish(&mut self, request: &PublishRequest<'_>) -> Result<PacketId, Error>;

    /// Queues a subscribe and returns the packet id the SUBACK will carry.
    fn subscribe(&mut self, request: &SubscribeRequest<'_>) -> Result<PacketId, Error>;

    /// Queues an unsubscribe and returns the packet id the UNSUBACK will carry.
    fn unsubscribe(&mut self, request: &UnsubscribeRequest<'_>) -> Result<PacketId, Error>;

    /// One iteration of the synchronous driver loop.
    fn process(&mut self) -> Result<(), Error> {
        Ok(())
    }
}

/// A transport with nothing wired in. Every call fails with
/// [`Error::DependencyNotProvided`].
#[derive(Debug, Clone, Copy, Default)]
pub struct NoTransport;

impl MqttTransport for NoTransport {
    fn connect(&mut self, _request: &ConnectRequest<'_>) -> Result<(), Error> {
        Err(Error::DependencyNotProvided)
    }

    fn disconnect(&mut self) -> Result<(), Error> {
        Err(Error::DependencyNotProvided)
    }

    fn publish(&mut self, _request: &PublishRequest<'_>) -> Result<PacketId, Error> {
        Err(Error::DependencyNotProvided)
    }

    fn subscribe(&mut self, _request: &SubscribeRequest<'_>) -> Result<PacketId, Error> {
        Err(Error::DependencyNotProvided)
    }

    fn unsubscribe(&mut self, _request: &UnsubscribeRequest<'_>) -> Result<PacketId, Error> {
        Err(Error::DependencyNotProvided)
    }

    fn process(&mut self) -> Result<(), Error> {
        Err(Error::DependencyNotProvided)
    }
}

/// Maps an event that left the outbound end of the pipeline onto a transport call.
pub(crate) fn deliver<'t>(
    transport: &mut (dyn MqttTransport + 't),
    event: &Event<'_>,
) -> Result<(), Error> {
    match event {
        Event::ConnectReq(request) => transport.connect(request),
        Event::DisconnectReq => transport.disconnect(),
        Event::PublishReq(request) => {
            let id = transport.publish(request)?;
            request.out_id.set(Some(id));
            Ok(())
        }
        Event::SubscribeReq(request) => {
            let id = transport.subscribe(request)?;
            request.out_id.set(Some(id));
            Ok(())
        }
        Event::UnsubscribeReq(request) => {
            let id = transport.unsubscribe(request)?;
            request.out_id.set(Some(id));
            Ok(())
        }
        Event::ProcessLoop => transport.process(),
        // Requests some policy should have claimed.
        Event::ConnectionOpenReq
        | Event::ConnectionCloseReq
        | Event::RpcClientInvokeReq(_)
        | Event::RpcServerRegisterReq(Some(_))
        | Event::RpcClientSubscribeReq(Some(_))
        | Event::RpcClientUnsubscribeReq(Some(_)) => {
            warn!("transport: no policy accepted {:?}", event.kind());
            Err(Error::NotFound)
        }
        _ => {
            debug!("transport: discarding {:?}", event.kind());
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::vec::Vec;

    use super::*;
    use crate::packet::QoS;
    use crate::test_support::{RecordingTransport, Sent};

    #[test]
    fn test_deliver_fills_packet_ids() {
        let log = Mutex::new(Vec::new());
        let mut transport = RecordingTransport::new(&log);

        let subscribe = SubscribeRequest::new("vehicles/m/commands/car-1/+", QoS::AtLeastOnce);
        deliver(&mut transport, &Event::SubscribeReq(&subscribe)).unwrap();
        let publish = PublishRequest::new("a/b", b"{}", QoS::AtMostOnce);
        deliver(&mut transport, &Event::PublishReq(&publish)).unwrap();

        assert_eq!(subscribe.out_id.get(), Some(1));
        assert_eq!(publish.out_id.get(), Some(2));
        assert!(matches!(log.lock().unwrap()[0], Sent::Subscribe { id: 1, .. }));
    }

    #[test]
    fn test_deliver_unclaimed_requests() {
        let log = Mutex::new(Vec::new());
        let mut transport = RecordingTransport::new(&log);

        assert_eq!(
            deliver(&mut transport, &Event::ConnectionOpenReq),
            Err(Error::NotFound)
        );
        assert_eq!(
            deliver(&mut transport, &Event::RpcServerRegisterReq(Some("unlock"))),
            Err(Error::NotFound)
        );
        assert_eq!(
            deliver(&mut transport, &Event::RpcServerRegisterReq(None)),
            Ok(())
        );
        assert!(log.lock().unwrap().is_empty());
    }

    #[test]
    fn test_no_transport() {
        let publish = PublishRequest::new("a/b", b"", QoS::AtMostOnce);
        assert_eq!(
            deliver(&mut NoTransport, &Event::PublishReq(&publish)),
            Err(Error::DependencyNotProvided)
        );
        assert_eq!(publish.out_id.get(), None);
        assert_eq!(NoTransport.disconnect(), Err(Error::DependencyNotProvided));
    }
}
