//! Hole-punch coordinator dispatch and signaling.

use async_trait::async_trait;
use minitunnel::punch::message::{PunchHoleResetInfo, PunchHoleReverseInfo, encode};
use minitunnel::punch::{
    OnPunchHoleArg, PUNCH_HOLE_MESSENGER_ID, PunchForwardType, PunchHole, PunchHoleCoordinator, PunchHoleError,
    PunchHoleParams, PunchHoleTunnelInfo, PunchHoleType, SendPunchHoleArg, ServerType, StrategyContext,
};
use minitunnel::register::RegisterEvent;
use minitunnel::transport::{MessageRequest, MessageResponse};
use minitunnel::{ClientInfo, Connection, ConnectionRef, MessengerTransport, RegisterState, TransportError};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

#[derive(Debug)]
struct Conn(u64);

impl Connection for Conn {
    fn connect_id(&self) -> u64 {
        self.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Sent {
    Only,
    Reply,
}

/// Records every envelope and how it was sent
#[derive(Default)]
struct MockTransport {
    sent: Mutex<Vec<(Sent, MessageRequest)>>,
}

impl MockTransport {
    fn sent(&self) -> Vec<(Sent, MessageRequest)> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl MessengerTransport for MockTransport {
    async fn send_only(&self, request: MessageRequest) -> Result<(), TransportError> {
        self.sent.lock().unwrap().push((Sent::Only, request));
        Ok(())
    }

    async fn send_reply(&self, request: MessageRequest) -> Result<MessageResponse, TransportError> {
        self.sent.lock().unwrap().push((Sent::Reply, request));
        Ok(MessageResponse::ok(vec![1]))
    }
}

/// Fails every delivery as if the tunnel had gone away
struct ClosedTransport;

#[async_trait]
impl MessengerTransport for ClosedTransport {
    async fn send_only(&self, _request: MessageRequest) -> Result<(), TransportError> {
        Err(TransportError::Closed)
    }

    async fn send_reply(&self, _request: MessageRequest) -> Result<MessageResponse, TransportError> {
        Err(TransportError::Timeout)
    }
}

struct Counting {
    punch_type: PunchHoleType,
    hits: Arc<AtomicUsize>,
}

#[async_trait]
impl PunchHole for Counting {
    fn punch_type(&self) -> PunchHoleType {
        self.punch_type
    }

    async fn execute(&self, _arg: OnPunchHoleArg) {
        self.hits.fetch_add(1, Ordering::SeqCst);
    }
}

fn counting(punch_type: PunchHoleType, hits: &Arc<AtomicUsize>) -> impl FnOnce(&StrategyContext) -> Arc<dyn PunchHole> + Send + 'static {
    let hits = Arc::clone(hits);
    move |_: &StrategyContext| Arc::new(Counting { punch_type, hits }) as Arc<dyn PunchHole>
}

fn setup() -> (Arc<MockTransport>, Arc<RegisterState>) {
    (Arc::new(MockTransport::default()), Arc::new(RegisterState::new()))
}

fn incoming(punch_type: u8, data: Vec<u8>) -> OnPunchHoleArg {
    OnPunchHoleArg {
        connection: Arc::new(Conn(1)) as ConnectionRef,
        data: PunchHoleParams {
            punch_type,
            step: 0,
            forward_type: PunchForwardType::Forward,
            tunnel_name: 0,
            index: 0,
            from_id: 99,
            to_id: 1,
            data,
        },
    }
}

#[tokio::test]
async fn strategy_runs_exactly_once_per_message() {
    let (transport, register) = setup();
    let hits = Arc::new(AtomicUsize::new(0));
    let coordinator = PunchHoleCoordinator::builder(transport, register)
        .strategy(counting(PunchHoleType::Udp, &hits))
        .build();

    coordinator
        .on_punch_hole(incoming(PunchHoleType::Udp as u8, Vec::new()))
        .await;
    assert_eq!(hits.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn unknown_or_unregistered_types_are_dropped() {
    let (transport, register) = setup();
    let hits = Arc::new(AtomicUsize::new(0));
    let coordinator = PunchHoleCoordinator::builder(Arc::clone(&transport) as Arc<dyn MessengerTransport>, register)
        .strategy(counting(PunchHoleType::Udp, &hits))
        .build();

    coordinator.on_punch_hole(incoming(0xEE, Vec::new())).await;
    coordinator
        .on_punch_hole(incoming(PunchHoleType::TcpNutssa as u8, Vec::new()))
        .await;

    assert_eq!(hits.load(Ordering::SeqCst), 0);
    assert!(!coordinator.has_strategy(PunchHoleType::TcpNutssa));
    assert!(transport.sent().is_empty());
}

#[tokio::test]
async fn host_strategy_takes_precedence_over_builtin() {
    let (transport, register) = setup();
    register.set_online(Arc::new(Conn(1)));
    let hits = Arc::new(AtomicUsize::new(0));
    let coordinator = PunchHoleCoordinator::builder(transport, Arc::clone(&register))
        .strategy(counting(PunchHoleType::Reset, &hits))
        .build();

    coordinator
        .on_punch_hole(incoming(PunchHoleType::Reset as u8, Vec::new()))
        .await;

    assert_eq!(hits.load(Ordering::SeqCst), 1);
    assert!(register.is_online());
}

#[tokio::test]
async fn without_builtin_nothing_is_registered() {
    let (transport, register) = setup();
    let coordinator = PunchHoleCoordinator::builder(transport, register)
        .without_builtin()
        .build();

    assert!(!coordinator.has_strategy(PunchHoleType::Reset));
    assert!(!coordinator.has_strategy(PunchHoleType::Tunnel));
}

#[tokio::test]
async fn send_tunnel_waits_for_the_peer() {
    let (transport, register) = setup();
    register.set_online(Arc::new(Conn(10)));
    let coordinator = PunchHoleCoordinator::builder(Arc::clone(&transport) as Arc<dyn MessengerTransport>, register).build();

    let response = coordinator.send_tunnel(20, 7, ServerType::Udp).await.unwrap();
    assert_eq!(response, MessageResponse::ok(vec![1]));

    let sent = transport.sent();
    assert_eq!(sent.len(), 1);
    let (how, request) = &sent[0];
    assert_eq!(*how, Sent::Reply);
    assert_eq!(request.messenger_id, PUNCH_HOLE_MESSENGER_ID);

    let params = PunchHoleParams::from_bytes(&request.payload).unwrap();
    assert_eq!(params.kind(), Some(PunchHoleType::Tunnel));
    assert_eq!(params.from_id, 10);
    assert_eq!(params.to_id, 20);
    assert_eq!(params.forward_type, PunchForwardType::Forward);

    let info: PunchHoleTunnelInfo = minitunnel::punch::message::decode(&params.data).unwrap();
    assert_eq!(info.tunnel_name, 7);
    assert_eq!(info.server_type, ServerType::Udp);
}

#[tokio::test]
async fn signaling_messages_are_fire_and_forget() {
    let (transport, register) = setup();
    register.set_online(Arc::new(Conn(10)));
    let coordinator = PunchHoleCoordinator::builder(Arc::clone(&transport) as Arc<dyn MessengerTransport>, register).build();

    let peer = ClientInfo {
        id: 30,
        name: "nas".into(),
        try_reverse: 2,
    };
    coordinator.send_reverse(&peer).await.unwrap();
    coordinator.send_reset(31).await.unwrap();
    coordinator.send_offline(32).await.unwrap();

    let sent = transport.sent();
    assert_eq!(sent.len(), 3);
    assert!(sent.iter().all(|(how, _)| *how == Sent::Only));

    let kinds: Vec<_> = sent
        .iter()
        .map(|(_, request)| PunchHoleParams::from_bytes(&request.payload).unwrap())
        .map(|params| (params.kind(), params.to_id))
        .collect();
    assert_eq!(
        kinds,
        vec![
            (Some(PunchHoleType::Reverse), 30),
            (Some(PunchHoleType::Reset), 31),
            (Some(PunchHoleType::Offline), 32),
        ]
    );
}

#[tokio::test]
async fn send_with_tunnel_routing() {
    let (transport, register) = setup();
    let coordinator = PunchHoleCoordinator::builder(Arc::clone(&transport) as Arc<dyn MessengerTransport>, register).build();

    let arg = SendPunchHoleArg::new(Arc::new(Conn(3)), 4, PunchHoleReverseInfo { try_reverse: 1 }).with_tunnel(0xAB, 2);
    coordinator.send(arg).await.unwrap();

    let (_, request) = transport.sent().remove(0);
    let params = PunchHoleParams::from_bytes(&request.payload).unwrap();
    assert_eq!(params.tunnel_name, 0xAB);
    assert_eq!(params.index, 2);
    assert_eq!(params.from_id, 3);
}

#[tokio::test]
async fn sending_requires_registration() {
    let (transport, register) = setup();
    let coordinator = PunchHoleCoordinator::builder(Arc::clone(&transport) as Arc<dyn MessengerTransport>, register).build();

    let err = coordinator.send_reset(1).await.unwrap_err();
    assert!(matches!(err, PunchHoleError::NotOnline));
    assert!(transport.sent().is_empty());
}

#[tokio::test]
async fn reset_message_drops_registration() {
    let (transport, register) = setup();
    register.set_online(Arc::new(Conn(1)));
    let mut events = register.subscribe();
    let coordinator = PunchHoleCoordinator::builder(transport, Arc::clone(&register)).build();

    let envelope = PunchHoleParams {
        punch_type: PunchHoleType::Reset as u8,
        step: 0,
        forward_type: PunchForwardType::Forward,
        tunnel_name: 0,
        index: 0,
        from_id: 2,
        to_id: 1,
        data: encode(&PunchHoleResetInfo).unwrap(),
    };
    coordinator
        .on_message(Arc::new(Conn(1)), &envelope.to_bytes().unwrap())
        .await
        .unwrap();

    assert!(!register.is_online());
    assert_eq!(events.recv().await.unwrap(), RegisterEvent::Reset);
}

#[tokio::test]
async fn offline_message_publishes_offline() {
    let (transport, register) = setup();
    register.set_online(Arc::new(Conn(1)));
    let mut events = register.subscribe();
    let coordinator = PunchHoleCoordinator::builder(transport, Arc::clone(&register)).build();

    coordinator
        .on_punch_hole(incoming(PunchHoleType::Offline as u8, Vec::new()))
        .await;

    assert!(!register.is_online());
    assert_eq!(events.recv().await.unwrap(), RegisterEvent::Offline);
}

#[tokio::test]
async fn tunnel_and_reverse_requests_reach_subscribers() {
    let (transport, register) = setup();
    let coordinator = PunchHoleCoordinator::builder(transport, register).build();
    let mut tunnels = coordinator.on_tunnel().subscribe();
    let mut reverses = coordinator.on_reverse().subscribe();

    let request = PunchHoleTunnelInfo {
        tunnel_name: 5,
        server_type: ServerType::Tcp,
    };
    coordinator
        .on_punch_hole(incoming(PunchHoleType::Tunnel as u8, encode(&request).unwrap()))
        .await;
    assert_eq!(tunnels.recv().await.unwrap(), request);

    coordinator
        .on_punch_hole(incoming(PunchHoleType::Reverse as u8, Vec::new()))
        .await;
    assert_eq!(reverses.recv().await.unwrap().data.from_id, 99);
}

#[tokio::test]
async fn malformed_envelope_is_an_error() {
    let (transport, register) = setup();
    let coordinator = PunchHoleCoordinator::builder(transport, register).build();

    let err = coordinator
        .on_message(Arc::new(Conn(1)), &[0x01])
        .await
        .unwrap_err();
    assert!(matches!(err, PunchHoleError::Codec(_)));
}

#[tokio::test]
async fn transport_failures_reach_the_caller() {
    let register = Arc::new(RegisterState::new());
    register.set_online(Arc::new(Conn(10)));
    let coordinator = PunchHoleCoordinator::builder(Arc::new(ClosedTransport), register).build();

    let err = coordinator.send_reset(1).await.unwrap_err();
    assert!(matches!(err, PunchHoleError::Transport(TransportError::Closed)));

    let err = coordinator.send_tunnel(2, 7, ServerType::Tcp).await.unwrap_err();
    assert!(matches!(err, PunchHoleError::Transport(TransportError::Timeout)));
}
