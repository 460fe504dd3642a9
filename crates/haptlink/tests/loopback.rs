//! End-to-end scenarios over real loopback sockets.

use std::net::{SocketAddr, UdpSocket as StdUdpSocket};
use std::time::Duration;

use haptlink::channel::{BodyPose, PoseReceiver, PoseSample, PoseSender};
use haptlink::service::CodecService;
use haptlink::signal::{
    Batch, BatchShape, Lz4BlockCodec, RemoteCodec, RemoteCodecConfig, SignalCodec,
};
use haptlink::transport::{DatagramReceiver, DatagramSender, EndpointConfig};
use haptlink::wire::{Quat, Vec3};
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio_util::bytes::Bytes;
use tokio_util::sync::CancellationToken;

fn any_port() -> SocketAddr {
    "127.0.0.1:0".parse().unwrap()
}

/// A loopback address nobody is listening on right now.
fn free_addr() -> SocketAddr {
    let socket = StdUdpSocket::bind(any_port()).unwrap();
    socket.local_addr().unwrap()
}

async fn eventually(what: &str, mut done: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(2), async {
        while !done() {
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for {what}"));
}

fn pose_at(tick: usize) -> PoseSample {
    let t = tick as f32;
    let mut sample = PoseSample::new(3);
    sample.timestamp = t * 0.02;
    for (i, body) in sample.bodies.iter_mut().enumerate() {
        let i = i as f32;
        *body = BodyPose {
            position: Vec3::new(t, i, -t),
            rotation: Quat::new(0.0, 0.0, i * 0.1, 1.0),
        };
    }
    sample
}

#[tokio::test]
async fn pose_stream_picks_up_a_late_receiver() {
    let addr = free_addr();
    let mut sender = PoseSender::new(EndpointConfig::sender(addr, 1024), Handle::current());
    sender.start().unwrap();

    // Nobody listens for the first half; those datagrams are simply gone.
    for tick in 0..25 {
        sender.tick(&pose_at(tick));
    }
    tokio::time::sleep(Duration::from_millis(20)).await;

    let mut receiver =
        PoseReceiver::new(EndpointConfig::receiver(addr, 1024), Handle::current(), 3, 2.0);
    receiver.start().unwrap();
    assert!(receiver.is_empty());
    assert!(!receiver.tick());

    let mut last = pose_at(0);
    for tick in 25..50 {
        last = pose_at(tick);
        sender.tick(&last);
    }
    eventually("a pose", || !receiver.is_empty()).await;

    // Keep draining until the final sample lands.
    eventually("the final pose", || {
        receiver.tick();
        receiver.sample() == &last
    })
    .await;
    assert!(receiver.is_empty());

    receiver.calibrate_time(100.0);
    assert_eq!(receiver.last_pose_time(), 100.0);
    assert!(!receiver.is_timed_out(101.0));
    assert!(receiver.is_timed_out(102.5));
}

#[tokio::test]
async fn large_payload_survives_fragmentation() {
    let max_datagram = 64;
    let payload: Vec<u8> = (0..max_datagram * 12).map(|i| (i * 7 % 251) as u8).collect();

    let (tx, mut rx) = mpsc::unbounded_channel::<Bytes>();
    let mut receiver = DatagramReceiver::new(
        EndpointConfig::receiver(any_port(), max_datagram),
        Handle::current(),
        move |payload| {
            let _ = tx.send(payload);
        },
    );
    receiver.start().unwrap();
    let addr = receiver.local_addr().unwrap();

    let mut sender =
        DatagramSender::new(EndpointConfig::sender(addr, max_datagram), Handle::current());
    sender.start().unwrap();
    sender.send(payload.clone()).unwrap();
    sender.send(Bytes::from_static(b"tail")).unwrap();

    let first = tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(first.len(), payload.len());
    assert_eq!(&first[..], &payload[..]);

    let second = tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&second[..], b"tail");
}

#[tokio::test]
async fn remote_codec_round_trips_through_the_service() {
    let actuators = 2;
    let shape = BatchShape::new(actuators, 8, 4);

    let samples = shape.actuator_len();
    let service = CodecService::bind(any_port(), actuators, samples, 256, Lz4BlockCodec::new(samples))
        .await
        .unwrap();
    let service_addr = service.local_addr();

    let config = RemoteCodecConfig {
        request: EndpointConfig::sender(service_addr, 256),
        response: EndpointConfig::receiver(any_port(), 256),
        timeout: Some(Duration::from_secs(2)),
    };
    let codec = RemoteCodec::new(config, Handle::current());
    codec.start().unwrap();
    let reply = codec.response_addr().unwrap();

    let cancel = CancellationToken::new();
    let server = tokio::spawn(service.with_replies(reply, reply).run(cancel.clone()));

    let mut batch = Batch::new(shape);
    for (i, sample) in batch.samples_mut().iter_mut().enumerate() {
        *sample = ((i % 16) as f32 - 8.0) / 10.0;
    }

    let encoded = codec.encode(&batch).await.unwrap().unwrap();
    assert_eq!(&encoded[..4], &(actuators as i32).to_ne_bytes());

    let mut decoded = Batch::new(shape);
    codec.decode(&encoded, &mut decoded).await.unwrap();
    for (i, (a, b)) in batch.samples().iter().zip(decoded.samples()).enumerate() {
        assert!((a - b).abs() < 1e-3, "sample {i}: {a} vs {b}");
    }

    codec.stop();
    cancel.cancel();
    server.await.unwrap();
}
