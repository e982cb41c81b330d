use bytes::{Bytes, BytesMut};
use criterion::{BenchmarkId, Criterion, black_box, criterion_group, criterion_main};
use mqttlink::protocol::codec;
use mqttlink::protocol::v4::{Incoming, Publish};
use mqttlink::{Client, ClientConfig, MemoryTransport, QoS, TransportEvent};

fn bench_variable_int(c: &mut Criterion) {
    let mut group = c.benchmark_group("variable_int");
    for value in [127u32, 16_383, 2_097_151, 268_435_455] {
        group.bench_with_input(BenchmarkId::new("encode", value), &value, |b, &value| {
            let mut buf = BytesMut::with_capacity(4);
            b.iter(|| {
                buf.clear();
                codec::write_variable_int(&mut buf, black_box(value)).unwrap()
            })
        });

        let mut encoded = BytesMut::new();
        codec::write_variable_int(&mut encoded, value).unwrap();
        group.bench_with_input(BenchmarkId::new("decode", value), &encoded, |b, encoded| {
            b.iter(|| codec::read_variable_int(black_box(encoded)))
        });
    }
    group.finish();
}

fn publish(payload_len: usize) -> Publish {
    Publish {
        topic: "sensors/line-3/temperature".to_string(),
        payload: Bytes::from(vec![0x42; payload_len]),
        qos: QoS::AtLeastOnce,
        retain: false,
        dup: false,
        pkid: 42,
    }
}

fn bench_publish(c: &mut Criterion) {
    let mut group = c.benchmark_group("publish");
    for size in [16usize, 1024, 64 * 1024] {
        let packet = publish(size);
        group.bench_with_input(BenchmarkId::new("encode", size), &packet, |b, packet| {
            b.iter(|| packet.encode().unwrap())
        });

        let encoded = packet.encode().unwrap();
        group.bench_with_input(BenchmarkId::new("decode", size), &encoded, |b, encoded| {
            b.iter(|| {
                let mut buf = BytesMut::from(&encoded[..]);
                let (header, body) = codec::take_frame(&mut buf).unwrap();
                Incoming::read(&header, &body).unwrap()
            })
        });
    }
    group.finish();
}

fn bench_client_inbound(c: &mut Criterion) {
    let transport = MemoryTransport::new();
    let config = ClientConfig::new("bench", 1883).with_client_id("bench");
    let mut client = Client::new(config, transport.clone()).unwrap();
    client.connect();
    client.handle_transport(TransportEvent::Opened);
    client.handle_transport(TransportEvent::Data(Bytes::from_static(&[
        0x20, 0x02, 0x00, 0x00,
    ])));
    client.drain_events();

    let mut stream = BytesMut::new();
    for _ in 0..100 {
        stream.extend_from_slice(&publish(256).encode().unwrap());
    }
    let stream = stream.freeze();

    c.bench_function("client/100_qos1_publishes_in_512b_chunks", |b| {
        b.iter(|| {
            for chunk in stream.chunks(512) {
                client.handle_transport(TransportEvent::Data(Bytes::copy_from_slice(chunk)));
            }
            transport.clear();
            black_box(client.drain_events().len())
        })
    });
}

criterion_group!(benches, bench_variable_int, bench_publish, bench_client_inbound);
criterion_main!(benches);
