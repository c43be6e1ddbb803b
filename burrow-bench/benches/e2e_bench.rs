//! End-to-end client-server benchmarks.

use burrow_client::{ClientConfig, NetClient, SystemClient};
use burrow_protocol::{Id, WireBuffer, WireReader};
use burrow_server::{EchoSystem, Server, ServerConfig, System, SystemRegistry};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Runtime;

const PUMP_INTERVAL: Duration = Duration::from_micros(100);
const TIMEOUT: Duration = Duration::from_secs(5);

/// Discards every update.
struct NullClient;

impl SystemClient for NullClient {
    fn number(&self) -> u32 {
        1
    }

    fn apply_update(&self, update: WireReader) {
        black_box(update);
    }
}

struct TestSetup {
    server: Arc<Server>,
    client: NetClient,
}

fn setup_server_and_client(rt: &Runtime) -> TestSetup {
    let registry =
        SystemRegistry::new([Arc::new(EchoSystem::default()) as Arc<dyn System>]).unwrap();
    let server = Arc::new(Server::new(
        ServerConfig::new("127.0.0.1:0".parse().unwrap()),
        registry,
    ));

    let (listener, addr) = rt.block_on(async {
        let listener = server.bind().unwrap();
        let addr = listener.local_addr().unwrap();
        (listener, addr)
    });

    let server_clone = server.clone();
    rt.spawn(async move {
        let _ = server_clone.serve(listener).await;
    });

    let config = ClientConfig::new(addr)
        .with_session_id(Id::new(1, 1))
        .with_auto_disconnect_pumps(u32::MAX);
    let client = NetClient::new(
        config,
        [Arc::new(NullClient) as Arc<dyn SystemClient>],
        rt.handle().clone(),
    )
    .unwrap();

    TestSetup { server, client }
}

fn round_trip(rt: &Runtime, client: &mut NetClient, commands: u32, payload: &Arc<Vec<u8>>) {
    for request in 0..commands {
        let payload = payload.clone();
        client.schedule_send(
            1,
            request,
            Box::new(move |buf: &mut WireBuffer| buf.write_bytes(&payload)),
        );
    }
    rt.block_on(client.pump_until_response(PUMP_INTERVAL, TIMEOUT))
        .unwrap();
}

fn bench_echo_latency(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let mut setup = setup_server_and_client(&rt);
    let payload = Arc::new(vec![1, 0, 0, 0, 0, 0, 0, 0, 3, 4, 5, 6]);

    let mut group = c.benchmark_group("e2e_echo");
    group.throughput(Throughput::Elements(1));

    group.bench_function("single_command", |b| {
        b.iter(|| round_trip(&rt, &mut setup.client, 1, &payload));
    });

    group.finish();
    setup.server.shutdown();
}

fn bench_batch_throughput(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let mut setup = setup_server_and_client(&rt);
    let payload = Arc::new(vec![0x42u8; 256]);

    let mut group = c.benchmark_group("e2e_batch");

    for commands in [8u32, 64, 512] {
        group.throughput(Throughput::Elements(commands as u64));
        group.bench_with_input(
            BenchmarkId::from_parameter(commands),
            &commands,
            |b, &commands| {
                b.iter(|| round_trip(&rt, &mut setup.client, commands, &payload));
            },
        );
    }

    group.finish();
    setup.server.shutdown();
}

fn bench_concurrent_clients(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let setup = setup_server_and_client(&rt);

    let mut group = c.benchmark_group("e2e_concurrent");

    for clients in [2usize, 8] {
        group.throughput(Throughput::Elements(clients as u64));
        group.bench_with_input(BenchmarkId::from_parameter(clients), &clients, |b, &clients| {
            b.iter(|| {
                rt.block_on(async {
                    let tasks = (0..clients).map(|i| {
                        let mut client = fresh_client(&setup, i as u64);
                        async move {
                            client.schedule_send(
                                1,
                                0,
                                Box::new(|buf: &mut WireBuffer| buf.write_u32(7)),
                            );
                            client.pump_until_response(PUMP_INTERVAL, TIMEOUT).await
                        }
                    });
                    for result in futures::future::join_all(tasks).await {
                        result.unwrap();
                    }
                });
            });
        });
    }

    group.finish();
    setup.server.shutdown();
}

fn fresh_client(setup: &TestSetup, n: u64) -> NetClient {
    let config = ClientConfig::new(setup.client.config().addr).with_session_id(Id::new(2, n));
    NetClient::new(
        config,
        [Arc::new(NullClient) as Arc<dyn SystemClient>],
        tokio::runtime::Handle::current(),
    )
    .unwrap()
}

criterion_group!(
    benches,
    bench_echo_latency,
    bench_batch_throughput,
    bench_concurrent_clients,
);

criterion_main!(benches);
