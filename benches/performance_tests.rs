//! Performance benchmarks for tcplogd

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use std::time::Duration;
use tcplogd::config::{Protocol, ServerConfig};
use tcplogd::server::{LogServer, LogSink, MemorySink, RotatingFile};
use tempfile::tempdir;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::runtime::Runtime;

fn bench_config() -> ServerConfig {
    let mut config = ServerConfig::default();
    config.listener.protocol = Protocol::Tcp4;
    config.listener.address = "127.0.0.1".to_string();
    config.listener.port = 0;
    config
}

/// Benchmark raw sink writes, with and without frequent rotation
fn bench_rotating_file_writes(c: &mut Criterion) {
    let mut group = c.benchmark_group("rotating_file_writes");
    let line = b"Jan  1 00:00:00 router daemon.info dnsmasq[1234]: query[A] example.org from 192.168.1.20\n";
    group.throughput(Throughput::Bytes(line.len() as u64 * 1000));

    for max_bytes in [64 * 1024u64, 100 * 1024 * 1024].iter() {
        group.bench_with_input(
            BenchmarkId::new("max_bytes", max_bytes),
            max_bytes,
            |b, &max_bytes| {
                let temp_dir = tempdir().unwrap();
                let mut settings = bench_config().sink;
                settings.filename = temp_dir.path().join("bench.log");
                settings.max_backups = 3;
                let mut sink = RotatingFile::new(&settings).with_max_bytes(max_bytes);

                b.iter(|| {
                    for _ in 0..1000 {
                        sink.write(line).unwrap();
                    }
                });
                sink.close().unwrap();
            },
        );
    }

    group.finish();
}

/// Benchmark end-to-end ingest from concurrent clients
fn bench_concurrent_clients(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();

    let mut group = c.benchmark_group("concurrent_clients");
    group.measurement_time(Duration::from_secs(10));
    group.sample_size(10);

    for client_count in [1usize, 5, 20].iter() {
        group.throughput(Throughput::Elements(*client_count as u64 * 500));
        group.bench_with_input(
            BenchmarkId::new("clients", client_count),
            client_count,
            |b, &num_clients| {
                b.to_async(&rt).iter(|| async move {
                    let sink = MemorySink::new();
                    let server = LogServer::with_sink(&bench_config(), sink.clone())
                        .await
                        .unwrap();
                    let addr = server.local_addr().unwrap();
                    let shutdown = server.shutdown_handle();
                    let server_handle = tokio::spawn(server.run());

                    let mut handles = Vec::with_capacity(num_clients);
                    for i in 0..num_clients {
                        handles.push(tokio::spawn(async move {
                            let mut stream = TcpStream::connect(addr).await.unwrap();
                            for j in 0..500 {
                                let line = format!("client {} message {}\n", i, j);
                                stream.write_all(line.as_bytes()).await.unwrap();
                            }
                            stream.shutdown().await.unwrap();
                        }));
                    }
                    for handle in handles {
                        handle.await.unwrap();
                    }

                    while sink.write_calls() < num_clients * 500 {
                        tokio::time::sleep(Duration::from_millis(1)).await;
                    }
                    shutdown.trigger("bench");
                    server_handle.await.unwrap().unwrap();
                });
            },
        );
    }

    group.finish();
}

criterion_group!(benches, bench_rotating_file_writes, bench_concurrent_clients);
criterion_main!(benches);
