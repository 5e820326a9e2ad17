//! Integration tests for log rotation functionality

use flate2::read::GzDecoder;
use std::fs;
use std::io::Read;
use std::path::Path;
use std::time::Duration;
use tcplogd::config::{Protocol, ServerConfig};
use tcplogd::server::rotation::list_backups;
use tcplogd::server::{LogServer, RotatingFile};
use tempfile::tempdir;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::time::timeout;

/// Helper to create server config with rotation settings
fn create_rotation_config(log_file: &Path, max_backups: usize, compress: bool) -> ServerConfig {
    let mut config = ServerConfig::default();
    config.listener.protocol = Protocol::Tcp4;
    config.listener.address = "127.0.0.1".to_string();
    config.listener.port = 0;
    config.sink.filename = log_file.to_path_buf();
    config.sink.max_backups = max_backups;
    config.sink.compress = compress;
    config.sink.local_time = false;
    config
}

fn read_maybe_gz(path: &Path) -> Vec<u8> {
    let raw = fs::read(path).unwrap();
    if path.extension().and_then(|e| e.to_str()) == Some("gz") {
        let mut out = Vec::new();
        GzDecoder::new(raw.as_slice()).read_to_end(&mut out).unwrap();
        out
    } else {
        raw
    }
}

/// Backups oldest first, followed by the active file
fn everything_written(log_file: &Path) -> Vec<u8> {
    let mut backups = list_backups(log_file, false).unwrap();
    backups.reverse();
    let mut all = Vec::new();
    for backup in backups {
        all.extend(read_maybe_gz(&backup.path));
    }
    if log_file.exists() {
        all.extend(fs::read(log_file).unwrap());
    }
    all
}

/// Send `lines` over one connection, then shut the server down
async fn ingest(config: &ServerConfig, sink: RotatingFile, lines: &[String]) {
    let server = LogServer::with_sink(config, sink).await.unwrap();
    let addr = server.local_addr().unwrap();
    let shutdown = server.shutdown_handle();
    let handle = tokio::spawn(server.run());

    let mut stream = TcpStream::connect(addr).await.unwrap();
    for line in lines {
        stream.write_all(line.as_bytes()).await.unwrap();
    }
    stream.shutdown().await.unwrap();
    drop(stream);

    // Lines are unique and arrive in order, so the last one reaching the
    // active file means everything before it was written too
    let last = lines.last().unwrap().as_bytes().to_vec();
    let log_file = config.sink.filename.clone();
    timeout(Duration::from_secs(5), async {
        while !fs::read(&log_file).map(|c| c.ends_with(&last)).unwrap_or(false) {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("last line never reached the log file");

    shutdown.trigger("test");
    let report = timeout(Duration::from_secs(5), handle)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    let total = lines.len() as u64;
    assert_eq!(report.records_written, total);
}

fn numbered_lines(count: usize) -> Vec<String> {
    (0..count)
        .map(|i| format!("Numbered message: {:06}\n", i))
        .collect()
}

/// Test basic log rotation based on file size
#[tokio::test]
async fn test_size_based_rotation_loses_nothing() {
    let temp_dir = tempdir().unwrap();
    let log_file = temp_dir.path().join("logs/router.log");
    let config = create_rotation_config(&log_file, 0, false);
    let sink = RotatingFile::new(&config.sink).with_max_bytes(256);

    let lines = numbered_lines(100);
    ingest(&config, sink, &lines).await;

    let backups = list_backups(&log_file, false).unwrap();
    assert!(backups.len() >= 5, "expected several rotations, got {}", backups.len());
    for backup in &backups {
        assert!(fs::metadata(&backup.path).unwrap().len() <= 256);
    }
    assert_eq!(everything_written(&log_file), lines.concat().into_bytes());
}

/// Test rotation with compression enabled
#[tokio::test]
async fn test_rotation_with_compression() {
    let temp_dir = tempdir().unwrap();
    let log_file = temp_dir.path().join("router.log");
    let config = create_rotation_config(&log_file, 0, true);
    let sink = RotatingFile::new(&config.sink).with_max_bytes(512);

    let lines = numbered_lines(80);
    ingest(&config, sink, &lines).await;

    let backups = list_backups(&log_file, false).unwrap();
    assert!(!backups.is_empty());
    assert!(backups.iter().all(|b| b.compressed));
    assert_eq!(everything_written(&log_file), lines.concat().into_bytes());
}

/// Test rotation keeps only the configured number of backups
#[tokio::test]
async fn test_rotation_backup_limit() {
    let temp_dir = tempdir().unwrap();
    let log_file = temp_dir.path().join("router.log");
    let config = create_rotation_config(&log_file, 2, false);
    let sink = RotatingFile::new(&config.sink).with_max_bytes(128);

    let lines = numbered_lines(60);
    ingest(&config, sink, &lines).await;

    let backups = list_backups(&log_file, false).unwrap();
    assert_eq!(backups.len(), 2);

    // The newest data survives: backups plus active file end with the last line
    let tail = everything_written(&log_file);
    let text = String::from_utf8(tail).unwrap();
    assert!(text.ends_with(lines.last().unwrap()));
    assert!(!text.contains(&lines[0]));
}

/// An existing log from a previous run is appended to, not replaced
#[tokio::test]
async fn test_restart_appends_to_existing_log() {
    let temp_dir = tempdir().unwrap();
    let log_file = temp_dir.path().join("router.log");
    fs::write(&log_file, "from the previous run\n").unwrap();

    let config = create_rotation_config(&log_file, 0, false);
    let sink = RotatingFile::new(&config.sink);
    let lines = numbered_lines(3);
    ingest(&config, sink, &lines).await;

    let mut expected = b"from the previous run\n".to_vec();
    expected.extend(lines.concat().into_bytes());
    assert_eq!(fs::read(&log_file).unwrap(), expected);
}
