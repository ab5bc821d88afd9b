use std::{
    path::Path,
    thread,
    time::{Duration, Instant},
};

use localcomm::{Endpoint, RpcError};

fn unique(name: &str) -> String {
    format!("{name}-{}", std::process::id())
}

fn spin_for(mut endpoint: Endpoint, calls: usize) -> thread::JoinHandle<()> {
    thread::spawn(move || {
        let mut served = 0;
        while served < calls {
            if endpoint.spin_once(Some(Duration::from_millis(100))).unwrap() {
                served += 1;
            }
        }
    })
}

/// Shm objects carrying `service` payloads still present in the OS
/// namespace.
fn leftover_segments(service: &str) -> Vec<String> {
    let shm_dir = Path::new("/dev/shm");
    if !shm_dir.is_dir() {
        return Vec::new();
    }
    std::fs::read_dir(shm_dir)
        .unwrap()
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.file_name().to_string_lossy().into_owned())
        .filter(|name| name.contains(service))
        .collect()
}

#[test]
fn identity_service() {
    let service = unique("e2e-identity");
    let mut server = Endpoint::new().unwrap();
    server
        .create_service(&service, |request: &[u8]| -> Result<Vec<u8>, String> {
            Ok(request.to_vec())
        })
        .unwrap();
    let server = spin_for(server, 1);

    let mut client = Endpoint::new().unwrap();
    let caller = client.create_service_caller(&service).unwrap();
    assert_eq!(caller.call(b"hello").unwrap(), b"hello");

    server.join().unwrap();
    assert!(leftover_segments(&service).is_empty());
}

#[test]
fn reverse_bytes_service() {
    let service = unique("e2e-reverse");
    let mut server = Endpoint::new().unwrap();
    server
        .create_service(&service, |request: &[u8]| -> Result<Vec<u8>, String> {
            let mut reply = request.to_vec();
            reply.reverse();
            Ok(reply)
        })
        .unwrap();
    let server = spin_for(server, 1);

    let mut client = Endpoint::new().unwrap();
    let caller = client.create_service_caller(&service).unwrap();
    assert_eq!(caller.call(b"\x00\x01\x02\x03").unwrap(), b"\x03\x02\x01\x00");

    server.join().unwrap();
}

#[test]
fn large_echo_stays_on_the_memory_path() {
    const LEN: usize = 64 * 1024 * 1024;

    let service = unique("e2e-large");
    let mut server = Endpoint::new().unwrap();
    server
        .create_service(&service, |request: &[u8]| -> Result<Vec<u8>, String> {
            Ok(request.to_vec())
        })
        .unwrap();
    let server = spin_for(server, 1);

    let mut client = Endpoint::new().unwrap();
    let caller = client.create_service_caller(&service).unwrap();
    let request = vec![0xAB; LEN];
    let start = Instant::now();
    let reply = caller.call(&request).unwrap();
    let elapsed = start.elapsed();
    assert_eq!(reply, request);
    assert!(elapsed < Duration::from_secs(10), "64 MiB round-trip took {elapsed:?}");

    server.join().unwrap();
    assert!(leftover_segments(&service).is_empty());
}

#[test]
fn grown_reply_leaves_nothing_behind() {
    const REPLY_LEN: usize = 16 * 1024 * 1024;

    let service = unique("e2e-grow");
    let mut server = Endpoint::new().unwrap();
    server
        .create_service(&service, |_request: &[u8]| -> Result<Vec<u8>, String> {
            Ok(vec![0xEE; REPLY_LEN])
        })
        .unwrap();
    let server = spin_for(server, 1);

    let mut client = Endpoint::new().unwrap();
    let caller = client.create_service_caller(&service).unwrap();
    let reply = caller.call(&vec![0x11; 1024]).unwrap();
    assert_eq!(reply.len(), REPLY_LEN);
    assert!(reply.iter().all(|&b| b == 0xEE));

    // Both the request segment and the grown reply segment are unlinked once
    // the server finished the handoff.
    server.join().unwrap();
    assert!(leftover_segments(&service).is_empty());
}

#[test]
fn failing_handler_leaves_nothing_behind() {
    let service = unique("e2e-boom");
    let mut server = Endpoint::new().unwrap();
    server
        .create_service(&service, |_request: &[u8]| -> Result<Vec<u8>, String> {
            Err("boom".to_string())
        })
        .unwrap();
    let server = spin_for(server, 1);

    let mut client = Endpoint::new().unwrap();
    let caller = client.create_service_caller(&service).unwrap();
    let err = caller.call(b"payload").unwrap_err();
    assert!(matches!(err, RpcError::Remote(message) if message == "boom"));

    server.join().unwrap();
    assert!(leftover_segments(&service).is_empty());
}

#[test]
fn overlapping_calls_share_one_handler_lane() {
    const HANDLER_TIME: Duration = Duration::from_millis(100);

    let service = unique("e2e-lane");
    let mut server = Endpoint::new().unwrap();
    server
        .create_service(&service, move |request: &[u8]| -> Result<Vec<u8>, String> {
            thread::sleep(HANDLER_TIME);
            Ok(request.to_vec())
        })
        .unwrap();
    let server = spin_for(server, 2);

    let start = Instant::now();
    let clients: Vec<_> = [b"alpha".to_vec(), b"bravo".to_vec()]
        .into_iter()
        .map(|payload| {
            let service = service.clone();
            thread::spawn(move || {
                let mut client = Endpoint::new().unwrap();
                let caller = client.create_service_caller(&service).unwrap();
                let reply = caller.call(&payload).unwrap();
                assert_eq!(reply, payload);
            })
        })
        .collect();
    for client in clients {
        client.join().unwrap();
    }
    // One handler at a time: total wall time is the sum of handler times.
    assert!(start.elapsed() >= HANDLER_TIME * 2 - Duration::from_millis(20));

    server.join().unwrap();
}

#[test]
fn zero_length_request_and_reply() {
    let service = unique("e2e-zero");
    let mut server = Endpoint::new().unwrap();
    server
        .create_service(&service, |_request: &[u8]| -> Result<Vec<u8>, String> { Ok(Vec::new()) })
        .unwrap();
    let server = spin_for(server, 1);

    let mut client = Endpoint::new().unwrap();
    let caller = client.create_service_caller(&service).unwrap();
    assert!(caller.call(&[]).unwrap().is_empty());

    server.join().unwrap();
}

#[test]
fn long_service_names() {
    let max = format!("{:x<96}", unique("e2e-max"));
    assert_eq!(max.len(), 96);
    assert!(localcomm::utils::validate_service_name(&max).is_ok());

    // sun_path caps the socket path at 108 bytes, runtime dir included; the
    // live roundtrip keeps the bound name inside that.
    let service = format!("{:x<60}", unique("e2e-long"));
    let mut server = Endpoint::new().unwrap();
    server
        .create_service(&service, |request: &[u8]| -> Result<Vec<u8>, String> {
            Ok(request.to_vec())
        })
        .unwrap();
    let server = spin_for(server, 1);

    let mut client = Endpoint::new().unwrap();
    let caller = client.create_service_caller(&service).unwrap();
    assert_eq!(caller.call(b"fits").unwrap(), b"fits");

    server.join().unwrap();
}

#[test]
fn separator_in_name_fails_before_any_socket() {
    let mut endpoint = Endpoint::new().unwrap();
    assert!(matches!(
        endpoint.create_service_caller("no/such/name").unwrap_err(),
        RpcError::Protocol(_)
    ));
    assert!(matches!(
        endpoint
            .create_service("no/such/name", |request: &[u8]| -> Result<Vec<u8>, String> {
                Ok(request.to_vec())
            })
            .unwrap_err(),
        RpcError::Protocol(_)
    ));
}

#[test]
fn removed_service_is_gone() {
    let service = unique("e2e-removed");
    let mut endpoint = Endpoint::new().unwrap();
    endpoint
        .create_service(&service, |request: &[u8]| -> Result<Vec<u8>, String> {
            Ok(request.to_vec())
        })
        .unwrap();
    endpoint.remove_service(&service).unwrap();

    let mut client = Endpoint::new().unwrap();
    let caller = client.create_service_caller(&service).unwrap();
    assert!(matches!(caller.call(b"x").unwrap_err(), RpcError::NotFound(_)));
}

