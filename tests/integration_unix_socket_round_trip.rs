//! End-to-end smoke test over the Unix domain socket transport: one
//! `ServiceStub` serving `echo`/`add`/`error`/`slow`, one `ServiceProxy`
//! driving every concrete scenario from spec §8.

use anyhow::Result;
use cdmf_ipc::error::{proxy_codes, stub_codes};
use cdmf_ipc::proxy::{ProxyConfig, RetryPolicy, ServiceProxy};
use cdmf_ipc::stub::{sync_handler, ServiceStub, StubConfig};
use cdmf_ipc::transport::{TransportConfig, TransportType};

fn socket_path() -> String {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("cdmf-ipc-test.sock");
    // Leak the TempDir so the socket file survives for the test's duration;
    // the OS reclaims it on process exit same as any other test temp file.
    std::mem::forget(dir);
    path.to_string_lossy().into_owned()
}

async fn spawn_stub(endpoint: &str) -> Result<ServiceStub> {
    let mut transport_config = TransportConfig::default();
    transport_config.transport_type = TransportType::UnixSocket;
    transport_config.endpoint = endpoint.to_string();
    transport_config.is_server = true;

    let stub = ServiceStub::new(StubConfig {
        transport_config,
        service_name: "test.echo".to_string(),
        ..Default::default()
    })?;

    stub.register_method("echo", sync_handler(|data| Ok(data)));
    stub.register_method(
        "add",
        sync_handler(|data| {
            if data.len() != 8 {
                return Err("add expects 8 bytes".to_string());
            }
            let a = i32::from_le_bytes(data[0..4].try_into().unwrap());
            let b = i32::from_le_bytes(data[4..8].try_into().unwrap());
            Ok((a + b).to_le_bytes().to_vec())
        }),
    );
    stub.register_method("error", sync_handler(|_| Err("Test error".to_string())));
    stub.register_method(
        "slow",
        sync_handler(|data| {
            std::thread::sleep(std::time::Duration::from_millis(2_000));
            Ok(data)
        }),
    );

    stub.start().await?;
    Ok(stub)
}

async fn connect_proxy(endpoint: &str) -> Result<ServiceProxy> {
    let mut transport_config = TransportConfig::default();
    transport_config.transport_type = TransportType::UnixSocket;
    transport_config.endpoint = endpoint.to_string();
    transport_config.is_server = false;

    let proxy = ServiceProxy::new(ProxyConfig {
        transport_config,
        service_name: "test.echo".to_string(),
        ..Default::default()
    })?;
    proxy.connect().await?;
    Ok(proxy)
}

#[tokio::test]
async fn echo_round_trip() -> Result<()> {
    let endpoint = socket_path();
    let stub = spawn_stub(&endpoint).await?;
    let proxy = connect_proxy(&endpoint).await?;

    let result = proxy.call("echo", b"Hello, World!", 1_000).await;
    assert!(result.success);
    assert_eq!(result.data, b"Hello, World!");

    proxy.disconnect().await?;
    stub.stop().await?;
    Ok(())
}

#[tokio::test]
async fn integer_add() -> Result<()> {
    let endpoint = socket_path();
    let stub = spawn_stub(&endpoint).await?;
    let proxy = connect_proxy(&endpoint).await?;

    let mut payload = Vec::with_capacity(8);
    payload.extend_from_slice(&42i32.to_le_bytes());
    payload.extend_from_slice(&58i32.to_le_bytes());

    let result = proxy.call("add", &payload, 1_000).await;
    assert!(result.success);
    assert_eq!(i32::from_le_bytes(result.data[0..4].try_into().unwrap()), 100);

    proxy.disconnect().await?;
    stub.stop().await?;
    Ok(())
}

#[tokio::test]
async fn method_not_found_reports_correct_code() -> Result<()> {
    let endpoint = socket_path();
    let stub = spawn_stub(&endpoint).await?;
    let proxy = connect_proxy(&endpoint).await?;

    let result = proxy.call("nonexistent", b"", 1_000).await;
    assert!(!result.success);
    assert_eq!(result.error_code, stub_codes::METHOD_NOT_FOUND);

    proxy.disconnect().await?;
    stub.stop().await?;
    Ok(())
}

#[tokio::test]
async fn handler_exception_carries_message() -> Result<()> {
    let endpoint = socket_path();
    let stub = spawn_stub(&endpoint).await?;
    let proxy = connect_proxy(&endpoint).await?;

    let result = proxy.call("error", b"", 1_000).await;
    assert!(!result.success);
    assert_eq!(result.error_code, stub_codes::HANDLER_EXCEPTION);
    assert!(result.error_message.contains("Test error"));

    proxy.disconnect().await?;
    stub.stop().await?;
    Ok(())
}

#[tokio::test]
async fn slow_handler_times_out_on_the_client_side() -> Result<()> {
    let endpoint = socket_path();
    let stub = spawn_stub(&endpoint).await?;
    let proxy = connect_proxy(&endpoint).await?;

    proxy.set_retry_policy(RetryPolicy {
        enabled: false,
        ..Default::default()
    });
    let result = proxy.call("slow", b"", 500).await;
    assert!(!result.success);
    assert_eq!(result.error_code, proxy_codes::TIMEOUT);
    assert_eq!(proxy.stats().timeout_calls, 1);

    proxy.disconnect().await?;
    stub.stop().await?;
    Ok(())
}

#[tokio::test]
async fn large_payload_round_trip() -> Result<()> {
    let endpoint = socket_path();
    let stub = spawn_stub(&endpoint).await?;
    let proxy = connect_proxy(&endpoint).await?;

    let size = 1024 * 1024;
    let payload: Vec<u8> = (0..size).map(|i| (i % 256) as u8).collect();
    let result = proxy.call("echo", &payload, 5_000).await;
    assert!(result.success);
    assert_eq!(result.data, payload);

    proxy.disconnect().await?;
    stub.stop().await?;
    Ok(())
}

#[tokio::test]
async fn two_clients_each_get_their_own_response() -> Result<()> {
    let endpoint = socket_path();
    let stub = spawn_stub(&endpoint).await?;
    let p1 = connect_proxy(&endpoint).await?;
    let p2 = connect_proxy(&endpoint).await?;

    let (r1, r2) = tokio::join!(
        p1.call("echo", b"from client one", 1_000),
        p2.call("echo", b"from client two", 1_000),
    );

    assert!(r1.success && r2.success);
    assert_eq!(r1.data, b"from client one");
    assert_eq!(r2.data, b"from client two");

    p1.disconnect().await?;
    p2.disconnect().await?;
    stub.stop().await?;
    Ok(())
}
