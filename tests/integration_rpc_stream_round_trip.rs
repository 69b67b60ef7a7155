//! End-to-end smoke test over the RPC-over-stream (TCP loopback) transport.

use anyhow::Result;
use cdmf_ipc::proxy::{ProxyConfig, ServiceProxy};
use cdmf_ipc::stub::{sync_handler, ServiceStub, StubConfig};
use cdmf_ipc::transport::{TransportConfig, TransportType};

fn unique_port() -> u16 {
    // Bind to port 0 to let the OS assign a free ephemeral port, then drop
    // the listener immediately; good enough for a single-shot test harness
    // that starts its own server right after.
    let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind ephemeral port");
    listener.local_addr().expect("local addr").port()
}

#[tokio::test]
async fn echo_round_trip_over_tcp() -> Result<()> {
    let endpoint = format!("127.0.0.1:{}", unique_port());

    let mut server_config = TransportConfig::default();
    server_config.transport_type = TransportType::RpcStream;
    server_config.endpoint = endpoint.clone();
    server_config.is_server = true;

    let stub = ServiceStub::new(StubConfig {
        transport_config: server_config,
        service_name: "test.rpc_stream".to_string(),
        ..Default::default()
    })?;
    stub.register_method("echo", sync_handler(|data| Ok(data)));
    stub.start().await?;

    let mut client_config = TransportConfig::default();
    client_config.transport_type = TransportType::RpcStream;
    client_config.endpoint = endpoint;
    client_config.is_server = false;

    let proxy = ServiceProxy::new(ProxyConfig {
        transport_config: client_config,
        service_name: "test.rpc_stream".to_string(),
        ..Default::default()
    })?;
    proxy.connect().await?;

    let result = proxy.call("echo", b"over tcp", 1_000).await;
    assert!(result.success);
    assert_eq!(result.data, b"over tcp");

    proxy.disconnect().await?;
    stub.stop().await?;
    Ok(())
}
