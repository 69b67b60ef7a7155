//! Shared-memory round trip sized so the ring wraps (spec §8 "Bounded
//! queue" invariant). `ring_buffer_capacity` is small enough that the
//! cumulative bytes pushed across the run exceed it several times over,
//! forcing the data-pointer index in `transport::shared_memory` to wrap
//! around the buffer while the free-running `read_pos`/`write_pos`
//! cursors keep climbing -- the scenario that corrupted frames before
//! the ring's wrap arithmetic was fixed.

use anyhow::Result;
use cdmf_ipc::proxy::{ProxyConfig, ServiceProxy};
use cdmf_ipc::stub::{sync_handler, ServiceStub, StubConfig};
use cdmf_ipc::transport::{TransportConfig, TransportType};

fn segment_name() -> String {
    static COUNTER: std::sync::atomic::AtomicU32 = std::sync::atomic::AtomicU32::new(0);
    let n = COUNTER.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
    format!("/cdmf_ipc_shm_test_{}_{}", std::process::id(), n)
}

#[tokio::test]
async fn many_small_messages_wrap_the_ring_without_corruption() -> Result<()> {
    let endpoint = segment_name();

    let mut server_config = TransportConfig::default();
    server_config.transport_type = TransportType::SharedMemory;
    server_config.endpoint = endpoint.clone();
    server_config.is_server = true;
    server_config.ring_buffer_capacity = 256;

    let stub = ServiceStub::new(StubConfig {
        transport_config: server_config,
        service_name: "test.shm".to_string(),
        ..Default::default()
    })?;
    stub.register_method("echo", sync_handler(|data| Ok(data)));
    stub.start().await?;

    let mut client_config = TransportConfig::default();
    client_config.transport_type = TransportType::SharedMemory;
    client_config.endpoint = endpoint;
    client_config.is_server = false;
    client_config.ring_buffer_capacity = 256;

    let proxy = ServiceProxy::new(ProxyConfig {
        transport_config: client_config,
        service_name: "test.shm".to_string(),
        ..Default::default()
    })?;
    proxy.connect().await?;

    // Each round trip is drained before the next is sent, so no single
    // frame need exceed the ring, but 80 of them push well past 256 bytes
    // cumulatively in each direction -- several index wraps per ring.
    for i in 0..80u32 {
        let payload: Vec<u8> = (0..32).map(|b| ((i + b) % 256) as u8).collect();
        let result = proxy.call("echo", &payload, 2_000).await;
        assert!(result.success, "call {} failed: {:?}", i, result);
        assert_eq!(result.data, payload, "call {} returned corrupted data", i);
    }

    proxy.disconnect().await?;
    stub.stop().await?;
    Ok(())
}
