//! Spec §8 scenario 8: `get_proxy(name, cfg)` called twice with an
//! identical key returns the same cached instance.

use anyhow::Result;
use cdmf_ipc::factory::{ProxyFactory, ProxyFactoryConfig};
use cdmf_ipc::proxy::ProxyConfig;
use cdmf_ipc::stub::{sync_handler, ServiceStub, StubConfig};
use cdmf_ipc::transport::{TransportConfig, TransportType};

fn socket_path() -> String {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("cdmf-ipc-factory-test.sock");
    std::mem::forget(dir);
    path.to_string_lossy().into_owned()
}

#[tokio::test]
async fn get_proxy_caches_and_reuses_the_same_instance() -> Result<()> {
    let endpoint = socket_path();

    let mut server_config = TransportConfig::default();
    server_config.transport_type = TransportType::UnixSocket;
    server_config.endpoint = endpoint.clone();
    server_config.is_server = true;

    let stub = ServiceStub::new(StubConfig {
        transport_config: server_config,
        service_name: "test.factory".to_string(),
        ..Default::default()
    })?;
    stub.register_method("echo", sync_handler(|data| Ok(data)));
    stub.start().await?;

    let factory = ProxyFactory::new(ProxyFactoryConfig::default());

    let mut client_config = TransportConfig::default();
    client_config.transport_type = TransportType::UnixSocket;
    client_config.endpoint = endpoint.clone();

    let proxy_config = ProxyConfig {
        transport_config: client_config,
        service_name: "test.factory".to_string(),
        ..Default::default()
    };

    let first = factory
        .get_proxy("test.factory", proxy_config.clone())
        .expect("first get_proxy call must succeed");
    let second = factory
        .get_proxy("test.factory", proxy_config.clone())
        .expect("second get_proxy call must succeed");

    assert!(std::sync::Arc::ptr_eq(&first, &second));
    assert_eq!(factory.cached_proxy_count(), 1);
    assert_eq!(factory.aggregated_stats().cache_hits, 1);

    first.connect().await?;
    let result = first.call("echo", b"cached", 1_000).await;
    assert!(result.success);

    first.disconnect().await?;
    factory.shutdown().await;
    stub.stop().await?;
    Ok(())
}

#[tokio::test]
async fn distinct_endpoints_get_distinct_cache_entries() -> Result<()> {
    let factory = ProxyFactory::new(ProxyFactoryConfig::default());

    let mut config_a = ProxyConfig::default();
    config_a.service_name = "svc.a".to_string();
    config_a.transport_config.transport_type = TransportType::UnixSocket;
    config_a.transport_config.endpoint = "/tmp/cdmf-ipc-a.sock".to_string();

    let mut config_b = config_a.clone();
    config_b.service_name = "svc.b".to_string();
    config_b.transport_config.endpoint = "/tmp/cdmf-ipc-b.sock".to_string();

    let proxy_a = factory.get_proxy("svc.a", config_a).expect("proxy a");
    let proxy_b = factory.get_proxy("svc.b", config_b).expect("proxy b");

    assert!(!std::sync::Arc::ptr_eq(&proxy_a, &proxy_b));
    assert_eq!(factory.cached_proxy_count(), 2);

    factory.shutdown().await;
    Ok(())
}
