//! # CDMF IPC Demonstration Harness
//!
//! A minimal end-to-end exerciser for the CDMF IPC substrate: it starts one
//! `ServiceStub` and one `ServiceProxy` over the selected transport and runs
//! through the scenarios named in spec §8 (echo, integer add, unknown
//! method, handler exception, timeout, a large payload, and a second
//! independent client routed through the same stub). This is a harness for
//! exercising the substrate, not a throughput/latency benchmark.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use cdmf_ipc::cli::Args;
use cdmf_ipc::error::{proxy_codes, stub_codes};
use cdmf_ipc::factory::{ProxyFactory, ProxyFactoryConfig};
use cdmf_ipc::logging::ColorizedFormatter;
use cdmf_ipc::proxy::ProxyConfig;
use cdmf_ipc::stub::{sync_handler, ServiceStub, StubConfig};
use cdmf_ipc::transport::TransportConfig;
use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::{filter::LevelFilter, prelude::*, Layer};

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let log_level = match args.verbose {
        0 => LevelFilter::INFO,
        1 => LevelFilter::DEBUG,
        _ => LevelFilter::TRACE,
    };

    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .with_filter(log_level);

    let stdout_layer = if !args.quiet {
        Some(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stdout)
                .event_format(ColorizedFormatter)
                .with_filter(log_level),
        )
    } else {
        None
    };

    tracing_subscriber::registry()
        .with(stderr_layer)
        .with(stdout_layer)
        .init();

    info!(mechanism = %args.mechanism, "starting cdmf-ipc demonstration harness");

    if let Err(e) = run(&args).await {
        error!(error = %e, "demonstration harness failed");
        return Err(e);
    }

    info!("demonstration harness completed successfully");
    Ok(())
}

async fn run(args: &Args) -> Result<()> {
    let endpoint = args.resolved_endpoint();
    let transport_type = args.mechanism.into();

    let mut transport_config = TransportConfig::default();
    transport_config.transport_type = transport_type;
    transport_config.endpoint = endpoint.clone();
    transport_config.is_server = true;

    let stub_config = StubConfig {
        transport_config: transport_config.clone(),
        service_name: "demo.echo".to_string(),
        ..Default::default()
    };

    let stub = ServiceStub::new(stub_config)?;
    register_handlers(&stub);
    stub.start().await?;
    info!(endpoint = %endpoint, "stub listening");

    let factory = ProxyFactory::new(ProxyFactoryConfig::default());

    let mut client_transport_config = transport_config.clone();
    client_transport_config.is_server = false;

    let proxy_config = ProxyConfig {
        transport_config: client_transport_config.clone(),
        service_name: "demo.echo".to_string(),
        ..Default::default()
    };

    let proxy = factory
        .get_proxy("demo.echo", proxy_config.clone())
        .expect("factory returns a proxy for a fresh key");
    proxy.connect().await?;

    run_echo_scenario(&proxy).await?;
    run_add_scenario(&proxy).await?;
    run_method_not_found_scenario(&proxy).await?;
    run_handler_exception_scenario(&proxy).await?;
    run_timeout_scenario(&proxy).await?;
    run_large_payload_scenario(&proxy, args.large_payload_size).await?;
    run_second_client_scenario(&factory, &proxy_config).await?;

    info!(stats = ?proxy.stats(), "final proxy statistics");
    info!(stats = ?stub.stats(), "final stub statistics");

    proxy.disconnect().await?;
    factory.shutdown().await;
    stub.stop().await?;
    Ok(())
}

fn register_handlers(stub: &ServiceStub) {
    stub.register_method(
        "echo",
        sync_handler(|data| Ok(data)),
    );

    stub.register_method(
        "add",
        sync_handler(|data| {
            if data.len() != 8 {
                return Err("add expects two little-endian i32 arguments".to_string());
            }
            let a = i32::from_le_bytes(data[0..4].try_into().unwrap());
            let b = i32::from_le_bytes(data[4..8].try_into().unwrap());
            Ok((a + b).to_le_bytes().to_vec())
        }),
    );

    stub.register_method(
        "error",
        sync_handler(|_| Err("Test error".to_string())),
    );

    stub.register_method(
        "slow",
        sync_handler(|data| {
            std::thread::sleep(Duration::from_millis(2_000));
            Ok(data)
        }),
    );
}

async fn run_echo_scenario(proxy: &Arc<cdmf_ipc::proxy::ServiceProxy>) -> Result<()> {
    let result = proxy.call("echo", b"hello, cdmf", 1_000).await;
    if !result.success || result.data != b"hello, cdmf" {
        bail!("echo scenario failed: {:?}", result);
    }
    info!("echo scenario passed");
    Ok(())
}

async fn run_add_scenario(proxy: &Arc<cdmf_ipc::proxy::ServiceProxy>) -> Result<()> {
    let mut payload = Vec::with_capacity(8);
    payload.extend_from_slice(&42i32.to_le_bytes());
    payload.extend_from_slice(&58i32.to_le_bytes());

    let result = proxy.call("add", &payload, 1_000).await;
    let sum = if result.data.len() == 4 {
        i32::from_le_bytes(result.data[0..4].try_into().unwrap())
    } else {
        0
    };
    if !result.success || sum != 100 {
        bail!("add scenario failed: {:?}", result);
    }
    info!(sum, "add scenario passed");
    Ok(())
}

async fn run_method_not_found_scenario(proxy: &Arc<cdmf_ipc::proxy::ServiceProxy>) -> Result<()> {
    let result = proxy.call("no_such_method", b"", 1_000).await;
    if result.success || result.error_code != stub_codes::METHOD_NOT_FOUND {
        bail!("method-not-found scenario failed: {:?}", result);
    }
    info!("method-not-found scenario passed");
    Ok(())
}

async fn run_handler_exception_scenario(proxy: &Arc<cdmf_ipc::proxy::ServiceProxy>) -> Result<()> {
    let result = proxy.call("error", b"", 1_000).await;
    if result.success
        || result.error_code != stub_codes::HANDLER_EXCEPTION
        || !result.error_message.contains("Test error")
    {
        bail!("handler-exception scenario failed: {:?}", result);
    }
    info!("handler-exception scenario passed");
    Ok(())
}

async fn run_timeout_scenario(proxy: &Arc<cdmf_ipc::proxy::ServiceProxy>) -> Result<()> {
    let policy = cdmf_ipc::proxy::RetryPolicy {
        enabled: false,
        ..Default::default()
    };
    proxy.set_retry_policy(policy);
    let result = proxy.call("slow", b"", 500).await;
    if result.success || result.error_code != proxy_codes::TIMEOUT {
        bail!("timeout scenario failed: {:?}", result);
    }
    info!("timeout scenario passed");
    Ok(())
}

async fn run_large_payload_scenario(proxy: &Arc<cdmf_ipc::proxy::ServiceProxy>, size: usize) -> Result<()> {
    let payload: Vec<u8> = (0..size).map(|i| (i % 256) as u8).collect();
    let result = proxy.call("echo", &payload, 5_000).await;
    if !result.success || result.data.len() != size {
        bail!("large-payload scenario failed: got {} bytes", result.data.len());
    }
    info!(bytes = size, "large-payload scenario passed");
    Ok(())
}

async fn run_second_client_scenario(
    factory: &Arc<ProxyFactory>,
    proxy_config: &ProxyConfig,
) -> Result<()> {
    let second = factory
        .get_proxy("demo.echo", proxy_config.clone())
        .expect("factory returns the cached proxy for the same key");
    if !second.is_connected() {
        second.connect().await?;
    }
    let result = second.call("echo", b"second client", 1_000).await;
    if !result.success || result.data != b"second client" {
        bail!("second-client scenario failed: {:?}", result);
    }
    info!(cached = factory.cached_proxy_count(), "second-client scenario passed (factory cache reused)");
    Ok(())
}
