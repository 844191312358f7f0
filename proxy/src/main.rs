//! Revamp Proxy entry point
//!
//! Loads configuration, loads or generates the CA, and starts the three front doors (HTTP
//! proxy, SOCKS5, captive portal) against one shared [`ResponsePipeline`].
//! The CLI banner and user-facing setup instructions are out of scope; this is just
//! process wiring.

use std::net::SocketAddr;
use std::sync::Arc;

use revamp_proxy::blocklist::StaticBlockList;
use revamp_proxy::cache::ContentCache;
use revamp_proxy::cert::CertificateAuthority;
use revamp_proxy::config::{ConfigHandle, RevampConfig};
use revamp_proxy::error::FatalInit;
use revamp_proxy::http_frontend::HttpFrontend;
use revamp_proxy::metrics::Metrics;
use revamp_proxy::origin::OriginClient;
use revamp_proxy::pipeline::ResponsePipeline;
use revamp_proxy::portal::PortalEndpoint;
use revamp_proxy::socks5::Socks5Frontend;
use revamp_proxy::transform::{NoopTransformer, TransformerPool};
use tracing::{error, info};

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    if let Err(e) = run().await {
        error!(error = %e, "fatal startup error");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), FatalInit> {
    let config = RevampConfig::from_env();
    info!(
        http_proxy_port = config.http_proxy_port,
        socks5_port = config.socks5_port,
        portal_port = config.portal_port,
        "starting Revamp Proxy"
    );

    let metrics = Arc::new(Metrics::new().expect("metric registration never fails on first init"));

    let cert_authority = Arc::new(
        CertificateAuthority::ensure_ca(&config.cert_dir, Arc::clone(&metrics))
            .map_err(FatalInit::Ca)?,
    );

    let cache = Arc::new(ContentCache::new(
        config.cache_dir.clone(),
        config.flags.cache_enabled,
        Arc::clone(&metrics),
    ));
    cache.spawn_sweeper();

    // The real JS/CSS/HTML rewriting logic is out of scope; a `NoopTransformer`
    // exercises the whole pool/cache/pipeline path today, and is the seam where a real
    // `Transformer` impl plugs in.
    let transformer_pool = Arc::new(TransformerPool::new(
        Arc::new(NoopTransformer),
        Arc::clone(&metrics),
    ));
    let origin_client = Arc::new(OriginClient::new(
        config.allow_self_signed_origins,
        config.flags.spoof_user_agent,
    ));
    let block_list = Arc::new(StaticBlockList::new());
    let pipeline = Arc::new(ResponsePipeline::new(
        Arc::clone(&cache),
        Arc::clone(&transformer_pool),
        Arc::clone(&origin_client),
        block_list,
        Arc::clone(&metrics),
    ));

    let config_handle = ConfigHandle::new(config.clone());

    let http_frontend = Arc::new(HttpFrontend::new(
        Arc::clone(&pipeline),
        Arc::clone(&cert_authority),
        config_handle.clone(),
        Arc::clone(&metrics),
    ));
    let http_addr = SocketAddr::from(([0, 0, 0, 0], config.http_proxy_port));

    let socks5_frontend = Arc::new(Socks5Frontend::new(http_addr, Arc::clone(&metrics)));
    let socks5_addr = SocketAddr::from(([0, 0, 0, 0], config.socks5_port));

    let portal = Arc::new(PortalEndpoint::new(Arc::clone(&cert_authority), Arc::clone(&metrics)));
    let portal_addr = SocketAddr::from(([0, 0, 0, 0], config.portal_port));

    let http_task = tokio::spawn(async move { http_frontend.serve(http_addr).await });
    let socks5_task = tokio::spawn(async move { socks5_frontend.serve(socks5_addr).await });
    let portal_task = tokio::spawn(async move { portal.serve(portal_addr).await });

    let (http_result, socks5_result, portal_result) =
        tokio::join!(http_task, socks5_task, portal_task);

    http_result.expect("HTTP frontend task panicked")?;
    socks5_result.expect("SOCKS5 frontend task panicked")?;
    portal_result.expect("portal task panicked")?;

    Ok(())
}
