use async_trait::async_trait;
use clap::Parser;
use sipstack::{
    message::{Message, Method, Request},
    proxy::{Proxy, ProxyRouter},
    transaction::make_response,
    transport::{SipAddr, TransportLayer},
    EndpointBuilder, EndpointOption, Result, TlsConfig,
};
use std::{net::IpAddr, sync::Arc};
use tokio::select;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(author, version, about = "Stateless SIP proxy forwarding each request to its Request-URI")]
struct Args {
    /// Local address to bind
    #[arg(short, long, default_value = "0.0.0.0")]
    addr: IpAddr,

    /// UDP and TCP port
    #[arg(short, long, default_value = "5060")]
    port: u16,

    /// Host advertised in Via headers
    #[arg(long)]
    public_address: Option<String>,

    /// Disable the UDP transport
    #[arg(long)]
    no_udp: bool,

    /// Disable the TCP transport
    #[arg(long)]
    no_tcp: bool,

    /// TLS certificate chain (PEM)
    #[arg(long, requires = "tls_key")]
    tls_cert: Option<String>,

    /// TLS private key (PEM)
    #[arg(long, requires = "tls_cert")]
    tls_key: Option<String>,

    #[arg(long, default_value = "5061")]
    tls_port: u16,

    /// WebSocket listener port
    #[arg(long)]
    ws_port: Option<u16>,
}

struct RequestUriRouter;

#[async_trait]
impl ProxyRouter for RequestUriRouter {
    async fn route(
        &self,
        proxy: &Proxy,
        endpoint: &sipstack::Endpoint,
        mut rq: Request,
        remote: SipAddr,
    ) -> Result<()> {
        let max_forwards = rq
            .headers
            .text("max-forwards")
            .and_then(|v| v.trim().parse::<u32>().ok())
            .unwrap_or(endpoint.option().max_forwards);
        if max_forwards == 0 {
            if rq.method == Method::Ack {
                return Ok(());
            }
            warn!(%remote, "too many hops for {}", rq.uri);
            let rs = make_response(&rq, 483, None);
            return proxy.send(endpoint, rs.into(), None).await;
        }
        rq.headers
            .insert("max-forwards", (max_forwards - 1).to_string());
        info!(%remote, "forwarding {} {}", rq.method, rq.uri);
        proxy.send(endpoint, Message::Request(rq), None).await
    }
}

async fn load_tls(args: &Args) -> Result<Option<TlsConfig>> {
    let (Some(cert), Some(key)) = (&args.tls_cert, &args.tls_key) else {
        return Ok(None);
    };
    Ok(Some(TlsConfig {
        cert: Some(tokio::fs::read(cert).await?),
        key: Some(tokio::fs::read(key).await?),
        ca_certs: None,
    }))
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_file(true)
        .with_line_number(true)
        .init();

    let args = Args::parse();
    let option = EndpointOption {
        address: args.addr,
        public_address: args.public_address.clone(),
        port: args.port,
        udp: !args.no_udp,
        tcp: !args.no_tcp,
        tls_port: args.tls_port,
        tls: load_tls(&args).await?,
        ws_port: args.ws_port,
        ..Default::default()
    };

    let token = CancellationToken::new();
    let transport_layer = TransportLayer::new(token.child_token());
    transport_layer.bind(&option).await?;
    for addr in transport_layer.get_addrs() {
        info!("listening on {}", addr);
    }

    let proxy = Proxy::new(Arc::new(RequestUriRouter));
    let endpoint = EndpointBuilder::new()
        .with_option(option)
        .with_transport_layer(transport_layer)
        .with_handler(Arc::new(proxy))
        .with_cancel_token(token.clone())
        .build();

    select! {
        r = endpoint.serve() => r?,
        _ = tokio::signal::ctrl_c() => {
            info!("interrupted, shutting down");
        }
    }
    endpoint.destroy();
    Ok(())
}
