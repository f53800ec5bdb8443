// Nearby LAN daemon: advertise, scan, serve pulls.

mod config;
mod frame;
mod radio;

use std::time::Duration;

use nearby_core::{Message, MessageId, NearbyEvent, NearbySession, ServiceId};
use tracing::info;

const VERSION: &str = env!("CARGO_PKG_VERSION");

fn main() -> anyhow::Result<()> {
    for arg in std::env::args().skip(1) {
        if arg == "--version" || arg == "-V" {
            println!("nearby-lan {}", VERSION);
            return Ok(());
        }
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cfg = config::load();
    let service: ServiceId = cfg.service.parse()?;

    // First non-flag argument, if any, is published as a message payload.
    let publish_text = std::env::args().skip(1).find(|a| !a.starts_with('-'));

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async {
        let listener = tokio::net::TcpListener::bind(("0.0.0.0", cfg.pull_port)).await?;
        info!(pull_port = cfg.pull_port, advert_port = cfg.advert_port, %service, "starting");

        let lan = radio::LanRadio::new(service, cfg.clone());
        let core_cfg = nearby_core::Config {
            presence_ttl: Duration::from_secs(cfg.presence_ttl_secs),
            chunk_size: radio::chunk_size_for(cfg.transfer_unit),
        };
        let (session, mut events) = NearbySession::new(lan, core_cfg);

        let handle = session.pull_handle();
        handle
            .set_chunk_size(radio::chunk_size_for(cfg.transfer_unit))
            .await;
        tokio::spawn(radio::serve(listener, handle));

        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                match event {
                    NearbyEvent::Found { id, payload } => {
                        info!(%id, len = payload.as_ref().map(Vec::len).unwrap_or(0), "found")
                    }
                    NearbyEvent::Lost { id, .. } => info!(%id, "lost"),
                    NearbyEvent::PublishExpired => info!("publish expired"),
                    NearbyEvent::SubscribeExpired => info!("subscribe expired"),
                }
            }
        });

        if let Some(text) = publish_text {
            session
                .start_publish(Message::new(MessageId::random(), text.into_bytes()), None)
                .await?;
        }
        session.start_subscribe(None).await?;

        shutdown_signal().await?;
        session.shutdown().await;
        Ok::<(), anyhow::Error>(())
    })?;
    Ok(())
}

/// Wait for Ctrl+C or SIGTERM (Unix).
async fn shutdown_signal() -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
    }
    Ok(())
}
