use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use anyhow::Context;
use colored::*;
use sweepr_common::config::Config;
use sweepr_core::{Engine, Mdns};
use sweepr_protocols::mdns::Message;
use tracing::info;

use crate::terminal::{colors, print, spinner::Spinner};

pub async fn listen(seconds: u64) -> anyhow::Result<()> {
    let mdns: Mdns = Mdns::new().context("building the mDNS probe")?;
    let config: Config = Config {
        multicast: true,
        ..Config::default()
    };
    let engine: Engine<Mdns> = Engine::with_config(mdns, config)?;

    let seen: Arc<AtomicUsize> = Arc::new(AtomicUsize::new(0));
    let counter: Arc<AtomicUsize> = seen.clone();
    engine.protocol().on_message(move |from: SocketAddr, message: &Message| {
        counter.fetch_add(1, Ordering::Relaxed);
        for answer in &message.answers {
            print::print_status(format!(
                "{} {}",
                from.ip().to_string().color(colors::IPV4_ADDR),
                answer
            ));
        }
    });

    engine
        .start_multicast(Mdns::group())
        .context("joining the mDNS group")?;

    let spinner: Spinner = Spinner::start(format!("Listening for {seconds}s, Ctrl-C to stop"));
    tokio::select! {
        _ = tokio::time::sleep(Duration::from_secs(seconds)) => {}
        _ = tokio::signal::ctrl_c() => info!("Interrupted"),
    }
    drop(spinner);

    engine.shutdown().await;
    print::fat_separator();
    print::print_status(format!(
        "{} mDNS message(s) received",
        seen.load(Ordering::Relaxed).to_string().green().bold()
    ));
    Ok(())
}
