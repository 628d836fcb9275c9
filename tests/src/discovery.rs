//! End-to-end runs of the engine hosting mDNS over loopback.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use sweepr_common::config::Config;
use sweepr_core::mdns::DEFAULT_PROBE;
use sweepr_core::{Engine, EngineError, EngineState, Mdns};
use sweepr_protocols::mdns::{self, Answer, Message, RecordType};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::time::timeout;

const WAIT: Duration = Duration::from_secs(2);

fn unicast_only() -> Config {
    Config {
        multicast: false,
        ..Config::default()
    }
}

/// A one-answer mDNS response: `name` has the A record `addr`.
fn a_response(name: &str, addr: Ipv4Addr) -> Vec<u8> {
    let mut packet: Vec<u8> = vec![
        0x00, 0x00, // id
        0x84, 0x00, // response, authoritative
        0x00, 0x00, // questions
        0x00, 0x01, // answers
        0x00, 0x00, // authorities
        0x00, 0x00, // additionals
    ];
    for label in name.split('.') {
        packet.push(label.len() as u8);
        packet.extend_from_slice(label.as_bytes());
    }
    packet.push(0);
    packet.extend_from_slice(&[0x00, 0x01]); // A
    packet.extend_from_slice(&[0x80, 0x01]); // IN with cache flush
    packet.extend_from_slice(&120u32.to_be_bytes());
    packet.extend_from_slice(&[0x00, 0x04]);
    packet.extend_from_slice(&addr.octets());
    packet
}

async fn send_to_engine(port: u16, packet: &[u8]) -> anyhow::Result<()> {
    let socket: UdpSocket = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).await?;
    socket.send_to(packet, (Ipv4Addr::LOCALHOST, port)).await?;
    Ok(())
}

#[tokio::test]
async fn response_reaches_registered_handler() -> anyhow::Result<()> {
    let engine: Engine<Mdns> = Engine::with_config(Mdns::new()?, unicast_only())?;
    let (tx, mut rx) = mpsc::unbounded_channel::<(String, Vec<Answer>)>();
    engine
        .protocol()
        .register_domain("printer.local", move |trigger: &str, answers: &[Answer]| {
            let _ = tx.send((trigger.to_string(), answers.to_vec()));
        });

    let port: u16 = engine.start_global(0)?;
    send_to_engine(port, &a_response("printer.local", Ipv4Addr::new(192, 168, 1, 50))).await?;

    let (trigger, answers) = timeout(WAIT, rx.recv())
        .await?
        .ok_or_else(|| anyhow::anyhow!("handler channel closed"))?;
    assert_eq!(trigger, "printer.local");
    assert_eq!(answers.len(), 1);
    assert_eq!(answers[0].ipv4(), Some(Ipv4Addr::new(192, 168, 1, 50)));
    assert!(answers[0].cache_flush);

    engine.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn unmatched_and_malformed_packets_are_dropped() -> anyhow::Result<()> {
    let engine: Engine<Mdns> = Engine::with_config(Mdns::new()?, unicast_only())?;
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    engine
        .protocol()
        .register_domain("printer.local", move |trigger: &str, _: &[Answer]| {
            let _ = tx.send(trigger.to_string());
        });
    let (seen_tx, mut seen_rx) = mpsc::unbounded_channel::<usize>();
    engine
        .protocol()
        .on_message(move |_: SocketAddr, message: &Message| {
            let _ = seen_tx.send(message.answers.len());
        });

    let port: u16 = engine.start_global(0)?;
    send_to_engine(port, &[0x00, 0x01, 0x02]).await?;
    send_to_engine(port, &a_response("scanner.local", Ipv4Addr::new(10, 0, 0, 7))).await?;

    // the truncated datagram never parses, the other one parses but matches nothing
    assert_eq!(timeout(WAIT, seen_rx.recv()).await?, Some(1));
    assert!(timeout(Duration::from_millis(200), rx.recv()).await.is_err());
    assert_eq!(engine.state(), EngineState::Listening);

    engine.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn unicast_send_carries_default_probe() -> anyhow::Result<()> {
    let peer: UdpSocket = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).await?;
    let peer_port: u16 = peer.local_addr()?.port();

    let engine: Engine<Mdns> = Engine::with_config(Mdns::new()?, unicast_only())?;
    let port: u16 = engine.start_global(0)?;
    assert_eq!(engine.send_unicast(IpAddr::V4(Ipv4Addr::LOCALHOST), peer_port)?, 1);

    let mut buf = [0u8; 512];
    let (len, from) = timeout(WAIT, peer.recv_from(&mut buf)).await??;
    assert_eq!(from.port(), port);

    let questions = mdns::parse_questions(&buf[..len])?;
    assert_eq!(questions.len(), 1);
    assert_eq!(questions[0].name, DEFAULT_PROBE);
    assert_eq!(questions[0].qtype, RecordType::Ptr);

    engine.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn sending_before_start_reports_no_listener() -> anyhow::Result<()> {
    let engine: Engine<Mdns> = Engine::with_config(Mdns::new()?, unicast_only())?;
    assert!(matches!(
        engine.send_unicast(IpAddr::V4(Ipv4Addr::LOCALHOST), 5353),
        Err(EngineError::NoListener)
    ));
    assert!(matches!(engine.scan(), Err(EngineError::NoListener)));
    Ok(())
}

#[tokio::test]
async fn explicit_port_already_bound_is_rejected() -> anyhow::Result<()> {
    let holder = std::net::UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))?;
    let taken: u16 = holder.local_addr()?.port();

    let engine: Engine<Mdns> = Engine::with_config(Mdns::new()?, unicast_only())?;
    assert!(matches!(
        engine.start_global(taken),
        Err(EngineError::PortInUse(port)) if port == taken
    ));
    assert_eq!(engine.state(), EngineState::Idle);
    Ok(())
}

#[tokio::test]
async fn stop_all_closes_the_engine() -> anyhow::Result<()> {
    let engine: Engine<Mdns> = Engine::with_config(Mdns::new()?, unicast_only())?;
    let port: u16 = engine.start_global(0)?;
    assert_eq!(engine.listening_on().len(), 1);

    engine.stop_all().await;
    engine.stop_all().await;
    assert_eq!(engine.state(), EngineState::Closed);
    assert!(engine.listening_on().is_empty());
    assert!(matches!(engine.start_global(0), Err(EngineError::Closed)));
    assert!(matches!(
        engine.send_unicast(IpAddr::V4(Ipv4Addr::LOCALHOST), port),
        Err(EngineError::Closed)
    ));

    // the port is released once the receive loop is joined
    let rebound = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, port)).await;
    assert!(rebound.is_ok());
    Ok(())
}
