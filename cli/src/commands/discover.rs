use std::collections::BTreeMap;
use std::net::IpAddr;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use anyhow::Context;
use clap::Args;
use colored::*;
use sweepr_common::config::{Config, ListenMode};
use sweepr_core::mdns::DEFAULT_PROBE;
use sweepr_core::{DeviceFound, Engine, Mdns, ScannerViewer};
use sweepr_protocols::mdns::{Answer, MDNS_PORT, RecordData};
use tracing::{debug, info};

use crate::terminal::{colors, network_fmt, print, spinner::Spinner};

const POLL_INTERVAL: Duration = Duration::from_millis(250);
const SERIAL_KEYS: &[&str] = &["serial", "sn", "serialnumber", "mac", "deviceid"];

#[derive(Args)]
pub struct DiscoverArgs {
    /// Service or host name to resolve, e.g. _ipp._tcp.local (repeatable)
    #[arg(short, long = "service")]
    pub services: Vec<String>,

    /// Seconds to wait for answers
    #[arg(short, long, default_value_t = 5)]
    pub timeout: u64,

    /// Also probe every host of each private subnet
    #[arg(long)]
    pub sweep: bool,

    /// Bind one socket per interface address instead of one wildcard socket
    #[arg(long)]
    pub per_interface: bool,

    /// Local port of the wildcard socket (0 picks a free one)
    #[arg(short, long, default_value_t = 0)]
    pub port: u16,
}

/// Collects devices and echoes each new one as it arrives.
#[derive(Default)]
struct TerminalViewer {
    label: Mutex<Option<ColoredString>>,
    devices: Mutex<BTreeMap<(IpAddr, String), DeviceFound>>,
}

impl TerminalViewer {
    fn count(&self) -> usize {
        self.devices.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    fn take_devices(&self) -> Vec<DeviceFound> {
        std::mem::take(&mut *self.devices.lock().unwrap_or_else(PoisonError::into_inner))
            .into_values()
            .collect()
    }
}

impl ScannerViewer for TerminalViewer {
    fn device_found(&self, device: &DeviceFound) {
        let key = (device.address, device.device_type.clone());
        let fresh: bool = self
            .devices
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key, device.clone())
            .is_none();
        if fresh {
            let label = self
                .label
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clone()
                .unwrap_or_else(|| device.protocol.normal());
            info!("{label} {} {}", device.address, device.device_type);
        }
    }

    fn format_protocol(&self, name: &str, color: u32) {
        let label: ColoredString = format!(" {name} ").white().on_color(colors::from_argb(color));
        *self.label.lock().unwrap_or_else(PoisonError::into_inner) = Some(label);
    }
}

pub async fn discover(args: DiscoverArgs) -> anyhow::Result<()> {
    let config: Config = Config {
        listen_mode: if args.per_interface {
            ListenMode::PerInterface
        } else {
            ListenMode::Global
        },
        global_port: args.port,
        ..Config::default()
    };
    let engine: Engine<Mdns> =
        Engine::with_config(Mdns::new().context("building the mDNS probe")?, config)?;

    let viewer: Arc<TerminalViewer> = Arc::new(TerminalViewer::default());
    engine.register_viewer(viewer.clone());

    let services: Vec<String> = if args.services.is_empty() {
        vec![DEFAULT_PROBE.to_string()]
    } else {
        args.services.clone()
    };
    for service in services {
        let viewer: Arc<TerminalViewer> = viewer.clone();
        engine
            .protocol()
            .register_domain(service, move |trigger: &str, answers: &[Answer]| {
                for device in devices_from(Mdns::NAME, trigger, answers) {
                    viewer.device_found(&device);
                }
            });
    }

    engine.start().context("starting listeners")?;
    for (kind, addr) in engine.listening_on() {
        debug!("{kind} listener on {addr}");
    }

    let start_time: Instant = Instant::now();
    engine.scan().context("sending mDNS queries")?;
    if args.sweep {
        engine
            .active_scan(MDNS_PORT)
            .await
            .context("starting the subnet sweep")?;
    }

    wait_for_answers(&viewer, Duration::from_secs(args.timeout)).await;

    if args.sweep {
        if let Some(sent) = engine.wait_scan().await {
            info!("Sweep sent {sent} probe(s)");
        }
    }
    engine.shutdown().await;

    print_devices(viewer.take_devices(), start_time.elapsed());
    Ok(())
}

async fn wait_for_answers(viewer: &TerminalViewer, timeout: Duration) {
    let spinner: Spinner = Spinner::start("Waiting for answers...");
    let deadline: Instant = Instant::now() + timeout;

    while Instant::now() < deadline {
        tokio::select! {
            _ = tokio::time::sleep(POLL_INTERVAL) => {}
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted");
                break;
            }
        }
        spinner.set_message(format!(
            "Identified {} device(s) so far...",
            viewer.count().to_string().green().bold()
        ));
    }
}

/// Turns one answer set into device reports, one per announced address.
///
/// The type is the instance the trigger points at (or the trigger itself);
/// the serial comes from a well-known TXT key, falling back to the host name.
fn devices_from(protocol: &str, trigger: &str, answers: &[Answer]) -> Vec<DeviceFound> {
    let device_type: String = answers
        .iter()
        .find(|a| a.name == trigger)
        .and_then(|a| a.domain())
        .unwrap_or(trigger)
        .to_string();

    let serial_from_txt: Option<String> = answers
        .iter()
        .filter_map(Answer::texts)
        .flatten()
        .find_map(|entry| {
            let (key, value) = entry.split_once('=')?;
            SERIAL_KEYS
                .contains(&key.to_ascii_lowercase().as_str())
                .then(|| value.to_string())
        });

    answers
        .iter()
        .filter_map(|answer| {
            let address: IpAddr = match answer.data {
                RecordData::A(v4) if !v4.is_unspecified() => IpAddr::V4(v4),
                RecordData::Aaaa(v6) if !v6.is_unspecified() => IpAddr::V6(v6),
                _ => return None,
            };
            Some(DeviceFound {
                protocol: protocol.to_string(),
                version: 1,
                address,
                device_type: device_type.clone(),
                serial: serial_from_txt.clone().unwrap_or_else(|| answer.name.clone()),
            })
        })
        .collect()
}

fn print_devices(mut devices: Vec<DeviceFound>, total_time: Duration) {
    if devices.is_empty() {
        print::header("zero devices detected");
        print::no_results();
        return;
    }

    print::header("mdns discovery");
    devices.sort_by_key(|d| d.address);
    for (idx, device) in devices.iter().enumerate() {
        let rows: Vec<(String, ColoredString)> = vec![
            network_fmt::ip_to_key_value_pair(device.address),
            ("Serial".to_string(), device.serial.normal()),
            ("Protocol".to_string(), format!("{} v{}", device.protocol, device.version).normal()),
        ];
        print::tree(idx, &device.device_type, &rows);
        if idx + 1 != devices.len() {
            print::blank();
        }
    }

    let found: ColoredString = format!("{} device(s)", devices.len()).bold().green();
    let elapsed: ColoredString = format!("{:.2}s", total_time.as_secs_f64()).bold().yellow();
    print::fat_separator();
    print::print_status(format!("Discovery complete: {found} identified in {elapsed}"));
}
