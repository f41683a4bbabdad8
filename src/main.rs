//! rx1090: a Mode S / ADS-B receiver.
//!
//! IQ samples come from an RTL-SDR pipe or a file, frames are
//! demodulated and decoded on a dedicated thread, and the decoded
//! stream drives the aircraft registry, the interactive view, and the
//! raw/SBS/HTTP network services.

mod aircraft;
mod config;
mod cpr;
mod crc;
mod decoder;
mod demod;
mod http;
mod magnitude;
mod network;
mod signal;
mod stats;

use std::io::{self, Write};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, RecvTimeoutError, Sender};
use parking_lot::RwLock;
use tracing::{error, info, Level};
use tracing_subscriber::FmtSubscriber;

use crate::aircraft::{AircraftStore, ShowState};
use crate::config::Config;
use crate::decoder::ModesMessage;
use crate::demod::{Demodulator, SampleStream};
use crate::network::{ExitFlag, NetContext, Service};
use crate::stats::Stats;

fn main() {
    std::process::exit(run());
}

fn run() -> i32 {
    let config = Config::from_args();

    // Logging stays quiet in interactive mode; the table owns the
    // terminal.
    if !config.interactive {
        let subscriber = FmtSubscriber::builder()
            .with_max_level(Level::INFO)
            .finish();
        tracing::subscriber::set_global_default(subscriber).ok();
        info!("rx1090 starting");
    }

    let home = match (config.home_lat, config.home_lon) {
        (Some(lat), Some(lon)) => Some((lat, lon)),
        _ => None,
    };
    let store = Arc::new(RwLock::new(AircraftStore::new(config.interactive_ttl, home)));
    let stats = Arc::new(Stats::new());
    let exit = Arc::new(ExitFlag::new());

    let (msg_tx, msg_rx) = bounded::<ModesMessage>(1024);

    // The sample source is the only other thread; decoding happens on
    // it, everything downstream of the channel happens in the runtime.
    let demod_handle = if config.net_only {
        drop(msg_tx);
        None
    } else {
        let config = config.clone();
        let stats = Arc::clone(&stats);
        let exit = Arc::clone(&exit);
        Some(thread::spawn(move || -> io::Result<()> {
            let mut demod = Demodulator::new(&config, stats);
            let result = match config.infile {
                Some(ref filename) => demod.process_file(filename, &msg_tx, exit.flag()),
                None => run_sdr_pipe(&config, &mut demod, &msg_tx, exit.flag()),
            };
            // End of the sample stream ends the run.
            exit.request_exit();
            result
        }))
    };

    let rt = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("failed to start runtime: {}", e);
            return 2;
        }
    };

    rt.block_on(async {
        let ctx = Arc::new(NetContext::new(
            config.clone(),
            Arc::clone(&store),
            Arc::clone(&stats),
            Arc::clone(&exit),
        ));

        if config.net {
            let ctx = Arc::clone(&ctx);
            tokio::spawn(async move {
                if let Err(e) = network::run_servers(ctx).await {
                    error!("network: {}", e);
                }
            });
        }

        // Frame processor: registry update and fan-out, in sample
        // order, one frame completing before the next begins.
        {
            let ctx = Arc::clone(&ctx);
            let exit = Arc::clone(&exit);
            let config = config.clone();
            tokio::task::spawn_blocking(move || loop {
                match msg_rx.recv_timeout(Duration::from_millis(125)) {
                    Ok(mm) => {
                        network::process_decoded_message(&ctx, &mm, Instant::now());
                        if !config.interactive {
                            if config.raw {
                                println!("{}", mm.to_raw_string());
                            } else if config.onlyaddr {
                                println!("{:06X}", mm.icao_address());
                            } else {
                                println!("{}", mm);
                            }
                        }
                    }
                    Err(RecvTimeoutError::Timeout) => {
                        if exit.is_set() {
                            break;
                        }
                    }
                    Err(RecvTimeoutError::Disconnected) => break,
                }
            });
        }

        // Registry housekeeping every 125 ms.
        {
            let store = Arc::clone(&store);
            tokio::spawn(async move {
                let mut interval = tokio::time::interval(Duration::from_millis(125));
                loop {
                    interval.tick().await;
                    store.write().tick(Instant::now());
                }
            });
        }

        if config.interactive {
            let store = Arc::clone(&store);
            let rows = config.interactive_rows;
            let metric = config.metric;
            tokio::spawn(async move {
                interactive_display(store, rows, metric).await;
            });
        }

        {
            let exit = Arc::clone(&exit);
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    exit.request_exit();
                }
            });
        }

        exit.wait().await;
    });

    let mut code = 0;
    if let Some(handle) = demod_handle {
        match handle.join() {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                eprintln!("sample source error: {}", e);
                if config.infile.is_none() {
                    eprintln!("is rtl-sdr installed? use --infile <file> or --net-only otherwise");
                }
                code = 2;
            }
            Err(_) => {
                eprintln!("sample source thread panicked");
                code = 2;
            }
        }
    }

    stats.print_summary(Service::ALL.map(|s| s.descr()));
    code
}

/// Run `rtl_sdr` as a child process and demodulate its output. The
/// device layer stays outside this program; the pipe carries plain
/// 8-bit IQ samples at 2.4 MHz.
fn run_sdr_pipe(
    config: &Config,
    demod: &mut Demodulator,
    tx: &Sender<ModesMessage>,
    exit: &AtomicBool,
) -> io::Result<()> {
    use std::process::{Command, Stdio};

    let mut cmd = Command::new("rtl_sdr");
    cmd.arg("-f")
        .arg(config.freq.to_string())
        .arg("-s")
        .arg("2400000");
    match config.gain {
        Some(gain) => {
            cmd.arg("-g").arg(format!("{:.1}", gain));
        }
        None => {
            cmd.arg("-g").arg("0");
        }
    }
    if config.ppm != 0 {
        cmd.arg("-p").arg(config.ppm.to_string());
    }
    cmd.arg("-").stdout(Stdio::piped()).stderr(Stdio::null());

    let mut child = cmd.spawn()?;
    let mut stdout = child
        .stdout
        .take()
        .ok_or_else(|| io::Error::new(io::ErrorKind::BrokenPipe, "no pipe from rtl_sdr"))?;

    let mut stream = SampleStream::new();
    let result = demod.process_reader(&mut stdout, &mut stream, tx, exit);
    let _ = child.kill();
    let _ = child.wait();
    result
}

async fn interactive_display(store: Arc<RwLock<AircraftStore>>, max_rows: usize, metric: bool) {
    let mut interval = tokio::time::interval(Duration::from_millis(250));
    loop {
        interval.tick().await;

        // Clear screen, cursor home.
        print!("\x1B[2J\x1B[H");
        println!(
            "\x1B[1m{:<6} {:<8} {:>8} {:>6} {:>10} {:>11} {:>5} {:>5} {:>8} {:>5}\x1B[0m",
            "Hex",
            "Flight",
            if metric { "Alt m" } else { "Alt ft" },
            if metric { "km/h" } else { "Knots" },
            "Lat",
            "Lon",
            "Trk",
            "Sq",
            "Msgs",
            "Seen",
        );
        println!("{}", "-".repeat(80));

        let store = store.read();
        let now = Instant::now();
        let mut aircraft: Vec<_> = store.all().collect();
        aircraft.sort_by(|a, b| b.seen.cmp(&a.seen));

        let mut shown = 0;
        for a in aircraft.iter().take(max_rows) {
            if a.show == ShowState::None {
                continue;
            }
            let color = match a.show {
                ShowState::FirstTime => "\x1B[32m",
                ShowState::LastTime => "\x1B[31m",
                _ => "",
            };

            let (altitude, speed) = if metric {
                ((a.altitude as f64 / 3.2808) as i32, (a.speed as f64 * 1.852) as u16)
            } else {
                (a.altitude, a.speed)
            };

            let pos = a.est_position.or(a.position);
            let lat_str = pos.map(|(lat, _)| format!("{:.4}", lat)).unwrap_or_default();
            let lon_str = pos.map(|(_, lon)| format!("{:.4}", lon)).unwrap_or_default();
            let alt_str = if altitude != 0 { altitude.to_string() } else { String::new() };
            let speed_str = if speed != 0 { speed.to_string() } else { String::new() };
            let trk_str = if a.heading_is_valid {
                format!("{}", a.heading.round() as i32)
            } else {
                String::new()
            };
            let sq_str = if a.squawk != 0 { format!("{:04}", a.squawk) } else { String::new() };

            println!(
                "{}{:<6} {:<8} {:>8} {:>6} {:>10} {:>11} {:>5} {:>5} {:>8} {:>4}s\x1B[0m",
                color,
                a.hex_addr,
                a.flight,
                alt_str,
                speed_str,
                lat_str,
                lon_str,
                trk_str,
                sq_str,
                a.messages,
                now.duration_since(a.seen).as_secs(),
            );
            shown += 1;
        }

        println!("{}", "-".repeat(80));
        println!("Aircraft: {} | Press Ctrl+C to exit", shown);
        io::stdout().flush().ok();
    }
}
