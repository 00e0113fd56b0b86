//! Mock actuation device + acquisition feed
//!
//! Simulates the sorter line for local testing.
//!
//! Behavior:
//! 1. Listens on a TCP port (default 4001) for the sorter core to connect
//! 2. Every `--signal-interval-ms` reports a trigger signal (0x01) with an
//!    incrementing id
//! 3. Optionally sends the matching parcel event as a JSON line to the
//!    acquisition port `--parcel-lag-ms` later (every `--noread-every`th
//!    parcel carries a no-read barcode)
//! 4. Answers each sort command (0x02) with a feedback frame (0x03)
//!
//! Usage:
//!   cargo run --bin mock-device -- --port 4001 --acquisition-addr 127.0.0.1:25900

use clap::Parser;
use parcel_sorter::domain::SignalId;
use parcel_sorter::io::frame::{DeviceFrame, FrameDecoder, FEEDBACK_OK};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

#[derive(Parser, Debug)]
#[command(name = "mock-device")]
#[command(about = "Mock sorter actuation device for local simulation")]
struct Args {
    /// TCP port to listen on
    #[arg(short, long, default_value = "4001")]
    port: u16,

    /// Interval between trigger signals (ms)
    #[arg(long, default_value = "1000")]
    signal_interval_ms: u64,

    /// Acquisition listener address; parcels are only sent when set
    #[arg(long)]
    acquisition_addr: Option<String>,

    /// Delay from trigger signal to parcel capture (ms)
    #[arg(long, default_value = "300")]
    parcel_lag_ms: u64,

    /// Every Nth parcel is a no-read (0 disables)
    #[arg(long, default_value = "0")]
    noread_every: u64,

    /// Feedback error code to report for sort commands
    #[arg(long, default_value = "0")]
    feedback_error: u8,
}

/// Forward parcel JSON lines to the acquisition listener
async fn run_acquisition_feed(addr: String, mut parcel_rx: mpsc::Receiver<String>) {
    loop {
        let mut stream = match TcpStream::connect(&addr).await {
            Ok(stream) => {
                println!("[MOCK] Connected to acquisition listener {}", addr);
                stream
            }
            Err(e) => {
                eprintln!("[MOCK] Acquisition connect failed: {}", e);
                tokio::time::sleep(Duration::from_secs(2)).await;
                continue;
            }
        };

        while let Some(line) = parcel_rx.recv().await {
            if let Err(e) = stream.write_all(line.as_bytes()).await {
                eprintln!("[MOCK] Acquisition write failed: {}", e);
                break;
            }
        }
        if parcel_rx.is_closed() {
            return;
        }
    }
}

/// Handle a single sorter core connection
async fn handle_connection(
    mut socket: TcpStream,
    peer: std::net::SocketAddr,
    args: &Args,
    parcel_tx: Option<mpsc::Sender<String>>,
) {
    println!("[MOCK] Sorter connected from {}", peer);

    let mut decoder = FrameDecoder::new();
    let mut temp = [0u8; 512];
    let mut signal_timer = tokio::time::interval(Duration::from_millis(args.signal_interval_ms));
    let mut next_id: u16 = 1;
    let mut parcel_count: u64 = 0;

    loop {
        tokio::select! {
            // Report a trigger signal
            _ = signal_timer.tick() => {
                let id = SignalId(next_id);
                // Id 0 is reserved for decisions without a signal
                next_id = next_id.checked_add(1).unwrap_or(1);

                let frame = DeviceFrame::SignalReport { id }.encode();
                if socket.write_all(&frame).await.is_err() {
                    println!("[MOCK] Connection closed (write failed)");
                    break;
                }
                println!("[MOCK] Signal #{}", id);

                if let Some(tx) = parcel_tx.clone() {
                    parcel_count += 1;
                    let noread = args.noread_every > 0 && parcel_count % args.noread_every == 0;
                    let barcode = if noread { "NOREAD".to_string() } else { format!("PKG{:06}", parcel_count) };
                    let lag = Duration::from_millis(args.parcel_lag_ms);
                    tokio::spawn(async move {
                        tokio::time::sleep(lag).await;
                        let line = serde_json::json!({
                            "barcode": barcode,
                            "weight": 1.2,
                            "length": 300,
                            "width": 200,
                            "height": 150,
                            "arrived_at": parcel_sorter::domain::epoch_ms(),
                        });
                        let _ = tx.send(format!("{}\n", line)).await;
                    });
                }
            }

            // Read sort commands
            result = socket.read(&mut temp) => {
                match result {
                    Ok(0) => {
                        println!("[MOCK] Sorter disconnected");
                        break;
                    }
                    Ok(n) => {
                        decoder.extend(&temp[..n]);
                        while let Some(frame) = decoder.next_frame() {
                            match frame {
                                Ok(DeviceFrame::SortCommand { id, chute }) => {
                                    println!("[MOCK] SORT #{} -> chute {}", id, chute);
                                    let feedback = DeviceFrame::Feedback {
                                        id,
                                        error_code: args.feedback_error,
                                        chute,
                                    }
                                    .encode();
                                    if socket.write_all(&feedback).await.is_err() {
                                        println!("[MOCK] Connection closed (feedback failed)");
                                        return;
                                    }
                                    if args.feedback_error != FEEDBACK_OK {
                                        println!("[MOCK] Reported error 0x{:02X}", args.feedback_error);
                                    }
                                }
                                Ok(other) => {
                                    println!("[MOCK] Unexpected frame: {:?}", other);
                                }
                                Err(e) => {
                                    eprintln!("[MOCK] Invalid frame: {}", e);
                                }
                            }
                        }
                    }
                    Err(e) => {
                        eprintln!("[MOCK] Read error: {}", e);
                        break;
                    }
                }
            }
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    println!("╔══════════════════════════════════════════════════════════╗");
    println!("║           Mock Sorter Actuation Device                   ║");
    println!("╠══════════════════════════════════════════════════════════╣");
    println!("║ Port:            {:>5}                                   ║", args.port);
    println!("║ Signal interval: {:>5} ms                                ║", args.signal_interval_ms);
    println!(
        "║ Acquisition:     {:<38} ║",
        args.acquisition_addr.as_deref().unwrap_or("disabled")
    );
    println!("║ Parcel lag:      {:>5} ms                                ║", args.parcel_lag_ms);
    println!("╚══════════════════════════════════════════════════════════╝");
    println!();
    println!("[MOCK] Waiting for sorter connection...");

    let parcel_tx = args.acquisition_addr.clone().map(|addr| {
        let (tx, rx) = mpsc::channel(256);
        tokio::spawn(run_acquisition_feed(addr, rx));
        tx
    });

    let listener = TcpListener::bind(format!("0.0.0.0:{}", args.port)).await?;

    // One sorter at a time; the core reconnects if the connection drops
    loop {
        let (socket, peer) = listener.accept().await?;
        handle_connection(socket, peer, &args, parcel_tx.clone()).await;
    }
}
