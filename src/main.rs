use std::net::SocketAddrV4;
use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use time::macros::format_description;
use tracing_appender::non_blocking;
use tracing_subscriber::fmt::time::LocalTime;

use tinytorrent::metadata::bencode;
use tinytorrent::metadata::tracker::{AnnounceParams, discover_peers};
use tinytorrent::peer::generate_peer_id;
use tinytorrent::util::{self, io::save_piece};
use tinytorrent::{DownloadSession, SessionConfig, download_piece, parse_torrent};

#[derive(Parser, Debug)]
#[command(name = "tinytorrent", version)]
struct Args {
    #[arg(long, default_value_t = 6881, global = true, help = "Port reported to the tracker")]
    port: u16,

    #[arg(
        long,
        default_value_t = 30,
        global = true,
        value_parser = clap::value_parser!(u64).range(1..),
        help = "Seconds to wait on any single peer exchange"
    )]
    timeout_secs: u64,

    #[arg(long, default_value = "logs", global = true, help = "Directory for the log file")]
    log_dir: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Decode a bencoded string and print it as JSON
    Decode { value: String },
    /// Print the contents of a torrent file
    Info { torrent: PathBuf },
    /// Ask the tracker for peers
    Peers { torrent: PathBuf },
    /// Handshake with a peer and print its peer id
    Handshake { torrent: PathBuf, peer: SocketAddrV4 },
    /// Download and verify a single piece
    #[command(name = "download_piece")]
    DownloadPiece {
        #[arg(short, long)]
        output: PathBuf,
        torrent: PathBuf,
        index: u32,
    },
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    let file_appender = tracing_appender::rolling::never(&args.log_dir, "tinytorrent.log");
    let (non_blocking, _guard) = non_blocking(file_appender);
    let timer = LocalTime::new(format_description!(
        "[month]/[day]/[year] [hour repr:24]:[minute]:[second].[subsecond digits:4]"
    ));
    tracing_subscriber::fmt().with_writer(non_blocking).with_ansi(false).with_timer(timer).init();

    let config = SessionConfig {
        message_timeout: Some(Duration::from_secs(args.timeout_secs)),
        ..SessionConfig::default()
    };
    let peer_id = generate_peer_id(&mut rand::rng());

    match args.command {
        Command::Decode { value } => match bencode::decode(value.as_bytes()) {
            Ok(decoded) => println!("{}", serde_json::Value::from(&decoded)),
            Err(e) => println!("Unable to decode value: {e}"),
        },
        Command::Info { torrent } => match parse_torrent(&torrent) {
            Ok(file) => println!("{}", file),
            Err(e) => println!("Unable to parse {}: {e}", torrent.display()),
        },
        Command::Peers { torrent } => {
            let file = match parse_torrent(&torrent) {
                Ok(file) => file,
                Err(e) => return println!("Unable to parse {}: {e}", torrent.display()),
            };
            match discover_peers(&file, &AnnounceParams::new(&file, peer_id, args.port)).await {
                Ok(response) => println!("{}", response),
                Err(e) => println!("Unable to discover peers: {e}"),
            }
        }
        Command::Handshake { torrent, peer } => {
            let file = match parse_torrent(&torrent) {
                Ok(file) => file,
                Err(e) => return println!("Unable to parse {}: {e}", torrent.display()),
            };
            let result = match DownloadSession::connect(peer, file, peer_id, config).await {
                Ok(mut session) => session.handshake().await,
                Err(e) => Err(e),
            };
            match result {
                Ok(remote) => println!("Peer ID: {}", util::to_string(&remote)),
                Err(e) => println!("Handshake with {peer} failed: {e}"),
            }
        }
        Command::DownloadPiece { output, torrent, index } => {
            let file = match parse_torrent(&torrent) {
                Ok(file) => file,
                Err(e) => return println!("Unable to parse {}: {e}", torrent.display()),
            };
            let name = file.info.name.clone();
            let progress = ProgressBar::new(0);
            if let Ok(style) = ProgressStyle::with_template("piece {msg} [{bar:40}] {pos}/{len} blocks") {
                progress.set_style(style);
            }
            progress.set_message(index.to_string());

            let piece = match download_piece(file, index, peer_id, args.port, config, progress.clone()).await {
                Ok(piece) => piece,
                Err(e) => {
                    progress.abandon();
                    return println!("Unable to download piece {index}: {e}");
                }
            };
            progress.finish();
            match save_piece(&output, &name, index, &piece).await {
                Ok(path) => println!("Piece {index} downloaded to {}.", path.display()),
                Err(e) => println!("Unable to write piece {index} to {}: {e}", output.display()),
            }
        }
    }
}
