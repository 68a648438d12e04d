//! Rendering client: connects to the server, mirrors its scene and keeps the
//! staging buffers current. The actual GPU renderer is an external
//! collaborator; this binary installs a sink that reports what it would have
//! uploaded.

use clap::Parser;
use prism::client::apply::RenderSink;
use prism::client::Client;
use prism::config::Config;
use prism::hashing::StringId;
use prism::logging;
use prism::wire::geometry::GeomKind;
use std::net::IpAddr;
use std::ops::Range;
use std::path::PathBuf;
use std::process;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "prism-client", about = "Receives and mirrors a streamed 3D scene")]
struct Args {
    /// Server IP address
    server: IpAddr,

    /// Raise log verbosity one level per repetition
    #[arg(short = 'v', action = clap::ArgAction::Count)]
    verbose: u8,

    /// Disable ANSI colours in log output
    #[arg(short = 'n')]
    no_color: bool,

    /// Free-camera mode (forwarded to the renderer)
    #[arg(short = 'c')]
    camera: bool,

    /// Use the debug/forward renderer instead of the deferred one
    #[arg(short = 'd')]
    debug_renderer: bool,

    /// TOML configuration file (ports, buffer sizes, timeouts)
    #[arg(long = "config")]
    config: Option<PathBuf>,
}

/// Stand-in for the GPU renderer: counts dirty notifications and logs them.
struct LoggingSink {
    log: logging::Logger,
    geometry_events: AtomicUsize,
}

impl RenderSink for LoggingSink {
    fn geometry_dirty(&self, kind: GeomKind, range: Range<usize>) {
        self.geometry_events.fetch_add(1, Ordering::Relaxed);
        logging::trace!(self.log, "geometry dirty";
                        "kind" => ?kind, "start" => range.start, "end" => range.end);
    }

    fn light_changed(&self, id: StringId) {
        logging::trace!(self.log, "light changed"; "id" => id);
    }

    fn transform_changed(&self, id: StringId, matrix: &[f32; 16]) {
        logging::trace!(self.log, "transform changed";
                        "id" => id, "tx" => matrix[12], "ty" => matrix[13], "tz" => matrix[14]);
    }
}

fn main() {
    let args = Args::parse();
    let log = logging::terminal(args.verbose, !args.no_color);

    let config = match args.config {
        Some(path) => match Config::load(&path) {
            Ok(config) => config,
            Err(err) => {
                logging::crit!(log, "failed to load config"; "error" => %err);
                process::exit(1);
            }
        },
        None => Config::default(),
    };

    logging::info!(log, "renderer options";
                   "free_camera" => args.camera,
                   "debug_renderer" => args.debug_renderer);

    let client = match Client::connect(args.server, &config, &log) {
        Ok(client) => client,
        Err(err) => {
            logging::crit!(log, "failed to connect"; "error" => ?err, "server" => %args.server);
            process::exit(1);
        }
    };

    if !client.wait_streaming(Duration::from_secs(30)) {
        logging::crit!(log, "handshake did not complete");
        process::exit(1);
    }
    logging::info!(log, "session streaming");

    let sink = LoggingSink {
        log: log.new(logging::o!("component" => "render-sink")),
        geometry_events: AtomicUsize::new(0),
    };

    // The frame loop: pump received updates at display cadence until the
    // connection drains. Nothing here ever blocks on the network.
    while client.is_connected() {
        let stats = client.frame(&sink);
        if stats.chunks_applied > 0 {
            logging::debug!(log, "frame applied updates";
                            "chunks" => stats.chunks_applied,
                            "geometry" => stats.geom_applied,
                            "superseded" => stats.superseded,
                            "discarded" => stats.discarded);
        }

        thread::sleep(Duration::from_millis(16));
    }

    logging::info!(log, "connection drained, exiting";
                   "geometry_events" => sink.geometry_events.load(Ordering::Relaxed));
    client.shutdown();
}
