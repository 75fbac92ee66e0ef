//! The worker binary.
//!
//! Speaks line-delimited JSON on stdin/stdout with the controlling
//! process: requests in, responses and notifications out. Media I/O is
//! wired up by the embedding transport layer; this binary exercises the
//! control plane and the routing core.

use std::collections::HashMap;
use std::io::{BufRead, Write};
use std::process::exit;
use std::time::Instant;

use clap::Parser;
use tracing::{info, warn};

use sfu::channel::{Notification, Request, Response};
use sfu::config::Settings;
use sfu::{Output, SfuError, Transport};

// Exit code for configuration errors.
const EXIT_BAD_CONFIG: i32 = 42;

fn main() {
    let settings = match Settings::try_parse() {
        Ok(s) => s,
        Err(e) => {
            eprintln!("{}", e);
            exit(EXIT_BAD_CONFIG);
        }
    };

    if let Err(e) = settings.validate() {
        eprintln!("invalid configuration: {}", e);
        exit(EXIT_BAD_CONFIG);
    }

    init_logging(&settings);

    info!(
        "sfu-worker running [rtcMinPort:{}, rtcMaxPort:{}]",
        settings.rtc_min_port, settings.rtc_max_port
    );

    let mut worker = Worker::default();

    let stdin = std::io::stdin();
    let stdout = std::io::stdout();

    for line in stdin.lock().lines() {
        let line = match line {
            Ok(l) => l,
            Err(_) => break,
        };
        if line.trim().is_empty() {
            continue;
        }

        let request: Request = match serde_json::from_str(&line) {
            Ok(r) => r,
            Err(e) => {
                warn!("Discarding unparseable request: {}", e);
                continue;
            }
        };

        let response = worker.handle_request(&request);

        let mut out = stdout.lock();
        let _ = serde_json::to_writer(&mut out, &response);
        let _ = out.write_all(b"\n");

        for notification in worker.drain_notifications() {
            let _ = serde_json::to_writer(&mut out, &notification);
            let _ = out.write_all(b"\n");
        }
        let _ = out.flush();
    }
}

fn init_logging(settings: &Settings) {
    use tracing_subscriber::EnvFilter;

    let mut filter = settings.log_level.clone();
    for tag in &settings.log_tags {
        filter.push_str(&format!(",sfu::{}={}", tag, settings.log_level));
    }

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(filter))
        .with_writer(std::io::stderr)
        .init();
}

/// Owner of the transports of this worker process.
#[derive(Default)]
struct Worker {
    transports: HashMap<String, Transport>,
    notifications: Vec<Notification>,
}

impl Worker {
    fn handle_request(&mut self, request: &Request) -> Response {
        let now = Instant::now();

        match request.method.as_str() {
            "worker.createTransport" => {
                let Some(id) = request.internal.transport_id.clone() else {
                    return Response::error(
                        request.id,
                        &SfuError::Config("request has no internal.transportId".into()),
                    );
                };
                if self.transports.contains_key(&id) {
                    return Response::error(
                        request.id,
                        &SfuError::Conflict(format!("a transport with id {} already exists", id)),
                    );
                }

                let mut transport = Transport::new(&id);
                // The binary has no DTLS layer: transports run as
                // connected so RTCP timers arm.
                transport.connected(now);
                self.transports.insert(id, transport);

                Response::accepted(request.id, None)
            }

            "transport.close" => {
                let Some(id) = request.internal.transport_id.clone() else {
                    return Response::error(
                        request.id,
                        &SfuError::Config("request has no internal.transportId".into()),
                    );
                };
                let Some(mut transport) = self.transports.remove(&id) else {
                    return Response::error(
                        request.id,
                        &SfuError::NotFound(format!("transport not found: {}", id)),
                    );
                };

                transport.close_producers_and_consumers();
                collect_outputs(&mut self.notifications, &mut transport);

                Response::accepted(request.id, None)
            }

            _ => {
                let Some(id) = request.internal.transport_id.clone() else {
                    return Response::error(
                        request.id,
                        &SfuError::Config("request has no internal.transportId".into()),
                    );
                };
                let Some(transport) = self.transports.get_mut(&id) else {
                    return Response::error(
                        request.id,
                        &SfuError::NotFound(format!("transport not found: {}", id)),
                    );
                };

                let response = transport.handle_request(now, request);
                collect_outputs(&mut self.notifications, transport);

                response
            }
        }
    }

    fn drain_notifications(&mut self) -> Vec<Notification> {
        std::mem::take(&mut self.notifications)
    }
}

fn collect_outputs(notifications: &mut Vec<Notification>, transport: &mut Transport) {
    while let Some(output) = transport.poll_output() {
        match output {
            Output::Event(event) => {
                notifications.push(event.to_notification());
            }
            // Media outputs go to the DTLS layer, which this binary
            // does not carry.
            Output::Rtp(_) | Output::Rtcp(_) => {}
        }
    }
}
