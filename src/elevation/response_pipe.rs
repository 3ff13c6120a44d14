use interprocess::local_socket::{prelude::*, Listener, ListenerOptions};
use std::io;
use std::sync::mpsc::{self, Receiver, Sender};
use std::thread;
use std::time::Duration;
use tracing::{debug, warn};

use super::message::write_message;
use super::socket_name;
use crate::status::StatusReportItem;

/// How long the helper waits for its report to be picked up before exiting.
pub const SENT_TIMEOUT: Duration = Duration::from_millis(3000);

/// Server side of the channel, run inside the elevated helper. The caller
/// connects once; the report is written as soon as both the connection and
/// the report are there, in whichever order they arrive.
pub struct ElevatedProcessResponsePipe {
    report_tx: Option<Sender<Vec<StatusReportItem>>>,
    sent_rx: Receiver<io::Result<()>>,
}

impl ElevatedProcessResponsePipe {
    pub fn create(channel: &str) -> io::Result<Self> {
        let listener = ListenerOptions::new().name(socket_name(channel)?).create_sync()?;
        let (report_tx, report_rx) = mpsc::channel();
        let (sent_tx, sent_rx) = mpsc::channel();

        let channel = channel.to_string();
        thread::Builder::new()
            .name("response-pipe".into())
            .spawn(move || {
                let result = serve(&listener, &report_rx);
                debug!("Response on {} finished: {:?}", channel, result);
                let _ = sent_tx.send(result);
            })?;

        Ok(Self {
            report_tx: Some(report_tx),
            sent_rx,
        })
    }

    /// Hand over the report; it is buffered until the caller has connected.
    /// Only the first report is sent.
    pub fn send_report(&mut self, report: Vec<StatusReportItem>) {
        match self.report_tx.take() {
            Some(tx) => {
                let _ = tx.send(report);
            }
            None => warn!("Response already sent; dropping additional report"),
        }
    }

    /// Block until the report was written, at most `timeout`.
    pub fn wait_for_sent(&self, timeout: Duration) -> bool {
        match self.sent_rx.recv_timeout(timeout) {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                warn!("Failed to send response: {}", e);
                false
            }
            Err(_) => {
                warn!("Response was not picked up within {} ms", timeout.as_millis());
                false
            }
        }
    }
}

fn serve(listener: &Listener, report_rx: &Receiver<Vec<StatusReportItem>>) -> io::Result<()> {
    let mut conn = listener.accept()?;
    let report = report_rx
        .recv()
        .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "no report was produced"))?;
    let payload = serde_json::to_vec(&report).map_err(io::Error::other)?;
    write_message(&mut conn, &payload)
}
