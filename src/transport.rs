//! Line-delimited JSON over TCP.
//!
//! Every connection is one viewer. A reader thread answers requests
//! directly; a writer thread drains the viewer's broadcast queue. Both write
//! through the same locked stream so lines never interleave.

use crate::broadcast::ViewerId;
use crate::host::Host;

use log::{debug, info, warn};
use std::{
    io::{self, BufRead, BufReader, Write},
    net::{Shutdown, TcpListener, TcpStream, ToSocketAddrs},
    sync::{mpsc::Receiver, Arc, Mutex},
    thread,
};

type SharedStream = Arc<Mutex<TcpStream>>;

/// Bind the listening socket.
pub fn bind(addr: impl ToSocketAddrs) -> io::Result<TcpListener> {
    let listener = TcpListener::bind(addr)?;
    info!("listening on {}", listener.local_addr()?);
    Ok(listener)
}

/// Accept viewers forever.
pub fn serve(host: Arc<Host>, listener: TcpListener) -> io::Result<()> {
    for stream in listener.incoming() {
        match stream {
            Ok(stream) => {
                if let Err(e) = accept(Arc::clone(&host), stream) {
                    warn!("failed to set up connection: {}", e);
                }
            }
            Err(e) => warn!("failed to accept connection: {}", e),
        }
    }
    Ok(())
}

fn accept(host: Arc<Host>, stream: TcpStream) -> io::Result<()> {
    let peer = stream.peer_addr()?;
    stream.set_nodelay(true)?;
    let read_half = stream.try_clone()?;
    let write_half: SharedStream = Arc::new(Mutex::new(stream));

    let (viewer, outbound) = host.connect();
    info!("viewer {} is {}", viewer, peer);

    let writer = Arc::clone(&write_half);
    let spawned = thread::Builder::new()
        .name(format!("viewer-{}-out", viewer))
        .spawn(move || write_queue(viewer, &writer, outbound))
        .and_then(|_| {
            thread::Builder::new()
                .name(format!("viewer-{}-in", viewer))
                .spawn({
                    let host = Arc::clone(&host);
                    move || {
                        read_requests(&host, viewer, read_half, &write_half);
                        host.disconnect(viewer);
                    }
                })
        });
    if let Err(e) = spawned {
        host.disconnect(viewer);
        return Err(e);
    }
    Ok(())
}

fn write_line(stream: &SharedStream, line: &str) -> io::Result<()> {
    let mut stream = stream.lock().unwrap_or_else(|e| e.into_inner());
    stream.write_all(line.as_bytes())?;
    stream.write_all(b"\n")?;
    stream.flush()
}

fn read_requests(host: &Arc<Host>, viewer: ViewerId, stream: TcpStream, replies: &SharedStream) {
    for line in BufReader::new(stream).lines() {
        let line = match line {
            Ok(line) => line,
            Err(e) => {
                debug!("viewer {} read failed: {}", viewer, e);
                break;
            }
        };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let reply = host.handle_message(line);
        if let Err(e) = write_line(replies, &reply) {
            debug!("viewer {} write failed: {}", viewer, e);
            break;
        }
    }
}

/// Ends when the viewer is unsubscribed or the socket breaks.
fn write_queue(viewer: ViewerId, stream: &SharedStream, outbound: Receiver<Arc<str>>) {
    while let Ok(message) = outbound.recv() {
        if let Err(e) = write_line(stream, &message) {
            debug!("viewer {} write failed: {}", viewer, e);
            // wakes the reader so the viewer is dropped
            let _ = stream
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .shutdown(Shutdown::Both);
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerConfig;
    use crate::experiment::ExperimentRegistry;
    use crate::hardware::{RigFactory, SharedHardware};
    use serde_json::Value;
    use std::time::Duration;

    #[test]
    fn request_reply_over_tcp() {
        let mut config = ServerConfig::default();
        config.defaults.log_dir = None;
        let host = Host::new(
            config,
            ExperimentRegistry::with_builtin(),
            Box::new(RigFactory),
            SharedHardware::detached(),
        )
        .unwrap();
        let listener = bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let server_host = Arc::clone(&host);
        thread::spawn(move || serve(server_host, listener));

        let mut client = TcpStream::connect(addr).unwrap();
        client
            .set_read_timeout(Some(Duration::from_secs(2)))
            .unwrap();
        client
            .write_all(b"{\"type\":\"ping\",\"requestId\":\"abc\"}\n")
            .unwrap();

        let mut reader = BufReader::new(client.try_clone().unwrap());
        let mut line = String::new();
        reader.read_line(&mut line).unwrap();
        let reply: Value = serde_json::from_str(&line).unwrap();
        assert_eq!(reply["type"], "pong");
        assert_eq!(reply["requestId"], "abc");
        assert_eq!(host.viewer_count(), 1);

        drop(reader);
        client.shutdown(Shutdown::Both).unwrap();
        for _ in 0..50 {
            if host.viewer_count() == 0 {
                break;
            }
            thread::sleep(Duration::from_millis(20));
        }
        assert_eq!(host.viewer_count(), 0);
        host.shutdown();
    }
}
