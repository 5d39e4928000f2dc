// Copyright (c) 2024 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

// Line protocol for remote control. Each request is one CRLF-terminated
// line; each gets one reply line, "OK" or "ERROR <reason>". There is no
// authentication, so the listen address defaults to loopback.

use std::net::SocketAddr;
use std::sync::Arc;
use std::thread;

use canonical_error::{failed_precondition_error, unavailable_error, CanonicalError};
use log::{debug, error, info, warn};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RemoteCommand {
    // Shut down this application.
    Shutdown,
    ShutdownMount,
    BootMount,
}

pub fn parse_remote_command(line: &str) -> Option<RemoteCommand> {
    let words: Vec<String> = line.split_whitespace().map(|w| w.to_lowercase()).collect();
    match words.iter().map(String::as_str).collect::<Vec<_>>().as_slice() {
        ["shutdown"] => Some(RemoteCommand::Shutdown),
        ["shutdown", "mount"] => Some(RemoteCommand::ShutdownMount),
        ["boot", "mount"] => Some(RemoteCommand::BootMount),
        _ => None,
    }
}

/// Carries out remote commands. Called on a blocking-capable thread.
pub trait RemoteHandler: Send + Sync {
    fn handle(&self, command: RemoteCommand) -> Result<(), CanonicalError>;
}

async fn reply_for(line: &str, handler: &Arc<dyn RemoteHandler>) -> String {
    let Some(command) = parse_remote_command(line) else {
        return format!("ERROR unknown command {:?}", line.trim());
    };
    info!("Remote command {:?}", command);
    let handler = handler.clone();
    match tokio::task::spawn_blocking(move || handler.handle(command)).await {
        Ok(Ok(())) => "OK".to_string(),
        Ok(Err(e)) => format!("ERROR {}", e.message),
        Err(e) => format!("ERROR {}", e),
    }
}

async fn handle_connection(stream: TcpStream, handler: Arc<dyn RemoteHandler>) {
    let peer = stream.peer_addr().ok();
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();
    debug!("Remote connection from {:?}", peer);
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                if line.trim().is_empty() {
                    continue;
                }
                let reply = reply_for(&line, &handler).await;
                if let Err(e) = writer.write_all(format!("{}\r\n", reply).as_bytes()).await {
                    warn!("Failed to reply to {:?}: {}", peer, e);
                    break;
                }
            }
            Ok(None) => {
                debug!("Remote client {:?} closed connection", peer);
                break;
            }
            Err(e) => {
                debug!("Error reading from {:?}: {}", peer, e);
                break;
            }
        }
    }
}

/// Accepts connections until `stop` fires, serving each on its own task.
pub async fn serve(listener: TcpListener, handler: Arc<dyn RemoteHandler>,
                   mut stop: oneshot::Receiver<()>) {
    loop {
        tokio::select! {
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, _)) => {
                        tokio::spawn(handle_connection(stream, handler.clone()));
                    }
                    Err(e) => warn!("Remote accept failed: {}", e),
                }
            }
            _ = &mut stop => break,
        }
    }
}

/// Runs serve() on its own thread and runtime.
pub struct RemoteServer {
    local_address: SocketAddr,
    stop: Option<oneshot::Sender<()>>,
    worker_thread: Option<thread::JoinHandle<()>>,
}

impl RemoteServer {
    pub fn start(address: SocketAddr, handler: Arc<dyn RemoteHandler>)
                 -> Result<Self, CanonicalError> {
        let bind_error = |e: std::io::Error| {
            unavailable_error(format!("Cannot listen on {}: {}", address, e).as_str())
        };
        let listener = std::net::TcpListener::bind(address).map_err(bind_error)?;
        listener.set_nonblocking(true).map_err(bind_error)?;
        let local_address = listener.local_addr().map_err(bind_error)?;
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .enable_all()
            .build()
            .map_err(|e| failed_precondition_error(
                format!("Cannot start remote runtime: {}", e).as_str()))?;
        let (stop_sender, stop_receiver) = oneshot::channel();
        let worker_thread = thread::spawn(move || {
            runtime.block_on(async move {
                match TcpListener::from_std(listener) {
                    Ok(listener) => serve(listener, handler, stop_receiver).await,
                    Err(e) => error!("Remote listener: {}", e),
                }
            });
        });
        info!("Remote control listening on {}", local_address);
        Ok(RemoteServer {
            local_address,
            stop: Some(stop_sender),
            worker_thread: Some(worker_thread),
        })
    }

    pub fn local_address(&self) -> SocketAddr {
        self.local_address
    }

    pub fn stop(&mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        if let Some(worker_thread) = self.worker_thread.take() {
            if worker_thread.join().is_err() {
                error!("Remote server thread panicked");
            }
        }
    }
}

impl Drop for RemoteServer {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use std::io::{BufRead, Write};
    use std::sync::Mutex;

    use super::*;

    #[derive(Default)]
    struct Recorder {
        commands: Mutex<Vec<RemoteCommand>>,
    }

    impl RemoteHandler for Recorder {
        fn handle(&self, command: RemoteCommand) -> Result<(), CanonicalError> {
            self.commands.lock().unwrap().push(command);
            if command == RemoteCommand::BootMount {
                return Err(failed_precondition_error("no MAC configured"));
            }
            Ok(())
        }
    }

    #[test]
    fn test_parse() {
        assert_eq!(parse_remote_command("shutdown"), Some(RemoteCommand::Shutdown));
        assert_eq!(parse_remote_command("  Shutdown  Mount\r"),
                   Some(RemoteCommand::ShutdownMount));
        assert_eq!(parse_remote_command("boot mount"), Some(RemoteCommand::BootMount));
        assert_eq!(parse_remote_command("boot"), None);
        assert_eq!(parse_remote_command("shutdown now please"), None);
    }

    #[tokio::test]
    async fn test_serve() {
        let recorder = Arc::new(Recorder::default());
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap();
        let (stop_sender, stop_receiver) = oneshot::channel();
        let server = tokio::spawn(serve(listener, recorder.clone(), stop_receiver));

        let stream = TcpStream::connect(address).await.unwrap();
        let (reader, mut writer) = stream.into_split();
        let mut lines = BufReader::new(reader).lines();
        writer.write_all(b"shutdown mount\r\nboot mount\r\nfly\r\n").await.unwrap();
        assert_eq!(lines.next_line().await.unwrap().unwrap(), "OK");
        assert_eq!(lines.next_line().await.unwrap().unwrap(), "ERROR no MAC configured");
        assert!(lines.next_line().await.unwrap().unwrap().starts_with("ERROR unknown"));
        assert_eq!(*recorder.commands.lock().unwrap(),
                   vec![RemoteCommand::ShutdownMount, RemoteCommand::BootMount]);

        stop_sender.send(()).unwrap();
        server.await.unwrap();
    }

    #[test]
    fn test_remote_server_thread() {
        let recorder = Arc::new(Recorder::default());
        let mut server = RemoteServer::start("127.0.0.1:0".parse().unwrap(),
                                             recorder.clone()).unwrap();
        let mut stream = std::net::TcpStream::connect(server.local_address()).unwrap();
        stream.write_all(b"shutdown\r\n").unwrap();
        let mut line = String::new();
        std::io::BufReader::new(stream.try_clone().unwrap()).read_line(&mut line).unwrap();
        assert_eq!(line, "OK\r\n");
        assert_eq!(*recorder.commands.lock().unwrap(), vec![RemoteCommand::Shutdown]);
        server.stop();
    }
}
