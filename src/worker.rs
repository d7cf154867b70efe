use crate::connection::UdpConnection;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::select;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, info, warn};

/// cadence of the per-connection bookkeeping pass
const IDLE_WAIT: Duration = Duration::from_millis(10);

/// upper bound for the worker's blocking wait, even with nothing to do
const MAX_WAIT: Duration = Duration::from_secs(1);

/// The single background actor driving any number of connections: all socket I/O and all
///  connection mutation happens on its task. It wakes up when the application signals new
///  outbound messages, or on a bounded timeout, and runs each connection through its update
///  tick, socket read and socket write in that order.
pub struct NetworkWorker {
    connections: Arc<Mutex<Vec<Arc<UdpConnection>>>>,
    wake: Arc<Notify>,
    handle: Option<JoinHandle<()>>,
}

impl NetworkWorker {
    pub fn new() -> NetworkWorker {
        NetworkWorker {
            connections: Arc::new(Mutex::new(Vec::new())),
            wake: Arc::new(Notify::new()),
            handle: None,
        }
    }

    pub fn add_connection(&self, connection: Arc<UdpConnection>) {
        connection.attach_worker(self.wake.clone());
        self.connections.lock().unwrap().push(connection);
        debug!("connection added to network worker");
        self.wake.notify_one();
    }

    pub fn num_connections(&self) -> usize {
        self.connections.lock().unwrap().len()
    }

    pub fn spawn(&mut self) {
        if self.handle.is_some() {
            warn!("network worker already spawned");
            return;
        }
        let connections = self.connections.clone();
        let wake = self.wake.clone();
        self.handle = Some(tokio::spawn(Self::main_loop(connections, wake)));
    }

    pub fn stop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }

    async fn main_loop(connections: Arc<Mutex<Vec<Arc<UdpConnection>>>>, wake: Arc<Notify>) {
        info!("network worker running");

        loop {
            let current: Vec<Arc<UdpConnection>> = connections.lock().unwrap().clone();

            if current.is_empty() {
                select! {
                    _ = wake.notified() => {}
                    _ = sleep(MAX_WAIT) => {}
                }
                continue;
            }

            let mut wait = IDLE_WAIT;
            for connection in &current {
                connection.update_tick().await;
                connection.read_socket().await;
                connection.send_out_packets().await;

                // when a throttled connection frees up sooner than the next tick, shorten
                //  the wait accordingly
                if let Some(until_send) = connection.time_until_next_send().await {
                    wait = wait.min(until_send.max(Duration::from_millis(1)));
                }
            }

            {
                let mut connections = connections.lock().unwrap();
                let before = connections.len();
                connections.retain(|c| !c.is_closed());
                if connections.len() != before {
                    debug!("dropped {} closed connection(s) from the worker", before - connections.len());
                }
            }

            select! {
                _ = wake.notified() => {}
                _ = sleep(wait) => {}
            }
        }
    }
}

impl Default for NetworkWorker {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for NetworkWorker {
    fn drop(&mut self) {
        self.stop();
    }
}
