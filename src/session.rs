//! # Session
//!
//! The process-level object owning the UDP socket, the segment number
//! generator, the connection table and the worker threads.
//!
//! ## Thread roles
//!
//! - **socket reader** (one): polls the UDP descriptor together with a stop
//!   pipe. Each datagram is routed by its leading six bytes (sender host id
//!   and channel id) to the owning connection's inbox, and the connection is
//!   put on the work queue.
//! - **fifo monitor** (one): polls the inbound FIFO descriptors of every
//!   idle connection together with a wake pipe. A readable FIFO puts its
//!   connection on the work queue; the descriptor leaves the poll set until
//!   the workers have drained it, so a slow worker never turns the monitor
//!   into a busy loop.
//! - **connection workers** (N, default 5): wait on the queue, take one
//!   connection at a time and run its [`Connection::move_data`]. Afterwards
//!   the connection is either re-queued (it still has pending work) or
//!   handed back to the fifo monitor.
//!
//! A connection is always in exactly one place: the queue, a worker's
//! hands, or the monitored set. That single-location rule is what makes a
//! `Connection` effectively single-threaded and the per-connection ordering
//! guarantees hold.
//!
//! The per-dispatch work budget (`dwell`) adapts to load: when more
//! connections are busy or queued than there are workers it shrinks, so no
//! connection can starve the others; otherwise it grows back.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;

use crate::config::Config;
use crate::connection::{ConnId, Connection};
use crate::constants::{
    CONN_ID_SIZE, DEFAULT_MAX_PACKET_SIZE, DWELL_MAX, DWELL_MIN,
};
use crate::error::Result;
use crate::net::{EventLoop, UdpPort, WakePipe, POLLIN, WAKE_REBUILD, WAKE_STOP};
use crate::segnum::SegmentNumGenerator;

/// Where a connection currently lives in the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConnLocation {
    /// On the work queue, waiting for a worker.
    Queued,
    /// In a worker's hands.
    Busy,
    /// Idle; its inbound FIFO descriptor is watched by the fifo monitor.
    Monitored,
}

struct Scheduler {
    queue: VecDeque<ConnId>,
    location: HashMap<ConnId, ConnLocation>,
    dwell: u32,
    stopping: bool,
}

struct Shared {
    udp: Arc<UdpPort>,
    #[allow(dead_code)]
    segnums: Arc<SegmentNumGenerator>,
    connections: HashMap<ConnId, Arc<Connection>>,
    sched: Mutex<Scheduler>,
    queue_cv: Condvar,
    monitor_wake: WakePipe,
    reader_stop: WakePipe,
    num_workers: usize,
    failed: AtomicBool,
}

/// The running tunnel. Dropping a `Session` stops it.
pub struct Session {
    shared: Arc<Shared>,
    threads: Vec<JoinHandle<()>>,
    stopped: bool,
}

impl Session {
    /// Build every connection from the configuration and start the reader,
    /// monitor and worker threads.
    pub fn start(config: &Config, segnum_base: &str, num_workers: usize) -> Result<Session> {
        let udp = Arc::new(UdpPort::bind(&config.self_ip, config.self_port)?);
        log::info!("listening on {}:{}", udp.bound_addr(), udp.bound_port());

        let channel_count: usize = config.peers.iter().map(|p| p.channels.len()).sum();
        // two segment numbers per connection covers startup plus one
        // rotation before the next reservation touches the disk
        let segnums = Arc::new(SegmentNumGenerator::new(
            segnum_base,
            (2 * channel_count).max(1) as u64,
        )?);

        let mut connections: HashMap<ConnId, Arc<Connection>> = HashMap::new();
        let mut sched = Scheduler {
            queue: VecDeque::new(),
            location: HashMap::new(),
            dwell: DWELL_MAX,
            stopping: false,
        };

        for peer in &config.peers {
            let max_packet_size = peer
                .max_packet_size
                .or(config.default_max_packet_size)
                .unwrap_or(DEFAULT_MAX_PACKET_SIZE);

            for channel in &peer.channels {
                let conn = Connection::new(
                    config.self_id,
                    &peer.name,
                    peer.id,
                    channel.id,
                    &channel.fifo_base,
                    &peer.key,
                    &peer.ip,
                    peer.port,
                    max_packet_size,
                    Arc::clone(&udp),
                    Arc::clone(&segnums),
                )?;
                let id = conn.conn_id();
                sched.location.insert(id, ConnLocation::Monitored);
                connections.insert(id, Arc::new(conn));
                log::info!(
                    "channel {:02x}{:02x} to {} at {}:{}",
                    channel.id[0],
                    channel.id[1],
                    peer.name,
                    peer.ip,
                    peer.port
                );
            }
        }

        let num_workers = num_workers.max(1);
        let shared = Arc::new(Shared {
            udp,
            segnums,
            connections,
            sched: Mutex::new(sched),
            queue_cv: Condvar::new(),
            monitor_wake: WakePipe::new()?,
            reader_stop: WakePipe::new()?,
            num_workers,
            failed: AtomicBool::new(false),
        });

        let mut threads = Vec::with_capacity(num_workers + 2);
        {
            let shared = Arc::clone(&shared);
            threads.push(std::thread::spawn(move || socket_reader(&shared)));
        }
        {
            let shared = Arc::clone(&shared);
            threads.push(std::thread::spawn(move || fifo_monitor(&shared)));
        }
        for _ in 0..num_workers {
            let shared = Arc::clone(&shared);
            threads.push(std::thread::spawn(move || connection_worker(&shared)));
        }

        log::info!(
            "session started: {} connections, {} workers",
            shared.connections.len(),
            num_workers
        );
        Ok(Session {
            shared,
            threads,
            stopped: false,
        })
    }

    /// Whether a worker hit an unrecoverable error and shut the session
    /// down from the inside.
    pub fn has_failed(&self) -> bool {
        self.shared.failed.load(Ordering::SeqCst)
    }

    /// Stop all threads and wait for them. Idempotent.
    pub fn stop(&mut self) {
        if self.stopped {
            return;
        }
        self.stopped = true;

        {
            let mut sched = self.shared.sched.lock().unwrap();
            sched.stopping = true;
        }
        self.shared.queue_cv.notify_all();
        self.shared.monitor_wake.notify(WAKE_STOP);
        self.shared.reader_stop.notify(WAKE_STOP);

        for handle in self.threads.drain(..) {
            let _ = handle.join();
        }
        log::info!("session stopped");
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Request shutdown from inside a thread (worker error path).
fn initiate_shutdown(shared: &Shared) {
    {
        let mut sched = shared.sched.lock().unwrap();
        sched.stopping = true;
    }
    shared.queue_cv.notify_all();
    shared.monitor_wake.notify(WAKE_STOP);
    shared.reader_stop.notify(WAKE_STOP);
}

/// Receive datagrams and route them to connection inboxes.
fn socket_reader(shared: &Shared) {
    let mut poll = EventLoop::new();
    poll.add_fd(shared.udp.fd(), POLLIN);
    poll.add_fd(shared.reader_stop.fd(), POLLIN);

    loop {
        let events = match poll.poll(-1) {
            Ok(events) => events,
            Err(e) => {
                log::error!("socket reader poll failed: {}", e);
                shared.failed.store(true, Ordering::SeqCst);
                initiate_shutdown(shared);
                return;
            }
        };

        for (fd, _revents) in events {
            if fd == shared.reader_stop.fd() {
                if shared.reader_stop.read_byte() == Some(WAKE_STOP) {
                    return;
                }
                continue;
            }

            let Some(message) = shared.udp.receive() else {
                log::warn!("UDP receive failed, continuing");
                continue;
            };
            if message.data.len() < CONN_ID_SIZE {
                continue;
            }
            let mut id: ConnId = [0u8; CONN_ID_SIZE];
            id.copy_from_slice(&message.data[..CONN_ID_SIZE]);
            let Some(conn) = shared.connections.get(&id) else {
                log::trace!(
                    "dropped datagram for unknown connection from {}:{}",
                    message.source_addr,
                    message.source_port
                );
                continue;
            };

            // enqueue the datagram before taking the scheduler lock, so a
            // worker that is just finishing sees it in its pending check
            conn.add_message(message.data);

            let mut sched = shared.sched.lock().unwrap();
            if sched.location.get(&id) == Some(&ConnLocation::Monitored) {
                sched.location.insert(id, ConnLocation::Queued);
                sched.queue.push_back(id);
                shared.queue_cv.notify_one();
                // its FIFO descriptor must leave the monitor's poll set
                shared.monitor_wake.notify(WAKE_REBUILD);
            }
            // queued or busy connections will pick the datagram up anyway
        }
    }
}

/// Watch the inbound FIFOs of idle connections and queue them when their
/// user writes data.
fn fifo_monitor(shared: &Shared) {
    let mut poll = EventLoop::new();
    let mut watched: HashMap<i32, ConnId> = HashMap::new();

    loop {
        // (re)build the poll set: wake pipe plus every monitored FIFO. The
        // monitored set changes under the scheduler lock, so this snapshot
        // is refreshed on every wake byte.
        poll.clear();
        watched.clear();
        poll.add_fd(shared.monitor_wake.fd(), POLLIN);
        {
            let sched = shared.sched.lock().unwrap();
            if sched.stopping {
                return;
            }
            for (id, location) in &sched.location {
                if *location == ConnLocation::Monitored {
                    if let Some(conn) = shared.connections.get(id) {
                        poll.add_fd(conn.in_fifo_fd(), POLLIN);
                        watched.insert(conn.in_fifo_fd(), *id);
                    }
                }
            }
        }

        let events = match poll.poll(-1) {
            Ok(events) => events,
            Err(e) => {
                log::error!("fifo monitor poll failed: {}", e);
                shared.failed.store(true, Ordering::SeqCst);
                initiate_shutdown(shared);
                return;
            }
        };

        let mut sched = shared.sched.lock().unwrap();
        for (fd, _revents) in events {
            if fd == shared.monitor_wake.fd() {
                if shared.monitor_wake.read_byte() == Some(WAKE_STOP) {
                    return;
                }
                // WAKE_REBUILD: fall through, the set is rebuilt above
                continue;
            }
            let Some(id) = watched.get(&fd) else { continue };
            // any event on the FIFO sends the connection to a worker, which
            // is where reads (and read errors) are handled
            if sched.location.get(id) == Some(&ConnLocation::Monitored) {
                sched.location.insert(*id, ConnLocation::Queued);
                sched.queue.push_back(*id);
                shared.queue_cv.notify_one();
            }
        }
    }
}

/// Take connections off the queue and move their data.
fn connection_worker(shared: &Shared) {
    loop {
        let (id, dwell) = {
            let mut sched = shared.sched.lock().unwrap();
            loop {
                if sched.stopping {
                    return;
                }
                if let Some(id) = sched.queue.pop_front() {
                    sched.location.insert(id, ConnLocation::Busy);

                    // adapt the work budget to the load
                    let busy = sched
                        .location
                        .values()
                        .filter(|l| **l == ConnLocation::Busy)
                        .count();
                    let active = busy + sched.queue.len();
                    sched.dwell = if active > shared.num_workers {
                        (sched.dwell - 1).max(DWELL_MIN)
                    } else {
                        (sched.dwell + 1).min(DWELL_MAX)
                    };
                    break (id, sched.dwell);
                }
                sched = shared.queue_cv.wait(sched).unwrap();
            }
        };

        let conn = &shared.connections[&id];
        if let Err(e) = conn.move_data(dwell) {
            log::error!("[{}] worker failed: {}", conn.peer_name(), e);
            shared.failed.store(true, Ordering::SeqCst);
            initiate_shutdown(shared);
            return;
        }

        let mut sched = shared.sched.lock().unwrap();
        if conn.is_data() {
            // still has work (or new datagrams arrived while busy)
            sched.location.insert(id, ConnLocation::Queued);
            sched.queue.push_back(id);
            shared.queue_cv.notify_one();
        } else {
            sched.location.insert(id, ConnLocation::Monitored);
            shared.monitor_wake.notify(WAKE_REBUILD);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::parse_config;
    use std::fs::OpenOptions;
    use std::io::{Read, Write};
    use std::os::unix::fs::OpenOptionsExt;
    use std::time::{Duration, Instant};

    const KEY_HEX: &str = "0102030405060708090a0b0c0d0e0f101112131415161718191a1b1c1d1e1f20";

    fn seed_segnums(dir: &std::path::Path, name: &str) -> String {
        let base = dir.join(name).to_str().unwrap().to_string();
        std::fs::write(format!("{}_FIRST", base), "1\n1\n").unwrap();
        std::fs::write(format!("{}_SECOND", base), "1\n1\n").unwrap();
        base
    }

    #[test]
    fn test_session_without_peers_starts_and_stops() {
        let dir = tempfile::tempdir().unwrap();
        let base = seed_segnums(dir.path(), "segnums");
        let port = {
            let probe = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
            probe.local_addr().unwrap().port()
        };
        let config = parse_config(&format!(
            "name: self\nid: 0a0b0c0d\nip: 127.0.0.1\nport: {}\n",
            port
        ))
        .unwrap();

        let mut session = Session::start(&config, &base, 3).unwrap();
        assert!(!session.has_failed());
        session.stop();
        session.stop(); // idempotent
    }

    #[test]
    fn test_two_sessions_move_bytes_end_to_end() {
        let dir = tempfile::tempdir().unwrap();

        // bind throwaway sockets to pick two free ports, then release them
        let (port_a, port_b) = {
            let a = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
            let b = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
            (
                a.local_addr().unwrap().port(),
                b.local_addr().unwrap().port(),
            )
        };

        let fifo_a = dir.path().join("a_chan").to_str().unwrap().to_string();
        let fifo_b = dir.path().join("b_chan").to_str().unwrap().to_string();

        let config_a = parse_config(&format!(
            "name: self\nid: 0a0a0a0a\nip: 127.0.0.1\nport: {}\n\
             name: hostb\nid: 0b0b0b0b\nkey: {}\nip: 127.0.0.1\nport: {}\n\
             channel: 0001 {}\n",
            port_a, KEY_HEX, port_b, fifo_a
        ))
        .unwrap();
        let config_b = parse_config(&format!(
            "name: self\nid: 0b0b0b0b\nip: 127.0.0.1\nport: {}\n\
             name: hosta\nid: 0a0a0a0a\nkey: {}\nip: 127.0.0.1\nport: {}\n\
             channel: 0001 {}\n",
            port_b, KEY_HEX, port_a, fifo_b
        ))
        .unwrap();

        let base_a = seed_segnums(dir.path(), "segnums_a");
        let base_b = seed_segnums(dir.path(), "segnums_b");

        let mut session_a = Session::start(&config_a, &base_a, 2).unwrap();
        let mut session_b = Session::start(&config_b, &base_b, 2).unwrap();

        // attach the user endpoints: read B's inward FIFO, write A's
        // outward FIFO
        let mut b_reader = OpenOptions::new()
            .read(true)
            .custom_flags(libc::O_NONBLOCK)
            .open(format!("{}_INWARD", fifo_b))
            .unwrap();
        let mut a_writer = OpenOptions::new()
            .write(true)
            .open(format!("{}_OUTWARD", fifo_a))
            .unwrap();

        a_writer.write_all(b"17 bytes exactly!").unwrap();
        a_writer.flush().unwrap();

        // the hello exchange and the data packet all ride on live threads;
        // poll the reader until the plaintext lands
        let deadline = Instant::now() + Duration::from_secs(5);
        let mut received = Vec::new();
        while received.len() < 17 && Instant::now() < deadline {
            let mut buf = [0u8; 64];
            match b_reader.read(&mut buf) {
                Ok(n) => received.extend_from_slice(&buf[..n]),
                Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    std::thread::sleep(Duration::from_millis(10));
                }
                Err(e) => panic!("read failed: {}", e),
            }
        }
        assert_eq!(received, b"17 bytes exactly!");

        // and the reverse direction over the same channel
        let mut a_reader = OpenOptions::new()
            .read(true)
            .custom_flags(libc::O_NONBLOCK)
            .open(format!("{}_INWARD", fifo_a))
            .unwrap();
        let mut b_writer = OpenOptions::new()
            .write(true)
            .open(format!("{}_OUTWARD", fifo_b))
            .unwrap();
        b_writer.write_all(b"reply").unwrap();
        b_writer.flush().unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        let mut received = Vec::new();
        while received.len() < 5 && Instant::now() < deadline {
            let mut buf = [0u8; 64];
            match a_reader.read(&mut buf) {
                Ok(n) => received.extend_from_slice(&buf[..n]),
                Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    std::thread::sleep(Duration::from_millis(10));
                }
                Err(e) => panic!("read failed: {}", e),
            }
        }
        assert_eq!(received, b"reply");

        assert!(!session_a.has_failed());
        assert!(!session_b.has_failed());
        session_a.stop();
        session_b.stop();
    }
}
