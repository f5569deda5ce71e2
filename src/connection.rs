//! # Connection
//!
//! A `Connection` is one channel of communication with one peer: it moves
//! bytes from the channel's inbound FIFO onto the network and bytes received
//! from the network into the outbound FIFO, doing all encryption,
//! authentication and replay filtering on the way.
//!
//! ## Wire format
//!
//! Every datagram starts with a 24-byte header, all integers little-endian:
//!
//! ```text
//! ┌──────────┬───────────┬──────────────┬────────────┬──────────┐
//! │ HostId   │ ChannelId │ ReceiverSeg  │ SenderSeg  │ MsgNum   │
//! │ (4)      │ (2)       │ (6)          │ (6)        │ (6)      │
//! └──────────┴───────────┴──────────────┴────────────┴──────────┘
//! ```
//!
//! followed by the AEAD ciphertext and its 16-byte tag. The AEAD IV is the
//! sender segment number concatenated with the message number (12 bytes) and
//! the additional data is the receiver segment number bytes, so a packet
//! only authenticates against the exact segment pair it was built for. An
//! empty payload is a *hello* packet, used to communicate segment numbers
//! before any data can flow.
//!
//! ## Segment numbers
//!
//! Each side sends under its current local segment number and restarts its
//! message counter at 1 whenever it takes a fresh segment. A receiver keeps
//! the current and the previous segment of its peer alive, each with its own
//! replay window, so packets reordered across a rotation still deliver. The
//! segment a packet names as its receiver decides how it is handled:
//!
//! - names a segment that is not ours: if it authenticates and its sender
//!   segment is news to us, we answer with an empty packet echoing that
//!   sender segment, which is how a peer that does not know our segment yet
//!   learns it. The sender segment is *not* adopted from this path, so an
//!   unauthenticated claim can never displace a confirmed one.
//! - names our current or previous segment and comes from a known peer
//!   segment: replay-filtered delivery.
//! - names our segment and carries a sender segment above the confirmed
//!   one: if it authenticates, the peer has rotated (or is being confirmed
//!   for the first time); the windows shift and the packet delivers.
//!
//! Anything else is dropped in silence; adversarial traffic never produces
//! a reply.

use std::collections::VecDeque;
use std::os::unix::io::RawFd;
use std::sync::{Arc, Mutex};

use crate::clock::epoch_millis;
use crate::config::{ChannelId, HostId};
use crate::constants::{
    AEAD_IV_SIZE, AEAD_TAG_SIZE, CHANNEL_ID_SIZE, CONN_ID_SIZE, FIFO_INWARD_SUFFIX,
    FIFO_OUTWARD_SUFFIX, HOST_ID_SIZE, MIN_PACKET_SIZE, PACKET_HEADER_SIZE, SEGNUM_MAX,
    SEGNUM_SIZE,
};
use crate::crypto::{hkdf_expand, AeadCodec, SecretKey};
use crate::error::{CommsError, Result};
use crate::net::{fd_readable, InFifo, OutFifo, UdpPort};
use crate::replay::ReplayWindow;
use crate::rtt::RttTracker;
use crate::segnum::SegmentNumGenerator;

/// Connection identifier: sender host id followed by channel id, the first
/// six bytes of every packet.
pub type ConnId = [u8; CONN_ID_SIZE];

/// Per-channel protocol state machine. See the module documentation.
pub struct Connection {
    self_id: HostId,
    peer_name: String,
    peer_id: HostId,
    channel_id: ChannelId,
    peer_ip: String,
    peer_port: u16,
    max_packet_size: usize,
    udp: Arc<UdpPort>,
    segnums: Arc<SegmentNumGenerator>,
    in_fifo_fd: RawFd,
    /// Datagrams queued by the socket reader, drained by the owning worker.
    inbox: Mutex<VecDeque<Vec<u8>>>,
    /// All other state. Only ever locked by the worker the scheduler has
    /// dispatched this connection to, so the lock is uncontended; it exists
    /// to make that exclusivity a compiler-checked fact.
    state: Mutex<ConnState>,
}

struct ConnState {
    in_fifo: InFifo,
    out_fifo: OutFifo,
    codec: AeadCodec,
    rtt: Arc<Mutex<RttTracker>>,
    cur_local_seg: u64,
    /// 0 = no previous local segment.
    old_local_seg: u64,
    /// 0 = the peer's segment is not yet confirmed.
    cur_peer_seg: u64,
    /// 0 = no previous peer segment.
    old_peer_seg: u64,
    cur_window: ReplayWindow,
    old_window: ReplayWindow,
    /// Message number of the next outbound packet under `cur_local_seg`.
    next_msgnum: u64,
    last_hello_ms: u64,
}

struct PacketHeader {
    recv_seg: u64,
    send_seg: u64,
    msgnum: u64,
    /// Sender segment and message number as IV bytes, straight off the wire.
    iv: [u8; AEAD_IV_SIZE],
    /// Receiver segment bytes, the AEAD additional data.
    ad: [u8; SEGNUM_SIZE],
}

impl Connection {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        self_id: HostId,
        peer_name: &str,
        peer_id: HostId,
        channel_id: ChannelId,
        fifo_base: &str,
        key: &SecretKey,
        peer_ip: &str,
        peer_port: u16,
        max_packet_size: usize,
        udp: Arc<UdpPort>,
        segnums: Arc<SegmentNumGenerator>,
    ) -> Result<Self> {
        if max_packet_size <= MIN_PACKET_SIZE {
            return Err(CommsError::Config(format!(
                "max packet size {} leaves no room for payload (need > {})",
                max_packet_size, MIN_PACKET_SIZE
            )));
        }

        // Direction subkeys: send = HKDF(shared, self ‖ peer ‖ channel),
        // recv = HKDF(shared, peer ‖ self ‖ channel). Our send context is
        // the peer's receive context and vice versa.
        let send_key = hkdf_expand(key, &direction_info(&self_id, &peer_id, &channel_id))?;
        let recv_key = hkdf_expand(key, &direction_info(&peer_id, &self_id, &channel_id))?;
        let codec = AeadCodec::new(&send_key, &recv_key)?;

        let in_fifo = InFifo::new(&format!("{}{}", fifo_base, FIFO_OUTWARD_SUFFIX))?;
        let out_fifo = OutFifo::new(&format!("{}{}", fifo_base, FIFO_INWARD_SUFFIX))?;
        let in_fifo_fd = in_fifo.fd();

        let rtt = Arc::new(Mutex::new(RttTracker::new()));
        let cur_local_seg = segnums.next()?;

        log::debug!(
            "connection to {} channel {:02x}{:02x}: local segment {}",
            peer_name,
            channel_id[0],
            channel_id[1],
            cur_local_seg
        );

        Ok(Connection {
            self_id,
            peer_name: peer_name.to_string(),
            peer_id,
            channel_id,
            peer_ip: peer_ip.to_string(),
            peer_port,
            max_packet_size,
            udp,
            segnums,
            in_fifo_fd,
            inbox: Mutex::new(VecDeque::new()),
            state: Mutex::new(ConnState {
                in_fifo,
                out_fifo,
                codec,
                rtt: Arc::clone(&rtt),
                cur_local_seg,
                old_local_seg: 0,
                cur_peer_seg: 0,
                old_peer_seg: 0,
                cur_window: ReplayWindow::new(Arc::clone(&rtt)),
                old_window: ReplayWindow::new(rtt),
                next_msgnum: 1,
                last_hello_ms: 0,
            }),
        })
    }

    /// The routing key under which this connection receives: peer host id
    /// followed by channel id.
    pub fn conn_id(&self) -> ConnId {
        let mut id = [0u8; CONN_ID_SIZE];
        id[..HOST_ID_SIZE].copy_from_slice(&self.peer_id);
        id[HOST_ID_SIZE..].copy_from_slice(&self.channel_id);
        id
    }

    pub fn peer_name(&self) -> &str {
        &self.peer_name
    }

    /// Descriptor of the FIFO carrying user bytes into the tunnel, for
    /// readiness monitoring.
    pub fn in_fifo_fd(&self) -> RawFd {
        self.in_fifo_fd
    }

    /// When the last hello packet left, in epoch milliseconds (0 = never).
    pub fn last_hello_ms(&self) -> u64 {
        self.state.lock().unwrap().last_hello_ms
    }

    /// Queue a datagram received from the network for this connection.
    pub fn add_message(&self, data: Vec<u8>) {
        self.inbox.lock().unwrap().push_back(data);
    }

    /// Whether this connection has work pending: queued inbound datagrams
    /// or readable bytes in the inbound FIFO.
    pub fn is_data(&self) -> bool {
        !self.inbox.lock().unwrap().is_empty() || fd_readable(self.in_fifo_fd)
    }

    /// Move data in both directions, alternating one inbound datagram and
    /// one outbound packet per pass, for at most `dwell` passes or until
    /// neither direction has anything left.
    ///
    /// Inbound runs first within a pass: a confirmation sitting in the
    /// inbox then unblocks the send path for queued user data in the same
    /// pass instead of provoking another hello.
    pub fn move_data(&self, dwell: u32) -> Result<()> {
        let mut st = self.state.lock().unwrap();
        // at most one hello per scheduling slice
        let mut hello_sent = false;

        for _ in 0..dwell {
            let mut moved = false;

            let inbound = self.inbox.lock().unwrap().pop_front();
            if let Some(message) = inbound {
                moved = true;
                self.handle_message(&mut st, &message)?;
            }

            if st.cur_peer_seg == 0 {
                // The peer's segment is unknown, so data cannot be sent
                // yet. If the user has bytes waiting, prod the peer with a
                // hello carrying our segment; the data stays in the FIFO
                // until the handshake completes.
                if !hello_sent && st.in_fifo.has_data() {
                    st.last_hello_ms = epoch_millis();
                    self.send_packet(&mut st, &[], 0)?;
                    log::debug!("[{}] sent hello", self.peer_name);
                    hello_sent = true;
                }
            } else {
                let payload = st.in_fifo.read(self.max_packet_size - MIN_PACKET_SIZE)?;
                if !payload.is_empty() {
                    moved = true;
                    let recv_seg = st.cur_peer_seg;
                    self.send_packet(&mut st, &payload, recv_seg)?;
                }
            }

            if !moved {
                break;
            }
        }
        Ok(())
    }

    /// Take the next outbound message number, rotating to a fresh local
    /// segment when the counter space is exhausted.
    fn take_msgnum(&self, st: &mut ConnState) -> Result<u64> {
        if st.next_msgnum > SEGNUM_MAX {
            st.old_local_seg = st.cur_local_seg;
            st.cur_local_seg = self.segnums.next()?;
            st.next_msgnum = 1;
            log::info!(
                "[{}] message numbers exhausted, rotated to local segment {}",
                self.peer_name,
                st.cur_local_seg
            );
        }
        let msgnum = st.next_msgnum;
        st.next_msgnum += 1;
        Ok(msgnum)
    }

    /// Build, encrypt and send one packet under the current local segment.
    fn send_packet(&self, st: &mut ConnState, payload: &[u8], recv_seg: u64) -> Result<()> {
        let msgnum = self.take_msgnum(st)?;

        let mut packet = vec![0u8; PACKET_HEADER_SIZE + payload.len() + AEAD_TAG_SIZE];
        packet[..HOST_ID_SIZE].copy_from_slice(&self.self_id);
        packet[HOST_ID_SIZE..CONN_ID_SIZE].copy_from_slice(&self.channel_id);
        write_u48(&mut packet[6..12], recv_seg);
        write_u48(&mut packet[12..18], st.cur_local_seg);
        write_u48(&mut packet[18..24], msgnum);

        let mut iv = [0u8; AEAD_IV_SIZE];
        iv.copy_from_slice(&packet[12..24]);
        let mut ad = [0u8; SEGNUM_SIZE];
        ad.copy_from_slice(&packet[6..12]);

        st.codec
            .encrypt_into(payload, &ad, &iv, &mut packet, PACKET_HEADER_SIZE)?;

        if !self.udp.send(&packet, &self.peer_ip, self.peer_port) {
            // UDP is lossy anyway; the peer's replay window handles gaps
            log::warn!(
                "[{}] UDP send of {} bytes failed",
                self.peer_name,
                packet.len()
            );
        } else {
            log::trace!(
                "[{}] sent msgnum {} ({} payload bytes)",
                self.peer_name,
                msgnum,
                payload.len()
            );
        }
        Ok(())
    }

    /// Classify and handle one datagram addressed to this connection.
    fn handle_message(&self, st: &mut ConnState, bytes: &[u8]) -> Result<()> {
        if bytes.len() < MIN_PACKET_SIZE {
            return Ok(());
        }
        let hdr = unpack_header(bytes);
        if hdr.send_seg == 0 {
            return Ok(());
        }
        let body = &bytes[PACKET_HEADER_SIZE..];

        let my_seg_live = hdr.recv_seg != 0
            && (hdr.recv_seg == st.cur_local_seg
                || (st.old_local_seg != 0 && hdr.recv_seg == st.old_local_seg));

        if !my_seg_live {
            // The sender does not know our live segment. If its own segment
            // is not news either, this is old traffic and gets no reply
            // (answering replayed packets would make us an amplifier).
            if hdr.send_seg <= st.cur_peer_seg {
                return Ok(());
            }
            if st.codec.decrypt(body, &hdr.ad, &hdr.iv).is_none() {
                return Ok(());
            }
            // Authentic hello from a segment we have not confirmed: answer
            // with an empty packet echoing its segment so the reply is
            // accepted, teaching the peer our segment. Confirmation of the
            // peer's segment itself only happens on a packet addressed to
            // our live segment.
            log::debug!(
                "[{}] answering hello for peer segment {}",
                self.peer_name,
                hdr.send_seg
            );
            self.send_packet(st, &[], hdr.send_seg)?;
            return Ok(());
        }

        let peer_seg_known = hdr.send_seg == st.cur_peer_seg
            || (st.old_peer_seg != 0 && hdr.send_seg == st.old_peer_seg);

        if peer_seg_known {
            let use_cur = hdr.send_seg == st.cur_peer_seg;
            let already_seen = if use_cur {
                st.cur_window.seen(hdr.msgnum)
            } else {
                st.old_window.seen(hdr.msgnum)
            };
            if already_seen {
                log::trace!(
                    "[{}] dropped replayed msgnum {} for segment {}",
                    self.peer_name,
                    hdr.msgnum,
                    hdr.send_seg
                );
                return Ok(());
            }

            let Some(plain) = st.codec.decrypt(body, &hdr.ad, &hdr.iv) else {
                log::trace!("[{}] dropped packet with bad tag", self.peer_name);
                return Ok(());
            };
            if use_cur {
                st.cur_window.log(hdr.msgnum);
            } else {
                st.old_window.log(hdr.msgnum);
            }
            self.deliver(st, &plain)?;
        } else if hdr.send_seg > st.cur_peer_seg {
            // The peer claims a newer segment; only an authentic packet may
            // move our receive state.
            let Some(plain) = st.codec.decrypt(body, &hdr.ad, &hdr.iv) else {
                log::trace!("[{}] dropped unauthentic rotation claim", self.peer_name);
                return Ok(());
            };

            let first_confirmation = st.cur_peer_seg == 0;
            st.old_peer_seg = st.cur_peer_seg;
            std::mem::swap(&mut st.old_window, &mut st.cur_window);
            st.cur_peer_seg = hdr.send_seg;
            st.cur_window.reset();
            st.cur_window.log(hdr.msgnum);

            if first_confirmation {
                log::debug!(
                    "[{}] peer segment {} confirmed",
                    self.peer_name,
                    hdr.send_seg
                );
                if st.last_hello_ms != 0 {
                    // hello out, confirmation in: one round trip
                    let sample = epoch_millis().saturating_sub(st.last_hello_ms);
                    st.rtt
                        .lock()
                        .unwrap()
                        .update(sample.min(u64::from(u32::MAX)) as u32);
                }
            } else {
                log::debug!(
                    "[{}] peer rotated to segment {}",
                    self.peer_name,
                    hdr.send_seg
                );
            }
            self.deliver(st, &plain)?;
        }
        // remaining case: a stale sender segment with no live window; drop

        Ok(())
    }

    /// Best-effort delivery of decrypted bytes to the local reader.
    fn deliver(&self, st: &mut ConnState, plain: &[u8]) -> Result<()> {
        if plain.is_empty() {
            return Ok(());
        }
        let (written, broken) = st.out_fifo.write(plain)?;
        if broken {
            log::debug!(
                "[{}] no local reader, dropped {} bytes",
                self.peer_name,
                plain.len() - written
            );
        } else if written < plain.len() {
            log::warn!(
                "[{}] outbound FIFO full, dropped {} bytes",
                self.peer_name,
                plain.len() - written
            );
        }
        Ok(())
    }
}

/// HKDF info bytes for one direction of a channel.
fn direction_info(
    from: &HostId,
    to: &HostId,
    channel: &ChannelId,
) -> [u8; 2 * HOST_ID_SIZE + CHANNEL_ID_SIZE] {
    let mut info = [0u8; 2 * HOST_ID_SIZE + CHANNEL_ID_SIZE];
    info[..HOST_ID_SIZE].copy_from_slice(from);
    info[HOST_ID_SIZE..2 * HOST_ID_SIZE].copy_from_slice(to);
    info[2 * HOST_ID_SIZE..].copy_from_slice(channel);
    info
}

fn read_u48(bytes: &[u8]) -> u64 {
    let mut buf = [0u8; 8];
    buf[..SEGNUM_SIZE].copy_from_slice(&bytes[..SEGNUM_SIZE]);
    u64::from_le_bytes(buf)
}

fn write_u48(dest: &mut [u8], value: u64) {
    dest[..SEGNUM_SIZE].copy_from_slice(&value.to_le_bytes()[..SEGNUM_SIZE]);
}

/// Split a raw packet into header fields. The caller has checked the
/// length; the leading host and channel ids were already used for routing.
fn unpack_header(bytes: &[u8]) -> PacketHeader {
    let mut iv = [0u8; AEAD_IV_SIZE];
    iv.copy_from_slice(&bytes[12..24]);
    let mut ad = [0u8; SEGNUM_SIZE];
    ad.copy_from_slice(&bytes[6..12]);

    PacketHeader {
        recv_seg: read_u48(&bytes[6..12]),
        send_seg: read_u48(&bytes[12..18]),
        msgnum: read_u48(&bytes[18..24]),
        iv,
        ad,
    }
}
