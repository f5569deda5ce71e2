//! # Configuration
//!
//! Parses the tunnel configuration file and makes the result available as
//! plain data. The format is line based: `option: value` lines grouped into
//! blocks, each block starting with a `name:` line. The block named `self`
//! describes the local host; every other block describes a peer and its
//! channels. Blank lines and lines whose first non-whitespace character is
//! `#` are ignored.
//!
//! ```text
//! name: self
//! id: 0a0b0c0d
//! ip: 192.0.2.10
//! port: 4000
//! max_size: 1200
//!
//! name: othersite
//! id: 01020304
//! key: <64 hex characters>
//! ip: 192.0.2.20
//! port: 4000
//! channel: 01a4 /var/run/comms/alpha
//! channel: 01a5 /var/run/comms/beta
//! ```
//!
//! Lines holding secret key material are parsed without intermediate copies
//! (see [`SecretKey::from_hex`]) and callers of [`parse_config_file`] get
//! the file contents scrubbed from memory before it returns.

use std::collections::HashSet;
use std::fs;

use zeroize::Zeroize;

use crate::constants::MAX_UDP_PAYLOAD;
use crate::crypto::SecretKey;
use crate::error::{CommsError, Result};

/// Host identifier: 4 bytes, assigned per host in configuration.
pub type HostId = [u8; 4];

/// Channel identifier: 2 bytes, unique per peer.
pub type ChannelId = [u8; 2];

const SELF_NAME: &str = "self";

/// One channel of a peer: its identifier and the base path of the local
/// FIFO pair.
#[derive(Debug)]
pub struct ChannelSpec {
    pub id: ChannelId,
    pub fifo_base: String,
}

/// Configuration of one remote peer.
#[derive(Debug)]
pub struct PeerConfig {
    pub name: String,
    pub id: HostId,
    pub key: SecretKey,
    pub ip: String,
    pub port: u16,
    pub max_packet_size: Option<usize>,
    pub channels: Vec<ChannelSpec>,
}

/// Fully parsed configuration: the local host plus all peers.
#[derive(Debug)]
pub struct Config {
    pub self_id: HostId,
    pub self_ip: String,
    pub self_port: u16,
    pub default_max_packet_size: Option<usize>,
    pub peers: Vec<PeerConfig>,
}

/// Parse the configuration file at `path`.
pub fn parse_config_file(path: &str) -> Result<Config> {
    let mut content = fs::read_to_string(path).map_err(|e| {
        CommsError::Startup(format!("could not read config file {}: {}", path, e))
    })?;
    let result = parse_config(&content);
    // the file may hold secret keys in hexadecimal form
    content.zeroize();
    result
}

/// Parse configuration text. See the module documentation for the format.
pub fn parse_config(content: &str) -> Result<Config> {
    let mut blocks: Vec<Block> = Vec::new();
    let mut current: Option<Block> = None;

    for (idx, raw_line) in content.lines().enumerate() {
        let line_num = idx + 1;
        let line = raw_line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let (option, value) = split_option_line(line, line_num)?;

        if option == "name" {
            if let Some(done) = current.take() {
                blocks.push(done);
            }
            current = Some(Block::new(parse_name(value, line_num)?));
            continue;
        }

        let block = current.as_mut().ok_or_else(|| {
            line_error("expected option \"name\"", line_num)
        })?;
        block.apply_option(option, value, line_num)?;
    }
    if let Some(done) = current.take() {
        blocks.push(done);
    }

    assemble(blocks)
}

/// Partially parsed configuration block.
struct Block {
    name: String,
    seen: HashSet<String>,
    id: Option<HostId>,
    key: Option<SecretKey>,
    ip: Option<String>,
    port: Option<u16>,
    max_packet_size: Option<usize>,
    channels: Vec<ChannelSpec>,
}

impl Block {
    fn new(name: String) -> Self {
        Block {
            name,
            seen: HashSet::new(),
            id: None,
            key: None,
            ip: None,
            port: None,
            max_packet_size: None,
            channels: Vec::new(),
        }
    }

    fn is_self(&self) -> bool {
        self.name == SELF_NAME
    }

    fn apply_option(&mut self, option: &str, value: &str, line_num: usize) -> Result<()> {
        if option != "channel" && !self.seen.insert(option.to_string()) {
            return Err(line_error(
                &format!("configuration option \"{}\" repeated", option),
                line_num,
            ));
        }

        match option {
            "id" => self.id = Some(parse_id(value, line_num)?),
            "key" if self.is_self() => {
                return Err(line_error("\"key\" not allowed for \"self\"", line_num));
            }
            "key" => {
                self.key = Some(SecretKey::from_hex(value).map_err(|e| {
                    line_error(&format!("error parsing key, {}", e), line_num)
                })?);
            }
            "channel" if self.is_self() => {
                return Err(line_error("\"channel\" not allowed for \"self\"", line_num));
            }
            "channel" => self.channels.push(parse_channel(value, line_num)?),
            "ip" => self.ip = Some(parse_ip(value, line_num)?),
            "port" => self.port = Some(parse_port(value, line_num)?),
            "max_size" => self.max_packet_size = Some(parse_max_size(value, line_num)?),
            other => {
                return Err(line_error(
                    &format!("invalid option name \"{}\"", other),
                    line_num,
                ));
            }
        }
        Ok(())
    }

    fn require(&self, options: &[&str]) -> Result<()> {
        let missing: Vec<&str> = options
            .iter()
            .filter(|o| !self.seen.contains(**o))
            .copied()
            .collect();
        if !missing.is_empty() {
            return Err(CommsError::Config(format!(
                "missing options for \"{}\": {}",
                self.name,
                missing.join(" ")
            )));
        }
        Ok(())
    }
}

fn assemble(blocks: Vec<Block>) -> Result<Config> {
    let mut names_seen: HashSet<String> = HashSet::new();
    let mut selfcfg: Option<(HostId, String, u16, Option<usize>)> = None;
    let mut peers = Vec::new();

    for block in blocks {
        if !names_seen.insert(block.name.clone()) {
            return Err(CommsError::Config(format!(
                "multiple configurations for \"{}\"",
                block.name
            )));
        }

        if block.is_self() {
            block.require(&["id", "ip", "port"])?;
            selfcfg = Some((
                block.id.unwrap(),
                block.ip.unwrap(),
                block.port.unwrap(),
                block.max_packet_size,
            ));
        } else {
            block.require(&["id", "ip", "port", "key"])?;

            let mut channel_ids = HashSet::new();
            let mut channel_paths = HashSet::new();
            for channel in &block.channels {
                if !channel_ids.insert(channel.id) {
                    return Err(CommsError::Config(format!(
                        "duplicated channel id for \"{}\"",
                        block.name
                    )));
                }
                if !channel_paths.insert(channel.fifo_base.clone()) {
                    return Err(CommsError::Config(format!(
                        "duplicated channel path for \"{}\"",
                        block.name
                    )));
                }
            }

            peers.push(PeerConfig {
                name: block.name,
                id: block.id.unwrap(),
                key: block.key.unwrap(),
                ip: block.ip.unwrap(),
                port: block.port.unwrap(),
                max_packet_size: block.max_packet_size,
                channels: block.channels,
            });
        }
    }

    let (self_id, self_ip, self_port, default_max_packet_size) = selfcfg.ok_or_else(|| {
        CommsError::Config("missing configuration for \"self\"".to_string())
    })?;

    Ok(Config {
        self_id,
        self_ip,
        self_port,
        default_max_packet_size,
        peers,
    })
}

fn line_error(msg: &str, line_num: usize) -> CommsError {
    CommsError::Config(format!("[line {}] {}", line_num, msg))
}

/// Split a config line at its first colon, trimming both parts.
fn split_option_line(line: &str, line_num: usize) -> Result<(&str, &str)> {
    let colon = line
        .find(':')
        .ok_or_else(|| line_error("no ':' in line", line_num))?;
    let option = line[..colon].trim();
    let value = line[colon + 1..].trim();
    if option.is_empty() {
        return Err(line_error("empty option field", line_num));
    }
    Ok((option, value))
}

fn parse_name(value: &str, line_num: usize) -> Result<String> {
    let ok = !value.is_empty()
        && value
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_');
    if !ok {
        return Err(line_error(
            &format!("invalid characters in name: {}", value),
            line_num,
        ));
    }
    Ok(value.to_string())
}

/// Parse a fixed-size byte array from hex digits.
fn parse_hex_array<const N: usize>(value: &str) -> std::result::Result<[u8; N], String> {
    let bytes = value.as_bytes();
    if bytes.len() != 2 * N {
        return Err("string is the wrong length".to_string());
    }
    let mut out = [0u8; N];
    for (i, chunk) in bytes.chunks_exact(2).enumerate() {
        let hi = hex_digit(chunk[0]).ok_or("invalid characters present")?;
        let lo = hex_digit(chunk[1]).ok_or("invalid characters present")?;
        out[i] = hi << 4 | lo;
    }
    Ok(out)
}

fn hex_digit(b: u8) -> Option<u8> {
    match b {
        b'0'..=b'9' => Some(b - b'0'),
        b'a'..=b'f' => Some(b - b'a' + 10),
        b'A'..=b'F' => Some(b - b'A' + 10),
        _ => None,
    }
}

/// Host ids are 4-byte integers written as 8 hex digits.
fn parse_id(value: &str, line_num: usize) -> Result<HostId> {
    parse_hex_array::<4>(value)
        .map_err(|e| line_error(&format!("error parsing id, {}", e), line_num))
}

/// A channel description: a 2-byte channel id as 4 hex digits, whitespace,
/// then the filesystem base path of the channel's FIFO pair (which may
/// itself contain whitespace).
fn parse_channel(value: &str, line_num: usize) -> Result<ChannelSpec> {
    let split = value
        .find(char::is_whitespace)
        .ok_or_else(|| line_error("no whitespace in channel specifier", line_num))?;
    let (id_part, path_part) = value.split_at(split);
    let path = path_part.trim_start();
    if path.is_empty() {
        return Err(line_error("no path in channel specifier", line_num));
    }

    let id = parse_hex_array::<2>(id_part)
        .map_err(|e| line_error(&format!("error parsing channel id, {}", e), line_num))?;
    Ok(ChannelSpec {
        id,
        fifo_base: path.to_string(),
    })
}

/// Validate a dotted IPv4 address: four integers in 0..=255 separated by
/// periods, digits and periods only.
fn parse_ip(value: &str, line_num: usize) -> Result<String> {
    if !value.bytes().all(|b| b.is_ascii_digit() || b == b'.') {
        return Err(line_error("illegal character in ip address", line_num));
    }

    let chunks: Vec<&str> = value.split('.').collect();
    if chunks.len() != 4 {
        return Err(line_error("malformed ip address", line_num));
    }
    for chunk in chunks {
        if chunk.is_empty() || chunk.len() > 3 {
            return Err(line_error("malformed ip address", line_num));
        }
        let byte: u32 = chunk
            .parse()
            .map_err(|_| line_error("malformed ip address", line_num))?;
        if byte > 255 {
            return Err(line_error("invalid ip address", line_num));
        }
    }
    Ok(value.to_string())
}

fn parse_port(value: &str, line_num: usize) -> Result<u16> {
    let port: u32 = value
        .parse()
        .map_err(|_| line_error("invalid port number", line_num))?;
    if port == 0 || port > 65535 {
        return Err(line_error(
            "port number out of range, allowed range is (1,65535)",
            line_num,
        ));
    }
    Ok(port as u16)
}

/// The maximum payload for UDP over IPv4 is 65507 bytes.
fn parse_max_size(value: &str, line_num: usize) -> Result<usize> {
    let size: usize = value
        .parse()
        .map_err(|_| line_error("invalid max_size", line_num))?;
    if size == 0 || size > MAX_UDP_PAYLOAD {
        return Err(line_error(
            &format!("max_size out of range, allowed range is (1,{})", MAX_UDP_PAYLOAD),
            line_num,
        ));
    }
    Ok(size)
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY_HEX: &str = "0102030405060708090a0b0c0d0e0f101112131415161718191a1b1c1d1e1f20";

    fn full_config() -> String {
        format!(
            "# tunnel configuration\n\
             name: self\n\
             id: 0a0b0c0d\n\
             ip: 192.0.2.10\n\
             port: 4000\n\
             max_size: 1400\n\
             \n\
             name: othersite\n\
             id: 01020304\n\
             key: {}\n\
             ip: 192.0.2.20\n\
             port: 4001\n\
             channel: 01a4 /var/run/comms/alpha\n\
             channel: 01a5 /var/run/comms/path with spaces\n",
            KEY_HEX
        )
    }

    #[test]
    fn test_full_config_parses() {
        let cfg = parse_config(&full_config()).unwrap();
        assert_eq!(cfg.self_id, [0x0a, 0x0b, 0x0c, 0x0d]);
        assert_eq!(cfg.self_ip, "192.0.2.10");
        assert_eq!(cfg.self_port, 4000);
        assert_eq!(cfg.default_max_packet_size, Some(1400));

        assert_eq!(cfg.peers.len(), 1);
        let peer = &cfg.peers[0];
        assert_eq!(peer.name, "othersite");
        assert_eq!(peer.id, [1, 2, 3, 4]);
        assert_eq!(peer.port, 4001);
        assert_eq!(peer.max_packet_size, None);
        assert!(peer.key.bytes().is_ok());
        assert_eq!(peer.channels.len(), 2);
        assert_eq!(peer.channels[0].id, [0x01, 0xa4]);
        assert_eq!(peer.channels[1].fifo_base, "/var/run/comms/path with spaces");
    }

    #[test]
    fn test_missing_self_rejected() {
        let cfg = format!(
            "name: peer1\nid: 01020304\nkey: {}\nip: 10.0.0.1\nport: 9\n",
            KEY_HEX
        );
        assert!(matches!(parse_config(&cfg), Err(CommsError::Config(_))));
    }

    #[test]
    fn test_option_before_name_rejected() {
        let err = parse_config("id: 01020304\n").unwrap_err();
        assert!(err.to_string().contains("line 1"));
    }

    #[test]
    fn test_repeated_option_rejected() {
        let cfg = "name: self\nid: 01020304\nid: 01020304\nip: 10.0.0.1\nport: 9\n";
        let err = parse_config(cfg).unwrap_err();
        assert!(err.to_string().contains("repeated"));
        assert!(err.to_string().contains("line 3"));
    }

    #[test]
    fn test_key_forbidden_for_self() {
        let cfg = format!("name: self\nkey: {}\n", KEY_HEX);
        let err = parse_config(&cfg).unwrap_err();
        assert!(err.to_string().contains("not allowed"));
    }

    #[test]
    fn test_missing_required_options_listed() {
        let cfg = "name: self\nid: 01020304\nip: 10.0.0.1\nport: 9\n\
                   name: peer1\nid: 04030201\nip: 10.0.0.2\nport: 9\n";
        let err = parse_config(cfg).unwrap_err();
        assert!(err.to_string().contains("key"));
    }

    #[test]
    fn test_duplicate_block_names_rejected() {
        let cfg = "name: self\nid: 01020304\nip: 10.0.0.1\nport: 9\n\
                   name: self\nid: 01020304\nip: 10.0.0.1\nport: 9\n";
        let err = parse_config(cfg).unwrap_err();
        assert!(err.to_string().contains("multiple configurations"));
    }

    #[test]
    fn test_duplicate_channel_id_rejected() {
        let cfg = format!(
            "name: self\nid: 0a0b0c0d\nip: 10.0.0.1\nport: 9\n\
             name: p\nid: 01020304\nkey: {}\nip: 10.0.0.2\nport: 9\n\
             channel: 0001 /tmp/a\nchannel: 0001 /tmp/b\n",
            KEY_HEX
        );
        let err = parse_config(&cfg).unwrap_err();
        assert!(err.to_string().contains("duplicated channel id"));
    }

    #[test]
    fn test_duplicate_channel_path_rejected() {
        let cfg = format!(
            "name: self\nid: 0a0b0c0d\nip: 10.0.0.1\nport: 9\n\
             name: p\nid: 01020304\nkey: {}\nip: 10.0.0.2\nport: 9\n\
             channel: 0001 /tmp/a\nchannel: 0002 /tmp/a\n",
            KEY_HEX
        );
        let err = parse_config(&cfg).unwrap_err();
        assert!(err.to_string().contains("duplicated channel path"));
    }

    #[test]
    fn test_bad_ip_rejected() {
        for ip in ["10.0.0", "10.0.0.0.1", "10.0.0.256", "10..0.1", "a.b.c.d", "1.2.3.4."] {
            let cfg = format!("name: self\nid: 01020304\nip: {}\nport: 9\n", ip);
            assert!(parse_config(&cfg).is_err(), "ip {}", ip);
        }
    }

    #[test]
    fn test_bad_port_rejected() {
        for port in ["0", "65536", "-1", "4000x"] {
            let cfg = format!("name: self\nid: 01020304\nip: 10.0.0.1\nport: {}\n", port);
            assert!(parse_config(&cfg).is_err(), "port {}", port);
        }
    }

    #[test]
    fn test_bad_max_size_rejected() {
        for size in ["0", "65508"] {
            let cfg = format!(
                "name: self\nid: 01020304\nip: 10.0.0.1\nport: 9\nmax_size: {}\n",
                size
            );
            assert!(parse_config(&cfg).is_err(), "max_size {}", size);
        }
    }

    #[test]
    fn test_bad_name_rejected() {
        let err = parse_config("name: bad name!\n").unwrap_err();
        assert!(err.to_string().contains("invalid characters in name"));
    }

    #[test]
    fn test_bad_key_rejected() {
        let mut bad = KEY_HEX.to_string();
        bad.replace_range(0..1, "x");
        let cfg = format!(
            "name: self\nid: 01020304\nip: 10.0.0.1\nport: 9\n\
             name: p\nid: 04030201\nkey: {}\nip: 10.0.0.2\nport: 9\n",
            bad
        );
        let err = parse_config(&cfg).unwrap_err();
        assert!(err.to_string().contains("error parsing key"));
    }

    #[test]
    fn test_channel_without_path_rejected() {
        let cfg = format!(
            "name: self\nid: 01020304\nip: 10.0.0.1\nport: 9\n\
             name: p\nid: 04030201\nkey: {}\nip: 10.0.0.2\nport: 9\nchannel: 0001\n",
            KEY_HEX
        );
        let err = parse_config(&cfg).unwrap_err();
        assert!(err.to_string().contains("channel specifier"));
    }

    #[test]
    fn test_comments_and_blank_lines_ignored() {
        let cfg = "\n  # leading comment\nname: self\n# interior\nid: 01020304\n\nip: 10.0.0.1\nport: 9\n";
        assert!(parse_config(cfg).is_ok());
    }
}
