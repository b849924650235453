//! Byte-level SOCKS5 framing for the payloads carried inside relay
//! messages. Every function works on a complete frame already read off
//! the tunnel; none of them touch a socket.

use crate::socks5::address::{TargetAddr, parse_address_from_packet, write_socket_addr};
use crate::socks5::protocol::{Command, RSV, ReplyCode, USERPASS_VERSION, Version};
use anyhow::{Result, anyhow, bail};
use std::net::SocketAddr;

/// greeting_methods extracts the offered auth methods from a client hello
pub fn greeting_methods(frame: &[u8]) -> Result<&[u8]> {
    // ClientHello format
    // +----+----------+----------+
    // |VER | NMETHODS | METHODS  |
    // +----+----------+----------+
    // | 1  |    1     | 1 to 255 |
    // +----+----------+----------+
    if frame.len() < 2 {
        bail!("client hello too short");
    }
    if frame[0] != Version::SOCKS5 as u8 {
        bail!("not SOCKS5");
    }

    let n_methods = frame[1] as usize;
    frame
        .get(2..2 + n_methods)
        .ok_or_else(|| anyhow!("client hello truncated: expected {n_methods} methods"))
}

/// parse_credentials reads an RFC 1929 username/password request
pub fn parse_credentials(frame: &[u8]) -> Result<(String, String)> {
    // +----+------+----------+------+----------+
    // |VER | ULEN |  UNAME   | PLEN |  PASSWD  |
    // +----+------+----------+------+----------+
    // | 1  |  1   | 1 to 255 |  1   | 1 to 255 |
    // +----+------+----------+------+----------+
    if frame.first() != Some(&USERPASS_VERSION) {
        bail!("invalid username/password subnegotiation version");
    }

    let mut offset = 1;
    let username = read_short_string(frame, &mut offset)?;
    let password = read_short_string(frame, &mut offset)?;
    Ok((username, password))
}

/// command_target reads the command byte and destination of a request
pub fn command_target(frame: &[u8]) -> Result<(Option<Command>, TargetAddr)> {
    // +----+-----+-------+------+----------+----------+
    // |VER | CMD |  RSV  | ATYP | DST.ADDR | DST.PORT |
    // +----+-----+-------+------+----------+----------+
    // | 1  |  1  | X'00' |  1   | Variable |    2     |
    // +----+-----+-------+------+----------+----------+
    if frame.len() < 4 {
        bail!("command request too short");
    }
    if frame[0] != Version::SOCKS5 as u8 {
        bail!("not SOCKS5");
    }

    let (target, _) = parse_address_from_packet(frame, 3)?;
    Ok((Command::from_byte(frame[1]), target))
}

/// udp_envelope splits a client datagram into destination and payload
pub fn udp_envelope(frame: &[u8]) -> Result<(TargetAddr, &[u8])> {
    // +----+------+------+----------+----------+----------+
    // |RSV | FRAG | ATYP | DST.ADDR | DST.PORT |   DATA   |
    // +----+------+------+----------+----------+----------+
    // | 2  |  1   |  1   | Variable |    2     | Variable |
    // +----+------+------+----------+----------+----------+
    if frame.len() < 4 {
        bail!("UDP packet too short");
    }
    if frame[2] != 0x00 {
        bail!("UDP fragmentation not supported");
    }

    let (target, addr_len) = parse_address_from_packet(frame, 3)?;
    Ok((target, &frame[3 + addr_len..]))
}

/// udp_response_envelope wraps a datagram received from `from`
pub fn udp_response_envelope(from: SocketAddr, data: &[u8]) -> Vec<u8> {
    let mut packet = Vec::with_capacity(22 + data.len());

    // RSV -> 2 bytes, FRAG -> 1 byte
    packet.extend_from_slice(&[RSV, RSV, 0x00]);
    write_socket_addr(&mut packet, from);
    packet.extend_from_slice(data);
    packet
}

/// command_reply frames the reply to a command request
pub fn command_reply(code: ReplyCode, bound_addr: SocketAddr) -> Vec<u8> {
    // +----+-----+-------+------+----------+----------+
    // |VER | REP |  RSV  | ATYP | BND.ADDR | BND.PORT |
    // +----+-----+-------+------+----------+----------+
    // | 1  |  1  | X'00' |  1   | Variable |    2     |
    // +----+-----+-------+------+----------+----------+
    let mut reply = vec![Version::SOCKS5 as u8, code as u8, RSV];
    write_socket_addr(&mut reply, bound_addr);
    reply
}

fn read_short_string(frame: &[u8], offset: &mut usize) -> Result<String> {
    let len = *frame
        .get(*offset)
        .ok_or_else(|| anyhow!("missing length byte"))? as usize;
    *offset += 1;

    let bytes = frame
        .get(*offset..*offset + len)
        .ok_or_else(|| anyhow!("field truncated: expected {len} bytes"))?;
    *offset += len;

    Ok(std::str::from_utf8(bytes)?.to_owned())
}
