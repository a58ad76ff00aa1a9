/**
 * mux/frame.rs
 *
 * The peer channel carries exactly one kind of datagram: a control
 * frame (an ASCII token) or a data frame (`[flow_id][payload]`). The
 * two are told apart by matching the full leading token, not merely
 * sniffing the first byte, so that an opaque data payload can never be
 * mistaken for a control frame.
 */

pub const MIN_FLOW_ID: u8 = 2;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame<'a> {
    Connect(u8),
    ConnectAck(u8),
    Disconnect(u8),
    Heartbeat,
    Data(u8, &'a [u8]),
}

/// Classify a raw datagram read off the peer socket.
pub fn classify(datagram: &[u8]) -> Option<Frame<'_>> {
    if let Some(rest) = datagram.strip_prefix(b"CONNECT_ACK ") {
        return parse_id(rest).map(Frame::ConnectAck);
    }
    if let Some(rest) = datagram.strip_prefix(b"CONNECT ") {
        return parse_id(rest).map(Frame::Connect);
    }
    if let Some(rest) = datagram.strip_prefix(b"DISCONNECT ") {
        return parse_id(rest).map(Frame::Disconnect);
    }
    if datagram.starts_with(b"HEARTBEAT") {
        return Some(Frame::Heartbeat);
    }
    if datagram.is_empty() {
        return None;
    }
    Some(Frame::Data(datagram[0], &datagram[1..]))
}

fn parse_id(rest: &[u8]) -> Option<u8> {
    let text = std::str::from_utf8(rest).ok()?.trim();
    text.parse::<u8>().ok()
}

pub fn encode_connect(id: u8) -> Vec<u8> {
    format!("CONNECT {id}").into_bytes()
}

pub fn encode_connect_ack(id: u8) -> Vec<u8> {
    format!("CONNECT_ACK {id}").into_bytes()
}

pub fn encode_disconnect(id: u8) -> Vec<u8> {
    format!("DISCONNECT {id}").into_bytes()
}

pub fn encode_heartbeat() -> Vec<u8> {
    b"HEARTBEAT ".to_vec()
}

pub fn encode_data(id: u8, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(1 + payload.len());
    out.push(id);
    out.extend_from_slice(payload);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_control_frames() {
        assert_eq!(classify(b"CONNECT 2"), Some(Frame::Connect(2)));
        assert_eq!(classify(b"CONNECT_ACK 2"), Some(Frame::ConnectAck(2)));
        assert_eq!(classify(b"DISCONNECT 2"), Some(Frame::Disconnect(2)));
        assert_eq!(classify(b"HEARTBEAT "), Some(Frame::Heartbeat));
        assert_eq!(classify(b"HEARTBEAT"), Some(Frame::Heartbeat));
    }

    #[test]
    fn classifies_data_frame_with_colliding_first_byte() {
        // first byte happens to be ASCII 'C' (0x43) but the full token doesn't match.
        let datagram = [b'C', b'x', b'y'];
        assert_eq!(classify(&datagram), Some(Frame::Data(b'C', &[b'x', b'y'])));
    }

    #[test]
    fn empty_datagram_has_no_classification() {
        assert_eq!(classify(&[]), None);
    }

    #[test]
    fn roundtrips_encode_and_classify() {
        assert_eq!(classify(&encode_connect(5)), Some(Frame::Connect(5)));
        assert_eq!(classify(&encode_connect_ack(5)), Some(Frame::ConnectAck(5)));
        assert_eq!(classify(&encode_disconnect(5)), Some(Frame::Disconnect(5)));
        let data = encode_data(9, b"payload");
        assert_eq!(classify(&data), Some(Frame::Data(9, b"payload")));
    }
}
