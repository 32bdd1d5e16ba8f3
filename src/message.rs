//! Decides where one inbound message ends and the next begins.
//!
//! The wire carries no framing: no length prefix, no delimiter. The read loop hands every chunk it
//! reads to a [`MessageBoundary`] together with whether the socket had anything further buffered
//! at that moment, and the boundary cuts complete messages out of the pending bytes.
//!
//! Pending bytes are kept raw and only decoded once a message is complete, so a code point split
//! across two reads comes out whole.

use std::fmt;
use std::str::FromStr;

use bytes::{Bytes, BytesMut};

/// Cuts complete messages out of the bytes accumulated on one connection.
pub trait MessageBoundary: Send {
    /// Called after every chunk is appended to `pending` with `drained == false`, and once more
    /// with `drained == true` whenever the socket turns out to have nothing else buffered.
    ///
    /// Returned messages are removed from `pending`; whatever is left stays for the next call.
    fn extract(&mut self, pending: &mut BytesMut, drained: bool) -> Vec<Bytes>;
}

/// A message is everything received up to the point where a read completes and the socket has
/// no further bytes waiting.
#[derive(Debug, Default, Clone, Copy)]
pub struct Drained;

impl MessageBoundary for Drained {
    fn extract(&mut self, pending: &mut BytesMut, drained: bool) -> Vec<Bytes> {
        if drained && !pending.is_empty() {
            vec![pending.take().freeze()]
        } else {
            vec![]
        }
    }
}

/// Newline-delimited messages. A trailing `\r` is dropped and blank lines are skipped. Partial
/// lines wait for their newline no matter how long the socket stays quiet.
#[derive(Debug, Default, Clone, Copy)]
pub struct Lines;

impl MessageBoundary for Lines {
    fn extract(&mut self, pending: &mut BytesMut, _drained: bool) -> Vec<Bytes> {
        let mut out = vec![];
        while let Some(idx) = pending.iter().position(|b| *b == b'\n') {
            let mut line = pending.split_to(idx + 1);
            line.truncate(idx);
            if line.ends_with(b"\r") {
                let len = line.len();
                line.truncate(len - 1);
            }
            if !line.is_empty() {
                out.push(line.freeze());
            }
        }
        out
    }
}

/// Selects a [`MessageBoundary`] by name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Framing {
    /// `drain`: the buffered-bytes heuristic. Compatible with every existing peer.
    Drained,
    /// `line`: one message per newline-terminated line.
    Lines,
}

impl Framing {
    pub fn boundary(self) -> Box<dyn MessageBoundary> {
        match self {
            Framing::Drained => Box::new(Drained),
            Framing::Lines => Box::new(Lines),
        }
    }
}

impl FromStr for Framing {
    type Err = String;

    fn from_str(s: &str) -> Result<Framing, String> {
        match &s.trim().to_lowercase()[..] {
            "drain" | "drained" => Ok(Framing::Drained),
            "line" | "lines" => Ok(Framing::Lines),
            other => Err(format!("Unknown framing {}", other)),
        }
    }
}

impl fmt::Display for Framing {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Framing::Drained => f.write_str("drain"),
            Framing::Lines => f.write_str("line"),
        }
    }
}

/// Text of a complete message. Invalid UTF-8 is replaced rather than rejected.
pub fn decode(msg: &[u8]) -> String {
    String::from_utf8_lossy(msg).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feed(boundary: &mut dyn MessageBoundary, pending: &mut BytesMut, chunk: &[u8], drained: bool) -> Vec<String> {
        pending.extend_from_slice(chunk);
        let mut out: Vec<String> = boundary
            .extract(pending, false)
            .iter()
            .map(|m| decode(m))
            .collect();
        if drained {
            out.extend(boundary.extract(pending, true).iter().map(|m| decode(m)));
        }
        out
    }

    #[test]
    fn drained_holds_until_the_socket_is_empty() {
        let mut boundary = Drained;
        let mut pending = BytesMut::new();
        assert!(feed(&mut boundary, &mut pending, b"hel", false).is_empty());
        assert!(feed(&mut boundary, &mut pending, b"lo w", false).is_empty());
        assert_eq!(feed(&mut boundary, &mut pending, b"orld", true), vec!["hello world"]);
        assert!(pending.is_empty());
    }

    #[test]
    fn drained_with_nothing_pending_yields_nothing() {
        let mut boundary = Drained;
        let mut pending = BytesMut::new();
        assert!(boundary.extract(&mut pending, true).is_empty());
    }

    #[test]
    fn drained_keeps_code_points_split_across_reads() {
        let mut boundary = Drained;
        let mut pending = BytesMut::new();
        let text = "héllo";
        let bytes = text.as_bytes();
        // split inside the two byte 'é'
        assert!(feed(&mut boundary, &mut pending, &bytes[..2], false).is_empty());
        assert_eq!(feed(&mut boundary, &mut pending, &bytes[2..], true), vec![text]);
    }

    #[test]
    fn lines_split_on_newlines_and_keep_the_tail() {
        let mut boundary = Lines;
        let mut pending = BytesMut::new();
        assert_eq!(
            feed(&mut boundary, &mut pending, b"one\r\ntwo\n\nthr", true),
            vec!["one", "two"]
        );
        assert_eq!(&pending[..], b"thr");
        assert_eq!(feed(&mut boundary, &mut pending, b"ee\n", false), vec!["three"]);
        assert!(pending.is_empty());
    }

    #[test]
    fn framing_parses_by_name() {
        assert_eq!("drain".parse::<Framing>(), Ok(Framing::Drained));
        assert_eq!(" LINE ".parse::<Framing>(), Ok(Framing::Lines));
        assert!("length".parse::<Framing>().is_err());
        assert_eq!(Framing::Lines.to_string(), "line");
    }

    #[test]
    fn invalid_utf8_is_replaced() {
        assert_eq!(decode(b"a\xffb"), "a\u{fffd}b");
    }
}
