//! Outbound payloads. One native write path, three call-site shapes.

use bytes::Bytes;

/// Data handed to a `send` call. Text, borrowed bytes and shared buffers all reach the
/// engine as the same byte sequence; only WebSocket distinguishes text (text frame)
/// from binary (binary frame).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload<'a> {
    Text(&'a str),
    Bytes(&'a [u8]),
    /// Reference-counted buffer owned outside the call; engines may queue it without copying.
    Buffer(Bytes),
}

impl<'a> Payload<'a> {
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Payload::Text(s) => s.as_bytes(),
            Payload::Bytes(b) => b,
            Payload::Buffer(b) => b,
        }
    }

    pub fn len(&self) -> usize {
        self.as_bytes().len()
    }

    pub fn is_empty(&self) -> bool {
        self.as_bytes().is_empty()
    }

    pub fn is_text(&self) -> bool {
        matches!(self, Payload::Text(_))
    }

    /// Owned bytes for queuing. Copies text and borrowed slices; a `Buffer` is only re-referenced.
    pub fn to_bytes(&self) -> Bytes {
        match self {
            Payload::Text(s) => Bytes::copy_from_slice(s.as_bytes()),
            Payload::Bytes(b) => Bytes::copy_from_slice(b),
            Payload::Buffer(b) => b.clone(),
        }
    }
}

impl<'a> From<&'a str> for Payload<'a> {
    fn from(s: &'a str) -> Self {
        Payload::Text(s)
    }
}

impl<'a> From<&'a String> for Payload<'a> {
    fn from(s: &'a String) -> Self {
        Payload::Text(s.as_str())
    }
}

impl<'a> From<&'a [u8]> for Payload<'a> {
    fn from(b: &'a [u8]) -> Self {
        Payload::Bytes(b)
    }
}

impl<'a, const N: usize> From<&'a [u8; N]> for Payload<'a> {
    fn from(b: &'a [u8; N]) -> Self {
        Payload::Bytes(b.as_slice())
    }
}

impl<'a> From<&'a Vec<u8>> for Payload<'a> {
    fn from(b: &'a Vec<u8>) -> Self {
        Payload::Bytes(b.as_slice())
    }
}

impl From<Bytes> for Payload<'static> {
    fn from(b: Bytes) -> Self {
        Payload::Buffer(b)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encodings_agree() {
        let text = "GET / \r\n";
        let raw = text.as_bytes().to_vec();
        let buf = Bytes::from(raw.clone());
        let a = Payload::from(text);
        let b = Payload::from(&raw);
        let c = Payload::from(buf);
        assert_eq!(a.as_bytes(), b.as_bytes());
        assert_eq!(b.as_bytes(), c.as_bytes());
        assert!(a.is_text());
        assert!(!c.is_text());
    }

    #[test]
    fn buffer_is_not_copied() {
        let buf = Bytes::from_static(b"shared");
        let p = Payload::Buffer(buf.clone());
        assert_eq!(p.to_bytes().as_ptr(), buf.as_ptr());
    }
}
