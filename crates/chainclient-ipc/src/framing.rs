//! Splitting a byte stream into JSON documents.
//!
//! Frames are top-level objects or arrays. A bracket scan over each new
//! chunk finds where a document ends, so a large document arriving in many
//! reads is scanned once and parsed once.

use serde_json::Value;

/// Reassembles concatenated JSON documents from arbitrary read boundaries.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buf: Vec<u8>,
    /// Bytes of `buf` already scanned; all belong to the open document.
    scanned: usize,
    depth: usize,
    in_string: bool,
    escaped: bool,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bytes buffered for the document still in progress.
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Append `bytes` and return every document completed by them.
    ///
    /// A document that fails to parse is skipped. Bytes outside any
    /// object or array cannot be resynchronised, so the buffer is dropped.
    pub fn decode(&mut self, bytes: &[u8]) -> Vec<Value> {
        self.buf.extend_from_slice(bytes);
        let mut frames = Vec::new();
        let mut start = 0;
        let mut i = self.scanned;

        while i < self.buf.len() {
            let b = self.buf[i];
            if self.depth == 0 {
                match b {
                    b' ' | b'\t' | b'\r' | b'\n' => {
                        i += 1;
                        start = i;
                        continue;
                    }
                    b'{' | b'[' => self.depth = 1,
                    _ => {
                        tracing::warn!(dropped = self.buf.len() - start, "malformed IPC payload discarded");
                        self.reset();
                        return frames;
                    }
                }
            } else if self.in_string {
                if self.escaped {
                    self.escaped = false;
                } else if b == b'\\' {
                    self.escaped = true;
                } else if b == b'"' {
                    self.in_string = false;
                }
            } else {
                match b {
                    b'"' => self.in_string = true,
                    b'{' | b'[' => self.depth += 1,
                    b'}' | b']' => {
                        self.depth -= 1;
                        if self.depth == 0 {
                            let end = i + 1;
                            match serde_json::from_slice::<Value>(&self.buf[start..end]) {
                                Ok(v) => frames.push(v),
                                Err(e) => tracing::warn!(error = %e, "malformed IPC document skipped"),
                            }
                            start = end;
                        }
                    }
                    _ => {}
                }
            }
            i += 1;
        }

        self.buf.drain(..start);
        self.scanned = self.buf.len();
        frames
    }

    fn reset(&mut self) {
        self.buf.clear();
        self.scanned = 0;
        self.depth = 0;
        self.in_string = false;
        self.escaped = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn splits_concatenated_documents() {
        let mut dec = FrameDecoder::new();
        let frames = dec.decode(
            br#"{"id":1,"result":"0x1"}{"id":2,"result":"0x2"}
[{"id":3,"result":null}]"#,
        );
        assert_eq!(frames.len(), 3);
        assert_eq!(frames[1]["id"], json!(2));
        assert!(frames[2].is_array());
        assert!(dec.is_empty());
    }

    #[test]
    fn keeps_partial_tail() {
        let mut dec = FrameDecoder::new();
        let frames = dec.decode(br#"{"id":1,"result":"0x1"}{"id":2,"res"#);
        assert_eq!(frames.len(), 1);
        assert_eq!(dec.len(), br#"{"id":2,"res"#.len());

        let frames = dec.decode(br#"ult":"0x2"}"#);
        assert_eq!(frames, vec![json!({"id": 2, "result": "0x2"})]);
        assert!(dec.is_empty());
    }

    #[test]
    fn brackets_inside_strings_do_not_close() {
        let mut dec = FrameDecoder::new();
        assert!(dec.decode(br#"{"result":"}] \"{"#).is_empty());
        let frames = dec.decode(br#"x"}"#);
        assert_eq!(frames, vec![json!({"result": "}] \"{x"})]);
    }

    #[test]
    fn large_document_split_into_many_reads() {
        let big = json!({ "id": 7, "result": "ab".repeat(256 * 1024) });
        let bytes = serde_json::to_vec(&big).unwrap();
        let mut dec = FrameDecoder::new();
        let mut frames = Vec::new();
        for chunk in bytes.chunks(8 * 1024) {
            frames.extend(dec.decode(chunk));
        }
        assert_eq!(frames, vec![big]);
        assert!(dec.is_empty());
    }

    #[test]
    fn discards_garbage() {
        let mut dec = FrameDecoder::new();
        let frames = dec.decode(b"{\"id\":1}}}not json");
        assert_eq!(frames.len(), 1);
        assert!(dec.is_empty());
    }

    #[test]
    fn skips_a_malformed_document_and_continues() {
        let mut dec = FrameDecoder::new();
        let frames = dec.decode(br#"{"id":1,}{"id":2}"#);
        assert_eq!(frames, vec![json!({"id": 2})]);
    }
}
