use serde_json::Value;

/// Accumulates raw bytes from the host connection and yields complete
/// JSON objects. The wire is concatenated objects with no delimiter, so
/// framing is done by walking the buffer with a brace-depth counter that
/// ignores braces inside strings.
///
/// This is the only place in the crate that parses raw bytes.
#[derive(Debug, Default)]
pub struct FrameBuffer {
    buf: Vec<u8>,
}

enum Scan {
    /// A balanced object spans `start..end`.
    Complete { start: usize, end: usize },
    /// An object opened at `start` but is not closed yet.
    Partial { start: usize },
    /// No `{` anywhere in the buffer.
    NoObject,
}

impl FrameBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn extend(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    pub fn clear(&mut self) {
        self.buf.clear();
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    /// Pop the next complete frame, or `None` when more bytes are needed.
    /// Corrupted input never stalls: every pass either consumes bytes or
    /// returns, and a pass that would otherwise leave the buffer unchanged
    /// advances by one byte.
    pub fn next_frame(&mut self) -> Option<Value> {
        loop {
            let before = self.buf.len();
            if before == 0 {
                return None;
            }
            match scan(&self.buf) {
                Scan::Complete { start, end } => {
                    match serde_json::from_slice::<Value>(&self.buf[start..end]) {
                        Ok(value) => {
                            self.buf.drain(..end);
                            return Some(value);
                        }
                        Err(_) => {
                            // Balanced braces but invalid JSON: resync at the
                            // next opening brace, or give up on the buffer.
                            match find_brace(&self.buf, start + 1) {
                                Some(next) => {
                                    self.buf.drain(..next);
                                }
                                None => {
                                    self.buf.clear();
                                    return None;
                                }
                            }
                        }
                    }
                }
                Scan::Partial { start } => {
                    if start > 0 {
                        self.buf.drain(..start);
                    }
                    return None;
                }
                Scan::NoObject => {
                    self.buf.drain(..1);
                    continue;
                }
            }
            if self.buf.len() == before && !self.buf.is_empty() {
                self.buf.drain(..1);
            }
        }
    }
}

fn find_brace(buf: &[u8], from: usize) -> Option<usize> {
    buf.get(from..)?.iter().position(|&b| b == b'{').map(|i| from + i)
}

fn scan(buf: &[u8]) -> Scan {
    let Some(start) = find_brace(buf, 0) else {
        return Scan::NoObject;
    };

    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (i, &b) in buf[start..].iter().enumerate() {
        if in_string {
            if escaped {
                escaped = false;
            } else if b == b'\\' {
                escaped = true;
            } else if b == b'"' {
                in_string = false;
            }
            continue;
        }
        match b {
            b'"' => in_string = true,
            b'{' => depth += 1,
            b'}' => {
                depth = depth.saturating_sub(1);
                if depth == 0 {
                    return Scan::Complete { start, end: start + i + 1 };
                }
            }
            _ => {}
        }
    }
    Scan::Partial { start }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn two_frames_in_one_chunk() {
        let mut fb = FrameBuffer::new();
        fb.extend(br#"{"a":1}{"b":2}"#);
        assert_eq!(fb.next_frame(), Some(json!({"a": 1})));
        assert_eq!(fb.next_frame(), Some(json!({"b": 2})));
        assert_eq!(fb.next_frame(), None);
    }

    #[test]
    fn partial_frame_is_retained_until_completed() {
        let mut fb = FrameBuffer::new();
        fb.extend(br#"{"status":"succ"#);
        assert_eq!(fb.next_frame(), None);
        fb.extend(br#"ess","result":7}"#);
        assert_eq!(fb.next_frame(), Some(json!({"status": "success", "result": 7})));
    }

    #[test]
    fn braces_inside_strings_do_not_close_the_frame() {
        let mut fb = FrameBuffer::new();
        fb.extend(br#"{"msg":"a } b { c"}"#);
        assert_eq!(fb.next_frame(), Some(json!({"msg": "a } b { c"})));
    }

    #[test]
    fn escaped_quotes_inside_strings() {
        let mut fb = FrameBuffer::new();
        fb.extend(br#"{"msg":"say \"}\" now"}"#);
        assert_eq!(fb.next_frame(), Some(json!({"msg": "say \"}\" now"})));
    }

    #[test]
    fn single_non_brace_byte_does_not_loop() {
        let mut fb = FrameBuffer::new();
        fb.extend(b"x");
        assert_eq!(fb.next_frame(), None);
        assert_eq!(fb.len(), 0);
    }

    #[test]
    fn junk_before_a_frame_is_skipped() {
        let mut fb = FrameBuffer::new();
        fb.extend(br#"garbage??{"ok":true}"#);
        assert_eq!(fb.next_frame(), Some(json!({"ok": true})));
    }

    #[test]
    fn invalid_complete_frame_resyncs_to_next_brace() {
        let mut fb = FrameBuffer::new();
        // balanced braces but not valid JSON, followed by a good frame
        fb.extend(br#"{oops}{"good":1}"#);
        assert_eq!(fb.next_frame(), Some(json!({"good": 1})));
    }

    #[test]
    fn invalid_frame_with_nothing_after_clears_buffer() {
        let mut fb = FrameBuffer::new();
        fb.extend(br#"{oops}"#);
        assert_eq!(fb.next_frame(), None);
        assert_eq!(fb.len(), 0);
    }

    #[test]
    fn nested_objects_pop_as_one_frame() {
        let mut fb = FrameBuffer::new();
        fb.extend(br#"{"result":{"objects":[{"name":"Cube"}]}}"#);
        let frame = fb.next_frame().unwrap();
        assert_eq!(frame["result"]["objects"][0]["name"], "Cube");
    }
}
