//! Bounded capture of probe output.

/// Fixed-capacity ring buffer that keeps the most recent bytes written and
/// counts everything that passed through it.
#[derive(Debug, Clone)]
pub struct OutputBuffer {
    data: Vec<u8>,
    cap: usize,
    pos: usize,
    total: u64,
}

impl OutputBuffer {
    pub fn new(cap: usize) -> Self {
        Self {
            data: Vec::with_capacity(cap),
            cap,
            pos: 0,
            total: 0,
        }
    }

    pub fn write(&mut self, buf: &[u8]) {
        self.total += buf.len() as u64;
        if self.cap == 0 {
            return;
        }
        let buf = if buf.len() > self.cap {
            &buf[buf.len() - self.cap..]
        } else {
            buf
        };
        for &b in buf {
            if self.data.len() < self.cap {
                self.data.push(b);
            } else {
                self.data[self.pos] = b;
            }
            self.pos = (self.pos + 1) % self.cap;
        }
    }

    /// Bytes written so far, including those no longer held.
    pub fn total_written(&self) -> u64 {
        self.total
    }

    pub fn capacity(&self) -> usize {
        self.cap
    }

    /// Retained bytes, oldest first.
    pub fn bytes(&self) -> Vec<u8> {
        if self.data.len() < self.cap {
            return self.data.clone();
        }
        let mut out = Vec::with_capacity(self.cap);
        out.extend_from_slice(&self.data[self.pos..]);
        out.extend_from_slice(&self.data[..self.pos]);
        out
    }

    /// Captured output as reported to the notifier. When more was written
    /// than fits, a banner with both counts precedes the retained tail.
    pub fn render(&self) -> String {
        let tail = String::from_utf8_lossy(&self.bytes()).into_owned();
        if self.total > self.cap as u64 {
            format!("Captured {} of {} bytes\n...\n{}", self.cap, self.total, tail)
        } else {
            tail
        }
    }
}

/// Cut `output` to at most `max` bytes for a TTL status update.
pub fn truncate_output(output: &str, max: usize) -> String {
    if max == 0 || output.len() <= max {
        return output.to_string();
    }
    let mut end = max;
    while !output.is_char_boundary(end) {
        end -= 1;
    }
    format!(
        "{} ... (captured {} of {} bytes)",
        &output[..end],
        max,
        output.len()
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn small_output_is_verbatim() {
        let mut buf = OutputBuffer::new(16);
        buf.write(b"hello ");
        buf.write(b"world");
        assert_eq!(buf.render(), "hello world");
        assert_eq!(buf.total_written(), 11);
    }

    #[test]
    fn overflow_keeps_tail_with_banner() {
        let mut buf = OutputBuffer::new(4);
        buf.write(b"abcdef");
        buf.write(b"gh");
        assert_eq!(buf.bytes(), b"efgh");
        assert_eq!(buf.render(), "Captured 4 of 8 bytes\n...\nefgh");
    }

    #[test]
    fn exactly_full_has_no_banner() {
        let mut buf = OutputBuffer::new(4);
        buf.write(b"ab");
        buf.write(b"cd");
        assert_eq!(buf.render(), "abcd");
    }

    #[test]
    fn truncate_marks_captured_size() {
        assert_eq!(truncate_output("short", 10), "short");
        assert_eq!(
            truncate_output("0123456789", 4),
            "0123 ... (captured 4 of 10 bytes)"
        );
    }

    #[test]
    fn truncate_respects_char_boundaries() {
        let out = truncate_output("ééé", 3);
        assert!(out.starts_with("é ..."));
    }
}
