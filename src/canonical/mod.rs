//! The "simple" and "relaxed" canonical forms of RFC 6376 §3.4, shared by
//! the DKIM and ARC engines.
//!
//! Header canonicalization operates on whole header lines (terminating CRLF
//! included). Body canonicalization is a write/close value over an inner
//! sink: bytes are buffered while writing and the canonical form is produced
//! at [`close`](SimpleBodyCanonicalizer::close), which consumes the
//! canonicalizer so it cannot be closed twice.

use std::io::{self, Write};

const CRLF: &str = "\r\n";

/// Canonicalization method for headers or body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Canonicalization {
    #[default]
    Simple,
    Relaxed,
}

impl Canonicalization {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "simple" => Some(Canonicalization::Simple),
            "relaxed" => Some(Canonicalization::Relaxed),
            _ => None,
        }
    }
}

impl std::fmt::Display for Canonicalization {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Canonicalization::Simple => f.write_str("simple"),
            Canonicalization::Relaxed => f.write_str("relaxed"),
        }
    }
}

/// Canonicalize one header line.
pub fn canonicalize_header(line: &str, canon: Canonicalization) -> String {
    match canon {
        Canonicalization::Simple => simple_header(line),
        Canonicalization::Relaxed => relaxed_header(line),
    }
}

/// Simple header canonicalization: the identity function.
pub fn simple_header(line: &str) -> String {
    line.to_string()
}

/// Unfold a header value: each CRLF followed by WSP collapses to a single
/// space (RFC 5322 folding).
fn unfold_header(value: &str) -> String {
    let mut s = value.to_string();
    loop {
        let original = s.clone();
        s = s.replace("\r\n ", " ");
        s = s.replace("\r\n\t", " ");
        if s == original {
            break;
        }
    }
    s
}

/// Relaxed header canonicalization: lowercase the name, unfold, collapse WSP
/// runs, trim, re-terminate with CRLF. A line without a colon becomes
/// `trimmed-lower-line:\r\n`.
pub fn relaxed_header(line: &str) -> String {
    let Some((name, value)) = line.split_once(':') else {
        return format!("{}:{}", line.trim().to_ascii_lowercase(), CRLF);
    };

    let name = name.trim().to_ascii_lowercase();
    let value = unfold_header(value);
    let value = value
        .split(|c| c == ' ' || c == '\t')
        .filter(|part| !part.is_empty())
        .collect::<Vec<_>>()
        .join(" ");
    format!("{}:{}{}", name, value.trim(), CRLF)
}

/// Stateful lone-LF to CRLF normalizer; the CR flag carries across writes.
#[derive(Default)]
struct CrlfFixer {
    cr: bool,
}

impl CrlfFixer {
    fn fix(&mut self, input: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(input.len());
        for &ch in input {
            let prev_cr = self.cr;
            self.cr = false;
            match ch {
                b'\r' => self.cr = true,
                b'\n' if !prev_cr => out.push(b'\r'),
                _ => {}
            }
            out.push(ch);
        }
        out
    }
}

/// Simple body canonicalizer: normalize lone LF to CRLF, strip trailing CRLF
/// runs, terminate with exactly one CRLF. Empty input produces `\r\n`.
pub struct SimpleBodyCanonicalizer<W: Write> {
    w: W,
    buf: Vec<u8>,
    fixer: CrlfFixer,
}

impl<W: Write> SimpleBodyCanonicalizer<W> {
    pub fn new(w: W) -> Self {
        Self {
            w,
            buf: Vec::new(),
            fixer: CrlfFixer::default(),
        }
    }

    /// Flush the canonical form into the sink and return it. Must be called
    /// exactly once; consuming `self` enforces that statically.
    pub fn close(mut self) -> io::Result<W> {
        let mut fixed = self.fixer.fix(&self.buf);
        while fixed.ends_with(b"\r\n") {
            fixed.truncate(fixed.len() - 2);
        }
        fixed.extend_from_slice(CRLF.as_bytes());
        self.w.write_all(&fixed)?;
        Ok(self.w)
    }
}

impl<W: Write> Write for SimpleBodyCanonicalizer<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.buf.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Relaxed body canonicalizer: everything the simple form does, plus per-line
/// WSP trimming and collapsing, and removal of trailing lines that are blank
/// or WSP-only.
pub struct RelaxedBodyCanonicalizer<W: Write> {
    w: W,
    buf: Vec<u8>,
    fixer: CrlfFixer,
}

impl<W: Write> RelaxedBodyCanonicalizer<W> {
    pub fn new(w: W) -> Self {
        Self {
            w,
            buf: Vec::new(),
            fixer: CrlfFixer::default(),
        }
    }

    /// Flush the canonical form into the sink and return it.
    pub fn close(mut self) -> io::Result<W> {
        let fixed = self.fixer.fix(&self.buf);

        let mut lines: Vec<&[u8]> = fixed.split_str_crlf();
        while let Some(last) = lines.last() {
            if last.iter().all(|&b| b == b' ' || b == b'\t') {
                lines.pop();
            } else {
                break;
            }
        }

        let mut out = Vec::with_capacity(fixed.len() + 2);
        for (i, line) in lines.iter().enumerate() {
            if i > 0 {
                out.extend_from_slice(CRLF.as_bytes());
            }
            let mut end = line.len();
            while end > 0 && (line[end - 1] == b' ' || line[end - 1] == b'\t') {
                end -= 1;
            }
            let mut wsp = false;
            for &b in &line[..end] {
                if b == b' ' || b == b'\t' {
                    if !wsp {
                        out.push(b' ');
                        wsp = true;
                    }
                } else {
                    out.push(b);
                    wsp = false;
                }
            }
        }
        out.extend_from_slice(CRLF.as_bytes());

        self.w.write_all(&out)?;
        Ok(self.w)
    }
}

impl<W: Write> Write for RelaxedBodyCanonicalizer<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.buf.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Either body canonicalizer behind one write/close surface, chosen at
/// runtime from a parsed `c=` tag.
pub enum BodyCanonicalizer<W: Write> {
    Simple(SimpleBodyCanonicalizer<W>),
    Relaxed(RelaxedBodyCanonicalizer<W>),
}

impl<W: Write> BodyCanonicalizer<W> {
    pub fn new(w: W, canon: Canonicalization) -> Self {
        match canon {
            Canonicalization::Simple => BodyCanonicalizer::Simple(SimpleBodyCanonicalizer::new(w)),
            Canonicalization::Relaxed => {
                BodyCanonicalizer::Relaxed(RelaxedBodyCanonicalizer::new(w))
            }
        }
    }

    pub fn close(self) -> io::Result<W> {
        match self {
            BodyCanonicalizer::Simple(c) => c.close(),
            BodyCanonicalizer::Relaxed(c) => c.close(),
        }
    }
}

impl<W: Write> Write for BodyCanonicalizer<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            BodyCanonicalizer::Simple(c) => c.write(buf),
            BodyCanonicalizer::Relaxed(c) => c.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Split on CRLF, keeping a final partial line. `b"a\r\nb"` → `["a", "b"]`;
/// `b"a\r\n"` → `["a", ""]`.
trait SplitCrlf {
    fn split_str_crlf(&self) -> Vec<&[u8]>;
}

impl SplitCrlf for [u8] {
    fn split_str_crlf(&self) -> Vec<&[u8]> {
        let mut lines = Vec::new();
        let mut start = 0;
        let mut i = 0;
        while i + 1 < self.len() {
            if self[i] == b'\r' && self[i + 1] == b'\n' {
                lines.push(&self[start..i]);
                start = i + 2;
                i += 2;
            } else {
                i += 1;
            }
        }
        lines.push(&self[start..]);
        lines
    }
}
