//! Multi-run probe output.
//!
//! Some probes run their tool more than once (two ping bursts, one SYN burst
//! per port, direct and proxied HTTP requests). The runs are joined into one
//! text blob with `## <label>` header lines so the raw output stays plain
//! text and a fake adapter can fabricate it by hand.

const HEADER_PREFIX: &str = "## ";

pub const PING: &str = "ping";
pub const PING_LARGE: &str = "ping-large";
pub const SYN_APP: &str = "syn-app";
pub const SYN_CONTROL: &str = "syn-control";
pub const HTTP_HEADERS: &str = "http-headers";
pub const HTTP_PROXY_PREFIX: &str = "http-proxy-";

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Transcript {
    sections: Vec<(String, String)>,
}

impl Transcript {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, label: impl Into<String>, text: impl Into<String>) {
        self.sections.push((label.into(), text.into()));
    }

    pub fn with(mut self, label: impl Into<String>, text: impl Into<String>) -> Self {
        self.push(label, text);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.sections.is_empty()
    }

    pub fn section(&self, label: &str) -> Option<&str> {
        self.sections
            .iter()
            .find(|(name, _)| name == label)
            .map(|(_, text)| text.as_str())
    }

    pub fn sections(&self) -> impl Iterator<Item = (&str, &str)> {
        self.sections.iter().map(|(l, t)| (l.as_str(), t.as_str()))
    }

    pub fn render(&self) -> String {
        let mut out = String::new();
        for (label, text) in &self.sections {
            out.push_str(HEADER_PREFIX);
            out.push_str(label);
            out.push('\n');
            out.push_str(text);
            if !text.ends_with('\n') {
                out.push('\n');
            }
        }
        out
    }

    /// Splits rendered text back into sections. Text before the first header
    /// (or text with no headers at all) lands in a section labelled `""`.
    pub fn parse(text: &str) -> Self {
        let mut transcript = Transcript::new();
        let mut label = String::new();
        let mut body = String::new();
        let mut seen_header = false;

        for line in text.lines() {
            if let Some(name) = line.strip_prefix(HEADER_PREFIX) {
                if seen_header || !body.trim().is_empty() {
                    transcript.push(std::mem::take(&mut label), std::mem::take(&mut body));
                }
                label = name.trim().to_string();
                body.clear();
                seen_header = true;
            } else {
                body.push_str(line);
                body.push('\n');
            }
        }
        if seen_header || !body.trim().is_empty() {
            transcript.push(label, body);
        }
        transcript
    }
}
