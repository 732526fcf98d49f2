/// Ordered buffer of human-readable diagnostics produced by a turn.
/// Threaded explicitly through the command dispatcher and pipeline instead
/// of capturing stdout.
#[derive(Debug, Default)]
pub struct SystemMessageBuffer {
    lines: Vec<String>,
}

impl SystemMessageBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, line: impl Into<String>) {
        let line = line.into();
        if !line.trim().is_empty() {
            self.lines.push(line);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    pub fn into_lines(self) -> Vec<String> {
        self.lines
    }

    pub fn lines(&self) -> &[String] {
        &self.lines
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blank_lines_are_dropped() {
        let mut buffer = SystemMessageBuffer::new();
        buffer.push("first");
        buffer.push("   ");
        buffer.push("second");
        assert_eq!(buffer.into_lines(), vec!["first", "second"]);
    }
}
