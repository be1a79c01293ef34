//! Diagnostics text dump.

/// Line writer with indentation, for the human-readable scheduler dump.
#[derive(Debug, Default)]
pub struct IndentWriter {
    out: String,
    depth: usize,
}

impl IndentWriter {
    const STEP: &'static str = "  ";

    pub fn new() -> Self {
        Self::default()
    }

    /// Write `text`; every line of it gets the current indent.
    pub fn println(&mut self, text: impl AsRef<str>) {
        for line in text.as_ref().lines() {
            for _ in 0..self.depth {
                self.out.push_str(Self::STEP);
            }
            self.out.push_str(line);
            self.out.push('\n');
        }
    }

    pub fn indent(&mut self) {
        self.depth += 1;
    }

    pub fn exdent(&mut self) {
        self.depth = self.depth.saturating_sub(1);
    }

    pub fn finish(self) -> String {
        self.out
    }
}

/// Short byte count, e.g. `1.5 KiB`.
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["B", "KiB", "MiB", "GiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes} B")
    } else {
        format!("{value:.1} {}", UNITS[unit])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nested_lines_are_indented() {
        let mut w = IndentWriter::new();
        w.println("top");
        w.indent();
        w.println("a\nb");
        w.exdent();
        w.exdent();
        w.println("end");
        assert_eq!(w.finish(), "top\n  a\n  b\nend\n");
    }

    #[test]
    fn bytes_are_humanised() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(1536), "1.5 KiB");
        assert_eq!(format_bytes(5 * 1024 * 1024), "5.0 MiB");
    }
}
