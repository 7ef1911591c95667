use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use anyhow::{Context, Result};

use super::TraceOutput;
use crate::merge::MergedLog;

/// Merged events as JSON lines.
pub struct JsonLinesOutput<W: Write> {
    writer: W,
}

impl JsonLinesOutput<BufWriter<File>> {
    pub fn create(path: &Path) -> Result<Self> {
        let file =
            File::create(path).with_context(|| format!("Failed to create {}", path.display()))?;
        Ok(Self::new(BufWriter::new(file)))
    }
}

impl<W: Write> JsonLinesOutput<W> {
    pub fn new(writer: W) -> Self {
        JsonLinesOutput { writer }
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}

impl<W: Write> TraceOutput for JsonLinesOutput<W> {
    fn write_events(&mut self, log: &MergedLog) -> Result<()> {
        for event in log.events() {
            serde_json::to_writer(&mut self.writer, event)?;
            self.writer.write_all(b"\n")?;
        }
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        self.writer.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{EventKind, RawEvent};
    use crate::handler::SourceLog;

    #[test]
    fn test_one_object_per_line() {
        let log = MergedLog::from_logs(vec![SourceLog {
            source: "fork".to_string(),
            events: vec![
                RawEvent::new(EventKind::Fork, 10, 1).with_child(2),
                RawEvent::new(EventKind::Exit, 20, 2),
            ],
        }]);
        let mut output = JsonLinesOutput::new(Vec::new());
        output.write_events(&log).unwrap();
        output.flush().unwrap();

        let text = String::from_utf8(output.into_inner()).unwrap();
        let lines: Vec<serde_json::Value> = text
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["kind"], "fork");
        assert_eq!(lines[0]["child_pid"], 2);
        assert_eq!(lines[1]["timestamp"], 10);
    }
}
