use super::{Formatter, Output};
use serde::{Deserialize, Serialize};

#[derive(Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
struct Summary {
    success: i64,
    failed: i64,
    error: i64,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct JsonData {
    list: Vec<Output>,
    summary: Summary,
}

/// Aggregate presenter: buffers every output and emits one JSON document
/// with per-kind counters at the end of the run.
pub struct JsonFormatter {
    data: JsonData,
    pretty: bool,
}

impl JsonFormatter {
    pub fn new(pretty: bool) -> Self {
        Self {
            data: JsonData::default(),
            pretty,
        }
    }

    fn render(&self) -> serde_json::Result<String> {
        if self.pretty {
            serde_json::to_string_pretty(&self.data)
        } else {
            serde_json::to_string(&self.data)
        }
    }
}

impl Formatter for JsonFormatter {
    fn add(&mut self, output: &Output) {
        if !output.error.is_empty() {
            self.data.summary.error += 1;
        } else if output.exit_code != 0 {
            self.data.summary.failed += 1;
        } else {
            self.data.summary.success += 1;
        }
        self.data.list.push(output.clone());
    }

    fn print(&mut self) {
        match self.render() {
            Ok(rendered) => println!("{}", rendered),
            Err(err) => eprintln!("{}", err),
        }
    }
}
