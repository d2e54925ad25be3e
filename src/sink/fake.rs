// SPDX-License-Identifier: Apache-2.0

//! In-memory sink that records everything it receives. Used by the test
//! suites in this crate; exported so embedders can assert on delivery too.

use std::sync::{Arc, Mutex};

use super::{Entry, Sink, SinkError};

#[derive(Clone, Default)]
pub struct FakeSink {
    received: Arc<Mutex<Vec<Entry>>>,
}

impl FakeSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of everything received so far.
    pub fn entries(&self) -> Vec<Entry> {
        self.received.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn len(&self) -> usize {
        self.received.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Concatenated lines, for order-sensitive assertions.
    pub fn lines(&self) -> Vec<String> {
        self.received
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|e| e.line.clone())
            .collect()
    }
}

impl Sink for FakeSink {
    fn handle(&self, entry: Entry) -> Result<(), SinkError> {
        self.received
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(entry);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::Labels;

    #[test]
    fn records_entries_in_order() {
        let sink = FakeSink::new();
        assert!(sink.is_empty());

        sink.handle(Entry::new(Labels::new(), "first")).unwrap();
        sink.handle(Entry::new(Labels::new(), "second")).unwrap();

        assert_eq!(sink.len(), 2);
        assert_eq!(sink.lines(), vec!["first", "second"]);
    }
}
