use crate::error::{Result, VmError};
use crate::slots::{Origin, SlotId};

/// Who to resume when a nested invocation finishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NestRecord {
    pub number: u16,
    pub origin: Option<Origin>,
    pub slot: Option<SlotId>,
}

impl NestRecord {
    /// Record pushed when nothing was running; never resumes anything.
    pub fn top_level() -> Self {
        NestRecord {
            number: 0,
            origin: None,
            slot: None,
        }
    }

    pub fn caller(slot: SlotId, number: u16, origin: Origin) -> Self {
        NestRecord {
            number,
            origin: Some(origin),
            slot: Some(slot),
        }
    }

    pub fn is_valid(&self) -> bool {
        self.number != 0 && self.slot.is_some()
    }

    fn invalidate(&mut self) {
        *self = NestRecord::top_level();
    }
}

/// Depth-bounded stack of nested invocations.
#[derive(Debug, Clone)]
pub struct NestedCallStack {
    records: Vec<NestRecord>,
    max_depth: usize,
}

impl NestedCallStack {
    pub fn new(max_depth: usize) -> Self {
        NestedCallStack {
            records: Vec::with_capacity(max_depth),
            max_depth,
        }
    }

    pub fn push(&mut self, record: NestRecord) -> Result<()> {
        if self.records.len() >= self.max_depth {
            return Err(VmError::NestingOverflow {
                depth: self.max_depth,
            });
        }
        self.records.push(record);
        Ok(())
    }

    pub fn pop(&mut self) -> Option<NestRecord> {
        self.records.pop()
    }

    pub fn depth(&self) -> usize {
        self.records.len()
    }

    pub fn max_depth(&self) -> usize {
        self.max_depth
    }

    pub fn iter(&self) -> impl Iterator<Item = &NestRecord> {
        self.records.iter()
    }

    /// Invalidates records naming `number` in the given origin family so a
    /// later pop does not resume into a stopped script. Returns how many were
    /// purged.
    pub fn purge<F>(&mut self, number: u16, family: F) -> usize
    where
        F: Fn(Origin) -> bool,
    {
        let mut purged = 0;
        for record in &mut self.records {
            let matches = record.number == number && record.origin.is_some_and(&family);
            if matches {
                record.invalidate();
                purged += 1;
            }
        }
        purged
    }

    /// Invalidates every record that resumes `slot`.
    pub fn purge_slot(&mut self, slot: SlotId) -> usize {
        let mut purged = 0;
        for record in &mut self.records {
            if record.slot == Some(slot) {
                record.invalidate();
                purged += 1;
            }
        }
        purged
    }

    pub fn clear(&mut self) {
        self.records.clear();
    }
}
