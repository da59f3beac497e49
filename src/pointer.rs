use crate::{error::Result, field_set::FieldSet, record::Record};

/// A lazy stand-in for a slot whose value is a subset of a wider record.
///
/// Nothing is cloned until somebody reads the slot. If the clone turns out equal to what the slot held before, the
/// previous instance is returned so consumers relying on identity see no change.
#[derive(Debug, Clone)]
pub(crate) struct RecordPointer {
    previous: Option<Record>,
    record:   Record,
}

impl RecordPointer {
    pub(crate) fn new(previous: Option<Record>, record: Record) -> Self {
        Self { previous, record }
    }

    /// The wider record the pointer refers to.
    pub(crate) fn record(&self) -> &Record {
        &self.record
    }

    pub(crate) fn previous(&self) -> Option<&Record> {
        self.previous.as_ref()
    }

    pub(crate) fn materialize(&self, fs: &FieldSet) -> Result<Record> {
        let value = self.record.clone_fields(fs)?;
        if let Some(previous) = &self.previous {
            if previous.is_equal(&value) {
                return Ok(previous.clone());
            }
        }
        Ok(value)
    }
}
