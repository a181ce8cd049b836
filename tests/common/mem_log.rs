//! A simple, volatile, in-memory implementation of [`LogStore`].

use std::collections::HashMap;

use flock_rs::log_store::{LogError, LogRecord, LogStore};
use flock_rs::types::basic::{SubgroupId, Version};

/// An in-memory log store: one record vector per subgroup.
#[derive(Default)]
pub(crate) struct MemLogStore {
    logs: HashMap<SubgroupId, Vec<LogRecord>>,
}

impl MemLogStore {
    pub(crate) fn new() -> MemLogStore {
        MemLogStore::default()
    }
}

impl LogStore for MemLogStore {
    fn append(&mut self, subgroup: SubgroupId, record: &LogRecord) -> Result<(), LogError> {
        let log = self.logs.entry(subgroup).or_default();
        let last = log.last().map(|record| record.version).unwrap_or(Version::NONE);
        if record.version > last {
            log.push(record.clone());
        }
        Ok(())
    }

    fn truncate(&mut self, subgroup: SubgroupId, above: Version) -> Result<(), LogError> {
        if let Some(log) = self.logs.get_mut(&subgroup) {
            log.retain(|record| record.version <= above);
        }
        Ok(())
    }

    fn read_range(
        &mut self,
        subgroup: SubgroupId,
        from: Version,
        to: Version,
    ) -> Result<Vec<LogRecord>, LogError> {
        Ok(self
            .logs
            .get(&subgroup)
            .map(|log| {
                log.iter()
                    .filter(|record| record.version > from && record.version <= to)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    fn last_version(&mut self, subgroup: SubgroupId) -> Result<Version, LogError> {
        Ok(self
            .logs
            .get(&subgroup)
            .and_then(|log| log.last())
            .map(|record| record.version)
            .unwrap_or(Version::NONE))
    }
}
