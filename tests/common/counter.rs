//! A counting replicated object: the simplest state machine that makes divergence visible.

use borsh::{BorshDeserialize, BorshSerialize};

use flock_rs::replicated::{MethodTable, ObjectType, ReplicatedObject, StateLoadError};

pub(crate) const ADD: u64 = 0;
pub(crate) const READ: u64 = 1;

#[derive(Default, BorshSerialize, BorshDeserialize)]
pub(crate) struct Counter {
    value: u64,
}

impl ReplicatedObject for Counter {
    fn state_bytes(&self) -> Vec<u8> {
        self.try_to_vec().unwrap()
    }

    fn load_state(&mut self, bytes: &[u8]) -> Result<(), StateLoadError> {
        *self = Counter::try_from_slice(bytes).map_err(|err| StateLoadError {
            reason: err.to_string(),
        })?;
        Ok(())
    }
}

/// The counter's method table: `ADD` increments by the argument and replies with the new value,
/// `READ` replies with the current value.
pub(crate) fn counter_type() -> ObjectType {
    ObjectType::new(
        |_| Counter::default(),
        || {
            MethodTable::new()
                .method(ADD, |counter: &mut Counter, amount: u64| {
                    counter.value += amount;
                    counter.value
                })
                .method(READ, |counter: &mut Counter, (): ()| counter.value)
        },
    )
}
