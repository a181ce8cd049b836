/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The application's side of a subgroup: the [`ReplicatedObject`] trait a replicated state
//! machine implements, the [`MethodTable`] that maps query opcodes onto its methods, and the
//! type-erased registry entries the dispatcher owns one of per locally sharded subgroup.
//!
//! Object types are registered with the group at construction and identified from then on by
//! their [`SubgroupTypeId`](crate::types::basic::SubgroupTypeId), in registration order. Typed
//! wrappers over the opcode interface are user code; the library moves only bytes.

use borsh::{BorshDeserialize, BorshSerialize};
use std::collections::VecDeque;

use crate::types::basic::{Hlc, SubgroupId, Version};

/// A state machine replicated by every member of a subgroup's shard.
///
/// Mutations happen exclusively through the object's [`MethodTable`] handlers, which every shard
/// member runs in the same order on the same stable messages; the two state methods exist so
/// the library can ship the full state to joiners and snapshot it for the version log. An
/// implementation must be deterministic: the same handler applied to the same state must
/// produce the same state and reply everywhere.
pub trait ReplicatedObject: Send + 'static {
    /// Serialize the object's full state, for transfer to joiners and for version snapshots.
    fn state_bytes(&self) -> Vec<u8>;

    /// Replace the object's state with a previously serialized one.
    fn load_state(&mut self, bytes: &[u8]) -> Result<(), StateLoadError>;
}

#[derive(Debug)]
pub struct StateLoadError {
    pub reason: String,
}

/// Why a handler invocation produced no reply value.
#[derive(Debug)]
pub enum HandlerError {
    UnknownOpcode(u64),
    BadArguments(String),
}

/// The explicit method table of one object type: a vector of `{opcode, handler}` entries built
/// once at registration. Handlers receive the raw argument bytes of the query and return the
/// raw reply bytes; [`MethodTable::method`] layers Borsh decoding/encoding over that for typed
/// methods.
pub struct MethodTable<T> {
    entries: Vec<MethodEntry<T>>,
}

pub struct MethodEntry<T> {
    pub opcode: u64,
    pub handler: Box<dyn FnMut(&mut T, &[u8]) -> Result<Vec<u8>, HandlerError> + Send>,
}

impl<T> MethodTable<T> {
    pub fn new() -> MethodTable<T> {
        MethodTable {
            entries: Vec::new(),
        }
    }

    /// Register a typed method: arguments are Borsh-decoded into `A`, and the return value is
    /// Borsh-encoded from `R`.
    pub fn method<A, R>(
        mut self,
        opcode: u64,
        mut handler: impl FnMut(&mut T, A) -> R + Send + 'static,
    ) -> MethodTable<T>
    where
        A: BorshDeserialize,
        R: BorshSerialize,
    {
        self.entries.push(MethodEntry {
            opcode,
            handler: Box::new(move |object, args| {
                let args = A::try_from_slice(args)
                    .map_err(|err| HandlerError::BadArguments(err.to_string()))?;
                let reply = handler(object, args);
                Ok(reply
                    .try_to_vec()
                    .expect("a reply value serializes"))
            }),
        });
        self
    }

    /// Register a raw method that works on bytes directly.
    pub fn raw_method(
        mut self,
        opcode: u64,
        handler: impl FnMut(&mut T, &[u8]) -> Result<Vec<u8>, HandlerError> + Send + 'static,
    ) -> MethodTable<T> {
        self.entries.push(MethodEntry {
            opcode,
            handler: Box::new(handler),
        });
        self
    }

    fn invoke(&mut self, object: &mut T, opcode: u64, args: &[u8]) -> Result<Vec<u8>, HandlerError> {
        let entry = self
            .entries
            .iter_mut()
            .find(|entry| entry.opcode == opcode)
            .ok_or(HandlerError::UnknownOpcode(opcode))?;
        (entry.handler)(object, args)
    }
}

impl<T> Default for MethodTable<T> {
    fn default() -> Self {
        MethodTable::new()
    }
}

/// A state snapshot staged for the persistence worker: the object's serialized state at the
/// moment `version` became stable.
pub struct StagedVersion {
    pub version: Version,
    pub hlc: Hlc,
    pub state: Vec<u8>,
}

/// The dispatcher's type-erased view of one replicated object and its method table.
pub(crate) trait RegistryEntry: Send {
    fn invoke(&mut self, opcode: u64, args: &[u8]) -> Result<Vec<u8>, HandlerError>;

    fn state_bytes(&self) -> Vec<u8>;

    fn load_state(&mut self, bytes: &[u8]) -> Result<(), StateLoadError>;

    /// Stage the current state as the snapshot for `version`.
    fn make_version(&mut self, version: Version, hlc: Hlc);

    /// Hand over every staged snapshot with version at most `up_to`, oldest first.
    fn take_staged(&mut self, up_to: Version) -> Vec<StagedVersion>;
}

struct TypedEntry<T: ReplicatedObject> {
    object: T,
    methods: MethodTable<T>,
    staged: VecDeque<StagedVersion>,
}

impl<T: ReplicatedObject> RegistryEntry for TypedEntry<T> {
    fn invoke(&mut self, opcode: u64, args: &[u8]) -> Result<Vec<u8>, HandlerError> {
        self.methods.invoke(&mut self.object, opcode, args)
    }

    fn state_bytes(&self) -> Vec<u8> {
        self.object.state_bytes()
    }

    fn load_state(&mut self, bytes: &[u8]) -> Result<(), StateLoadError> {
        self.object.load_state(bytes)
    }

    fn make_version(&mut self, version: Version, hlc: Hlc) {
        self.staged.push_back(StagedVersion {
            version,
            hlc,
            state: self.object.state_bytes(),
        });
    }

    fn take_staged(&mut self, up_to: Version) -> Vec<StagedVersion> {
        let mut taken = Vec::new();
        while self
            .staged
            .front()
            .map(|staged| staged.version <= up_to)
            .unwrap_or(false)
        {
            taken.push(self.staged.pop_front().unwrap());
        }
        taken
    }
}

/// A replicated-object type as registered with the group: how to construct an instance when a
/// view shards the subgroup onto this replica, and how to build its method table.
pub struct ObjectType {
    pub(crate) make: Box<dyn Fn(SubgroupId) -> Box<dyn RegistryEntry> + Send + Sync>,
}

impl ObjectType {
    pub fn new<T, F, M>(factory: F, methods: M) -> ObjectType
    where
        T: ReplicatedObject,
        F: Fn(SubgroupId) -> T + Send + Sync + 'static,
        M: Fn() -> MethodTable<T> + Send + Sync + 'static,
    {
        ObjectType {
            make: Box::new(move |subgroup_id| {
                Box::new(TypedEntry {
                    object: factory(subgroup_id),
                    methods: methods(),
                    staged: VecDeque::new(),
                })
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::basic::ViewId;

    struct Counter(u64);

    impl ReplicatedObject for Counter {
        fn state_bytes(&self) -> Vec<u8> {
            self.0.to_le_bytes().to_vec()
        }

        fn load_state(&mut self, bytes: &[u8]) -> Result<(), StateLoadError> {
            let bytes: [u8; 8] = bytes.try_into().map_err(|_| StateLoadError {
                reason: "counter state is 8 bytes".to_string(),
            })?;
            self.0 = u64::from_le_bytes(bytes);
            Ok(())
        }
    }

    fn counter_type() -> ObjectType {
        ObjectType::new(
            |_| Counter(0),
            || {
                MethodTable::new()
                    .method(0, |counter: &mut Counter, amount: u64| {
                        counter.0 += amount;
                        counter.0
                    })
                    .method(1, |counter: &mut Counter, (): ()| counter.0)
            },
        )
    }

    #[test]
    fn typed_methods_decode_args_and_encode_replies() {
        let mut entry = (counter_type().make)(SubgroupId::new(0));
        let reply = entry.invoke(0, &5u64.try_to_vec().unwrap()).unwrap();
        assert_eq!(u64::try_from_slice(&reply).unwrap(), 5);

        let reply = entry.invoke(1, &().try_to_vec().unwrap()).unwrap();
        assert_eq!(u64::try_from_slice(&reply).unwrap(), 5);
    }

    #[test]
    fn unknown_opcodes_are_rejected() {
        let mut entry = (counter_type().make)(SubgroupId::new(0));
        assert!(matches!(
            entry.invoke(9, &[]),
            Err(HandlerError::UnknownOpcode(9))
        ));
    }

    #[test]
    fn staged_versions_hand_over_in_order() {
        let mut entry = (counter_type().make)(SubgroupId::new(0));
        entry.invoke(0, &3u64.try_to_vec().unwrap()).unwrap();
        entry.make_version(Version::new(ViewId::new(0), 0), Hlc::default());
        entry.invoke(0, &4u64.try_to_vec().unwrap()).unwrap();
        entry.make_version(Version::new(ViewId::new(0), 1), Hlc::default());

        let staged = entry.take_staged(Version::new(ViewId::new(0), 0));
        assert_eq!(staged.len(), 1);
        assert_eq!(staged[0].state, 3u64.to_le_bytes().to_vec());

        let staged = entry.take_staged(Version::new(ViewId::new(0), 5));
        assert_eq!(staged.len(), 1);
        assert_eq!(staged[0].state, 7u64.to_le_bytes().to_vec());
    }
}
