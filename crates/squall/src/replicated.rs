//! The typed replicated-object registry.
//!
//! Rather than parameterizing the whole group over every replicated type,
//! the group keeps one registry of subgroup handles erased to a stable type
//! tag; typed views are recovered through a lookup keyed by the tag. This
//! keeps the public API typed without a combinatorial generic surface.

use squall_types::{NodeId, SubgroupId, Version};

use crate::{Group, GroupError, GroupResult};

/// A stable tag identifying a replicated object type.
///
/// Derived from the type's name; stable for a given program, which is all
/// the registry needs since every member runs the same binary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TypeTag(&'static str);

impl TypeTag {
    pub fn of<T: 'static>() -> Self {
        Self(std::any::type_name::<T>())
    }

    pub fn as_str(&self) -> &'static str {
        self.0
    }
}

/// Marker trait for types replicated by a subgroup.
pub trait ReplicatedObject: 'static {
    /// The tag used to look this type's subgroups up in the registry.
    fn type_tag() -> TypeTag
    where
        Self: Sized,
    {
        TypeTag::of::<Self>()
    }
}

/// An untyped payload subgroup, for groups that multicast raw bytes.
pub struct RawObject;

impl ReplicatedObject for RawObject {}

/// Typed handle to a subgroup this node is a member of.
pub struct Replicated<'g, T: ReplicatedObject> {
    pub(crate) group: &'g Group,
    pub(crate) subgroup: SubgroupId,
    pub(crate) _marker: std::marker::PhantomData<T>,
}

impl<'g, T: ReplicatedObject> Replicated<'g, T> {
    pub fn subgroup_id(&self) -> SubgroupId {
        self.subgroup
    }

    /// Multicasts a message to the shard. `fill` writes the payload into the
    /// reserved buffer. Returns `Ok(false)` under backpressure.
    pub fn send(
        &self,
        payload_size: usize,
        fill: impl FnOnce(&mut [u8]),
    ) -> GroupResult<bool> {
        self.group.send(self.subgroup, payload_size, fill, false)
    }

    /// The latest version delivered locally in this subgroup.
    pub fn get_delivered_version(&self) -> GroupResult<Version> {
        Ok(self.group.engine()?.delivered_version(self.subgroup))
    }

    /// The latest version every shard member has persisted.
    pub fn get_global_persistence_frontier(&self) -> GroupResult<Version> {
        Ok(self
            .group
            .engine()?
            .get_global_persistence_frontier(self.subgroup))
    }

    /// Blocks until the shard-wide persistence frontier reaches `version`.
    /// Returns false if the version is beyond the latest delivered or the
    /// group is shutting down.
    pub fn wait_for_global_persistence_frontier(&self, version: Version) -> GroupResult<bool> {
        Ok(self
            .group
            .engine()?
            .wait_for_global_persistence_frontier(self.subgroup, version))
    }

    pub fn get_global_verified_frontier(&self) -> GroupResult<Version> {
        Ok(self
            .group
            .engine()?
            .get_global_verified_frontier(self.subgroup))
    }

    /// Members of this node's shard.
    pub fn members(&self) -> GroupResult<Vec<NodeId>> {
        let engine = self.group.engine()?;
        let settings = engine
            .settings()
            .get(&self.subgroup)
            .ok_or(GroupError::NotASubgroupMember)?;
        Ok(settings.members.clone())
    }
}

/// Request/reply access to a subgroup this node is not a member of.
pub struct PeerCaller<'g, T: ReplicatedObject> {
    pub(crate) group: &'g Group,
    pub(crate) subgroup: SubgroupId,
    pub(crate) _marker: std::marker::PhantomData<T>,
}

impl<'g, T: ReplicatedObject> PeerCaller<'g, T> {
    pub fn subgroup_id(&self) -> SubgroupId {
        self.subgroup
    }

    /// Sends a request to a member of the subgroup. Returns the sequence
    /// number to match the reply with, or `None` when the p2p window is
    /// full.
    pub fn send_request(&self, to: NodeId, payload: &[u8]) -> GroupResult<Option<u64>> {
        self.group.p2p().send_request(to, self.subgroup, payload)
    }

    /// Takes the next reply received from `from`, if any.
    pub fn try_recv_reply(&self, from: NodeId) -> Option<(u64, bytes::Bytes)> {
        self.group.p2p().take_reply(from, self.subgroup)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn type_tags_distinguish_types() {
        struct Ledger;
        struct Cache;
        impl ReplicatedObject for Ledger {}
        impl ReplicatedObject for Cache {}

        assert_ne!(Ledger::type_tag(), Cache::type_tag());
        assert_eq!(TypeTag::of::<Ledger>(), Ledger::type_tag());
        assert_eq!(RawObject::type_tag(), TypeTag::of::<RawObject>());
    }
}
