//! Identifier types for resource contexts and operations
//!
//! `CtxId` indexes the reactor's context slab. `OpId` packs a pool slot
//! and a generation counter into the 64-bit key handed to the completion
//! backend as user_data, so a stale completion for a recycled slot can be
//! detected and dropped instead of corrupting an unrelated operation.

use core::fmt;

/// Index of a `ResourceContext` in the reactor's context slab.
///
/// The maximum value (u32::MAX) is reserved as a sentinel for "no context".
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct CtxId(u32);

impl CtxId {
    /// Sentinel value indicating no context
    pub const NONE: CtxId = CtxId(u32::MAX);

    #[inline]
    pub const fn new(id: u32) -> Self {
        CtxId(id)
    }

    #[inline]
    pub const fn as_u32(self) -> u32 {
        self.0
    }

    /// Get as usize for indexing
    #[inline]
    pub const fn as_usize(self) -> usize {
        self.0 as usize
    }

    #[inline]
    pub const fn is_none(self) -> bool {
        self.0 == u32::MAX
    }

    #[inline]
    pub const fn is_some(self) -> bool {
        self.0 != u32::MAX
    }
}

impl Default for CtxId {
    fn default() -> Self {
        CtxId::NONE
    }
}

impl fmt::Debug for CtxId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_none() {
            write!(f, "CtxId(NONE)")
        } else {
            write!(f, "CtxId({})", self.0)
        }
    }
}

impl fmt::Display for CtxId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_none() {
            write!(f, "none")
        } else {
            write!(f, "{}", self.0)
        }
    }
}

/// Key of an in-flight operation: pool slot in the low 32 bits,
/// generation in the high 32 bits.
///
/// Stored in the backend's user_data field for zero-lookup routing of
/// completions back to their operation.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct OpId(u64);

impl OpId {
    /// Sentinel value indicating no operation
    pub const NONE: OpId = OpId(u64::MAX);

    #[inline]
    pub const fn new(slot: u32, generation: u32) -> Self {
        OpId(((generation as u64) << 32) | slot as u64)
    }

    /// Reconstruct from a raw backend user_data value.
    #[inline]
    pub const fn from_raw(raw: u64) -> Self {
        OpId(raw)
    }

    #[inline]
    pub const fn as_raw(self) -> u64 {
        self.0
    }

    /// Pool slot of this operation
    #[inline]
    pub const fn slot(self) -> u32 {
        self.0 as u32
    }

    /// Generation the slot had when this id was minted
    #[inline]
    pub const fn generation(self) -> u32 {
        (self.0 >> 32) as u32
    }

    #[inline]
    pub const fn is_none(self) -> bool {
        self.0 == u64::MAX
    }

    #[inline]
    pub const fn is_some(self) -> bool {
        self.0 != u64::MAX
    }
}

impl Default for OpId {
    fn default() -> Self {
        OpId::NONE
    }
}

impl fmt::Debug for OpId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_none() {
            write!(f, "OpId(NONE)")
        } else {
            write!(f, "OpId({}g{})", self.slot(), self.generation())
        }
    }
}
