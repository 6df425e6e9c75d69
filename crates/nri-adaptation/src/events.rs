//! Event subscription and capability masks.
//!
//! A plugin declares interest in lifecycle events by returning an
//! [`EventMask`] from its `configure` reply; an event is delivered to a
//! plugin if and only if the corresponding bit is set. The same bitset
//! machinery backs the [`CapabilityMask`] a plugin reports alongside it.

use std::fmt;
use std::marker::PhantomData;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::Error;

/// Lifecycle events a plugin can subscribe to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Event {
    RunPodSandbox,
    UpdatePodSandbox,
    PostUpdatePodSandbox,
    StopPodSandbox,
    RemovePodSandbox,
    CreateContainer,
    PostCreateContainer,
    StartContainer,
    PostStartContainer,
    UpdateContainer,
    PostUpdateContainer,
    StopContainer,
    RemoveContainer,
    ValidateContainerAdjustment,
}

/// Capabilities a plugin reports in its `configure` reply.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Capability {
    /// The plugin may adjust containers being created.
    Adjust,
    /// The plugin may request updates to existing containers.
    Update,
    /// The plugin may act as a validator for composed adjustments.
    Validate,
}

/// A member of a closed enumeration usable as a bit in a [`Mask`].
pub trait MaskBit: Copy + Eq + fmt::Debug + 'static {
    /// All members, in declaration order.
    const ALL: &'static [Self];

    /// Stable lower-case token used for parsing and rendering.
    fn token(self) -> &'static str;

    /// Position of this member's bit.
    fn index(self) -> u32;
}

impl MaskBit for Event {
    const ALL: &'static [Event] = &[
        Event::RunPodSandbox,
        Event::UpdatePodSandbox,
        Event::PostUpdatePodSandbox,
        Event::StopPodSandbox,
        Event::RemovePodSandbox,
        Event::CreateContainer,
        Event::PostCreateContainer,
        Event::StartContainer,
        Event::PostStartContainer,
        Event::UpdateContainer,
        Event::PostUpdateContainer,
        Event::StopContainer,
        Event::RemoveContainer,
        Event::ValidateContainerAdjustment,
    ];

    fn token(self) -> &'static str {
        match self {
            Event::RunPodSandbox => "run-pod-sandbox",
            Event::UpdatePodSandbox => "update-pod-sandbox",
            Event::PostUpdatePodSandbox => "post-update-pod-sandbox",
            Event::StopPodSandbox => "stop-pod-sandbox",
            Event::RemovePodSandbox => "remove-pod-sandbox",
            Event::CreateContainer => "create-container",
            Event::PostCreateContainer => "post-create-container",
            Event::StartContainer => "start-container",
            Event::PostStartContainer => "post-start-container",
            Event::UpdateContainer => "update-container",
            Event::PostUpdateContainer => "post-update-container",
            Event::StopContainer => "stop-container",
            Event::RemoveContainer => "remove-container",
            Event::ValidateContainerAdjustment => "validate-container-adjustment",
        }
    }

    fn index(self) -> u32 {
        self as u32
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.token())
    }
}

impl MaskBit for Capability {
    const ALL: &'static [Capability] =
        &[Capability::Adjust, Capability::Update, Capability::Validate];

    fn token(self) -> &'static str {
        match self {
            Capability::Adjust => "adjust",
            Capability::Update => "update",
            Capability::Validate => "validate",
        }
    }

    fn index(self) -> u32 {
        self as u32
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.token())
    }
}

/// Fixed-width bitset over a closed enumeration.
#[derive(Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent, bound = "")]
pub struct Mask<T: MaskBit> {
    bits: u64,
    #[serde(skip)]
    _marker: PhantomData<T>,
}

/// Subscription mask over lifecycle events.
pub type EventMask = Mask<Event>;

/// Capability set reported by a plugin.
pub type CapabilityMask = Mask<Capability>;

impl<T: MaskBit> Mask<T> {
    /// An empty mask.
    pub const fn new() -> Self {
        Mask {
            bits: 0,
            _marker: PhantomData,
        }
    }

    /// A mask with every valid bit set.
    pub fn all() -> Self {
        let mut mask = Self::new();
        mask.set(T::ALL);
        mask
    }

    /// Set the given bits.
    pub fn set(&mut self, bits: &[T]) -> &mut Self {
        for b in bits {
            self.bits |= 1 << b.index();
        }
        self
    }

    /// Clear the given bits.
    pub fn clear(&mut self, bits: &[T]) -> &mut Self {
        for b in bits {
            self.bits &= !(1 << b.index());
        }
        self
    }

    /// Test a single bit.
    pub fn is_set(&self, bit: T) -> bool {
        self.bits & (1 << bit.index()) != 0
    }

    pub fn is_empty(&self) -> bool {
        self.bits == 0
    }

    pub fn union(self, other: Self) -> Self {
        Self::from_raw(self.bits | other.bits)
    }

    pub fn intersect(self, other: Self) -> Self {
        Self::from_raw(self.bits & other.bits)
    }

    /// Bits set in `self` but not in `other`.
    pub fn difference(self, other: Self) -> Self {
        Self::from_raw(self.bits & !other.bits)
    }

    pub fn is_subset_of(self, other: Self) -> bool {
        self.bits & !other.bits == 0
    }

    /// Raw bit pattern as carried on the wire.
    pub fn raw_value(self) -> u64 {
        self.bits
    }

    /// Reconstruct a mask from a raw bit pattern. Bits outside the valid
    /// range are preserved so callers can detect them with
    /// [`Mask::is_subset_of`] against [`Mask::all`].
    pub fn from_raw(raw: u64) -> Self {
        Mask {
            bits: raw,
            _marker: PhantomData,
        }
    }

    /// Iterate over the set members in declaration order.
    pub fn iter(self) -> impl Iterator<Item = T> {
        T::ALL.iter().copied().filter(move |b| self.is_set(*b))
    }
}

impl<T: MaskBit> Default for Mask<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: MaskBit> fmt::Display for Mask<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for b in self.iter() {
            if !first {
                f.write_str(",")?;
            }
            f.write_str(b.token())?;
            first = false;
        }
        Ok(())
    }
}

impl<T: MaskBit> fmt::Debug for Mask<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Mask({})", self)
    }
}

impl<T: MaskBit> FromStr for Mask<T> {
    type Err = Error;

    /// Parse a comma-separated, case-insensitive token list. The token
    /// `all` sets every bit; empty tokens are ignored; unknown tokens fail.
    fn from_str(s: &str) -> Result<Self, Error> {
        let mut mask = Self::new();
        for token in s.split(',') {
            let token = token.trim().to_ascii_lowercase();
            if token.is_empty() {
                continue;
            }
            if token == "all" {
                mask = mask.union(Self::all());
                continue;
            }
            match T::ALL.iter().find(|b| b.token() == token) {
                Some(b) => {
                    mask.set(&[*b]);
                }
                None => {
                    return Err(Error::Config(format!("unknown mask token {:?}", token)));
                }
            }
        }
        Ok(mask)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_clear_test() {
        let mut mask = EventMask::new();
        assert!(mask.is_empty());

        mask.set(&[Event::CreateContainer, Event::StartContainer]);
        assert!(mask.is_set(Event::CreateContainer));
        assert!(mask.is_set(Event::StartContainer));
        assert!(!mask.is_set(Event::StopContainer));

        mask.clear(&[Event::CreateContainer]);
        assert!(!mask.is_set(Event::CreateContainer));
        assert!(mask.is_set(Event::StartContainer));
    }

    #[test]
    fn test_parse_case_insensitive() {
        let mask: EventMask = "Create-Container, START-CONTAINER".parse().unwrap();
        assert!(mask.is_set(Event::CreateContainer));
        assert!(mask.is_set(Event::StartContainer));
        assert!(!mask.is_set(Event::RemoveContainer));
    }

    #[test]
    fn test_parse_all_and_empty_tokens() {
        let mask: EventMask = "all".parse().unwrap();
        for e in Event::ALL {
            assert!(mask.is_set(*e), "bit for {} should be set", e);
        }
        let empty: EventMask = "".parse().unwrap();
        assert!(empty.is_empty());
    }

    #[test]
    fn test_parse_unknown_token_fails() {
        let res: Result<EventMask, _> = "create-container,bogus".parse();
        assert!(res.is_err());
    }

    #[test]
    fn test_display_round_trip() {
        let mut mask = EventMask::new();
        mask.set(&[Event::RunPodSandbox, Event::CreateContainer]);
        let rendered = mask.to_string();
        assert_eq!(rendered, "run-pod-sandbox,create-container");
        let parsed: EventMask = rendered.parse().unwrap();
        assert_eq!(parsed, mask);
    }

    #[test]
    fn test_set_algebra() {
        let mut a = EventMask::new();
        a.set(&[Event::CreateContainer, Event::StartContainer]);
        let mut b = EventMask::new();
        b.set(&[Event::StartContainer, Event::StopContainer]);

        let union = a.union(b);
        assert!(union.is_set(Event::CreateContainer));
        assert!(union.is_set(Event::StopContainer));

        let inter = a.intersect(b);
        assert!(inter.is_set(Event::StartContainer));
        assert!(!inter.is_set(Event::CreateContainer));

        let diff = a.difference(b);
        assert!(diff.is_set(Event::CreateContainer));
        assert!(!diff.is_set(Event::StartContainer));

        assert!(inter.is_subset_of(a));
        assert!(inter.is_subset_of(b));
        assert!(!union.is_subset_of(a));
    }

    #[test]
    fn test_raw_round_trip_detects_invalid_bits() {
        let mut mask = EventMask::new();
        mask.set(&[Event::ValidateContainerAdjustment]);
        let raw = mask.raw_value();
        assert_eq!(EventMask::from_raw(raw), mask);

        let bogus = EventMask::from_raw(1 << 63);
        assert!(!bogus.is_subset_of(EventMask::all()));
    }

    #[test]
    fn test_capability_mask() {
        let mask: CapabilityMask = "adjust,validate".parse().unwrap();
        assert!(mask.is_set(Capability::Adjust));
        assert!(!mask.is_set(Capability::Update));
        assert_eq!(mask.to_string(), "adjust,validate");
    }
}
