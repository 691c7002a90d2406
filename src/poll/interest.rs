//! Interest flags for I/O readiness.

/// Interest flags indicating which I/O conditions to monitor or report.
///
/// The readable and writable bits are what callers register; hangup, error,
/// and priority are reported by the kernel regardless of registration and
/// show up in [`Event::ready`](crate::poll::Event) so the event loop can
/// route them.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Interest(u8);

impl Interest {
    /// Interest in readable events.
    pub const READABLE: Interest = Interest(0b0_0001);
    /// Interest in writable events.
    pub const WRITABLE: Interest = Interest(0b0_0010);
    /// Peer hang-up.
    pub const HUP: Interest = Interest(0b0_0100);
    /// Error condition.
    pub const ERROR: Interest = Interest(0b0_1000);
    /// Urgent out-of-band data.
    pub const PRIORITY: Interest = Interest(0b1_0000);
    /// No bits set.
    pub const NONE: Interest = Interest(0);

    /// Returns interest in both readable and writable events.
    #[must_use]
    pub const fn both() -> Self {
        Interest(Self::READABLE.0 | Self::WRITABLE.0)
    }

    /// Returns true if the readable bit is set.
    #[must_use]
    pub const fn is_readable(self) -> bool {
        self.0 & Self::READABLE.0 != 0
    }

    /// Returns true if the writable bit is set.
    #[must_use]
    pub const fn is_writable(self) -> bool {
        self.0 & Self::WRITABLE.0 != 0
    }

    /// Returns true if the hang-up bit is set.
    #[must_use]
    pub const fn is_hup(self) -> bool {
        self.0 & Self::HUP.0 != 0
    }

    /// Returns true if the error bit is set.
    #[must_use]
    pub const fn is_error(self) -> bool {
        self.0 & Self::ERROR.0 != 0
    }

    /// Returns true if the priority bit is set.
    #[must_use]
    pub const fn is_priority(self) -> bool {
        self.0 & Self::PRIORITY.0 != 0
    }

    /// Returns true if no bits are set.
    #[must_use]
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Combines two interest sets.
    #[must_use]
    pub const fn add(self, other: Interest) -> Self {
        Interest(self.0 | other.0)
    }

    /// Removes the bits of `other` from this set.
    #[must_use]
    pub const fn without(self, other: Interest) -> Self {
        Interest(self.0 & !other.0)
    }

    /// Returns true if any bit of `other` is set in this set.
    #[must_use]
    pub const fn intersects(self, other: Interest) -> bool {
        self.0 & other.0 != 0
    }
}

impl std::fmt::Debug for Interest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut first = true;
        let mut put = |f: &mut std::fmt::Formatter<'_>, name: &str| -> std::fmt::Result {
            if !first {
                f.write_str("|")?;
            }
            first = false;
            f.write_str(name)
        };
        if self.is_readable() {
            put(f, "READABLE")?;
        }
        if self.is_writable() {
            put(f, "WRITABLE")?;
        }
        if self.is_hup() {
            put(f, "HUP")?;
        }
        if self.is_error() {
            put(f, "ERROR")?;
        }
        if self.is_priority() {
            put(f, "PRIORITY")?;
        }
        if first {
            f.write_str("NONE")?;
        }
        Ok(())
    }
}
