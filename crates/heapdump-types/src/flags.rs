use facet::Facet;
use std::error::Error;
use std::fmt;

/// Capture behaviour bits, fixed when a dumper is configured.
///
/// `NO_FORK` makes captures run synchronously in the calling process;
/// `NO_SIGNAL` suppresses the signal trigger. The default favours in-process
/// capture with the signal trigger on.
#[derive(Facet, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[facet(transparent)]
pub struct Flags(u32);

impl Flags {
    pub const NO_FORK: u32 = 1 << 0;
    pub const NO_SIGNAL: u32 = 1 << 1;
    const ALL: u32 = Self::NO_FORK | Self::NO_SIGNAL;

    /// No bits set: fork isolation and the signal trigger are both enabled.
    pub const fn empty() -> Self {
        Self(0)
    }

    pub fn from_bits(bits: u32) -> Result<Self, UnknownFlagBits> {
        let unknown = bits & !Self::ALL;
        if unknown != 0 {
            return Err(UnknownFlagBits { bits: unknown });
        }
        Ok(Self(bits))
    }

    pub const fn bits(self) -> u32 {
        self.0
    }

    pub const fn no_fork(self) -> bool {
        self.0 & Self::NO_FORK != 0
    }

    pub const fn no_signal(self) -> bool {
        self.0 & Self::NO_SIGNAL != 0
    }

    pub const fn with(self, bit: u32) -> Self {
        Self(self.0 | (bit & Self::ALL))
    }

    pub const fn without(self, bit: u32) -> Self {
        Self(self.0 & !bit)
    }

    /// Applies a comma-separated option list on top of the defaults.
    ///
    /// Tokens: `fork`, `nofork`, `signal`, `nosignal`. Whitespace around
    /// commas and empty tokens are ignored, later tokens win, and anything
    /// else is collected into [`ParsedOptions::unrecognized`] without
    /// touching the flags.
    pub fn parse_options(raw: &str) -> ParsedOptions {
        let mut flags = Self::default();
        let mut unrecognized = Vec::new();
        for token in raw.split(',').map(str::trim) {
            match token {
                "" => {}
                "fork" => flags = flags.without(Self::NO_FORK),
                "nofork" => flags = flags.with(Self::NO_FORK),
                "signal" => flags = flags.without(Self::NO_SIGNAL),
                "nosignal" => flags = flags.with(Self::NO_SIGNAL),
                other => unrecognized.push(other.to_string()),
            }
        }
        ParsedOptions {
            flags,
            unrecognized,
        }
    }
}

impl Default for Flags {
    fn default() -> Self {
        Self(Self::NO_FORK)
    }
}

impl fmt::Display for Flags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let fork = if self.no_fork() { "nofork" } else { "fork" };
        let signal = if self.no_signal() { "nosignal" } else { "signal" };
        write!(f, "{fork},{signal}")
    }
}

/// Result of [`Flags::parse_options`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedOptions {
    pub flags: Flags,
    /// Tokens that matched no option, in input order.
    pub unrecognized: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnknownFlagBits {
    pub bits: u32,
}

impl fmt::Display for UnknownFlagBits {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown flag bits 0x{:x}", self.bits)
    }
}

impl Error for UnknownFlagBits {}
