//! Arena keys for the Frame/Scope tree.
//!
//! Frames and Scopes reference each other in cycles (a Scope owns Frames, a
//! Frame's cleanup stack can capture its own Scope). Rather than modeling
//! that with `Rc`/`Weak`, the runtime owns one `slab::Slab` per kind and
//! everything else holds an id. An id keeps resolving even while the thing
//! it names is tearing down, which is what makes halt-while-executing safe.

use std::fmt;

/// Key into the runtime's Frame arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FrameId(pub(crate) usize);

impl fmt::Display for FrameId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Frame({})", self.0)
    }
}

/// Key into the runtime's Scope arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ScopeId(pub(crate) usize);

impl fmt::Display for ScopeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Scope({})", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_formats() {
        assert_eq!(FrameId(3).to_string(), "Frame(3)");
        assert_eq!(ScopeId(7).to_string(), "Scope(7)");
    }
}
