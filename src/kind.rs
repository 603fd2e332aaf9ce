//! Static type descriptors that stand in for runtime reflection.
//!
//! Every owner type (aggregate or projection state) and every event type
//! declares one [`Kind`]. A kind names its direct parent, which gives the
//! handler registry an explicit single-inheritance chain to walk on both
//! dispatch axes.

use std::fmt;
use std::hash::{Hash, Hasher};

/// Which side of a handler binding a kind belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    /// A state holder: an aggregate or a projection.
    Owner,
    /// A domain event payload.
    Event,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Owner => f.write_str("owner"),
            Role::Event => f.write_str("event"),
        }
    }
}

/// Static identity of an owner or event type.
///
/// Kinds are declared as associated constants and compared by name, so
/// names must be unique within a process.
///
/// # Examples
///
/// ```
/// use eventfold_kernel::{Kind, Role};
///
/// const BASE: &Kind = &Kind::event("base");
/// const DERIVED: &Kind = &Kind::event("derived").extends(BASE);
///
/// let chain: Vec<&str> = DERIVED.ancestors().map(Kind::name).collect();
/// assert_eq!(chain, ["derived", "base"]);
/// assert!(DERIVED.is_a(BASE));
/// assert_eq!(DERIVED.role(), Role::Event);
/// ```
#[derive(Debug, Clone, Copy)]
pub struct Kind {
    name: &'static str,
    role: Role,
    parent: Option<&'static Kind>,
}

impl Kind {
    /// Declare a root owner kind.
    pub const fn owner(name: &'static str) -> Self {
        Self {
            name,
            role: Role::Owner,
            parent: None,
        }
    }

    /// Declare a root event kind.
    pub const fn event(name: &'static str) -> Self {
        Self {
            name,
            role: Role::Event,
            parent: None,
        }
    }

    /// Attach a direct parent to this kind.
    pub const fn extends(self, parent: &'static Kind) -> Self {
        Self {
            name: self.name,
            role: self.role,
            parent: Some(parent),
        }
    }

    pub const fn name(&self) -> &'static str {
        self.name
    }

    pub const fn role(&self) -> Role {
        self.role
    }

    pub const fn parent(&self) -> Option<&'static Kind> {
        self.parent
    }

    /// Walk this kind and then its parents, most derived first.
    pub fn ancestors(&'static self) -> Ancestors {
        Ancestors { next: Some(self) }
    }

    /// Returns `true` if `other` is this kind or one of its ancestors.
    pub fn is_a(&'static self, other: &Kind) -> bool {
        self.ancestors().any(|k| k == other)
    }
}

impl PartialEq for Kind {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
    }
}

impl Eq for Kind {}

impl Hash for Kind {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.name.hash(state);
    }
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name)
    }
}

/// Iterator over a kind's ancestor chain. See [`Kind::ancestors`].
#[derive(Debug, Clone)]
pub struct Ancestors {
    next: Option<&'static Kind>,
}

impl Iterator for Ancestors {
    type Item = &'static Kind;

    fn next(&mut self) -> Option<Self::Item> {
        let current = self.next?;
        self.next = current.parent;
        Some(current)
    }
}
