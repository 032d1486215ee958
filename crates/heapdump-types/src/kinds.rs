use facet::Facet;

/// Node type of a heap object, in snapshot type-table order.
#[derive(Facet, Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
#[facet(rename_all = "snake_case")]
pub enum NodeKind {
    /// VM-internal object not meant to be shown to users.
    Hidden,
    Array,
    String,
    /// Plain object; its name is the class/constructor label.
    Object,
    Code,
    Closure,
    Regexp,
    /// Boxed number.
    Number,
    /// Object allocated outside the managed heap but owned by it.
    Native,
    /// Not a real object: groups roots.
    Synthetic,
    ConcatenatedString,
    SlicedString,
    Symbol,
    BigInt,
}

impl NodeKind {
    pub const ALL: [NodeKind; 14] = [
        NodeKind::Hidden,
        NodeKind::Array,
        NodeKind::String,
        NodeKind::Object,
        NodeKind::Code,
        NodeKind::Closure,
        NodeKind::Regexp,
        NodeKind::Number,
        NodeKind::Native,
        NodeKind::Synthetic,
        NodeKind::ConcatenatedString,
        NodeKind::SlicedString,
        NodeKind::Symbol,
        NodeKind::BigInt,
    ];

    /// Position in the `node_types` table of the snapshot meta.
    pub fn index(self) -> u32 {
        self as u32
    }

    pub fn from_index(index: u64) -> Option<Self> {
        usize::try_from(index)
            .ok()
            .and_then(|i| Self::ALL.get(i).copied())
    }

    /// Name used by heap-analysis tooling.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Hidden => "hidden",
            Self::Array => "array",
            Self::String => "string",
            Self::Object => "object",
            Self::Code => "code",
            Self::Closure => "closure",
            Self::Regexp => "regexp",
            Self::Number => "number",
            Self::Native => "native",
            Self::Synthetic => "synthetic",
            Self::ConcatenatedString => "concatenated string",
            Self::SlicedString => "sliced string",
            Self::Symbol => "symbol",
            Self::BigInt => "bigint",
        }
    }
}

/// Kind of a reference between two heap objects, in snapshot type-table order.
#[derive(Facet, Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
#[facet(rename_all = "snake_case")]
pub enum EdgeKind {
    /// Variable captured in a closure context.
    Context,
    /// Indexed slot of an array-like object.
    Element,
    /// Named property.
    Property,
    /// VM-internal named link.
    Internal,
    /// VM-internal indexed link.
    Hidden,
    /// Link to an object not strictly owned, shown for convenience.
    Shortcut,
    /// Does not keep its target alive.
    Weak,
}

impl EdgeKind {
    pub const ALL: [EdgeKind; 7] = [
        EdgeKind::Context,
        EdgeKind::Element,
        EdgeKind::Property,
        EdgeKind::Internal,
        EdgeKind::Hidden,
        EdgeKind::Shortcut,
        EdgeKind::Weak,
    ];

    pub fn index(self) -> u32 {
        self as u32
    }

    pub fn from_index(index: u64) -> Option<Self> {
        usize::try_from(index)
            .ok()
            .and_then(|i| Self::ALL.get(i).copied())
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Context => "context",
            Self::Element => "element",
            Self::Property => "property",
            Self::Internal => "internal",
            Self::Hidden => "hidden",
            Self::Shortcut => "shortcut",
            Self::Weak => "weak",
        }
    }

    /// Element and hidden edges carry a numeric index; every other kind
    /// carries a string-table reference.
    pub fn is_indexed(self) -> bool {
        matches!(self, Self::Element | Self::Hidden)
    }

    /// Whether following this edge keeps the target alive.
    pub fn is_strong(self) -> bool {
        !matches!(self, Self::Weak)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_kind_indices_follow_table_order() {
        for (i, kind) in NodeKind::ALL.iter().enumerate() {
            assert_eq!(kind.index() as usize, i);
            assert_eq!(NodeKind::from_index(i as u64), Some(*kind));
        }
        assert_eq!(NodeKind::from_index(NodeKind::ALL.len() as u64), None);
    }

    #[test]
    fn edge_kind_indices_follow_table_order() {
        for (i, kind) in EdgeKind::ALL.iter().enumerate() {
            assert_eq!(kind.index() as usize, i);
            assert_eq!(EdgeKind::from_index(i as u64), Some(*kind));
        }
        assert!(EdgeKind::Element.is_indexed());
        assert!(EdgeKind::Hidden.is_indexed());
        assert!(!EdgeKind::Property.is_indexed());
        assert!(!EdgeKind::Weak.is_strong());
    }
}
