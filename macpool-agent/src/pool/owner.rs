use std::fmt::{Display, Formatter};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OwnerKind {
    Pod,
    VirtualMachine,
}

impl Display for OwnerKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            OwnerKind::Pod => f.write_str("pod"),
            OwnerKind::VirtualMachine => f.write_str("virtual machine"),
        }
    }
}

/// The interface an address is assigned to.
///
/// Objects admitted with `generateName` and no name don't have their final
/// name yet, so `name` holds the prefix and `generated_name` is set. Such an
/// owner matches any object whose name starts with the prefix.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Owner {
    pub kind: OwnerKind,
    pub namespace: String,
    pub name: String,
    pub interface: String,
    pub generated_name: bool,
}

impl Owner {
    pub fn new(
        kind: OwnerKind,
        namespace: impl Into<String>,
        name: impl Into<String>,
        interface: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            namespace: namespace.into(),
            name: name.into(),
            interface: interface.into(),
            generated_name: false,
        }
    }

    pub fn with_generated_name(
        kind: OwnerKind,
        namespace: impl Into<String>,
        prefix: impl Into<String>,
        interface: impl Into<String>,
    ) -> Self {
        Self {
            generated_name: true,
            ..Self::new(kind, namespace, prefix, interface)
        }
    }

    pub fn is_object(&self, kind: OwnerKind, namespace: &str, name: &str) -> bool {
        self.kind == kind
            && self.namespace == namespace
            && match self.generated_name {
                true => name.starts_with(&self.name),
                false => self.name == name,
            }
    }

    /// Both owners refer to the same object, interfaces aside. Two generated
    /// owners are never considered the same object.
    pub fn same_object(&self, other: &Owner) -> bool {
        match (self.generated_name, other.generated_name) {
            (true, true) => false,
            (false, true) => other.is_object(self.kind, &self.namespace, &self.name),
            _ => self.is_object(other.kind, &other.namespace, &other.name),
        }
    }

    pub fn matches(&self, other: &Owner) -> bool {
        match self.generated_name || other.generated_name {
            true => self.same_object(other) && self.interface == other.interface,
            false => self == other,
        }
    }
}

impl Display for Owner {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let suffix = match self.generated_name {
            true => "*",
            false => "",
        };

        write!(
            f,
            "{} '{}{suffix}' in '{}' namespace (interface '{}')",
            self.kind, self.name, self.namespace, self.interface
        )
    }
}
