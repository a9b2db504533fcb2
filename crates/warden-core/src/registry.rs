//! Explicit component registration.
//!
//! The node runtime needs to know, for every hosted component, which other
//! components it references and which named listeners it owns. Those facts
//! are declared as data: generated registration code builds a
//! [`ComponentDescriptor`] per component, the application entry point feeds
//! them to a [`RegistryBuilder`] in a defined order, and the frozen
//! [`Registry`] is handed to the runtime. There is no load-time global state
//! and no runtime reflection.

use std::collections::HashMap;

/// Static facts about one component.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComponentDescriptor {
    /// Component path, unique within a registry.
    pub path: String,
    /// Paths of the components this component holds references to.
    pub refs: Vec<String>,
    /// Names of the network listeners this component owns.
    pub listeners: Vec<String>,
}

/// Errors produced while building a registry.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    /// Two descriptors used the same component path.
    #[error("component '{0}' registered twice")]
    DuplicatePath(String),

    /// A descriptor declared an empty component path.
    #[error("component descriptor with empty path")]
    EmptyPath,
}

/// Accumulates component descriptors before the registry is frozen.
#[derive(Debug, Default)]
pub struct RegistryBuilder {
    order: Vec<String>,
    by_path: HashMap<String, ComponentDescriptor>,
}

impl RegistryBuilder {
    /// Create an empty builder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register one component descriptor.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::DuplicatePath`] if the path was already
    /// registered, or [`RegistryError::EmptyPath`] for an empty path.
    pub fn register(&mut self, desc: ComponentDescriptor) -> Result<(), RegistryError> {
        if desc.path.is_empty() {
            return Err(RegistryError::EmptyPath);
        }
        if self.by_path.contains_key(&desc.path) {
            return Err(RegistryError::DuplicatePath(desc.path));
        }
        self.order.push(desc.path.clone());
        self.by_path.insert(desc.path.clone(), desc);
        Ok(())
    }

    /// Freeze the builder into an immutable registry.
    #[must_use]
    pub fn freeze(self) -> Registry {
        Registry {
            order: self.order,
            by_path: self.by_path,
        }
    }
}

/// An immutable set of component descriptors, queried by path.
#[derive(Debug)]
pub struct Registry {
    order: Vec<String>,
    by_path: HashMap<String, ComponentDescriptor>,
}

impl Registry {
    /// Look up a descriptor by component path.
    #[must_use]
    pub fn find(&self, path: &str) -> Option<&ComponentDescriptor> {
        self.by_path.get(path)
    }

    /// Iterate descriptors in registration order.
    pub fn iter(&self) -> impl Iterator<Item = &ComponentDescriptor> {
        self.order.iter().map(|p| &self.by_path[p])
    }

    /// Number of registered components.
    #[must_use]
    pub fn len(&self) -> usize {
        self.order.len()
    }

    /// Returns true if no component is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}
