//! Property links and scope resolution.
//!
//! A property is a named, flagged link from a parent value to a child
//! value; the link list is the unit of own-property storage and keeps
//! insertion order, which is also the `for (... in ...)` order.

use std::rc::Rc;

use bitflags::bitflags;

use crate::value::{ScopeKind, ScriptVar, VarKind, VarPtr};

/// Prototype slot installed on every function.
pub const PROTOTYPE: &str = "prototype";
/// Back link from a prototype to its constructor.
pub const CONSTRUCTOR: &str = "constructor";
/// Getter slot of an accessor value.
pub const ACCESSOR_GET: &str = "__accessor_get__";
/// Setter slot of an accessor value.
pub const ACCESSOR_SET: &str = "__accessor_set__";
/// The arguments array bound on function entry.
pub const ARGUMENTS: &str = "arguments";
/// The `this` binding of a function scope.
pub const THIS: &str = "this";

bitflags! {
    /// Property link flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct LinkFlags: u32 {
        /// This link is the canonical storage of the child.
        const OWNED = 1 << 0;
        /// Assignment through the link is allowed.
        const WRITABLE = 1 << 1;
        /// `delete` may remove the link.
        const DELETABLE = 1 << 2;
        /// Visible to `for (... in ...)`.
        const ENUMERABLE = 1 << 3;
        /// Skipped by `for (... in ...)` even when enumerable.
        const HIDDEN = 1 << 4;

        /// User-created properties.
        const DEFAULT = Self::WRITABLE.bits() | Self::DELETABLE.bits() | Self::ENUMERABLE.bits();
        /// `var` bindings: writable and enumerable, never deletable.
        const VAR_DEFAULT = Self::WRITABLE.bits() | Self::ENUMERABLE.bits();
        /// Native bindings: writable only.
        const NATIVE_DEFAULT = Self::WRITABLE.bits();
    }
}

/// A named property link.
#[derive(Debug, Clone)]
pub struct VarLink {
    /// Property name.
    pub name: String,
    /// The child value.
    pub value: VarPtr,
    /// Link flags.
    pub flags: LinkFlags,
}

impl VarLink {
    /// Create a link with the given flags (plus OWNED).
    pub fn new<N: Into<String>>(name: N, value: VarPtr, flags: LinkFlags) -> Self {
        VarLink { name: name.into(), value, flags: flags | LinkFlags::OWNED }
    }

    /// Writable?
    pub fn is_writable(&self) -> bool {
        self.flags.contains(LinkFlags::WRITABLE)
    }

    /// Deletable?
    pub fn is_deletable(&self) -> bool {
        self.flags.contains(LinkFlags::DELETABLE)
    }

    /// Enumerable and not hidden?
    pub fn is_enumerable(&self) -> bool {
        self.flags.contains(LinkFlags::ENUMERABLE) && !self.flags.contains(LinkFlags::HIDDEN)
    }
}

impl ScriptVar {
    /// Index of an own property.
    pub fn find_own_index(&self, name: &str) -> Option<usize> {
        self.childs.iter().position(|l| l.name == name)
    }

    /// Own property link, cloned.
    pub fn find_own(&self, name: &str) -> Option<VarLink> {
        self.childs.iter().find(|l| l.name == name).cloned()
    }

    /// Add a property; fails silently against an existing name (use
    /// [`ScriptVar::add_child_or_replace`] to overwrite).
    pub fn add_child<N: Into<String>>(&mut self, name: N, value: VarPtr, flags: LinkFlags) {
        let name = name.into();
        if self.find_own_index(&name).is_none() {
            self.childs.push(VarLink::new(name, value, flags));
        }
    }

    /// Add a property, overwriting any existing one with the same name.
    pub fn add_child_or_replace<N: Into<String>>(&mut self, name: N, value: VarPtr, flags: LinkFlags) {
        let name = name.into();
        match self.find_own_index(&name) {
            Some(idx) => {
                self.childs[idx].value = value;
                self.childs[idx].flags = flags | LinkFlags::OWNED;
            }
            None => self.childs.push(VarLink::new(name, value, flags)),
        }
    }

    /// Remove an own property. Returns false when the property exists
    /// but is not deletable.
    pub fn remove_child(&mut self, name: &str) -> bool {
        match self.find_own_index(name) {
            Some(idx) => {
                if !self.childs[idx].is_deletable() {
                    return false;
                }
                self.childs.remove(idx);
                true
            }
            None => true,
        }
    }

    /// Live array length: one plus the largest integer key, or zero.
    pub fn array_length(&self) -> u32 {
        let mut len = 0u32;
        for link in &self.childs {
            if let Ok(idx) = link.name.parse::<u32>() {
                len = len.max(idx + 1);
            }
        }
        len
    }

    /// Truncate an array to the given length by dropping integer keys
    /// at or beyond it.
    pub fn set_array_length(&mut self, len: u32) {
        self.childs.retain(|l| match l.name.parse::<u32>() {
            Ok(idx) => idx < len,
            Err(_) => true,
        });
    }
}

/// Look a property up through the prototype chain. Returns the link and
/// whether it was found on the value itself.
pub fn find_property(var: &VarPtr, name: &str) -> Option<(VarLink, bool)> {
    if let Some(link) = var.borrow().find_own(name) {
        return Some((link, true));
    }
    let mut current = var.borrow().prototype.clone();
    while let Some(proto) = current {
        if let Some(link) = proto.borrow().find_own(name) {
            return Some((link, false));
        }
        current = proto.borrow().prototype.clone();
    }
    None
}

/// Enumerable own property names followed by inherited enumerables in
/// chain order, deduplicated by name.
pub fn enumerable_keys(var: &VarPtr) -> Vec<String> {
    let mut keys: Vec<String> = Vec::new();
    let mut seen: Vec<String> = Vec::new();
    let mut current = Some(var.clone());
    while let Some(v) = current {
        for link in &v.borrow().childs {
            if seen.iter().any(|s| s == &link.name) {
                continue;
            }
            seen.push(link.name.clone());
            if link.is_enumerable() {
                keys.push(link.name.clone());
            }
        }
        current = v.borrow().prototype.clone();
    }
    keys
}

/// Would assigning `proto` as the prototype of `var` create a cycle?
pub fn prototype_would_cycle(var: &VarPtr, proto: &VarPtr) -> bool {
    let mut current = Some(proto.clone());
    while let Some(p) = current {
        if Rc::ptr_eq(&p, var) {
            return true;
        }
        current = p.borrow().prototype.clone();
    }
    false
}

/// A working reference produced by expression evaluation: the value
/// plus, when the expression named a property or variable, the owner it
/// can be written back through.
#[derive(Debug, Clone)]
pub struct Slot {
    /// Name the expression resolved (empty for temporaries).
    pub name: String,
    /// The resolved value.
    pub value: VarPtr,
    /// Owning scope or object, when the slot is assignable.
    pub owner: Option<VarPtr>,
    /// Whether the name actually resolved to an owned property.
    pub resolved: bool,
}

impl Slot {
    /// A plain value with no owner.
    pub fn temp(value: VarPtr) -> Self {
        Slot { name: String::new(), value, owner: None, resolved: true }
    }

    /// A property or variable reference.
    pub fn reference<N: Into<String>>(name: N, value: VarPtr, owner: VarPtr, resolved: bool) -> Self {
        Slot { name: name.into(), value, owner: Some(owner), resolved }
    }

    /// An identifier that did not resolve anywhere.
    pub fn unresolved<N: Into<String>>(name: N, undefined: VarPtr) -> Self {
        Slot { name: name.into(), value: undefined, owner: None, resolved: false }
    }
}

/// Resolve an identifier through the scope chain: let scopes consult
/// their own locals then the parent, with scopes consult the target
/// (inherited properties included) first, function scopes jump to the
/// captured closure, the root ends the walk.
pub fn find_in_scopes(scope: &VarPtr, name: &str) -> Option<Slot> {
    let mut current = Some(scope.clone());
    while let Some(s) = current {
        let kind = match &s.borrow().kind {
            VarKind::Scope(k) => k.clone(),
            _ => ScopeKind::Root,
        };
        match kind {
            ScopeKind::With { parent, target } => {
                if let Some((link, _)) = find_property(&target, name) {
                    return Some(Slot::reference(name, link.value, target, true));
                }
                current = Some(parent);
            }
            ScopeKind::Let { parent } => {
                if let Some(link) = s.borrow().find_own(name) {
                    return Some(Slot::reference(name, link.value, s.clone(), true));
                }
                current = Some(parent);
            }
            ScopeKind::Fnc { closure } => {
                if let Some(link) = s.borrow().find_own(name) {
                    return Some(Slot::reference(name, link.value, s.clone(), true));
                }
                current = closure;
            }
            ScopeKind::Root => {
                if let Some(link) = s.borrow().find_own(name) {
                    return Some(Slot::reference(name, link.value, s.clone(), true));
                }
                current = None;
            }
        }
    }
    None
}

/// The scope `var` declarations land in: the nearest function or root
/// scope, skipping let and with scopes.
pub fn scope_var_target(scope: &VarPtr) -> VarPtr {
    let mut current = scope.clone();
    loop {
        let next = match &current.borrow().kind {
            VarKind::Scope(ScopeKind::Let { parent })
            | VarKind::Scope(ScopeKind::With { parent, .. }) => parent.clone(),
            _ => return current.clone(),
        };
        current = next;
    }
}

/// The scope `let` declarations land in: the current scope, except that
/// a with scope forwards to its parent.
pub fn scope_let_target(scope: &VarPtr) -> VarPtr {
    match &scope.borrow().kind {
        VarKind::Scope(ScopeKind::With { parent, .. }) => parent.clone(),
        _ => scope.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::{ScriptVar, VarKind};

    fn obj() -> VarPtr {
        ScriptVar::new(VarKind::Object)
    }

    fn int(n: i32) -> VarPtr {
        ScriptVar::new(VarKind::Int(n))
    }

    #[test]
    fn test_insertion_order_preserved() {
        let o = obj();
        o.borrow_mut().add_child("b", int(1), LinkFlags::DEFAULT);
        o.borrow_mut().add_child("a", int(2), LinkFlags::DEFAULT);
        o.borrow_mut().add_child("c", int(3), LinkFlags::DEFAULT);
        let names: Vec<_> = o.borrow().childs.iter().map(|l| l.name.clone()).collect();
        assert_eq!(names, ["b", "a", "c"]);
    }

    #[test]
    fn test_add_child_or_replace() {
        let o = obj();
        o.borrow_mut().add_child("a", int(1), LinkFlags::DEFAULT);
        o.borrow_mut().add_child("a", int(2), LinkFlags::DEFAULT);
        assert_eq!(o.borrow().childs.len(), 1);
        o.borrow_mut().add_child_or_replace("a", int(3), LinkFlags::DEFAULT);
        let v = o.borrow().find_own("a").unwrap().value.borrow().to_number();
        assert_eq!(v, 3.0);
    }

    #[test]
    fn test_remove_child_respects_deletable() {
        let o = obj();
        o.borrow_mut().add_child("a", int(1), LinkFlags::VAR_DEFAULT);
        assert!(!o.borrow_mut().remove_child("a"));
        o.borrow_mut().add_child("b", int(1), LinkFlags::DEFAULT);
        assert!(o.borrow_mut().remove_child("b"));
        assert!(o.borrow().find_own("b").is_none());
    }

    #[test]
    fn test_array_length_view() {
        let a = ScriptVar::new(VarKind::Array);
        assert_eq!(a.borrow().array_length(), 0);
        a.borrow_mut().add_child("3", int(9), LinkFlags::DEFAULT);
        assert_eq!(a.borrow().array_length(), 4);
        a.borrow_mut().add_child("10", int(9), LinkFlags::DEFAULT);
        assert_eq!(a.borrow().array_length(), 11);
        a.borrow_mut().set_array_length(4);
        assert_eq!(a.borrow().array_length(), 4);
    }

    #[test]
    fn test_find_property_walks_prototype() {
        let proto = obj();
        proto.borrow_mut().add_child("x", int(7), LinkFlags::DEFAULT);
        let o = obj();
        o.borrow_mut().prototype = Some(proto);
        let (link, own) = find_property(&o, "x").unwrap();
        assert!(!own);
        assert_eq!(link.value.borrow().to_number(), 7.0);
    }

    #[test]
    fn test_enumerable_keys_dedup_and_hidden() {
        let proto = obj();
        proto.borrow_mut().add_child("a", int(0), LinkFlags::DEFAULT);
        proto.borrow_mut().add_child("p", int(0), LinkFlags::DEFAULT);
        let o = obj();
        o.borrow_mut().prototype = Some(proto);
        o.borrow_mut().add_child("a", int(1), LinkFlags::DEFAULT);
        o.borrow_mut()
            .add_child("h", int(1), LinkFlags::DEFAULT | LinkFlags::HIDDEN);
        assert_eq!(enumerable_keys(&o), ["a", "p"]);
    }

    #[test]
    fn test_prototype_cycle_detection() {
        let a = obj();
        let b = obj();
        b.borrow_mut().prototype = Some(a.clone());
        assert!(prototype_would_cycle(&a, &b));
        assert!(prototype_would_cycle(&a, &a));
        assert!(!prototype_would_cycle(&b, &obj()));
    }

    #[test]
    fn test_scope_lookup_through_with_and_let() {
        let root = ScriptVar::new(VarKind::Scope(ScopeKind::Root));
        root.borrow_mut().add_child("g", int(1), LinkFlags::VAR_DEFAULT);

        let target = obj();
        target.borrow_mut().add_child("w", int(2), LinkFlags::DEFAULT);
        let with_scope = ScriptVar::new(VarKind::Scope(ScopeKind::With {
            parent: root.clone(),
            target: target.clone(),
        }));
        let let_scope =
            ScriptVar::new(VarKind::Scope(ScopeKind::Let { parent: with_scope.clone() }));
        let_scope.borrow_mut().add_child("l", int(3), LinkFlags::DEFAULT);

        assert_eq!(find_in_scopes(&let_scope, "l").unwrap().value.borrow().to_number(), 3.0);
        assert_eq!(find_in_scopes(&let_scope, "w").unwrap().value.borrow().to_number(), 2.0);
        assert_eq!(find_in_scopes(&let_scope, "g").unwrap().value.borrow().to_number(), 1.0);
        assert!(find_in_scopes(&let_scope, "missing").is_none());
    }

    #[test]
    fn test_scope_var_target_skips_let() {
        let root = ScriptVar::new(VarKind::Scope(ScopeKind::Root));
        let fnc = ScriptVar::new(VarKind::Scope(ScopeKind::Fnc { closure: Some(root.clone()) }));
        let letsc = ScriptVar::new(VarKind::Scope(ScopeKind::Let { parent: fnc.clone() }));
        assert!(Rc::ptr_eq(&scope_var_target(&letsc), &fnc));
        assert!(Rc::ptr_eq(&scope_let_target(&letsc), &letsc));
    }
}
