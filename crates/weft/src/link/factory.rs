use std::{cell::RefCell, collections::HashMap};

use once_cell::sync::Lazy;
use std::sync::RwLock;

use crate::{LinkType, link::Link, protocol::ProtocolStack};

/// How to outfit a link of one [`LinkType`]: a display name and the
/// pipeline the variant carries.
#[derive(Clone, Copy)]
pub struct LinkRecipe {
    pub name: &'static str,
    pub build_stack: fn(&mut ProtocolStack),
}

static RECIPES: Lazy<RwLock<HashMap<LinkType, LinkRecipe>>> =
    Lazy::new(|| RwLock::new(HashMap::new()));

thread_local! {
    static POOLS: RefCell<HashMap<LinkType, Vec<Box<Link>>>> = RefCell::new(HashMap::new());
}

/// Process-wide registry of link variants with a per-thread pool per
/// variant. Allocation stamps the variant key into the link, so the
/// reactor can hand it back here without knowing the recipe.
pub struct LinkFactory;

impl LinkFactory {
    const POOL_CAP: usize = 256;

    /// Registers a variant; answers false (and logs) when the key is
    /// already taken.
    pub fn register(key: LinkType, recipe: LinkRecipe) -> bool {
        let mut recipes = RECIPES.write().unwrap_or_else(|e| e.into_inner());
        if recipes.contains_key(&key) {
            tracing::error!(key, name = recipe.name, "link type already registered");
            return false;
        }
        recipes.insert(key, recipe);
        true
    }

    /// Hands out a link of the given variant, reusing a pooled one when
    /// available. Unknown variants answer `None`.
    pub fn get(key: LinkType) -> Option<Box<Link>> {
        let pooled = POOLS.with_borrow_mut(|pools| pools.get_mut(&key).and_then(Vec::pop));
        if let Some(link) = pooled {
            return Some(link);
        }
        let recipes = RECIPES.read().unwrap_or_else(|e| e.into_inner());
        let recipe = recipes.get(&key)?;
        let mut link = Box::new(Link::new(key));
        (recipe.build_stack)(&mut link.stack);
        Some(link)
    }

    /// Returns a cleared link to its variant's pool on the calling thread.
    pub fn put(link: Box<Link>) {
        POOLS.with_borrow_mut(|pools| {
            let pool = pools.entry(link.kind).or_default();
            if pool.len() < Self::POOL_CAP {
                pool.push(link);
            }
        });
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::protocol::msg::MsgProtocol;

    fn msg_stack(stack: &mut ProtocolStack) {
        stack.push_protocol(Box::new(MsgProtocol::new())).unwrap();
    }

    #[test]
    fn register_get_and_recycle() {
        const KEY: LinkType = 0xf00d;
        assert!(LinkFactory::register(KEY, LinkRecipe { name: "test-msg", build_stack: msg_stack }));
        assert!(!LinkFactory::register(KEY, LinkRecipe { name: "dup", build_stack: msg_stack }));

        let link = LinkFactory::get(KEY).unwrap();
        assert_eq!(link.kind, KEY);
        assert_eq!(link.stack.len(), 1);
        LinkFactory::put(link);

        let again = LinkFactory::get(KEY).unwrap();
        assert_eq!(again.stack.len(), 1);
    }

    #[test]
    fn unknown_variant_is_none() {
        assert!(LinkFactory::get(0xdead_beef).is_none());
    }
}
