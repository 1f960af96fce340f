//! Subvolume identity and generation.

use std::ops::ControlFlow;

use bdup_config::log_search_debug;

use crate::abi::{key_type, InoLookupArgs, SearchKey, FIRST_FREE_OBJECTID, ROOT_TREE_OBJECTID};
use crate::items::RootItem;
use crate::{BtrfsError, Ioctl, Result, Volume};

impl<K: Ioctl> Volume<'_, K> {
    /// Tree id of the subvolume the descriptor lives in.
    pub fn root_id(&self) -> Result<u64> {
        let mut args = InoLookupArgs::new(0, FIRST_FREE_OBJECTID);
        self.kernel
            .ino_lookup(self.fd, &mut args)
            .map_err(self.ioctl_error("INO_LOOKUP"))?;
        Ok(args.treeid)
    }

    /// Highest generation recorded in this subvolume's root items.
    pub fn root_generation(&self) -> Result<u64> {
        let tree_id = self.root_id()?;
        self.root_generation_of(tree_id)
    }

    /// Highest generation recorded in the root items of `tree_id`.
    ///
    /// Searches the tree of roots for `(tree_id, ROOT_ITEM, *)` and stops at
    /// the first item outside that scope. A subvolume always has a root
    /// item, so finding none is an error.
    pub fn root_generation_of(&self, tree_id: u64) -> Result<u64> {
        let key = SearchKey::scoped(ROOT_TREE_OBJECTID, tree_id, key_type::ROOT_ITEM);
        let mut max_found: Option<u64> = None;

        let stats = self.search_each(key, |item| {
            if item.header.objectid != tree_id || item.header.item_type != key_type::ROOT_ITEM {
                return Ok(ControlFlow::Break(()));
            }
            let root = RootItem::decode(item.data)?;
            max_found = Some(max_found.map_or(root.generation, |m| m.max(root.generation)));
            Ok(ControlFlow::Continue(()))
        })?;

        log_search_debug!(
            "root generation resolved",
            tree_id = tree_id,
            pages = stats.pages,
            generation = tracing::field::debug(max_found),
        );
        max_found.ok_or(BtrfsError::NoRootItem { tree_id })
    }
}
