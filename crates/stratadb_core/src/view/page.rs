//! View pages and the in-memory group index.
//!
//! A view's ordered rowid lists are split into fixed-size pages, so an
//! insert or delete rewrites one page instead of a whole group. Pages form
//! a singly linked chain per group; the chain order is kept in a small
//! in-memory index (a vector of page metadata per group) so hot-path
//! membership queries never scan the full chain on disk.

use crate::error::DbResult;
use std::collections::{HashMap, HashSet};
use stratadb_store::{Rowid, StoreError};

/// One page: an ordered run of rowids.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct Page {
    pub(crate) rowids: Vec<Rowid>,
}

impl Page {
    pub(crate) fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(4 + self.rowids.len() * 8);
        buf.extend_from_slice(&(self.rowids.len() as u32).to_le_bytes());
        for rowid in &self.rowids {
            buf.extend_from_slice(&rowid.as_i64().to_le_bytes());
        }
        buf
    }

    pub(crate) fn decode(bytes: &[u8]) -> DbResult<Self> {
        if bytes.len() < 4 {
            return Err(StoreError::corruption("view page too short").into());
        }
        let count = u32::from_le_bytes(bytes[0..4].try_into().unwrap_or([0; 4])) as usize;
        if bytes.len() != 4 + count * 8 {
            return Err(StoreError::corruption("view page length mismatch").into());
        }
        let mut rowids = Vec::with_capacity(count);
        for i in 0..count {
            let start = 4 + i * 8;
            let raw = i64::from_le_bytes(bytes[start..start + 8].try_into().unwrap_or([0; 8]));
            rowids.push(Rowid::new(raw));
        }
        Ok(Self { rowids })
    }

    pub(crate) fn position_of(&self, rowid: Rowid) -> Option<usize> {
        self.rowids.iter().position(|&r| r == rowid)
    }
}

/// Persistent metadata for one page: its group, its successor in the
/// group's chain, and its entry count (so chains can be rebuilt and counted
/// without loading page bodies).
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct PageMeta {
    pub(crate) page_key: u64,
    pub(crate) group: String,
    pub(crate) next: Option<u64>,
    pub(crate) count: u32,
}

impl PageMeta {
    pub(crate) fn encode(&self) -> Vec<u8> {
        let group = self.group.as_bytes();
        let mut buf = Vec::with_capacity(4 + group.len() + 9 + 4);
        buf.extend_from_slice(&(group.len() as u32).to_le_bytes());
        buf.extend_from_slice(group);
        match self.next {
            Some(next) => {
                buf.push(1);
                buf.extend_from_slice(&next.to_le_bytes());
            }
            None => buf.push(0),
        }
        buf.extend_from_slice(&self.count.to_le_bytes());
        buf
    }

    pub(crate) fn decode(page_key: u64, bytes: &[u8]) -> DbResult<Self> {
        let corrupt = || StoreError::corruption("view page metadata malformed");
        if bytes.len() < 4 {
            return Err(corrupt().into());
        }
        let group_len = u32::from_le_bytes(bytes[0..4].try_into().unwrap_or([0; 4])) as usize;
        let mut cursor = 4 + group_len;
        if bytes.len() < cursor + 1 {
            return Err(corrupt().into());
        }
        let group = String::from_utf8(bytes[4..cursor].to_vec()).map_err(|_| corrupt())?;
        let has_next = bytes[cursor] != 0;
        cursor += 1;
        let next = if has_next {
            if bytes.len() < cursor + 8 {
                return Err(corrupt().into());
            }
            let next = u64::from_le_bytes(bytes[cursor..cursor + 8].try_into().unwrap_or([0; 8]));
            cursor += 8;
            Some(next)
        } else {
            None
        };
        if bytes.len() != cursor + 4 {
            return Err(corrupt().into());
        }
        let count = u32::from_le_bytes(bytes[cursor..cursor + 4].try_into().unwrap_or([0; 4]));
        Ok(Self {
            page_key,
            group,
            next,
            count,
        })
    }
}

/// The in-memory group → page chain index.
#[derive(Debug, Clone, Default)]
pub(crate) struct GroupIndex {
    /// Per group, the page chain in order (element 0 is the head).
    pub(crate) groups: HashMap<String, Vec<PageMeta>>,
}

impl GroupIndex {
    /// Rebuilds chains from an unordered set of page metadata records by
    /// following the `next` pointers.
    pub(crate) fn from_metas(metas: Vec<PageMeta>) -> DbResult<Self> {
        let mut by_key: HashMap<u64, PageMeta> = HashMap::new();
        let mut successors: HashSet<u64> = HashSet::new();
        for meta in metas {
            if let Some(next) = meta.next {
                successors.insert(next);
            }
            by_key.insert(meta.page_key, meta);
        }

        let heads: Vec<u64> = by_key
            .keys()
            .filter(|key| !successors.contains(key))
            .copied()
            .collect();

        let mut groups: HashMap<String, Vec<PageMeta>> = HashMap::new();
        let mut placed = 0usize;
        for head in heads {
            let mut cursor = Some(head);
            while let Some(page_key) = cursor {
                let meta = by_key
                    .get(&page_key)
                    .ok_or_else(|| StoreError::corruption("view page chain broken"))?
                    .clone();
                cursor = meta.next;
                groups.entry(meta.group.clone()).or_default().push(meta);
                placed += 1;
            }
        }
        if placed != by_key.len() {
            return Err(StoreError::corruption("view page chain has a cycle").into());
        }
        Ok(Self { groups })
    }

    pub(crate) fn group_names_sorted(&self) -> Vec<String> {
        let mut names: Vec<String> = self.groups.keys().cloned().collect();
        names.sort();
        names
    }

    pub(crate) fn count_in_group(&self, group: &str) -> usize {
        self.groups
            .get(group)
            .map_or(0, |metas| metas.iter().map(|m| m.count as usize).sum())
    }

    pub(crate) fn total_count(&self) -> usize {
        self.groups
            .values()
            .flat_map(|metas| metas.iter())
            .map(|m| m.count as usize)
            .sum()
    }

    /// Returns every page metadata record, keyed by page key.
    pub(crate) fn metas_by_key(&self) -> HashMap<u64, PageMeta> {
        self.groups
            .values()
            .flat_map(|metas| metas.iter())
            .map(|meta| (meta.page_key, meta.clone()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta(page_key: u64, group: &str, next: Option<u64>, count: u32) -> PageMeta {
        PageMeta {
            page_key,
            group: group.to_string(),
            next,
            count,
        }
    }

    #[test]
    fn page_roundtrip() {
        let page = Page {
            rowids: vec![Rowid::new(3), Rowid::new(-1), Rowid::new(42)],
        };
        assert_eq!(Page::decode(&page.encode()).unwrap(), page);

        let empty = Page::default();
        assert_eq!(Page::decode(&empty.encode()).unwrap(), empty);
    }

    #[test]
    fn page_decode_rejects_length_mismatch() {
        let page = Page {
            rowids: vec![Rowid::new(1)],
        };
        let mut bytes = page.encode();
        bytes.pop();
        assert!(Page::decode(&bytes).is_err());
    }

    #[test]
    fn meta_roundtrip() {
        for m in [
            meta(1, "inbox", Some(2), 50),
            meta(2, "inbox", None, 13),
            meta(3, "", None, 0),
        ] {
            assert_eq!(PageMeta::decode(m.page_key, &m.encode()).unwrap(), m);
        }
    }

    #[test]
    fn index_rebuild_follows_chains() {
        // inbox: 1 -> 2 -> 3; archive: 9
        let metas = vec![
            meta(2, "inbox", Some(3), 20),
            meta(9, "archive", None, 5),
            meta(1, "inbox", Some(2), 50),
            meta(3, "inbox", None, 7),
        ];
        let index = GroupIndex::from_metas(metas).unwrap();
        let inbox: Vec<u64> = index.groups["inbox"].iter().map(|m| m.page_key).collect();
        assert_eq!(inbox, vec![1, 2, 3]);
        assert_eq!(index.count_in_group("inbox"), 77);
        assert_eq!(index.count_in_group("archive"), 5);
        assert_eq!(index.count_in_group("missing"), 0);
        assert_eq!(index.total_count(), 82);
        assert_eq!(index.group_names_sorted(), ["archive", "inbox"]);
    }

    #[test]
    fn index_rebuild_detects_cycles() {
        let metas = vec![meta(1, "g", Some(2), 1), meta(2, "g", Some(1), 1)];
        assert!(GroupIndex::from_metas(metas).is_err());
    }
}
