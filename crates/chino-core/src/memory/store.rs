//! Keyed list stores backing the short-term buffer.
//!
//! Ranges follow list-server semantics: bounds are inclusive and negative indices
//! count from the end (`-1` is the last element).

use std::path::Path;

use dashmap::DashMap;

use crate::error::CoreResult;

/// Resolve an inclusive `[start, end]` range against a list of `len` items.
/// Returns the half-open `start..end` slice bounds, or `None` when empty.
pub fn resolve_range(len: usize, start: i64, end: i64) -> Option<(usize, usize)> {
    if len == 0 {
        return None;
    }
    let len_i = len as i64;
    let start = if start < 0 { (len_i + start).max(0) } else { start };
    let end = if end < 0 { len_i + end } else { end.min(len_i - 1) };
    if start > end || start >= len_i || end < 0 {
        return None;
    }
    Some((start as usize, end as usize + 1))
}

/// Ordered list per key. Implementations keep `append_bounded` atomic.
pub trait ShortTermStore: Send + Sync {
    fn append(&self, key: &str, value: String) -> CoreResult<()>;

    fn range(&self, key: &str, start: i64, end: i64) -> CoreResult<Vec<String>>;

    /// Keep only `[start, end]`; everything else is dropped.
    fn trim(&self, key: &str, start: i64, end: i64) -> CoreResult<()>;

    fn delete(&self, key: &str) -> CoreResult<()>;

    fn exists(&self, key: &str) -> CoreResult<bool>;

    fn len(&self, key: &str) -> CoreResult<usize>;

    /// Append, then keep only the last `keep` items. Returns the length afterwards.
    fn append_bounded(&self, key: &str, value: String, keep: usize) -> CoreResult<usize>;

    /// Make every write so far durable. A no-op for process-local stores.
    fn flush(&self) -> CoreResult<()> {
        Ok(())
    }
}

/// Process-local store.
#[derive(Default)]
pub struct InMemoryListStore {
    lists: DashMap<String, Vec<String>>,
}

impl InMemoryListStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn keep_last(list: &mut Vec<String>, keep: usize) {
    if list.len() > keep {
        let excess = list.len() - keep;
        list.drain(..excess);
    }
}

fn apply_trim(list: &mut Vec<String>, start: i64, end: i64) {
    match resolve_range(list.len(), start, end) {
        Some((s, e)) => {
            list.truncate(e);
            list.drain(..s);
        }
        None => list.clear(),
    }
}

impl ShortTermStore for InMemoryListStore {
    fn append(&self, key: &str, value: String) -> CoreResult<()> {
        self.lists.entry(key.to_string()).or_default().push(value);
        Ok(())
    }

    fn range(&self, key: &str, start: i64, end: i64) -> CoreResult<Vec<String>> {
        Ok(self
            .lists
            .get(key)
            .and_then(|list| resolve_range(list.len(), start, end).map(|(s, e)| list[s..e].to_vec()))
            .unwrap_or_default())
    }

    fn trim(&self, key: &str, start: i64, end: i64) -> CoreResult<()> {
        if let Some(mut list) = self.lists.get_mut(key) {
            apply_trim(&mut list, start, end);
        }
        self.lists.remove_if(key, |_, list| list.is_empty());
        Ok(())
    }

    fn delete(&self, key: &str) -> CoreResult<()> {
        self.lists.remove(key);
        Ok(())
    }

    fn exists(&self, key: &str) -> CoreResult<bool> {
        Ok(self.lists.contains_key(key))
    }

    fn len(&self, key: &str) -> CoreResult<usize> {
        Ok(self.lists.get(key).map(|l| l.len()).unwrap_or(0))
    }

    fn append_bounded(&self, key: &str, value: String, keep: usize) -> CoreResult<usize> {
        let mut list = self.lists.entry(key.to_string()).or_default();
        list.push(value);
        keep_last(&mut list, keep);
        Ok(list.len())
    }
}

/// Persistent store on sled. Each key holds its whole list as one JSON array; every
/// mutation is a single atomic `update_and_fetch`.
pub struct SledListStore {
    db: sled::Db,
}

impl SledListStore {
    pub fn open<P: AsRef<Path>>(path: P) -> CoreResult<Self> {
        Ok(Self {
            db: sled::open(path)?,
        })
    }

    pub fn temporary() -> CoreResult<Self> {
        Ok(Self {
            db: sled::Config::new().temporary(true).open()?,
        })
    }

    fn load(&self, key: &str) -> CoreResult<Vec<String>> {
        match self.db.get(key.as_bytes())? {
            Some(bytes) => Ok(serde_json::from_slice(&bytes)?),
            None => Ok(Vec::new()),
        }
    }

    /// Apply `f` atomically; an empty result removes the key.
    fn mutate<F>(&self, key: &str, mut f: F) -> CoreResult<usize>
    where
        F: FnMut(&mut Vec<String>),
    {
        let mut decode_error = None;
        let updated = self.db.update_and_fetch(key.as_bytes(), |old| {
            let mut list: Vec<String> = match old {
                Some(bytes) => match serde_json::from_slice(bytes) {
                    Ok(list) => list,
                    Err(e) => {
                        decode_error = Some(e);
                        return old.map(|b| b.to_vec());
                    }
                },
                None => Vec::new(),
            };
            decode_error = None;
            f(&mut list);
            if list.is_empty() {
                None
            } else {
                serde_json::to_vec(&list).ok()
            }
        })?;
        if let Some(e) = decode_error {
            return Err(e.into());
        }
        let len = match updated {
            Some(bytes) => serde_json::from_slice::<Vec<String>>(&bytes)?.len(),
            None => 0,
        };
        Ok(len)
    }
}

impl ShortTermStore for SledListStore {
    fn append(&self, key: &str, value: String) -> CoreResult<()> {
        self.mutate(key, |list| list.push(value.clone()))?;
        Ok(())
    }

    fn range(&self, key: &str, start: i64, end: i64) -> CoreResult<Vec<String>> {
        let list = self.load(key)?;
        Ok(resolve_range(list.len(), start, end)
            .map(|(s, e)| list[s..e].to_vec())
            .unwrap_or_default())
    }

    fn trim(&self, key: &str, start: i64, end: i64) -> CoreResult<()> {
        self.mutate(key, |list| apply_trim(list, start, end))?;
        Ok(())
    }

    fn delete(&self, key: &str) -> CoreResult<()> {
        self.db.remove(key.as_bytes())?;
        Ok(())
    }

    fn exists(&self, key: &str) -> CoreResult<bool> {
        Ok(self.db.contains_key(key.as_bytes())?)
    }

    fn len(&self, key: &str) -> CoreResult<usize> {
        Ok(self.load(key)?.len())
    }

    fn append_bounded(&self, key: &str, value: String, keep: usize) -> CoreResult<usize> {
        self.mutate(key, |list| {
            list.push(value.clone());
            keep_last(list, keep);
        })
    }

    fn flush(&self) -> CoreResult<()> {
        self.db.flush()?;
        Ok(())
    }
}
