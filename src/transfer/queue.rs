use std::collections::{BTreeMap, BTreeSet, HashMap};

use super::record::{Transfer, TransferKey};
use super::status::TransferStatus;

/// Which index a transfer is filed under, derived from its status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Bucket {
    Queued,
    Active,
    Failed,
    /// Finished, paused, filtered or cancelled.
    Idle,
}

impl Bucket {
    fn of(status: &TransferStatus) -> Self {
        match status {
            TransferStatus::Queued => Bucket::Queued,
            TransferStatus::Requesting | TransferStatus::Transferring => Bucket::Active,
            TransferStatus::Failed(_) | TransferStatus::Denied(_) => Bucket::Failed,
            TransferStatus::Finished
            | TransferStatus::Paused
            | TransferStatus::Filtered
            | TransferStatus::Cancelled => Bucket::Idle,
        }
    }
}

/// Transfer records with the indices the schedulers need.
///
/// Records are only changed through [`TransferQueue::modify`], which files
/// the record again afterwards. A key is therefore in at most one of the
/// queued, active and failed indices.
#[derive(Debug, Default)]
pub struct TransferQueue {
    records: BTreeMap<TransferKey, Transfer>,
    /// Global order in which transfers entered the queue.
    queued: BTreeMap<u64, TransferKey>,
    queued_seq: HashMap<TransferKey, u64>,
    queued_by_user: HashMap<String, BTreeMap<u64, String>>,
    active: HashMap<String, BTreeSet<String>>,
    failed: HashMap<String, BTreeSet<String>>,
    tokens: HashMap<(String, u32), String>,
    next_seq: u64,
}

impl TransferQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts or replaces a record.
    pub fn insert(&mut self, transfer: Transfer) {
        let key = transfer.key();
        if let Some(old) = self.records.remove(&key) {
            self.unindex(&key, &old, true);
        }
        self.index(&key, &transfer, None);
        self.records.insert(key, transfer);
    }

    pub fn remove(&mut self, key: &TransferKey) -> Option<Transfer> {
        let transfer = self.records.remove(key)?;
        self.unindex(key, &transfer, true);
        Some(transfer)
    }

    pub fn get(&self, key: &TransferKey) -> Option<&Transfer> {
        self.records.get(key)
    }

    pub fn contains(&self, key: &TransferKey) -> bool {
        self.records.contains_key(key)
    }

    /// Finds the record that owns `token` for `user`.
    pub fn key_for_token(&self, user: &str, token: u32) -> Option<TransferKey> {
        self.tokens
            .get(&(user.to_string(), token))
            .map(|path| TransferKey::new(user, path.as_str()))
    }

    /// Applies `f` to a record and re-files it. A transfer that stays queued
    /// keeps its place in the queue.
    pub fn modify<R>(
        &mut self,
        key: &TransferKey,
        f: impl FnOnce(&mut Transfer) -> R,
    ) -> Option<R> {
        let mut transfer = self.records.remove(key)?;
        let was_queued = transfer.status == TransferStatus::Queued;
        let seq = self.queued_seq.get(key).copied();
        self.unindex(key, &transfer, false);

        let result = f(&mut transfer);

        let keep = if was_queued && transfer.status == TransferStatus::Queued {
            seq
        } else {
            None
        };
        if let Some(seq) = seq {
            if keep.is_none() {
                self.queued.remove(&seq);
                self.queued_seq.remove(key);
            }
        }
        self.index(key, &transfer, keep);
        self.records.insert(key.clone(), transfer);
        Some(result)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Transfer> {
        self.records.values()
    }

    pub fn keys(&self) -> impl Iterator<Item = &TransferKey> {
        self.records.keys()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn bucket(&self, key: &TransferKey) -> Option<Bucket> {
        self.records.get(key).map(|t| Bucket::of(&t.status))
    }

    // ========================================================================
    // Queued
    // ========================================================================

    /// Queued transfers of every user, oldest first.
    pub fn queued(&self) -> impl Iterator<Item = &TransferKey> {
        self.queued.values()
    }

    /// Queued virtual paths of `user`, oldest first.
    pub fn queued_for<'a>(&'a self, user: &str) -> impl Iterator<Item = &'a String> + 'a {
        self.queued_by_user
            .get(user)
            .into_iter()
            .flat_map(|paths| paths.values())
    }

    pub fn queued_users(&self) -> impl Iterator<Item = &str> {
        self.queued_by_user.keys().map(String::as_str)
    }

    pub fn queued_count(&self, user: &str) -> usize {
        self.queued_by_user.get(user).map_or(0, BTreeMap::len)
    }

    pub fn queued_bytes(&self, user: &str) -> u64 {
        self.queued_for(user)
            .filter_map(|path| self.records.get(&TransferKey::new(user, path.as_str())))
            .map(|t| t.size)
            .sum()
    }

    /// Whether `key` is queued or active.
    pub fn is_pending(&self, key: &TransferKey) -> bool {
        matches!(self.bucket(key), Some(Bucket::Queued | Bucket::Active))
    }

    // ========================================================================
    // Active and failed
    // ========================================================================

    pub fn is_user_active(&self, user: &str) -> bool {
        self.active.contains_key(user)
    }

    pub fn active_count(&self) -> usize {
        self.active.values().map(BTreeSet::len).sum()
    }

    pub fn active_keys(&self) -> Vec<TransferKey> {
        keys_of(&self.active)
    }

    pub fn failed_keys(&self) -> Vec<TransferKey> {
        keys_of(&self.failed)
    }

    /// Every key belonging to `user`.
    pub fn keys_for(&self, user: &str) -> Vec<TransferKey> {
        self.records
            .keys()
            .filter(|key| key.user == user)
            .cloned()
            .collect()
    }

    // ========================================================================
    // Indexing
    // ========================================================================

    fn index(&mut self, key: &TransferKey, transfer: &Transfer, seq: Option<u64>) {
        match Bucket::of(&transfer.status) {
            Bucket::Queued => {
                let seq = seq.unwrap_or_else(|| {
                    self.next_seq += 1;
                    self.next_seq
                });
                self.queued.insert(seq, key.clone());
                self.queued_seq.insert(key.clone(), seq);
                self.queued_by_user
                    .entry(key.user.clone())
                    .or_default()
                    .insert(seq, key.virtual_path.clone());
            }
            Bucket::Active => {
                self.active
                    .entry(key.user.clone())
                    .or_default()
                    .insert(key.virtual_path.clone());
            }
            Bucket::Failed => {
                self.failed
                    .entry(key.user.clone())
                    .or_default()
                    .insert(key.virtual_path.clone());
            }
            Bucket::Idle => {}
        }
        if let Some(token) = transfer.token {
            self.tokens
                .insert((key.user.clone(), token), key.virtual_path.clone());
        }
    }

    /// Removes `key` from every index. The global queue position is only
    /// dropped when `drop_seq` is set; [`Self::modify`] decides on its own.
    fn unindex(&mut self, key: &TransferKey, transfer: &Transfer, drop_seq: bool) {
        if let Some(seq) = self.queued_seq.get(key).copied() {
            if let Some(paths) = self.queued_by_user.get_mut(&key.user) {
                paths.remove(&seq);
                if paths.is_empty() {
                    self.queued_by_user.remove(&key.user);
                }
            }
            if drop_seq {
                self.queued.remove(&seq);
                self.queued_seq.remove(key);
            }
        }
        remove_from(&mut self.active, key);
        remove_from(&mut self.failed, key);
        if let Some(token) = transfer.token {
            let token_key = (key.user.clone(), token);
            if self.tokens.get(&token_key) == Some(&key.virtual_path) {
                self.tokens.remove(&token_key);
            }
        }
    }
}

fn remove_from(index: &mut HashMap<String, BTreeSet<String>>, key: &TransferKey) {
    if let Some(paths) = index.get_mut(&key.user) {
        paths.remove(&key.virtual_path);
        if paths.is_empty() {
            index.remove(&key.user);
        }
    }
}

fn keys_of(index: &HashMap<String, BTreeSet<String>>) -> Vec<TransferKey> {
    let mut keys: Vec<TransferKey> = index
        .iter()
        .flat_map(|(user, paths)| paths.iter().map(move |path| TransferKey::new(user, path)))
        .collect();
    keys.sort();
    keys
}
