//! Shared account store and the per-task transactional overlay on top of it.
//!
//! Tasks never write to [`WorldState`] directly. Every attempt gets a fresh
//! [`TransactionalState`] that reads through to the shared store and buffers
//! its writes; the monitor applies the buffer only when the task commits, in
//! index order.

use crate::types::Address;
use alloy_primitives::{keccak256, B256, U256};
use dashmap::DashMap;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

/// Persisted state of one account.
///
/// The object-graph fields live here, not on any transient executor object,
/// so an aborted attempt can never leave a stale `next_hash` behind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Account {
    pub balance: U256,
    pub nonce: u64,
    pub storage: BTreeMap<Vec<u8>, Vec<u8>>,
    pub code: Option<Vec<u8>>,
    /// Next object hash id handed out by the contract's heap.
    pub next_hash: u32,
    /// Serialized heap snapshot of the contract.
    pub object_graph: Vec<u8>,
    /// `keccak256(object_graph)`.
    pub object_graph_hash: B256,
}

impl Default for Account {
    fn default() -> Self {
        Self {
            balance: U256::ZERO,
            nonce: 0,
            storage: BTreeMap::new(),
            code: None,
            next_hash: 0,
            object_graph: Vec::new(),
            object_graph_hash: keccak256([]),
        }
    }
}

impl Account {
    pub fn with_balance(balance: U256) -> Self {
        Self {
            balance,
            ..Self::default()
        }
    }

    /// Stores a new object graph. When `graph` is `None` only the hash
    /// counter moves and the stored graph is kept as is.
    pub fn set_object_graph(&mut self, next_hash: u32, graph: Option<Vec<u8>>) {
        self.next_hash = next_hash;
        if let Some(graph) = graph {
            self.object_graph_hash = keccak256(&graph);
            self.object_graph = graph;
        }
    }

    /// Writes or deletes (`None`) a storage slot, returning the size of the
    /// previous value if there was one.
    pub fn set_storage(&mut self, key: Vec<u8>, value: Option<Vec<u8>>) -> Option<usize> {
        let prev = match value {
            Some(value) => self.storage.insert(key, value),
            None => self.storage.remove(&key),
        };
        prev.map(|v| v.len())
    }
}

/// Account store shared by every task of a batch.
#[derive(Debug, Default)]
pub struct WorldState {
    accounts: DashMap<Address, Account>,
}

impl WorldState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_accounts<I>(accounts: I) -> Self
    where
        I: IntoIterator<Item = (Address, Account)>,
    {
        Self {
            accounts: accounts.into_iter().collect(),
        }
    }

    /// Returns a copy of the account, if it exists.
    pub fn account(&self, address: &Address) -> Option<Account> {
        self.accounts.get(address).map(|entry| entry.value().clone())
    }

    pub fn balance(&self, address: &Address) -> U256 {
        self.accounts
            .get(address)
            .map(|entry| entry.balance)
            .unwrap_or(U256::ZERO)
    }

    pub fn insert(&self, address: Address, account: Account) {
        self.accounts.insert(address, account);
    }

    /// Mutates the account in place, creating it if missing.
    pub fn update<R>(&self, address: Address, f: impl FnOnce(&mut Account) -> R) -> R {
        let mut entry = self.accounts.entry(address).or_default();
        f(entry.value_mut())
    }

    /// Applies a set of account writes.
    pub fn apply<I>(&self, writes: I)
    where
        I: IntoIterator<Item = (Address, Account)>,
    {
        for (address, account) in writes {
            self.accounts.insert(address, account);
        }
    }

    pub fn len(&self) -> usize {
        self.accounts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.accounts.is_empty()
    }

    /// Sorted copy of every account, for comparing two stores.
    pub fn snapshot(&self) -> BTreeMap<Address, Account> {
        self.accounts
            .iter()
            .map(|entry| (*entry.key(), entry.value().clone()))
            .collect()
    }
}

/// Saved overlay contents, restored when a nested call reverts.
#[derive(Debug, Clone, Default)]
pub struct Checkpoint {
    cache: HashMap<Address, Account>,
    dirty: HashSet<Address>,
}

/// Private overlay of one task attempt.
#[derive(Debug)]
pub struct TransactionalState {
    parent: Arc<WorldState>,
    cache: HashMap<Address, Account>,
    dirty: HashSet<Address>,
}

impl TransactionalState {
    pub fn new(parent: Arc<WorldState>) -> Self {
        Self {
            parent,
            cache: HashMap::new(),
            dirty: HashSet::new(),
        }
    }

    /// Reads an account, loading it from the shared store on first access.
    /// Missing accounts read as [`Account::default`].
    pub fn account(&mut self, address: &Address) -> &Account {
        let parent = &self.parent;
        self.cache
            .entry(*address)
            .or_insert_with(|| parent.account(address).unwrap_or_default())
    }

    /// Mutable access to an account; the account will be written on commit.
    pub fn account_mut(&mut self, address: &Address) -> &mut Account {
        self.dirty.insert(*address);
        let parent = &self.parent;
        self.cache
            .entry(*address)
            .or_insert_with(|| parent.account(address).unwrap_or_default())
    }

    pub fn is_dirty(&self, address: &Address) -> bool {
        self.dirty.contains(address)
    }

    pub fn dirty_count(&self) -> usize {
        self.dirty.len()
    }

    pub fn checkpoint(&self) -> Checkpoint {
        Checkpoint {
            cache: self.cache.clone(),
            dirty: self.dirty.clone(),
        }
    }

    pub fn restore(&mut self, checkpoint: Checkpoint) {
        self.cache = checkpoint.cache;
        self.dirty = checkpoint.dirty;
    }

    /// Writes every modified account to the shared store and empties the
    /// overlay. Returns the number of accounts written.
    pub fn commit(&mut self) -> usize {
        let dirty = std::mem::take(&mut self.dirty);
        let count = dirty.len();
        self.parent.apply(dirty.into_iter().filter_map(|address| {
            self.cache
                .remove(&address)
                .map(|account| (address, account))
        }));
        self.cache.clear();
        count
    }

    /// Drops every buffered write.
    pub fn discard(&mut self) {
        self.cache.clear();
        self.dirty.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_overlay_isolated_until_commit() {
        let alice = Address::external(1);
        let world = Arc::new(WorldState::with_accounts([(
            alice,
            Account::with_balance(U256::from(100)),
        )]));

        let mut overlay = TransactionalState::new(world.clone());
        overlay.account_mut(&alice).balance = U256::from(40);

        assert_eq!(overlay.account(&alice).balance, U256::from(40));
        assert_eq!(world.balance(&alice), U256::from(100));

        assert_eq!(overlay.commit(), 1);
        assert_eq!(world.balance(&alice), U256::from(40));
    }

    #[test]
    fn test_reads_are_not_written_back() {
        let bob = Address::external(2);
        let world = Arc::new(WorldState::new());

        let mut overlay = TransactionalState::new(world.clone());
        assert_eq!(overlay.account(&bob).balance, U256::ZERO);
        assert_eq!(overlay.commit(), 0);
        assert!(world.account(&bob).is_none());
    }

    #[test]
    fn test_discard() {
        let alice = Address::external(1);
        let world = Arc::new(WorldState::new());

        let mut overlay = TransactionalState::new(world.clone());
        overlay.account_mut(&alice).nonce = 3;
        overlay.discard();
        assert_eq!(overlay.commit(), 0);
        assert!(world.is_empty());
    }

    #[test]
    fn test_checkpoint_restore() {
        let alice = Address::external(1);
        let world = Arc::new(WorldState::new());

        let mut overlay = TransactionalState::new(world.clone());
        overlay.account_mut(&alice).balance = U256::from(1);
        let checkpoint = overlay.checkpoint();

        overlay.account_mut(&alice).balance = U256::from(2);
        overlay.account_mut(&Address::contract(9)).nonce = 1;
        overlay.restore(checkpoint);

        assert_eq!(overlay.account(&alice).balance, U256::from(1));
        assert_eq!(overlay.commit(), 1);
        assert_eq!(world.len(), 1);
    }

    #[test]
    fn test_object_graph_hash_tracks_graph() {
        let mut account = Account::default();
        assert_eq!(account.object_graph_hash, keccak256([]));

        account.set_object_graph(5, Some(b"heap".to_vec()));
        assert_eq!(account.next_hash, 5);
        assert_eq!(account.object_graph_hash, keccak256(b"heap"));

        // Counter-only update keeps graph and hash.
        account.set_object_graph(6, None);
        assert_eq!(account.next_hash, 6);
        assert_eq!(account.object_graph, b"heap".to_vec());
        assert_eq!(account.object_graph_hash, keccak256(b"heap"));
    }

    #[test]
    fn test_set_storage_reports_previous_size() {
        let mut account = Account::default();
        assert_eq!(account.set_storage(b"k".to_vec(), Some(vec![1, 2, 3])), None);
        assert_eq!(account.set_storage(b"k".to_vec(), Some(vec![9])), Some(3));
        assert_eq!(account.set_storage(b"k".to_vec(), None), Some(1));
        assert!(account.storage.is_empty());
    }
}
