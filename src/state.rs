//! World state: a copy-on-write account map with a deterministic root digest, a scratch overlay
//! for throw-away execution and a root-indexed cache backed by the [Database].
//!
//! Snapshots are structural copies: a [State] shares its account map (and every account's
//! storage) with all of its snapshots until one of them writes, at which point only the touched
//! parts are copied. Rolling back is just putting the old copy back.
use std::collections::{btree_map::BTreeMap, hash_map::HashMap, VecDeque};
use std::sync::Arc;

use log::{debug, warn};
use once_cell::sync::Lazy;

use crate::common::{Addr, Hash, Wei, U256, U256RLP};
use crate::core::{Code, PlainCode, WorldState, WorldStateR, WorldStateW};
use crate::store::{keys, Database};

static EMPTY_CODE: Lazy<Arc<PlainCode>> =
    Lazy::new(|| Arc::new(PlainCode::new(Vec::new().into())));

#[derive(Clone)]
pub struct Account {
    pub balance: Wei,
    pub nonce: u64,
    pub code: Arc<PlainCode>,
    pub storage: Arc<BTreeMap<Hash, U256>>,
}

impl Default for Account {
    fn default() -> Self {
        Self {
            balance: Wei::default(),
            nonce: 0,
            code: EMPTY_CODE.clone(),
            storage: Arc::new(BTreeMap::new()),
        }
    }
}

impl Account {
    fn storage_root(&self) -> Hash {
        let mut s = rlp::RlpStream::new_list(self.storage.len());
        for (k, v) in self.storage.iter() {
            s.begin_list(2).append(k).append(&U256RLP(*v));
        }
        Hash::hash(&s.out())
    }
}

/// The in-memory world state.
#[derive(Clone, Default)]
pub struct State {
    accounts: Arc<BTreeMap<Addr, Arc<Account>>>,
}

impl State {
    pub fn new() -> Self {
        Self::default()
    }

    fn account(&self, addr: &Addr) -> Option<&Account> {
        self.accounts.get(addr).map(|a| &**a)
    }

    fn account_mut(&mut self, addr: &Addr) -> &mut Account {
        let acc = Arc::make_mut(&mut self.accounts)
            .entry(addr.clone())
            .or_insert_with(|| Arc::new(Account::default()));
        Arc::make_mut(acc)
    }

    pub fn len(&self) -> usize {
        self.accounts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.accounts.is_empty()
    }

    pub fn accounts(&self) -> impl Iterator<Item = (&Addr, &Account)> {
        self.accounts.iter().map(|(a, acc)| (a, &**acc))
    }

    /// Digest over all accounts in address order: `keccak(rlp([[addr, balance, nonce,
    /// code_hash, storage_root], ...]))`.
    pub fn root(&self) -> Hash {
        let mut s = rlp::RlpStream::new_list(self.accounts.len());
        for (addr, acc) in self.accounts.iter() {
            s.begin_list(5)
                .append(addr)
                .append(&acc.balance)
                .append(&acc.nonce)
                .append(acc.code.get_hash())
                .append(&acc.storage_root());
        }
        Hash::hash(&s.out())
    }
}

impl rlp::Encodable for State {
    fn rlp_append(&self, s: &mut rlp::RlpStream) {
        s.begin_list(self.accounts.len());
        for (addr, acc) in self.accounts.iter() {
            s.begin_list(5)
                .append(addr)
                .append(&acc.balance)
                .append(&acc.nonce)
                .append(&acc.code.as_bytes());
            s.begin_list(acc.storage.len());
            for (k, v) in acc.storage.iter() {
                s.begin_list(2).append(k).append(&U256RLP(*v));
            }
        }
    }
}

impl rlp::Decodable for State {
    fn decode(rlp: &rlp::Rlp) -> Result<Self, rlp::DecoderError> {
        let mut accounts = BTreeMap::new();
        for item in rlp.iter() {
            let code: Vec<u8> = item.val_at(3)?;
            let mut storage = BTreeMap::new();
            for slot in item.at(4)?.iter() {
                let v: U256RLP = slot.val_at(1)?;
                storage.insert(slot.val_at(0)?, v.0);
            }
            let acc = Account {
                balance: item.val_at(1)?,
                nonce: item.val_at(2)?,
                code: if code.is_empty() {
                    EMPTY_CODE.clone()
                } else {
                    Arc::new(PlainCode::new(code.into()))
                },
                storage: Arc::new(storage),
            };
            accounts.insert(item.val_at(0)?, Arc::new(acc));
        }
        Ok(Self {
            accounts: Arc::new(accounts),
        })
    }
}

impl WorldStateR for State {
    fn get_state(&self, account: &Addr, key: &Hash) -> U256 {
        self.account(account)
            .and_then(|acc| acc.storage.get(key).copied())
            .unwrap_or_default()
    }

    fn get_balance(&self, account: &Addr) -> Wei {
        self.account(account)
            .map(|acc| acc.balance.clone())
            .unwrap_or_default()
    }

    fn get_code(&self, account: &Addr) -> Arc<dyn Code> {
        match self.account(account) {
            Some(acc) => acc.code.clone(),
            None => EMPTY_CODE.clone(),
        }
    }

    fn get_nonce(&self, account: &Addr) -> u64 {
        self.account(account).map(|acc| acc.nonce).unwrap_or(0)
    }

    fn exist(&self, account: &Addr) -> bool {
        self.accounts.contains_key(account)
    }
}

impl WorldStateW for State {
    fn set_state(&mut self, account: &Addr, key: &Hash, val: &U256) {
        let storage = Arc::make_mut(&mut self.account_mut(account).storage);
        if val.is_zero() {
            storage.remove(key);
        } else {
            storage.insert(key.clone(), *val);
        }
    }

    fn set_balance(&mut self, account: &Addr, balance: &Wei) {
        self.account_mut(account).balance = balance.clone();
    }

    fn set_code(&mut self, account: &Addr, code: &[u8]) {
        self.account_mut(account).code = Arc::new(PlainCode::new(code.into()));
    }

    fn set_nonce(&mut self, account: &Addr, nonce: u64) {
        self.account_mut(account).nonce = nonce;
    }

    fn create_account(&mut self, addr: &Addr) {
        let balance = self.get_balance(addr);
        let acc = self.account_mut(addr);
        *acc = Account::default();
        acc.balance = balance;
    }

    fn delete_account(&mut self, addr: &Addr) {
        if self.accounts.contains_key(addr) {
            Arc::make_mut(&mut self.accounts).remove(addr);
        }
    }
}

impl WorldState for State {
    fn snapshot(&self) -> Self {
        self.clone()
    }

    fn rollback(&mut self, state: Self) {
        *self = state;
    }
}

#[derive(Clone, Default)]
struct Delta {
    /// whether the account exists after the overlay's writes
    alive: bool,
    /// fields not in the delta read as zero instead of falling through to the base
    wiped: bool,
    balance: Option<Wei>,
    nonce: Option<u64>,
    code: Option<Arc<PlainCode>>,
    storage: BTreeMap<Hash, U256>,
}

/// A writable overlay on top of any read-only world state. Writes stay in the overlay and are
/// dropped together with it, so running contract code on a `ScratchState` never touches the
/// underlying state.
#[derive(Clone)]
pub struct ScratchState<'a> {
    base: &'a dyn WorldStateR,
    deltas: Arc<BTreeMap<Addr, Arc<Delta>>>,
}

impl<'a> ScratchState<'a> {
    pub fn new(base: &'a dyn WorldStateR) -> Self {
        Self {
            base,
            deltas: Arc::new(BTreeMap::new()),
        }
    }

    fn delta(&self, addr: &Addr) -> Option<&Delta> {
        self.deltas.get(addr).map(|d| &**d)
    }

    fn delta_mut(&mut self, addr: &Addr) -> &mut Delta {
        let d = Arc::make_mut(&mut self.deltas)
            .entry(addr.clone())
            .or_insert_with(|| Arc::new(Delta::default()));
        let d = Arc::make_mut(d);
        d.alive = true;
        d
    }
}

impl<'a> WorldStateR for ScratchState<'a> {
    fn get_state(&self, account: &Addr, key: &Hash) -> U256 {
        match self.delta(account) {
            Some(d) => match d.storage.get(key) {
                Some(v) => *v,
                None if d.wiped => U256::zero(),
                None => self.base.get_state(account, key),
            },
            None => self.base.get_state(account, key),
        }
    }

    fn get_balance(&self, account: &Addr) -> Wei {
        match self.delta(account) {
            Some(Delta {
                balance: Some(b), ..
            }) => b.clone(),
            Some(d) if d.wiped => Wei::default(),
            _ => self.base.get_balance(account),
        }
    }

    fn get_code(&self, account: &Addr) -> Arc<dyn Code> {
        match self.delta(account) {
            Some(Delta { code: Some(c), .. }) => c.clone(),
            Some(d) if d.wiped => EMPTY_CODE.clone(),
            _ => self.base.get_code(account),
        }
    }

    fn get_nonce(&self, account: &Addr) -> u64 {
        match self.delta(account) {
            Some(Delta { nonce: Some(n), .. }) => *n,
            Some(d) if d.wiped => 0,
            _ => self.base.get_nonce(account),
        }
    }

    fn exist(&self, account: &Addr) -> bool {
        match self.delta(account) {
            Some(d) => d.alive,
            None => self.base.exist(account),
        }
    }
}

impl<'a> WorldStateW for ScratchState<'a> {
    fn set_state(&mut self, account: &Addr, key: &Hash, val: &U256) {
        self.delta_mut(account).storage.insert(key.clone(), *val);
    }

    fn set_balance(&mut self, account: &Addr, balance: &Wei) {
        self.delta_mut(account).balance = Some(balance.clone());
    }

    fn set_code(&mut self, account: &Addr, code: &[u8]) {
        self.delta_mut(account).code = Some(Arc::new(PlainCode::new(code.into())));
    }

    fn set_nonce(&mut self, account: &Addr, nonce: u64) {
        self.delta_mut(account).nonce = Some(nonce);
    }

    fn create_account(&mut self, addr: &Addr) {
        let balance = self.get_balance(addr);
        let d = self.delta_mut(addr);
        *d = Delta {
            alive: true,
            wiped: true,
            balance: Some(balance),
            ..Delta::default()
        };
    }

    fn delete_account(&mut self, addr: &Addr) {
        let d = self.delta_mut(addr);
        *d = Delta {
            alive: false,
            wiped: true,
            ..Delta::default()
        };
    }
}

impl<'a> WorldState for ScratchState<'a> {
    fn snapshot(&self) -> Self {
        self.clone()
    }

    fn rollback(&mut self, state: Self) {
        *self = state;
    }
}

/// States indexed by their root digest. Recently used states stay in memory; committed ones are
/// also written to the database so they survive a restart.
pub struct StateDb {
    db: Arc<dyn Database>,
    cache: HashMap<Hash, State>,
    order: VecDeque<Hash>,
    capacity: usize,
}

impl StateDb {
    pub fn new(db: Arc<dyn Database>, capacity: usize) -> Self {
        Self {
            db,
            cache: HashMap::new(),
            order: VecDeque::new(),
            capacity: capacity.max(1),
        }
    }

    /// Keep `state` in memory only. Returns its root.
    pub fn cache(&mut self, state: State) -> Hash {
        let root = state.root();
        self.insert(root.clone(), state);
        root
    }

    /// Keep `state` in memory and persist it. Returns its root.
    pub fn commit(&mut self, state: State) -> Hash {
        let root = state.root();
        self.db.put(&keys::state(&root), &rlp::encode(&state));
        debug!("committed state {}", root);
        self.insert(root.clone(), state);
        root
    }

    /// Persist a state that is only cached so far.
    pub fn persist(&mut self, root: &Hash) -> bool {
        let key = keys::state(root);
        if self.db.has(&key) {
            return true
        }
        match self.cache.get(root) {
            Some(state) => {
                self.db.put(&key, &rlp::encode(state));
                true
            }
            None => false,
        }
    }

    pub fn get(&self, root: &Hash) -> Option<State> {
        if let Some(s) = self.cache.get(root) {
            return Some(s.clone())
        }
        let raw = self.db.get(&keys::state(root))?;
        match rlp::decode::<State>(&raw) {
            Ok(s) => Some(s),
            Err(e) => {
                warn!("corrupted state record {}: {}", root, e);
                None
            }
        }
    }

    pub fn contains(&self, root: &Hash) -> bool {
        self.cache.contains_key(root) || self.db.has(&keys::state(root))
    }

    fn insert(&mut self, root: Hash, state: State) {
        if self.cache.insert(root.clone(), state).is_none() {
            self.order.push_back(root);
        }
        while self.order.len() > self.capacity {
            if let Some(old) = self.order.pop_front() {
                self.cache.remove(&old);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Transferable;
    use crate::store::MemDatabase;

    fn addr(i: u64) -> Addr {
        U256::from(i).into()
    }

    #[test]
    fn test_snapshot_rollback() {
        let mut s = State::new();
        s.set_balance(&addr(1), &100u64.into());
        s.set_state(&addr(1), &U256::one().into(), &7.into());
        let snap = s.snapshot();
        s.set_state(&addr(1), &U256::one().into(), &9.into());
        s.transfer_balance(&addr(1), &addr(2), &40u64.into()).unwrap();
        assert_eq!(snap.get_state(&addr(1), &U256::one().into()), 7.into());
        assert_eq!(snap.get_balance(&addr(1)), 100u64.into());
        assert_eq!(s.get_balance(&addr(2)), 40u64.into());
        let root = s.root();
        s.rollback(snap);
        assert_ne!(s.root(), root);
        assert!(!s.exist(&addr(2)));
        assert_eq!(s.get_state(&addr(1), &U256::one().into()), 7.into());
    }

    #[test]
    fn test_root_is_order_independent() {
        let mut a = State::new();
        let mut b = State::new();
        a.set_nonce(&addr(1), 1);
        a.set_balance(&addr(2), &5u64.into());
        b.set_balance(&addr(2), &5u64.into());
        b.set_nonce(&addr(1), 1);
        assert_eq!(a.root(), b.root());
        // zero writes leave no storage behind
        b.set_state(&addr(1), &U256::one().into(), &3.into());
        b.set_state(&addr(1), &U256::one().into(), &U256::zero());
        assert_eq!(a.root(), b.root());
    }

    #[test]
    fn test_create_keeps_balance() {
        let mut s = State::new();
        s.set_balance(&addr(3), &10u64.into());
        s.set_nonce(&addr(3), 4);
        s.set_code(&addr(3), &[0x00]);
        s.create_account(&addr(3));
        assert_eq!(s.get_balance(&addr(3)), 10u64.into());
        assert_eq!(s.get_nonce(&addr(3)), 0);
        assert!(s.get_code(&addr(3)).as_bytes().is_empty());
        s.delete_account(&addr(3));
        assert!(!s.exist(&addr(3)));
    }

    #[test]
    fn test_scratch_overlay() {
        let mut base = State::new();
        base.set_balance(&addr(1), &50u64.into());
        base.set_state(&addr(1), &U256::one().into(), &8.into());
        let root = base.root();
        {
            let mut scratch = ScratchState::new(&base);
            assert_eq!(scratch.get_balance(&addr(1)), 50u64.into());
            scratch.transfer_balance(&addr(1), &addr(2), &20u64.into()).unwrap();
            scratch.set_state(&addr(1), &U256::one().into(), &U256::zero());
            assert_eq!(scratch.get_balance(&addr(2)), 20u64.into());
            assert!(scratch.get_state(&addr(1), &U256::one().into()).is_zero());
            let snap = scratch.snapshot();
            scratch.delete_account(&addr(1));
            assert!(!scratch.exist(&addr(1)));
            assert_eq!(scratch.get_balance(&addr(1)), Wei::default());
            scratch.rollback(snap);
            assert_eq!(scratch.get_balance(&addr(1)), 30u64.into());
        }
        assert_eq!(base.root(), root);
    }

    #[test]
    fn test_state_db() {
        let db = Arc::new(MemDatabase::new());
        let mut sdb = StateDb::new(db.clone(), 2);
        let mut s = State::new();
        s.set_code(&addr(1), &[0x60, 0x01]);
        s.set_state(&addr(1), &U256::one().into(), &2.into());
        let root = sdb.commit(s.clone());
        let mut t = s.clone();
        t.set_nonce(&addr(1), 2);
        let troot = sdb.cache(t);
        let mut u = s.clone();
        u.set_nonce(&addr(1), 3);
        sdb.cache(u);
        sdb.cache(State::new());
        // evicted from memory but persisted
        let s2 = sdb.get(&root).unwrap();
        assert_eq!(s2.root(), root);
        assert_eq!(s2.get_code(&addr(1)).as_bytes(), &[0x60, 0x01]);
        assert!(sdb.get(&troot).is_none());
        let fresh = StateDb::new(db, 2);
        assert!(fresh.contains(&root));
    }
}
